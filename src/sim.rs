//! Simulated execution for replay feedback.
//!
//! Settlement latency and failure derive from a xorshift mix of the intent
//! id and placement time instead of an RNG, so identical replays settle
//! identically.

use serde::Serialize;

use crate::events::{FailEvent, FillEvent, Side};
use crate::position::OrderIntent;

#[derive(Debug, Clone)]
pub struct SimParams {
    pub latency_min_ms: i64,
    pub latency_max_ms: i64,
    pub fail_prob: f64,
    pub fee_bps: f64,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            latency_min_ms: 200,
            latency_max_ms: 1_200,
            fail_prob: 0.01,
            fee_bps: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
struct SimOrder {
    intent: OrderIntent,
    condition_id: String,
    asset_id: String,
    fill_price: f64,
    due_at: i64,
    failed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Fill(FillEvent),
    Fail(FailEvent),
}

/// Row recorded for every placed intent; persisted as a simulated trade.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimTradeRecord {
    pub intent_id: String,
    pub condition_id: String,
    pub asset_id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub timestamp: i64,
    pub latency_ms: i64,
    pub failed: bool,
}

fn mix64(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

fn seed_for(intent_id: &str, now: i64) -> u64 {
    let mut acc = (now as u64) ^ 0x9e37_79b9_7f4a_7c15;
    for b in intent_id.as_bytes() {
        acc = mix64(acc ^ u64::from(*b));
    }
    acc
}

pub struct SimulatedExecution {
    params: SimParams,
    pending: Vec<SimOrder>,
    trades: Vec<SimTradeRecord>,
}

impl SimulatedExecution {
    pub fn new(params: SimParams) -> Self {
        Self {
            params,
            pending: Vec::new(),
            trades: Vec::new(),
        }
    }

    pub fn place(&mut self, intent: &OrderIntent, condition_id: &str, asset_id: &str, now: i64) {
        let seed = seed_for(&intent.intent_id, now);
        let latency = if self.params.latency_max_ms <= self.params.latency_min_ms {
            self.params.latency_min_ms
        } else {
            let span = (self.params.latency_max_ms - self.params.latency_min_ms + 1) as u64;
            self.params.latency_min_ms + (seed % span) as i64
        };
        let failed = (mix64(seed) as f64 / u64::MAX as f64) < self.params.fail_prob;
        let fill_price = intent.price * (1.0 - self.params.fee_bps / 10_000.0);

        self.pending.push(SimOrder {
            intent: intent.clone(),
            condition_id: condition_id.to_string(),
            asset_id: asset_id.to_string(),
            fill_price,
            due_at: now + latency,
            failed,
        });
        self.trades.push(SimTradeRecord {
            intent_id: intent.intent_id.clone(),
            condition_id: condition_id.to_string(),
            asset_id: asset_id.to_string(),
            side: intent.side,
            price: fill_price,
            size: intent.size,
            timestamp: now,
            latency_ms: latency,
            failed,
        });
    }

    /// Drain settlements due at or before `now`, in placement order.
    pub fn due(&mut self, now: i64) -> Vec<Settlement> {
        let mut out = Vec::new();
        let mut remaining = Vec::with_capacity(self.pending.len());
        for order in self.pending.drain(..) {
            if order.due_at <= now {
                out.push(settle(order));
            } else {
                remaining.push(order);
            }
        }
        self.pending = remaining;
        out
    }

    /// Settle everything still outstanding, regardless of due time.
    pub fn drain(&mut self) -> Vec<Settlement> {
        self.pending.drain(..).map(settle).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn trades(&self) -> &[SimTradeRecord] {
        &self.trades
    }
}

fn settle(order: SimOrder) -> Settlement {
    if order.failed {
        Settlement::Fail(FailEvent {
            intent_id: order.intent.intent_id,
            condition_id: order.condition_id,
            asset_id: order.asset_id,
            side: order.intent.side,
            size: order.intent.size,
            timestamp: order.due_at,
            reason: Some("settlement_failed".to_string()),
        })
    } else {
        Settlement::Fill(FillEvent {
            intent_id: order.intent.intent_id,
            condition_id: order.condition_id,
            asset_id: order.asset_id,
            side: order.intent.side,
            filled_size: order.intent.size,
            price: order.fill_price,
            timestamp: order.due_at,
            partial: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::IntentReason;

    fn intent(id: &str, price: f64) -> OrderIntent {
        OrderIntent {
            intent_id: id.to_string(),
            side: Side::Buy,
            price,
            size: 5.0,
            reason: IntentReason::DeltaSpd,
            created_ts: 1_000,
        }
    }

    fn sim(params: SimParams) -> SimulatedExecution {
        SimulatedExecution::new(params)
    }

    #[test]
    fn test_settlement_is_deterministic() {
        let run = |_: ()| {
            let mut s = sim(SimParams::default());
            s.place(&intent("i-1", 0.54), "c", "a", 1_000);
            s.place(&intent("i-2", 0.52), "c", "a", 2_000);
            s.drain()
        };
        assert_eq!(run(()), run(()));
    }

    #[test]
    fn test_latency_within_bounds() {
        let mut s = sim(SimParams {
            latency_min_ms: 200,
            latency_max_ms: 1_200,
            fail_prob: 0.0,
            fee_bps: 0.0,
        });
        for i in 0..50 {
            s.place(&intent(&format!("i-{i}"), 0.5), "c", "a", 1_000 * i);
        }
        for trade in s.trades() {
            assert!(trade.latency_ms >= 200 && trade.latency_ms <= 1_200);
        }
    }

    #[test]
    fn test_zero_fail_prob_always_fills() {
        let mut s = sim(SimParams {
            fail_prob: 0.0,
            ..SimParams::default()
        });
        for i in 0..20 {
            s.place(&intent(&format!("i-{i}"), 0.5), "c", "a", i);
        }
        assert!(s.drain().iter().all(|st| matches!(st, Settlement::Fill(_))));
    }

    #[test]
    fn test_certain_fail_prob_always_fails() {
        let mut s = sim(SimParams {
            fail_prob: 1.0,
            ..SimParams::default()
        });
        s.place(&intent("i-1", 0.5), "c", "a", 0);
        assert!(matches!(s.drain()[0], Settlement::Fail(_)));
    }

    #[test]
    fn test_due_respects_latency_and_order() {
        let mut s = sim(SimParams {
            latency_min_ms: 100,
            latency_max_ms: 100,
            fail_prob: 0.0,
            fee_bps: 0.0,
        });
        s.place(&intent("i-1", 0.5), "c", "a", 0);
        s.place(&intent("i-2", 0.5), "c", "a", 50);
        assert!(s.due(99).is_empty());
        let first = s.due(100);
        assert_eq!(first.len(), 1);
        assert_eq!(s.pending_len(), 1);
        let second = s.due(10_000);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_fee_reduces_fill_price() {
        let mut s = sim(SimParams {
            latency_min_ms: 0,
            latency_max_ms: 0,
            fail_prob: 0.0,
            fee_bps: 100.0, // 1%
        });
        s.place(&intent("i-1", 0.50), "c", "a", 0);
        match &s.drain()[0] {
            Settlement::Fill(fill) => assert!((fill.price - 0.495).abs() < 1e-12),
            other => panic!("expected fill, got {other:?}"),
        }
    }
}
