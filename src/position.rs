//! Inventory-aware intent decisions and execution feedback.
//!
//! One `Position` per `condition_id|asset_id` key tracks settled inventory
//! and in-flight (pending) exposure. Both are hard-capped: a breach means
//! the decision logic is defective and the run must stop, never be clamped.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dislocation::DislocationSignal;
use crate::events::{FailEvent, FillEvent, Side};

/// Tolerance for "pending has returned to zero" and for the cap check.
pub const SIZE_EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentReason {
    DeltaSpd,
    MmRebalance,
}

impl IntentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentReason::DeltaSpd => "DELTA_SPD",
            IntentReason::MmRebalance => "MM_REBALANCE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderIntent {
    pub intent_id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub reason: IntentReason,
    pub created_ts: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Position {
    /// Settled signed size.
    pub inventory: f64,
    /// Signed size committed to in-flight intents.
    pub pending: f64,
    pub last_intent_id: Option<String>,
    pub last_unwind_intent_id: Option<String>,
    pub last_unwind_ts: Option<i64>,
}

impl Position {
    pub fn exposure(&self) -> f64 {
        self.inventory + self.pending
    }
}

#[derive(Debug, Clone)]
pub struct IntentParams {
    pub delta_threshold: f64,
    pub inventory_cap: f64,
    pub order_size: f64,
    pub unwind_start_frac: f64,
    pub unwind_aggressive_frac: f64,
    pub unwind_min_edge_ticks: f64,
    pub unwind_cooldown_ms: i64,
    pub tick_size: f64,
}

/// Position cap breach. Fatal: indicates a logic defect, not a market
/// condition, so it aborts the run instead of being absorbed.
#[derive(Debug, Clone)]
pub struct InvariantViolation {
    pub key: String,
    pub inventory: f64,
    pub pending: f64,
    pub cap: f64,
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "position cap breached for {}: inventory={} pending={} cap={}",
            self.key, self.inventory, self.pending, self.cap
        )
    }
}

impl std::error::Error for InvariantViolation {}

/// Deterministic composite key: the same (market, side, price, size) always
/// maps to the same id, in live and replay alike.
pub fn intent_id(condition_id: &str, asset_id: &str, side: Side, price: f64, size: f64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(condition_id.as_bytes());
    hasher.update(b"|");
    hasher.update(asset_id.as_bytes());
    hasher.update(b"|");
    hasher.update(side.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{price:.6}|{size:.6}").as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

fn position_key(condition_id: &str, asset_id: &str) -> String {
    format!("{condition_id}|{asset_id}")
}

fn round_up_tick(price: f64, tick: f64) -> f64 {
    (price / tick - 1e-9).ceil() * tick
}

fn round_down_tick(price: f64, tick: f64) -> f64 {
    (price / tick + 1e-9).floor() * tick
}

pub struct PositionBook {
    params: IntentParams,
    positions: HashMap<String, Position>,
}

impl PositionBook {
    pub fn new(params: IntentParams) -> Self {
        Self {
            params,
            positions: HashMap::new(),
        }
    }

    pub fn position(&self, condition_id: &str, asset_id: &str) -> Option<&Position> {
        self.positions.get(&position_key(condition_id, asset_id))
    }

    /// Dislocation-driven entry. Caller has already checked the trader
    /// state and that both touches exist.
    pub fn entry_intent(
        &mut self,
        condition_id: &str,
        asset_id: &str,
        signal: &DislocationSignal,
        best_bid: f64,
        best_ask: f64,
        now: i64,
    ) -> Option<OrderIntent> {
        if signal.delta_spd.abs() < self.params.delta_threshold {
            return None;
        }
        let side = if signal.delta_spd > 0.0 { Side::Buy } else { Side::Sell };
        let size = self.params.order_size;
        let cap = self.params.inventory_cap;

        let key = position_key(condition_id, asset_id);
        let pos = self.positions.entry(key).or_default();

        let projected = pos.inventory + pos.pending + side.sign() * size;
        if projected.abs() > cap {
            return None;
        }

        // taker pricing: lift the ask to buy, hit the bid to sell
        let price = match side {
            Side::Buy => best_ask,
            Side::Sell => best_bid,
        };
        let id = intent_id(condition_id, asset_id, side, price, size);
        if pos.pending.abs() > SIZE_EPS && pos.last_intent_id.as_deref() == Some(id.as_str()) {
            return None; // identical intent already in flight
        }

        pos.pending += side.sign() * size;
        pos.last_intent_id = Some(id.clone());
        Some(OrderIntent {
            intent_id: id,
            side,
            price,
            size,
            reason: IntentReason::DeltaSpd,
            created_ts: now,
        })
    }

    /// Rebalance toward flat when exposure exceeds the start fraction of
    /// the cap. Evaluated only when no entry intent fired this tick.
    pub fn unwind_intent(
        &mut self,
        condition_id: &str,
        asset_id: &str,
        best_bid: f64,
        best_ask: f64,
        now: i64,
    ) -> Option<OrderIntent> {
        let p = self.params.clone();
        let key = position_key(condition_id, asset_id);
        let pos = self.positions.entry(key).or_default();

        let exposure = pos.exposure();
        if exposure.abs() < p.inventory_cap * p.unwind_start_frac {
            return None;
        }
        if let Some(last) = pos.last_unwind_ts {
            if now - last < p.unwind_cooldown_ms {
                return None;
            }
        }

        let mut size = p.order_size;
        // inclusive boundary: exposure exactly at the aggressive fraction doubles
        if exposure.abs() >= p.inventory_cap * p.unwind_aggressive_frac {
            size *= 2.0;
        }
        // never flip through flat
        size = size.min(exposure.abs());

        let side = if exposure > 0.0 { Side::Sell } else { Side::Buy };
        let edge = p.unwind_min_edge_ticks * p.tick_size;
        let price = match side {
            Side::Sell => round_up_tick(best_bid + edge, p.tick_size),
            Side::Buy => round_down_tick(best_ask - edge, p.tick_size),
        };

        let id = intent_id(condition_id, asset_id, side, price, size);
        if pos.pending.abs() > SIZE_EPS && pos.last_unwind_intent_id.as_deref() == Some(id.as_str())
        {
            return None;
        }

        pos.pending += side.sign() * size;
        pos.last_unwind_intent_id = Some(id.clone());
        pos.last_unwind_ts = Some(now);
        Some(OrderIntent {
            intent_id: id,
            side,
            price,
            size,
            reason: IntentReason::MmRebalance,
            created_ts: now,
        })
    }

    /// Settle signed filled size out of pending into inventory.
    pub fn apply_fill(&mut self, fill: &FillEvent) -> Result<(), InvariantViolation> {
        let key = position_key(&fill.condition_id, &fill.asset_id);
        let cap = self.params.inventory_cap;
        let pos = self.positions.entry(key.clone()).or_default();

        let signed = fill.side.sign() * fill.filled_size;
        pos.pending -= signed;
        pos.inventory += signed;
        Self::settle_dedup(pos);
        Self::check_caps(&key, pos, cap)
    }

    /// Reverse the pending reservation for an intent that will never settle.
    pub fn apply_fail(&mut self, fail: &FailEvent) -> Result<(), InvariantViolation> {
        let key = position_key(&fail.condition_id, &fail.asset_id);
        let cap = self.params.inventory_cap;
        let pos = self.positions.entry(key.clone()).or_default();

        pos.pending -= fail.side.sign() * fail.size;
        Self::settle_dedup(pos);
        Self::check_caps(&key, pos, cap)
    }

    fn settle_dedup(pos: &mut Position) {
        if pos.pending.abs() <= SIZE_EPS {
            pos.pending = 0.0;
            pos.last_intent_id = None;
            pos.last_unwind_intent_id = None;
        }
    }

    fn check_caps(key: &str, pos: &Position, cap: f64) -> Result<(), InvariantViolation> {
        if pos.inventory.abs() > cap + SIZE_EPS || pos.pending.abs() > cap + SIZE_EPS {
            return Err(InvariantViolation {
                key: key.to_string(),
                inventory: pos.inventory,
                pending: pos.pending,
                cap,
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn seed_position(&mut self, condition_id: &str, asset_id: &str, inventory: f64, pending: f64) {
        let pos = self
            .positions
            .entry(position_key(condition_id, asset_id))
            .or_default();
        pos.inventory = inventory;
        pos.pending = pending;
    }
}
