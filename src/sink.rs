//! Intent sinks: pure consumers of pipeline output, kept outside the
//! decision path. A sink never mutates pipeline state.

use serde::Serialize;

use crate::dislocation::DislocationSignal;
use crate::health::TraderState;
use crate::logging::{json_log, obj, v_num, v_str};
use crate::pipeline::{PipelineContext, PipelineOutput};
use crate::position::OrderIntent;
use crate::storage::SignalStore;

pub trait IntentSink {
    fn handle(&mut self, output: &PipelineOutput, ctx: &PipelineContext);
}

/// Live sink: log only. Execution wiring is out of scope; this is where it
/// would attach.
pub struct LiveSink;

impl IntentSink for LiveSink {
    fn handle(&mut self, output: &PipelineOutput, ctx: &PipelineContext) {
        if let Some(signal) = &output.dislocation {
            json_log(
                "live_dislocation",
                obj(&[
                    ("assetId", v_str(ctx.asset_id.as_deref().unwrap_or("unknown"))),
                    ("expectedProb", v_num(signal.expected_prob)),
                    ("pmMid", v_num(signal.pm_mid)),
                    ("deltaSpd", v_num(signal.delta_spd)),
                    ("state", v_str(output.state.as_str())),
                ]),
            );
        }
        if let Some(intent) = &output.intent {
            json_log(
                "live_intent",
                obj(&[
                    ("intentId", v_str(&intent.intent_id)),
                    ("side", v_str(intent.side.as_str())),
                    ("price", v_num(intent.price)),
                    ("size", v_num(intent.size)),
                    ("reason", v_str(intent.reason.as_str())),
                ]),
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRecord {
    pub condition_id: String,
    pub asset_id: String,
    pub signal: DislocationSignal,
    pub state: TraderState,
    pub ordering_collision: bool,
    pub dt_ms: Option<i64>,
    pub intent: Option<OrderIntent>,
}

/// Accumulates signal rows in memory for replay and collect runs. An
/// explicit `flush` hands the batch to the store; a failed flush is logged
/// and never reaches the decision path.
pub struct CollectSink {
    run_id: String,
    entries: Vec<SignalRecord>,
}

impl CollectSink {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn entries(&self) -> &[SignalRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of entries handed over. The buffer is cleared
    /// even when the insert fails; persistence is best-effort.
    pub fn flush(&mut self, store: &mut SignalStore) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        let count = self.entries.len();
        if let Err(err) = store.insert_signals(&self.run_id, &self.entries) {
            json_log(
                "persist_error",
                obj(&[
                    ("runId", v_str(&self.run_id)),
                    ("error", v_str(&err.to_string())),
                    ("dropped", v_num(count as f64)),
                ]),
            );
        }
        self.entries.clear();
        count
    }
}

impl IntentSink for CollectSink {
    fn handle(&mut self, output: &PipelineOutput, ctx: &PipelineContext) {
        // record rows whenever a signal exists, intent or not
        let Some(signal) = &output.dislocation else {
            return;
        };
        self.entries.push(SignalRecord {
            condition_id: ctx.condition_id.clone().unwrap_or_else(|| "unknown".to_string()),
            asset_id: ctx.asset_id.clone().unwrap_or_else(|| "unknown".to_string()),
            signal: signal.clone(),
            state: output.state,
            ordering_collision: output.ordering_collision,
            dt_ms: output.dt_ms,
            intent: output.intent.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Mode;

    fn output_with_signal(signal: Option<DislocationSignal>) -> PipelineOutput {
        PipelineOutput {
            features: None,
            dislocation: signal,
            intent: None,
            state: TraderState::Running,
            ordering_collision: false,
            dt_ms: Some(12),
        }
    }

    fn signal() -> DislocationSignal {
        DislocationSignal {
            expected_prob: 0.5,
            pm_mid: 0.53,
            delta_spd: -0.03,
            exchange_ts: 1_000,
            ingest_ts: 1_001,
        }
    }

    #[test]
    fn test_collect_records_only_signals() {
        let mut sink = CollectSink::new("run-1");
        let ctx = PipelineContext::new(Mode::Backtest).for_market(Some("c1"), "a1");
        sink.handle(&output_with_signal(None), &ctx);
        assert!(sink.is_empty());
        sink.handle(&output_with_signal(Some(signal())), &ctx);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.entries()[0].condition_id, "c1");
        assert_eq!(sink.entries()[0].asset_id, "a1");
        assert_eq!(sink.entries()[0].dt_ms, Some(12));
    }

    #[test]
    fn test_flush_clears_buffer() {
        let mut sink = CollectSink::new("run-1");
        let ctx = PipelineContext::new(Mode::Backtest).for_market(Some("c1"), "a1");
        sink.handle(&output_with_signal(Some(signal())), &ctx);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signals.sqlite");
        let mut store = SignalStore::new(path.to_str().unwrap()).unwrap();
        store.init().unwrap();

        assert_eq!(sink.flush(&mut store), 1);
        assert!(sink.is_empty());
        assert_eq!(sink.flush(&mut store), 0);
        assert_eq!(store.signal_count("run-1").unwrap(), 1);
    }
}
