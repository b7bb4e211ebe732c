//! Canonical event ordering and the replay harness.
//!
//! Replay feeds the exact `handle_event` used live. Ordering is
//! `exchange_ts` ascending, book-before-spot on ties, then arrival ordinal;
//! a non-monotonic timestamp after sorting means the sort or ordinal
//! assignment is broken and the run aborts.

use serde::{Deserialize, Serialize};

use crate::events::UnifiedEvent;
use crate::pipeline::{Pipeline, PipelineContext, PipelineOutput};
use crate::position::InvariantViolation;
use crate::sim::{Settlement, SimulatedExecution};
use crate::sink::IntentSink;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEvent {
    #[serde(flatten)]
    pub event: UnifiedEvent,
    #[serde(
        default,
        rename = "arrivalOrdinal",
        skip_serializing_if = "Option::is_none"
    )]
    pub arrival_ordinal: Option<u64>,
}

impl From<UnifiedEvent> for ReplayEvent {
    fn from(event: UnifiedEvent) -> Self {
        Self {
            event,
            arrival_ordinal: None,
        }
    }
}

/// Stable sort by (exchange_ts, kind priority, arrival ordinal).
pub fn sort_events(events: &mut [ReplayEvent]) {
    events.sort_by(|a, b| {
        a.event
            .exchange_ts()
            .cmp(&b.event.exchange_ts())
            .then_with(|| a.event.kind().priority().cmp(&b.event.kind().priority()))
            .then_with(|| {
                a.arrival_ordinal
                    .unwrap_or(0)
                    .cmp(&b.arrival_ordinal.unwrap_or(0))
            })
    });
}

#[derive(Debug)]
pub enum ReplayError {
    /// Post-sort exchange_ts went backwards.
    Ordering { prev_ts: i64, ts: i64 },
    /// Position cap breached while applying simulated feedback.
    Invariant(InvariantViolation),
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayError::Ordering { prev_ts, ts } => {
                write!(f, "non-monotonic exchangeTs after sort: {ts} after {prev_ts}")
            }
            ReplayError::Invariant(v) => v.fmt(f),
        }
    }
}

impl std::error::Error for ReplayError {}

impl From<InvariantViolation> for ReplayError {
    fn from(v: InvariantViolation) -> Self {
        ReplayError::Invariant(v)
    }
}

/// Assign missing ordinals, sort, and drive every event through the
/// pipeline. With a simulator attached, due settlements are applied before
/// each event and emitted intents are handed to it afterwards; leftovers
/// settle after the last event.
pub fn replay_events(
    pipeline: &mut Pipeline,
    mut events: Vec<ReplayEvent>,
    sink: &mut dyn IntentSink,
    ctx: &PipelineContext,
    mut sim: Option<&mut SimulatedExecution>,
) -> Result<Vec<PipelineOutput>, ReplayError> {
    for (idx, ev) in events.iter_mut().enumerate() {
        if ev.arrival_ordinal.is_none() {
            ev.arrival_ordinal = Some(idx as u64);
        }
    }
    sort_events(&mut events);

    let mut outputs = Vec::with_capacity(events.len());
    let mut last_ts = i64::MIN;
    for ev in &events {
        let ts = ev.event.exchange_ts();
        if ts < last_ts {
            return Err(ReplayError::Ordering { prev_ts: last_ts, ts });
        }
        last_ts = ts;

        if let Some(sim) = sim.as_deref_mut() {
            apply_settlements(pipeline, sim.due(ts))?;
        }

        let ev_ctx = match &ev.event {
            UnifiedEvent::PmBook(book) => ctx.for_market(book.condition_id.as_deref(), &book.asset_id),
            UnifiedEvent::Spot(_) => ctx.clone(),
        };
        let output = pipeline.handle_event(&ev.event, sink, &ev_ctx);

        if let Some(sim) = sim.as_deref_mut() {
            if let (Some(intent), UnifiedEvent::PmBook(book)) = (&output.intent, &ev.event) {
                sim.place(
                    intent,
                    book.condition_id.as_deref().unwrap_or("unknown"),
                    &book.asset_id,
                    ts,
                );
            }
        }
        outputs.push(output);
    }

    if let Some(sim) = sim.as_deref_mut() {
        apply_settlements(pipeline, sim.drain())?;
    }
    Ok(outputs)
}

fn apply_settlements(
    pipeline: &mut Pipeline,
    settlements: Vec<Settlement>,
) -> Result<(), ReplayError> {
    for settlement in settlements {
        match settlement {
            Settlement::Fill(fill) => pipeline.apply_fill(&fill)?,
            Settlement::Fail(fail) => pipeline.apply_fail(&fail)?,
        }
    }
    Ok(())
}
