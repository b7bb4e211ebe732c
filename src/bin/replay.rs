//! File replay: drive a recorded event set through the same decision path
//! used live, with simulated execution feedback, and persist the results.
//!
//! Input: JSON array of events (`kind`-tagged, optional `arrivalOrdinal`),
//! via INPUT_FILE or the first argument. The summary line includes a
//! fingerprint of the canonical event order so runs over the same data are
//! directly comparable.

use std::fs;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

use polydelta::config::Config;
use polydelta::events::UnifiedEvent;
use polydelta::logging::{json_log, obj, v_int, v_str};
use polydelta::pipeline::{Mode, Pipeline, PipelineContext};
use polydelta::replay::{replay_events, sort_events, ReplayEvent};
use polydelta::sim::SimulatedExecution;
use polydelta::sink::CollectSink;
use polydelta::storage::SignalStore;

fn event_fingerprint(events: &[ReplayEvent]) -> String {
    let mut ordered = events.to_vec();
    for (idx, ev) in ordered.iter_mut().enumerate() {
        if ev.arrival_ordinal.is_none() {
            ev.arrival_ordinal = Some(idx as u64);
        }
    }
    sort_events(&mut ordered);

    let mut hasher = Sha256::new();
    for ev in &ordered {
        let key = match &ev.event {
            UnifiedEvent::Spot(tick) => format!(
                "{}:spot:{}:{}",
                tick.exchange_ts, tick.product_id, tick.ingest_ts
            ),
            UnifiedEvent::PmBook(book) => format!(
                "{}:pmBook:{}:{}:{}",
                book.exchange_ts,
                book.condition_id.as_deref().unwrap_or(""),
                book.asset_id,
                book.ingest_ts
            ),
        };
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(&hasher.finalize()[..16])
}

fn main() -> Result<()> {
    let cfg = Config::from_env();
    let input = std::env::var("INPUT_FILE")
        .ok()
        .or_else(|| std::env::args().nth(1))
        .ok_or_else(|| anyhow!("INPUT_FILE env or first arg required (JSON array of events)"))?;
    let run_id = cfg
        .run_id
        .clone()
        .unwrap_or_else(|| format!("replay-{}", std::process::id()));

    let raw = fs::read_to_string(&input).with_context(|| format!("read {input}"))?;
    let events: Vec<ReplayEvent> =
        serde_json::from_str(&raw).with_context(|| format!("parse events from {input}"))?;
    let event_count = events.len();
    let fingerprint = event_fingerprint(&events);

    let mut pipeline = Pipeline::new(&cfg);
    let mut sink = CollectSink::new(run_id.clone());
    let mut sim = SimulatedExecution::new(cfg.sim_params());
    let ctx = PipelineContext::new(Mode::Backtest);

    let outputs = replay_events(&mut pipeline, events, &mut sink, &ctx, Some(&mut sim))?;
    let intents = outputs.iter().filter(|o| o.intent.is_some()).count();
    let signals = sink.len();

    let mut store = SignalStore::new(&cfg.sqlite_path)?;
    store.init()?;
    sink.flush(&mut store);
    let trades = store.insert_trades(&run_id, sim.trades())?;

    json_log(
        "replay_summary",
        obj(&[
            ("runId", v_str(&run_id)),
            ("input", v_str(&input)),
            ("eventCount", v_int(event_count as i64)),
            ("signals", v_int(signals as i64)),
            ("intents", v_int(intents as i64)),
            ("simTrades", v_int(trades as i64)),
            ("collisions", v_int(pipeline.collision_count() as i64)),
            ("finalState", v_str(pipeline.state().as_str())),
            ("eventHash", v_str(&fingerprint)),
        ]),
    );
    Ok(())
}
