use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;

use polydelta::config::Config;
use polydelta::dislocation::beta_is_zero;
use polydelta::events::UnifiedEvent;
use polydelta::feed::{catalog, polymarket, spot};
use polydelta::logging::{json_log, obj, v_int, v_num, v_str};
use polydelta::pipeline::{Mode, Pipeline, PipelineContext};
use polydelta::sink::{CollectSink, IntentSink, LiveSink};
use polydelta::storage::SignalStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let mode = Mode::parse(&cfg.mode);
    let run_id = cfg
        .run_id
        .clone()
        .unwrap_or_else(|| format!("r-{}-{}", Utc::now().timestamp_millis(), std::process::id()));

    if beta_is_zero(&cfg.beta_params) && !cfg.allow_zero_beta {
        json_log(
            "startup",
            obj(&[(
                "warning",
                v_str("BETA_PARAMS empty or zero; RUNNING is interlocked to WARMING. Set ALLOW_ZERO_BETA=true to override."),
            )]),
        );
    }

    let mut store = SignalStore::new(&cfg.sqlite_path)?;
    store.init()?;

    let mut pipeline = Pipeline::new(&cfg);
    let mut live_sink = LiveSink;
    let mut collect_sink = CollectSink::new(run_id.clone());
    let collecting = mode != Mode::Live;

    let (catalog, assets_rx) = catalog::MarketCatalog::new();
    let catalog_task = catalog::start_catalog(&cfg, catalog);
    let (tx, mut rx) = mpsc::channel::<UnifiedEvent>(1_024);
    let spot_handle = spot::start_spot_feed(&cfg, tx.clone());
    let pm_handle = polymarket::start_pm_feed(&cfg, assets_rx, tx.clone());
    drop(tx);

    json_log(
        "startup",
        obj(&[
            ("runId", v_str(&run_id)),
            ("mode", v_str(mode.as_str())),
            ("spotProduct", v_str(&cfg.spot_product_id)),
            (
                "targetAssets",
                if cfg.target_assets.is_empty() {
                    v_str("dynamic")
                } else {
                    serde_json::json!(cfg.target_assets)
                },
            ),
            ("marketRefreshMs", v_num(cfg.market_refresh_ms as f64)),
        ]),
    );

    let base_ctx = PipelineContext::new(mode);
    let persist_every_ms = (cfg.persist_every_secs * 1_000) as i64;
    let mut last_flush = Utc::now().timestamp_millis();
    let mut processed: u64 = 0;

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(event) = maybe else { break };
                let ctx = match &event {
                    UnifiedEvent::PmBook(book) => {
                        base_ctx.for_market(book.condition_id.as_deref(), &book.asset_id)
                    }
                    UnifiedEvent::Spot(_) => base_ctx.clone(),
                };
                let sink: &mut dyn IntentSink = if collecting {
                    &mut collect_sink
                } else {
                    &mut live_sink
                };
                pipeline.handle_event(&event, sink, &ctx);
                processed += 1;

                // persistence happens between events, never inside one
                let now = Utc::now().timestamp_millis();
                if collecting && now - last_flush >= persist_every_ms {
                    let flushed = collect_sink.flush(&mut store);
                    last_flush = now;
                    if flushed > 0 {
                        json_log(
                            "persist",
                            obj(&[
                                ("runId", v_str(&run_id)),
                                ("flushedSignals", v_int(flushed as i64)),
                                ("processedEvents", v_int(processed as i64)),
                            ]),
                        );
                    }
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    json_log("shutdown", obj(&[("error", v_str(&err.to_string()))]));
                }
                json_log("shutdown", obj(&[("signal", v_str("ctrl_c"))]));
                break;
            }
        }
    }

    spot_handle.stop();
    pm_handle.stop();
    catalog_task.abort();

    if collecting {
        let flushed = collect_sink.flush(&mut store);
        json_log(
            "shutdown",
            obj(&[
                ("runId", v_str(&run_id)),
                ("flushedSignals", v_int(flushed as i64)),
                ("processedEvents", v_int(processed as i64)),
                ("collisions", v_int(pipeline.collision_count() as i64)),
                ("finalState", v_str(pipeline.state().as_str())),
            ]),
        );
    }
    Ok(())
}
