//! Prediction-market feed: `price_changes` over the clob_market topic.
//!
//! Per-asset best-book deltas are merged into a local book so partial
//! updates (bid-only, ask-only) still yield a complete view; the mid is
//! only reported when both sides are present and the book is fresh.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::FeedHandle;
use crate::config::Config;
use crate::events::{DataError, PmBook, UnifiedEvent};
use crate::logging::{json_log, obj, v_int, v_str};

#[derive(Debug, Deserialize)]
struct PriceChangesMsg {
    topic: Option<String>,
    #[serde(rename = "type")]
    msg_type: Option<String>,
    payload: Option<PricePayload>,
}

#[derive(Debug, Deserialize)]
struct PricePayload {
    /// conditionId
    m: Option<String>,
    /// ms timestamp, as a string
    t: Option<serde_json::Value>,
    pc: Option<Vec<PriceChange>>,
}

#[derive(Debug, Deserialize)]
struct PriceChange {
    /// asset id
    a: String,
    /// best ask / best bid deltas; absent fields keep the previous value
    ba: Option<String>,
    bb: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct LocalBook {
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    updated_at: i64,
}

pub fn start_pm_feed(
    cfg: &Config,
    assets_rx: watch::Receiver<Vec<String>>,
    tx: mpsc::Sender<UnifiedEvent>,
) -> FeedHandle {
    let url = cfg.pm_ws_url.clone();
    let target_assets = cfg.target_assets.clone();
    let stale_ms = cfg.book_stale_ms;

    let task = tokio::spawn(async move {
        // books survive reconnects so partial updates stay merged
        let mut books: HashMap<String, LocalBook> = HashMap::new();
        let mut assets_rx = assets_rx;
        loop {
            if let Err(err) =
                run_once(&url, &target_assets, &mut assets_rx, stale_ms, &mut books, &tx).await
            {
                json_log(
                    "pm_feed",
                    obj(&[
                        ("status", v_str("disconnected")),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
            }
            if tx.is_closed() {
                return;
            }
            sleep(Duration::from_secs(3)).await;
        }
    });
    FeedHandle::new(task)
}

fn subscribe_frame(assets: &[String]) -> String {
    let filters = if assets.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::Value::String(assets.join(","))
    };
    json!({
        "subscriptions": [{
            "topic": "clob_market",
            "type": "price_changes",
            "filters": filters,
        }]
    })
    .to_string()
}

async fn run_once(
    url: &str,
    target_assets: &[String],
    assets_rx: &mut watch::Receiver<Vec<String>>,
    stale_ms: i64,
    books: &mut HashMap<String, LocalBook>,
    tx: &mpsc::Sender<UnifiedEvent>,
) -> Result<()> {
    let url = Url::parse(url)?;
    let (ws, _) = connect_async(url).await?;
    let (mut write, mut read) = ws.split();

    // explicit TARGET_ASSETS overrides the catalog
    let mut current_assets = if target_assets.is_empty() {
        assets_rx.borrow().clone()
    } else {
        target_assets.to_vec()
    };
    write
        .send(Message::Text(subscribe_frame(&current_assets)))
        .await?;
    json_log(
        "pm_feed",
        obj(&[
            ("status", v_str("connected")),
            ("subscribedAssets", v_int(current_assets.len() as i64)),
        ]),
    );

    loop {
        tokio::select! {
            changed = assets_rx.changed() => {
                if changed.is_err() {
                    return Ok(()); // catalog gone
                }
                let latest = assets_rx.borrow_and_update().clone();
                if target_assets.is_empty() {
                    current_assets = latest;
                    write.send(Message::Text(subscribe_frame(&current_assets))).await?;
                    json_log(
                        "pm_feed",
                        obj(&[
                            ("status", v_str("resubscribed")),
                            ("subscribedAssets", v_int(current_assets.len() as i64)),
                        ]),
                    );
                }
            }
            msg = read.next() => {
                let Some(msg) = msg else { return Ok(()) };
                let msg = msg?;
                let Message::Text(text) = msg else { continue };
                let ingest_ts = Utc::now().timestamp_millis();
                match normalize_price_changes(&text, &current_assets, stale_ms, books, ingest_ts) {
                    Ok(events) => {
                        for event in events {
                            if tx.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Err(err) => {
                        json_log("data_error", obj(&[("error", v_str(&err.to_string()))]));
                    }
                }
            }
        }
    }
}

/// Merge one price_changes frame into the local books and emit one
/// `PmBook` event per updated asset.
fn normalize_price_changes(
    text: &str,
    filter_assets: &[String],
    stale_ms: i64,
    books: &mut HashMap<String, LocalBook>,
    ingest_ts: i64,
) -> Result<Vec<UnifiedEvent>, DataError> {
    let msg: PriceChangesMsg = serde_json::from_str(text)
        .map_err(|err| DataError::new("pmBook", format!("unparseable frame: {err}")))?;
    if msg.topic.as_deref() != Some("clob_market")
        || msg.msg_type.as_deref() != Some("price_changes")
    {
        return Ok(Vec::new());
    }
    let Some(payload) = msg.payload else {
        return Err(DataError::new("pmBook", "price_changes without payload"));
    };
    let Some(changes) = payload.pc else {
        return Err(DataError::new("pmBook", "price_changes without pc list"));
    };
    let condition_id = payload.m;

    let exchange_ts = payload
        .t
        .as_ref()
        .and_then(|v| match v {
            serde_json::Value::String(s) => s.parse::<i64>().ok(),
            serde_json::Value::Number(n) => n.as_i64(),
            _ => None,
        })
        .unwrap_or(ingest_ts);

    let mut events = Vec::new();
    for change in changes {
        if !filter_assets.is_empty() && !filter_assets.contains(&change.a) {
            continue;
        }
        let book = books.entry(change.a.clone()).or_default();
        if let Some(bid) = change.bb.as_deref().and_then(|v| v.parse::<f64>().ok()) {
            book.best_bid = Some(bid);
        }
        if let Some(ask) = change.ba.as_deref().and_then(|v| v.parse::<f64>().ok()) {
            book.best_ask = Some(ask);
        }
        let prev_update = book.updated_at;
        book.updated_at = exchange_ts;

        let stale = prev_update > 0 && exchange_ts - prev_update > stale_ms;
        let mid = match (book.best_bid, book.best_ask) {
            (Some(bid), Some(ask)) if !stale => Some((bid + ask) / 2.0),
            _ => None,
        };

        events.push(UnifiedEvent::PmBook(PmBook {
            asset_id: change.a,
            condition_id: condition_id.clone(),
            best_bid: book.best_bid,
            best_ask: book.best_ask,
            mid,
            exchange_ts,
            ingest_ts,
        }));
    }
    Ok(events)
}
