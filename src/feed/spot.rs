//! Spot ticker feed (Coinbase Advanced Trade websocket).

use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::FeedHandle;
use crate::config::Config;
use crate::events::{DataError, SpotTick, UnifiedEvent};
use crate::logging::{json_log, obj, v_str};

#[derive(Debug, Deserialize)]
struct TickerMsg {
    #[serde(rename = "type")]
    msg_type: Option<String>,
    product_id: Option<String>,
    price: Option<String>,
    best_bid: Option<String>,
    best_ask: Option<String>,
    time: Option<String>,
}

pub fn start_spot_feed(cfg: &Config, tx: mpsc::Sender<UnifiedEvent>) -> FeedHandle {
    let url = cfg.spot_ws_url.clone();
    let products = vec![cfg.spot_product_id.clone()];
    let stale_ms = cfg.spot_stale_ms;

    let task = tokio::spawn(async move {
        loop {
            if let Err(err) = run_once(&url, &products, stale_ms, &tx).await {
                json_log(
                    "spot_feed",
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

async fn run_once(
    url: &str,
    products: &[String],
    stale_ms: i64,
    tx: &mpsc::Sender<UnifiedEvent>,
) -> Result<()> {
    let url = Url::parse(url)?;
    let (ws, _) = connect_async(url).await?;
    let (mut write, mut read) = ws.split();

    let subscribe = json!({
        "type": "subscribe",
        "product_ids": products,
        "channel": "ticker",
    });
    write.send(Message::Text(subscribe.to_string())).await?;
    json_log(
        "spot_feed",
        obj(&[
            ("status", v_str("connected")),
            ("products", serde_json::json!(products)),
        ]),
    );

    while let Some(msg) = read.next().await {
        let msg = msg?;
        let Message::Text(text) = msg else { continue };
        let ingest_ts = Utc::now().timestamp_millis();
        match normalize_ticker(&text, products, stale_ms, ingest_ts) {
            Ok(Some(event)) => {
                if tx.send(event).await.is_err() {
                    return Ok(()); // consumer gone, shut down quietly
                }
            }
            Ok(None) => {}
            Err(err) => {
                json_log("data_error", obj(&[("error", v_str(&err.to_string()))]));
            }
        }
    }
    Ok(())
}

/// Normalize one ticker frame. `Ok(None)` filters uninteresting or stale
/// frames; `Err` marks a malformed payload, dropped before the consumer.
fn normalize_ticker(
    text: &str,
    products: &[String],
    stale_ms: i64,
    ingest_ts: i64,
) -> Result<Option<UnifiedEvent>, DataError> {
    let msg: TickerMsg = serde_json::from_str(text)
        .map_err(|err| DataError::new("spot", format!("unparseable frame: {err}")))?;
    if msg.msg_type.as_deref() != Some("ticker") {
        return Ok(None);
    }
    let Some(product_id) = msg.product_id else {
        return Err(DataError::new("spot", "ticker frame without product_id"));
    };
    if !products.contains(&product_id) {
        return Ok(None);
    }

    let exchange_ts = msg
        .time
        .as_deref()
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|d| d.timestamp_millis())
        .unwrap_or(ingest_ts);
    if ingest_ts - exchange_ts > stale_ms {
        return Ok(None);
    }

    let best_bid = msg.best_bid.as_deref().and_then(|v| v.parse::<f64>().ok());
    let best_ask = msg.best_ask.as_deref().and_then(|v| v.parse::<f64>().ok());
    let mid = match (best_bid, best_ask) {
        (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
        _ => msg.price.as_deref().and_then(|v| v.parse::<f64>().ok()),
    };

    let mut parts = product_id.split('-');
    let base_asset = parts.next().map(|s| s.to_string());
    let quote_asset = parts.next().map(|s| s.to_string());

    Ok(Some(UnifiedEvent::Spot(SpotTick {
        product_id,
        base_asset,
        quote_asset,
        mid,
        exchange_ts,
        ingest_ts,
    })))
}
