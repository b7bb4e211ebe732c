//! Active-market discovery. The up/down markets roll every window, so the
//! catalog rebuilds the slug list ahead of time and republishes the active
//! asset-id set for the prediction-market feed to (re)subscribe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use crate::config::Config;
use crate::logging::{json_log, obj, v_int, v_str};

const MARKET_ASSET: &str = "btc";
const WINDOW_SECS: i64 = 15 * 60;

#[derive(Debug, Clone)]
pub struct MarketDescriptor {
    pub condition_id: String,
    pub asset_ids: Vec<String>,
    pub tick_size: f64,
    pub min_order_size: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    condition_id: Option<String>,
    clob_token_ids: Option<serde_json::Value>,
    order_price_min_tick_size: Option<f64>,
    order_min_size: Option<f64>,
}

pub struct MarketCatalog {
    state: Mutex<HashMap<String, MarketDescriptor>>,
    assets_tx: watch::Sender<Vec<String>>,
}

impl MarketCatalog {
    pub fn new() -> (Arc<Self>, watch::Receiver<Vec<String>>) {
        let (assets_tx, assets_rx) = watch::channel(Vec::new());
        (
            Arc::new(Self {
                state: Mutex::new(HashMap::new()),
                assets_tx,
            }),
            assets_rx,
        )
    }

    pub fn active_markets(&self) -> Vec<MarketDescriptor> {
        self.state.lock().expect("catalog lock").values().cloned().collect()
    }

    /// Sorted so the subscription filter is stable across refreshes.
    pub fn active_asset_ids(&self) -> Vec<String> {
        let state = self.state.lock().expect("catalog lock");
        let mut ids: Vec<String> = state
            .values()
            .flat_map(|m| m.asset_ids.iter().cloned())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn descriptor_for_asset(&self, asset_id: &str) -> Option<MarketDescriptor> {
        let state = self.state.lock().expect("catalog lock");
        state
            .values()
            .find(|m| m.asset_ids.iter().any(|a| a == asset_id))
            .cloned()
    }

    fn store(&self, markets: Vec<MarketDescriptor>) {
        let mut state = self.state.lock().expect("catalog lock");
        state.clear();
        for market in markets {
            state.insert(market.condition_id.clone(), market);
        }
        drop(state);
        let _ = self.assets_tx.send(self.active_asset_ids());
    }
}

fn ceil_to_interval(epoch_secs: i64, interval_secs: i64) -> i64 {
    (epoch_secs + interval_secs - 1) / interval_secs * interval_secs
}

fn build_slugs(now_secs: i64, windows_ahead: u32) -> Vec<String> {
    let current_end = ceil_to_interval(now_secs, WINDOW_SECS);
    (0..windows_ahead as i64)
        .map(|i| format!("{MARKET_ASSET}-updown-15m-{}", current_end + i * WINDOW_SECS))
        .collect()
}

fn parse_token_ids(value: &serde_json::Value) -> Vec<String> {
    let items = match value {
        // often double-encoded: a JSON string containing a JSON array
        serde_json::Value::String(s) => serde_json::from_str::<serde_json::Value>(s)
            .ok()
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default(),
        serde_json::Value::Array(arr) => arr.clone(),
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect()
}

fn to_descriptor(market: GammaMarket) -> Option<MarketDescriptor> {
    let condition_id = market.condition_id?;
    let asset_ids = market
        .clob_token_ids
        .as_ref()
        .map(parse_token_ids)
        .unwrap_or_default();
    if asset_ids.is_empty() {
        return None;
    }
    Some(MarketDescriptor {
        condition_id,
        asset_ids,
        tick_size: market.order_price_min_tick_size.unwrap_or(0.01),
        min_order_size: market.order_min_size.unwrap_or(1.0),
    })
}

pub fn start_catalog(cfg: &Config, catalog: Arc<MarketCatalog>) -> tokio::task::JoinHandle<()> {
    let base = cfg.gamma_base.clone();
    let refresh = Duration::from_millis(cfg.market_refresh_ms);
    let windows_ahead = cfg.market_windows_ahead;

    tokio::spawn(async move {
        let client = reqwest::Client::new();
        loop {
            match refresh_once(&client, &base, windows_ahead).await {
                Ok(markets) => {
                    json_log(
                        "catalog",
                        obj(&[
                            ("status", v_str("refreshed")),
                            ("markets", v_int(markets.len() as i64)),
                        ]),
                    );
                    catalog.store(markets);
                }
                Err(err) => {
                    json_log(
                        "catalog_error",
                        obj(&[("error", v_str(&err.to_string()))]),
                    );
                }
            }
            sleep(refresh).await;
        }
    })
}

async fn refresh_once(
    client: &reqwest::Client,
    base: &str,
    windows_ahead: u32,
) -> Result<Vec<MarketDescriptor>> {
    let slugs = build_slugs(Utc::now().timestamp(), windows_ahead);
    let query: Vec<(&str, &str)> = slugs.iter().map(|s| ("slug", s.as_str())).collect();
    let resp = client
        .get(format!("{base}/markets"))
        .query(&query)
        .send()
        .await?;
    if !resp.status().is_success() {
        anyhow::bail!("markets query failed: {}", resp.status());
    }
    let rows: Vec<GammaMarket> = resp.json().await?;
    Ok(rows.into_iter().filter_map(to_descriptor).collect())
}
