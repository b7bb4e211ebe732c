//! Env-driven configuration, parsed once at startup and injected into each
//! component. No module reads the environment after this point.

use crate::dislocation::{parse_beta, BetaParams};
use crate::features::FeatureConfig;
use crate::health::HealthLimits;
use crate::position::IntentParams;
use crate::sim::SimParams;

#[derive(Debug, Clone)]
pub struct Config {
    // feature windows
    pub anchor_window_ms: i64,
    pub ema_fast_half_life_ms: f64,
    pub ema_slow_half_life_ms: f64,
    pub vol_window_ms: i64,
    pub expected_interval_ms: f64,
    // health gates
    pub max_latency_ms: i64,
    pub max_stale_ms: i64,
    // model
    pub beta_params: BetaParams,
    pub allow_zero_beta: bool,
    // intents
    pub delta_threshold: f64,
    pub inventory_cap: f64,
    pub order_size: f64,
    pub unwind_start_frac: f64,
    pub unwind_aggressive_frac: f64,
    pub unwind_min_edge_ticks: f64,
    pub unwind_cooldown_ms: i64,
    pub tick_size: f64,
    // feeds
    pub spot_product_id: String,
    pub spot_ws_url: String,
    pub spot_stale_ms: i64,
    pub pm_ws_url: String,
    pub book_stale_ms: i64,
    pub target_assets: Vec<String>,
    pub market_refresh_ms: u64,
    pub market_windows_ahead: u32,
    pub gamma_base: String,
    // persistence + run identity
    pub sqlite_path: String,
    pub persist_every_secs: u64,
    pub run_id: Option<String>,
    pub mode: String,
    // simulated execution (replay only)
    pub sim_latency_min_ms: i64,
    pub sim_latency_max_ms: i64,
    pub sim_fail_prob: f64,
    pub sim_fee_bps: f64,
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            anchor_window_ms: std::env::var("FEATURE_ANCHOR_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(60_000),
            ema_fast_half_life_ms: std::env::var("FEATURE_EMA_FAST_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(10_000.0),
            ema_slow_half_life_ms: std::env::var("FEATURE_EMA_SLOW_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(60_000.0),
            vol_window_ms: std::env::var("FEATURE_VOL_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(120_000),
            expected_interval_ms: std::env::var("FEATURE_INTERVAL_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(1_000.0),
            max_latency_ms: std::env::var("HEALTH_MAX_LATENCY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(1_500),
            max_stale_ms: std::env::var("HEALTH_MAX_STALE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(5_000),
            beta_params: parse_beta(&std::env::var("BETA_PARAMS").unwrap_or_default()),
            allow_zero_beta: env_flag("ALLOW_ZERO_BETA"),
            delta_threshold: std::env::var("INTENT_DELTA_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(0.02),
            inventory_cap: std::env::var("INTENT_INVENTORY_CAP").ok().and_then(|v| v.parse().ok()).unwrap_or(100.0),
            order_size: std::env::var("INTENT_ORDER_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(1.0),
            unwind_start_frac: std::env::var("UNWIND_START_FRAC").ok().and_then(|v| v.parse().ok()).unwrap_or(0.5),
            unwind_aggressive_frac: std::env::var("UNWIND_AGGRESSIVE_FRAC").ok().and_then(|v| v.parse().ok()).unwrap_or(0.8),
            unwind_min_edge_ticks: std::env::var("UNWIND_MIN_EDGE_TICKS").ok().and_then(|v| v.parse().ok()).unwrap_or(1.0),
            unwind_cooldown_ms: std::env::var("UNWIND_COOLDOWN_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(5_000),
            tick_size: std::env::var("UNWIND_TICK_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(0.01),
            spot_product_id: std::env::var("SPOT_PRODUCT_ID").unwrap_or_else(|_| "BTC-USD".to_string()),
            spot_ws_url: std::env::var("SPOT_WS_URL").unwrap_or_else(|_| "wss://advanced-trade-ws.coinbase.com".to_string()),
            spot_stale_ms: std::env::var("SPOT_STALE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(3_000),
            pm_ws_url: std::env::var("PM_WS_URL").unwrap_or_else(|_| "wss://ws-live-data.polymarket.com".to_string()),
            book_stale_ms: std::env::var("BOOK_STALE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(5_000),
            target_assets: std::env::var("TARGET_ASSETS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            market_refresh_ms: std::env::var("MARKET_REFRESH_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(60_000),
            market_windows_ahead: std::env::var("MARKET_WINDOWS_AHEAD").ok().and_then(|v| v.parse().ok()).unwrap_or(4),
            gamma_base: std::env::var("GAMMA_BASE").unwrap_or_else(|_| "https://gamma-api.polymarket.com".to_string()),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./signals.sqlite".to_string()),
            persist_every_secs: std::env::var("PERSIST_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(300),
            run_id: std::env::var("RUN_ID").ok().filter(|v| !v.is_empty()),
            mode: std::env::var("MODE").unwrap_or_else(|_| "collect".to_string()).to_lowercase(),
            sim_latency_min_ms: std::env::var("SIM_LATENCY_MIN_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(200),
            sim_latency_max_ms: std::env::var("SIM_LATENCY_MAX_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(1_200),
            sim_fail_prob: std::env::var("SIM_FAIL_PROB").ok().and_then(|v| v.parse().ok()).unwrap_or(0.01),
            sim_fee_bps: std::env::var("SIM_FEE_BPS").ok().and_then(|v| v.parse().ok()).unwrap_or(0.0),
        }
    }

    pub fn feature_config(&self) -> FeatureConfig {
        FeatureConfig::from_config(self)
    }

    pub fn health_limits(&self) -> HealthLimits {
        HealthLimits {
            max_latency_ms: self.max_latency_ms,
            max_stale_ms: self.max_stale_ms,
        }
    }

    pub fn intent_params(&self) -> IntentParams {
        IntentParams {
            delta_threshold: self.delta_threshold,
            inventory_cap: self.inventory_cap,
            order_size: self.order_size,
            unwind_start_frac: self.unwind_start_frac,
            unwind_aggressive_frac: self.unwind_aggressive_frac,
            unwind_min_edge_ticks: self.unwind_min_edge_ticks,
            unwind_cooldown_ms: self.unwind_cooldown_ms,
            tick_size: self.tick_size,
        }
    }

    pub fn sim_params(&self) -> SimParams {
        SimParams {
            latency_min_ms: self.sim_latency_min_ms,
            latency_max_ms: self.sim_latency_max_ms,
            fail_prob: self.sim_fail_prob,
            fee_bps: self.sim_fee_bps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_configs_mirror_fields() {
        let mut cfg = Config::from_env();
        cfg.inventory_cap = 250.0;
        cfg.max_stale_ms = 9_000;
        cfg.anchor_window_ms = 30_000;
        assert_eq!(cfg.intent_params().inventory_cap, 250.0);
        assert_eq!(cfg.health_limits().max_stale_ms, 9_000);
        assert_eq!(cfg.feature_config().anchor_window_ms, 30_000);
    }
}
