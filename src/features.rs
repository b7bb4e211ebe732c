//! Rolling statistics primitives and the per-instrument feature engine.
//!
//! All windows are time-based on `exchange_ts`, not sample counts, so the
//! same tick stream produces the same features regardless of arrival pacing.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::Config;

/// EMA parameterized by half-life. Alpha assumes a roughly regular tick
/// interval; there is no timestamp-aware re-weighting.
#[derive(Debug, Clone)]
pub struct RollingEma {
    alpha: f64,
    current: Option<f64>,
}

impl RollingEma {
    pub fn new(half_life_ms: f64, interval_ms: f64) -> Self {
        let lambda = std::f64::consts::LN_2 / half_life_ms;
        Self {
            alpha: 1.0 - (-lambda * interval_ms).exp(),
            current: None,
        }
    }

    /// First sample seeds the EMA; later samples blend by alpha.
    pub fn update(&mut self, value: f64) -> f64 {
        let next = match self.current {
            None => value,
            Some(cur) => self.alpha * value + (1.0 - self.alpha) * cur,
        };
        self.current = Some(next);
        next
    }

    pub fn get(&self) -> Option<f64> {
        self.current
    }
}

/// Sliding time window whose oldest surviving sample is the anchor.
#[derive(Debug, Clone)]
pub struct WindowAnchor {
    window_ms: i64,
    samples: VecDeque<(i64, f64)>,
}

impl WindowAnchor {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            samples: VecDeque::new(),
        }
    }

    pub fn update(&mut self, value: f64, ts: i64) -> Option<f64> {
        self.samples.push_back((ts, value));
        self.prune(ts);
        self.samples.front().map(|&(_, v)| v)
    }

    pub fn get(&self) -> Option<f64> {
        self.samples.front().map(|&(_, v)| v)
    }

    fn prune(&mut self, now: i64) {
        let cutoff = now - self.window_ms;
        while let Some(&(head_ts, _)) = self.samples.front() {
            if head_ts < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Population standard deviation over a sliding time window. Returns 0.0
/// while the window is empty.
#[derive(Debug, Clone)]
pub struct RollingStd {
    window_ms: i64,
    samples: VecDeque<(i64, f64)>,
}

impl RollingStd {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            samples: VecDeque::new(),
        }
    }

    pub fn update(&mut self, value: f64, ts: i64) -> f64 {
        self.samples.push_back((ts, value));
        let cutoff = ts - self.window_ms;
        while let Some(&(head_ts, _)) = self.samples.front() {
            if head_ts < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.std()
    }

    fn std(&self) -> f64 {
        let n = self.samples.len();
        if n == 0 {
            return 0.0;
        }
        let mean = self.samples.iter().map(|&(_, v)| v).sum::<f64>() / n as f64;
        let variance = self
            .samples
            .iter()
            .map(|&(_, v)| (v - mean) * (v - mean))
            .sum::<f64>()
            / n as f64;
        variance.sqrt()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureConfig {
    pub anchor_window_ms: i64,
    pub ema_fast_half_life_ms: f64,
    pub ema_slow_half_life_ms: f64,
    pub vol_window_ms: i64,
    pub expected_interval_ms: f64,
}

impl FeatureConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            anchor_window_ms: cfg.anchor_window_ms,
            ema_fast_half_life_ms: cfg.ema_fast_half_life_ms,
            ema_slow_half_life_ms: cfg.ema_slow_half_life_ms,
            vol_window_ms: cfg.vol_window_ms,
            expected_interval_ms: cfg.expected_interval_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureVector {
    /// Log return from the anchor price: `ln(spot / anchor)`.
    #[serde(default)]
    pub x1: Option<f64>,
    #[serde(default)]
    pub ema_fast: Option<f64>,
    #[serde(default)]
    pub ema_slow: Option<f64>,
    /// Rolling std of ln(spot).
    #[serde(default)]
    pub vol: Option<f64>,
    #[serde(default)]
    pub spot: Option<f64>,
    pub ts: i64,
}

impl FeatureVector {
    pub fn is_ready(&self) -> bool {
        self.x1.is_some() && self.ema_fast.is_some() && self.ema_slow.is_some() && self.vol.is_some()
    }
}

/// Per-instrument feature state. Created lazily on the first spot tick for
/// a product and kept for the life of the run.
#[derive(Debug, Clone)]
pub struct FeatureEngine {
    anchor: WindowAnchor,
    ema_fast: RollingEma,
    ema_slow: RollingEma,
    vol: RollingStd,
    latest: Option<FeatureVector>,
}

impl FeatureEngine {
    pub fn new(cfg: FeatureConfig) -> Self {
        Self {
            anchor: WindowAnchor::new(cfg.anchor_window_ms),
            ema_fast: RollingEma::new(cfg.ema_fast_half_life_ms, cfg.expected_interval_ms),
            ema_slow: RollingEma::new(cfg.ema_slow_half_life_ms, cfg.expected_interval_ms),
            vol: RollingStd::new(cfg.vol_window_ms),
            latest: None,
        }
    }

    pub fn update(&mut self, spot: f64, exchange_ts: i64) -> FeatureVector {
        let anchor = self.anchor.update(spot, exchange_ts);
        let ema_fast = self.ema_fast.update(spot);
        let ema_slow = self.ema_slow.update(spot);
        let vol = self.vol.update(spot.ln(), exchange_ts);
        let x1 = anchor.map(|a| (spot / a).ln());

        let features = FeatureVector {
            x1,
            ema_fast: Some(ema_fast),
            ema_slow: Some(ema_slow),
            vol: Some(vol),
            spot: Some(spot),
            ts: exchange_ts,
        };
        self.latest = Some(features.clone());
        features
    }

    /// Last computed vector, without updating. Book events read features
    /// through this when no fresh spot tick exists.
    pub fn latest(&self) -> Option<&FeatureVector> {
        self.latest.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> FeatureConfig {
        FeatureConfig {
            anchor_window_ms: 60_000,
            ema_fast_half_life_ms: 10_000.0,
            ema_slow_half_life_ms: 60_000.0,
            vol_window_ms: 120_000,
            expected_interval_ms: 1_000.0,
        }
    }

    #[test]
    fn test_ema_seeds_on_first_update() {
        let mut ema = RollingEma::new(10_000.0, 1_000.0);
        assert_eq!(ema.get(), None);
        assert_eq!(ema.update(42.0), 42.0);
    }

    #[test]
    fn test_ema_converges_monotonically() {
        let mut ema = RollingEma::new(10_000.0, 1_000.0);
        ema.update(100.0);
        let target = 110.0;
        let mut prev = ema.get().unwrap();
        for _ in 0..200 {
            let next = ema.update(target);
            assert!(next > prev, "EMA must move toward a constant input");
            assert!(next <= target);
            prev = next;
        }
        assert!((target - prev).abs() < 0.01);
    }

    #[test]
    fn test_anchor_empty_has_no_value() {
        let anchor = WindowAnchor::new(1_000);
        assert_eq!(anchor.get(), None);
    }

    #[test]
    fn test_anchor_returns_oldest_in_window() {
        let mut anchor = WindowAnchor::new(1_000);
        assert_eq!(anchor.update(10.0, 0), Some(10.0));
        assert_eq!(anchor.update(11.0, 500), Some(10.0));
        // first sample expires at ts > 1000
        assert_eq!(anchor.update(12.0, 1_600), Some(11.0));
    }

    #[test]
    fn test_anchor_evicts_all_expired() {
        let mut anchor = WindowAnchor::new(1_000);
        anchor.update(10.0, 0);
        // a far-future sample evicts everything older; the new sample is its own anchor
        assert_eq!(anchor.update(99.0, 100_000), Some(99.0));
    }

    #[test]
    fn test_rolling_std_empty_is_zero() {
        let mut std = RollingStd::new(1_000);
        assert_eq!(std.update(5.0, 0), 0.0); // single sample, zero spread
    }

    #[test]
    fn test_rolling_std_constant_input() {
        let mut std = RollingStd::new(10_000);
        for i in 0..10 {
            assert_eq!(std.update(3.0, i * 100), 0.0);
        }
    }

    #[test]
    fn test_rolling_std_known_values() {
        let mut std = RollingStd::new(10_000);
        std.update(2.0, 0);
        std.update(4.0, 100);
        // population std of {2, 4} is 1
        let got = std.update(4.0, 200);
        let mean: f64 = (2.0 + 4.0 + 4.0) / 3.0;
        let expect =
            (((2.0 - mean) * (2.0 - mean) + 2.0 * (4.0 - mean) * (4.0 - mean)) / 3.0_f64).sqrt();
        assert!((got - expect).abs() < 1e-12);
    }

    #[test]
    fn test_engine_first_tick_is_ready_with_zero_return() {
        let mut engine = FeatureEngine::new(test_cfg());
        let features = engine.update(100.0, 1_000);
        assert!(features.is_ready());
        assert_eq!(features.x1, Some(0.0)); // anchor is the tick itself
        assert_eq!(features.spot, Some(100.0));
    }

    #[test]
    fn test_engine_x1_tracks_anchor_return() {
        let mut engine = FeatureEngine::new(test_cfg());
        engine.update(100.0, 0);
        let features = engine.update(105.0, 1_000);
        let x1 = features.x1.unwrap();
        assert!((x1 - (105.0_f64 / 100.0).ln()).abs() < 1e-12);
    }

    #[test]
    fn test_engine_latest_caches_without_update() {
        let mut engine = FeatureEngine::new(test_cfg());
        assert!(engine.latest().is_none());
        let features = engine.update(100.0, 0);
        assert_eq!(engine.latest(), Some(&features));
    }
}
