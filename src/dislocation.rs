//! Dislocation model: expected probability from rolling features vs. the
//! market-implied probability.

use serde::{Deserialize, Serialize};

use crate::features::FeatureVector;

/// Ordered coefficients applied to `[1, x1, ema_fast - ema_slow, vol]`.
/// Missing trailing coefficients are treated as zero.
pub type BetaParams = Vec<f64>;

pub fn parse_beta(raw: &str) -> BetaParams {
    raw.split(',')
        .filter_map(|s| s.trim().parse::<f64>().ok())
        .filter(|n| n.is_finite())
        .collect()
}

pub fn beta_is_zero(beta: &[f64]) -> bool {
    beta.is_empty() || beta.iter().all(|b| *b == 0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DislocationSignal {
    pub expected_prob: f64,
    pub pm_mid: f64,
    /// `expected_prob - pm_mid`.
    pub delta_spd: f64,
    pub exchange_ts: i64,
    pub ingest_ts: i64,
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn feature_row(features: &FeatureVector) -> Option<[f64; 4]> {
    let x1 = features.x1?;
    let ema_fast = features.ema_fast?;
    let ema_slow = features.ema_slow?;
    let vol = features.vol?;
    Some([1.0, x1, ema_fast - ema_slow, vol])
}

/// None when `pm_mid` is not finite or the feature vector is not ready.
pub fn compute_dislocation(
    features: &FeatureVector,
    pm_mid: f64,
    beta: &[f64],
    exchange_ts: i64,
    ingest_ts: i64,
) -> Option<DislocationSignal> {
    if !pm_mid.is_finite() {
        return None;
    }
    let x = feature_row(features)?;

    let mut z = 0.0;
    for (i, xi) in x.iter().enumerate() {
        z += beta.get(i).copied().unwrap_or(0.0) * xi;
    }
    let expected_prob = sigmoid(z);

    Some(DislocationSignal {
        expected_prob,
        pm_mid,
        delta_spd: expected_prob - pm_mid,
        exchange_ts,
        ingest_ts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_features() -> FeatureVector {
        FeatureVector {
            x1: Some(0.0),
            ema_fast: Some(100.0),
            ema_slow: Some(100.0),
            vol: Some(0.0),
            spot: Some(100.0),
            ts: 1_000,
        }
    }

    #[test]
    fn test_parse_beta_skips_junk() {
        assert_eq!(parse_beta("0, 1, nope, 2"), vec![0.0, 1.0, 2.0]);
        assert_eq!(parse_beta(""), Vec::<f64>::new());
    }

    #[test]
    fn test_beta_is_zero() {
        assert!(beta_is_zero(&[]));
        assert!(beta_is_zero(&[0.0, 0.0]));
        assert!(!beta_is_zero(&[0.0, 1.0]));
    }

    #[test]
    fn test_missing_feature_yields_none() {
        let mut features = ready_features();
        features.x1 = None;
        assert!(compute_dislocation(&features, 0.5, &[0.0, 1.0], 1, 1).is_none());
    }

    #[test]
    fn test_non_finite_mid_yields_none() {
        assert!(compute_dislocation(&ready_features(), f64::NAN, &[1.0], 1, 1).is_none());
        assert!(compute_dislocation(&ready_features(), f64::INFINITY, &[1.0], 1, 1).is_none());
    }

    #[test]
    fn test_zero_beta_scores_even_odds() {
        let signal = compute_dislocation(&ready_features(), 0.53, &[], 1, 2).unwrap();
        assert!((signal.expected_prob - 0.5).abs() < 1e-12);
        assert!((signal.delta_spd - (0.5 - 0.53)).abs() < 1e-12);
        assert_eq!(signal.exchange_ts, 1);
        assert_eq!(signal.ingest_ts, 2);
    }

    #[test]
    fn test_beta_applies_to_feature_row() {
        let mut features = ready_features();
        features.x1 = Some(0.1);
        features.ema_fast = Some(101.0);
        features.ema_slow = Some(100.0);
        features.vol = Some(0.02);
        // z = 0.5 + 2*0.1 + 0.25*(101-100) + 10*0.02 = 1.15
        let signal =
            compute_dislocation(&features, 0.5, &[0.5, 2.0, 0.25, 10.0], 1, 1).unwrap();
        assert!((signal.expected_prob - sigmoid(1.15)).abs() < 1e-12);
    }

    #[test]
    fn test_beta_longer_than_row_ignores_tail() {
        let a = compute_dislocation(&ready_features(), 0.5, &[0.3, 1.0, 1.0, 1.0], 1, 1).unwrap();
        let b =
            compute_dislocation(&ready_features(), 0.5, &[0.3, 1.0, 1.0, 1.0, 99.0], 1, 1).unwrap();
        assert_eq!(a.expected_prob, b.expected_prob);
    }
}
