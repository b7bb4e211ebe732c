//! Feed freshness and latency folded into a coarse operational state.
//!
//! Staleness is not an error: it degrades the trader state, which gates
//! intent emission, and recovers on its own when data freshens.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraderState {
    Starting,
    Warming,
    Running,
    Degraded,
}

impl TraderState {
    pub const INITIAL: TraderState = TraderState::Starting;

    pub fn as_str(&self) -> &'static str {
        match self {
            TraderState::Starting => "STARTING",
            TraderState::Warming => "WARMING",
            TraderState::Running => "RUNNING",
            TraderState::Degraded => "DEGRADED",
        }
    }
}

impl std::fmt::Display for TraderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthLimits {
    pub max_latency_ms: i64,
    pub max_stale_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub exchange_ts: i64,
    pub ingest_ts: i64,
    pub latency_ms: i64,
    pub spot_age_ms: Option<i64>,
    pub pm_age_ms: Option<i64>,
    pub features_ready: bool,
    pub spot_fresh: bool,
    pub pm_fresh: bool,
    pub latency_ok: bool,
    pub data_fresh: bool,
}

impl HealthSnapshot {
    pub fn health_ok(&self) -> bool {
        self.data_fresh && self.features_ready
    }
}

pub struct HealthInput {
    pub exchange_ts: i64,
    pub ingest_ts: i64,
    /// None means "no spot leg involved in this event", which counts as fresh.
    pub spot_age_ms: Option<i64>,
    pub pm_age_ms: Option<i64>,
    pub features_ready: bool,
}

pub fn make_health_snapshot(input: HealthInput, limits: &HealthLimits) -> HealthSnapshot {
    let latency_ms = (input.ingest_ts - input.exchange_ts).max(0);
    let spot_fresh = input.spot_age_ms.map_or(true, |age| age <= limits.max_stale_ms);
    let pm_fresh = input.pm_age_ms.map_or(true, |age| age <= limits.max_stale_ms);
    let latency_ok = latency_ms <= limits.max_latency_ms;

    HealthSnapshot {
        exchange_ts: input.exchange_ts,
        ingest_ts: input.ingest_ts,
        latency_ms,
        spot_age_ms: input.spot_age_ms,
        pm_age_ms: input.pm_age_ms,
        features_ready: input.features_ready,
        spot_fresh,
        pm_fresh,
        latency_ok,
        data_fresh: spot_fresh && pm_fresh && latency_ok,
    }
}

/// STARTING -> WARMING -> RUNNING on consecutive healthy events; RUNNING
/// drops to DEGRADED (not WARMING) so a recovered feed resumes immediately.
pub fn next_state(prev: TraderState, health: &HealthSnapshot) -> TraderState {
    let ok = health.health_ok();
    match prev {
        TraderState::Starting => {
            if ok {
                TraderState::Warming
            } else {
                TraderState::Starting
            }
        }
        TraderState::Warming => {
            if ok {
                TraderState::Running
            } else {
                TraderState::Starting
            }
        }
        TraderState::Running | TraderState::Degraded => {
            if ok {
                TraderState::Running
            } else {
                TraderState::Degraded
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: HealthLimits = HealthLimits {
        max_latency_ms: 1_500,
        max_stale_ms: 5_000,
    };

    fn snapshot(ok: bool) -> HealthSnapshot {
        make_health_snapshot(
            HealthInput {
                exchange_ts: 1_000,
                ingest_ts: 1_000,
                spot_age_ms: Some(0),
                pm_age_ms: Some(0),
                features_ready: ok,
            },
            &LIMITS,
        )
    }

    #[test]
    fn test_latency_clamped_to_zero() {
        let health = make_health_snapshot(
            HealthInput {
                exchange_ts: 2_000,
                ingest_ts: 1_000, // clock skew: ingest before exchange
                spot_age_ms: None,
                pm_age_ms: None,
                features_ready: true,
            },
            &LIMITS,
        );
        assert_eq!(health.latency_ms, 0);
        assert!(health.latency_ok);
    }

    #[test]
    fn test_missing_age_counts_as_fresh() {
        let health = make_health_snapshot(
            HealthInput {
                exchange_ts: 0,
                ingest_ts: 0,
                spot_age_ms: None,
                pm_age_ms: None,
                features_ready: true,
            },
            &LIMITS,
        );
        assert!(health.spot_fresh && health.pm_fresh && health.data_fresh);
    }

    #[test]
    fn test_stale_spot_breaks_freshness() {
        let health = make_health_snapshot(
            HealthInput {
                exchange_ts: 0,
                ingest_ts: 0,
                spot_age_ms: Some(5_001),
                pm_age_ms: Some(0),
                features_ready: true,
            },
            &LIMITS,
        );
        assert!(!health.spot_fresh);
        assert!(!health.data_fresh);
    }

    #[test]
    fn test_latency_breach_degrades() {
        let health = make_health_snapshot(
            HealthInput {
                exchange_ts: 0,
                ingest_ts: 2_000,
                spot_age_ms: Some(0),
                pm_age_ms: Some(0),
                features_ready: true,
            },
            &LIMITS,
        );
        assert!(!health.latency_ok);
        assert!(!health.data_fresh);
    }

    #[test]
    fn test_transition_table() {
        use TraderState::*;
        let cases = [
            (Starting, true, Warming),
            (Starting, false, Starting),
            (Warming, true, Running),
            (Warming, false, Starting),
            (Running, true, Running),
            (Running, false, Degraded),
            (Degraded, true, Running),
            (Degraded, false, Degraded),
        ];
        for (from, ok, expect) in cases {
            assert_eq!(next_state(from, &snapshot(ok)), expect, "{from:?} ok={ok}");
        }
    }

    #[test]
    fn test_recovery_skips_warming() {
        // STARTING -> WARMING -> RUNNING, one bad event, then straight back
        let mut state = TraderState::INITIAL;
        state = next_state(state, &snapshot(true));
        state = next_state(state, &snapshot(true));
        assert_eq!(state, TraderState::Running);
        state = next_state(state, &snapshot(false));
        assert_eq!(state, TraderState::Degraded);
        state = next_state(state, &snapshot(true));
        assert_eq!(state, TraderState::Running);
    }
}
