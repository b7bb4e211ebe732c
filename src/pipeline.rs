//! Unified event consumer: the single decision path shared by live feeds
//! and replay. All hot state lives on the `Pipeline` object, constructed
//! per run; given the same events in the same order, two pipelines produce
//! identical output sequences.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::Config;
use crate::dislocation::{beta_is_zero, compute_dislocation, BetaParams, DislocationSignal};
use crate::events::{EventKind, FailEvent, FillEvent, PmBook, SpotTick, UnifiedEvent};
use crate::features::{FeatureConfig, FeatureEngine, FeatureVector};
use crate::health::{
    make_health_snapshot, next_state, HealthInput, HealthLimits, HealthSnapshot, TraderState,
};
use crate::logging::{json_log, log_at, obj, v_bool, v_int, v_num, v_str, Level};
use crate::position::{InvariantViolation, OrderIntent, PositionBook};
use crate::sink::IntentSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Live,
    Backtest,
    Collect,
}

impl Mode {
    pub fn parse(raw: &str) -> Mode {
        match raw {
            "live" => Mode::Live,
            "backtest" => Mode::Backtest,
            _ => Mode::Collect,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Live => "live",
            Mode::Backtest => "backtest",
            Mode::Collect => "collect",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub mode: Mode,
    pub condition_id: Option<String>,
    pub asset_id: Option<String>,
}

impl PipelineContext {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            condition_id: None,
            asset_id: None,
        }
    }

    /// Context narrowed to one market, for sinks that tag records.
    pub fn for_market(&self, condition_id: Option<&str>, asset_id: &str) -> Self {
        let mut ctx = self.clone();
        ctx.condition_id = condition_id.map(|s| s.to_string());
        ctx.asset_id = Some(asset_id.to_string());
        ctx
    }
}

#[derive(Debug, Clone)]
struct SpotState {
    product_id: String,
    mid: f64,
    updated_at: i64,
}

// freshness of the merged book is tracked at the feed boundary; here the
// cache only carries the touches forward across partial updates
#[derive(Debug, Clone, Default)]
struct BookState {
    best_bid: Option<f64>,
    best_ask: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutput {
    pub features: Option<FeatureVector>,
    pub dislocation: Option<DislocationSignal>,
    pub intent: Option<OrderIntent>,
    pub state: TraderState,
    pub ordering_collision: bool,
    pub dt_ms: Option<i64>,
}

pub struct Pipeline {
    feature_cfg: FeatureConfig,
    limits: HealthLimits,
    beta: BetaParams,
    beta_zero: bool,
    allow_zero_beta: bool,
    spot_product_id: String,
    engines: HashMap<String, FeatureEngine>,
    spots: HashMap<String, SpotState>,
    books: HashMap<String, BookState>,
    positions: PositionBook,
    state: TraderState,
    last_event_ts: Option<i64>,
    last_event_kind: Option<EventKind>,
    collision_count: u64,
}

impl Pipeline {
    pub fn new(cfg: &Config) -> Self {
        Self {
            feature_cfg: cfg.feature_config(),
            limits: cfg.health_limits(),
            beta: cfg.beta_params.clone(),
            beta_zero: beta_is_zero(&cfg.beta_params),
            allow_zero_beta: cfg.allow_zero_beta,
            spot_product_id: cfg.spot_product_id.clone(),
            engines: HashMap::new(),
            spots: HashMap::new(),
            books: HashMap::new(),
            positions: PositionBook::new(cfg.intent_params()),
            state: TraderState::INITIAL,
            last_event_ts: None,
            last_event_kind: None,
            collision_count: 0,
        }
    }

    pub fn state(&self) -> TraderState {
        self.state
    }

    pub fn collision_count(&self) -> u64 {
        self.collision_count
    }

    pub fn positions(&self) -> &PositionBook {
        &self.positions
    }

    /// Process one event to completion and hand the output to the sink.
    pub fn handle_event(
        &mut self,
        event: &UnifiedEvent,
        sink: &mut dyn IntentSink,
        ctx: &PipelineContext,
    ) -> PipelineOutput {
        let collision = self.detect_collision(event);
        let output = match event {
            UnifiedEvent::Spot(tick) => self.handle_spot(tick, collision),
            UnifiedEvent::PmBook(book) => self.handle_pm_book(book, collision),
        };
        sink.handle(&output, ctx);
        output
    }

    /// Execution feedback entry points; the only other mutators of
    /// position state besides `handle_event`.
    pub fn apply_fill(&mut self, fill: &FillEvent) -> Result<(), InvariantViolation> {
        self.positions.apply_fill(fill)
    }

    pub fn apply_fail(&mut self, fail: &FailEvent) -> Result<(), InvariantViolation> {
        self.positions.apply_fail(fail)
    }

    fn handle_spot(&mut self, tick: &SpotTick, collision: bool) -> PipelineOutput {
        let mid = tick.mid.filter(|m| m.is_finite() && *m > 0.0);
        let Some(mid) = mid else {
            // tick without a usable price: degrade, touch nothing
            let health = make_health_snapshot(
                HealthInput {
                    exchange_ts: tick.exchange_ts,
                    ingest_ts: tick.ingest_ts,
                    spot_age_ms: None,
                    pm_age_ms: None,
                    features_ready: false,
                },
                &self.limits,
            );
            let state = self.advance(&health);
            return PipelineOutput {
                features: None,
                dislocation: None,
                intent: None,
                state,
                ordering_collision: collision,
                dt_ms: None,
            };
        };

        self.spots.insert(
            tick.product_id.clone(),
            SpotState {
                product_id: tick.product_id.clone(),
                mid,
                updated_at: tick.exchange_ts,
            },
        );

        let feature_cfg = self.feature_cfg;
        let engine = self
            .engines
            .entry(tick.product_id.clone())
            .or_insert_with(|| FeatureEngine::new(feature_cfg));
        let features = engine.update(mid, tick.exchange_ts);

        let health = make_health_snapshot(
            HealthInput {
                exchange_ts: tick.exchange_ts,
                ingest_ts: tick.ingest_ts,
                spot_age_ms: Some(0),
                pm_age_ms: None,
                features_ready: features.is_ready(),
            },
            &self.limits,
        );
        let state = self.advance(&health);

        log_at(
            Level::Debug,
            "features",
            obj(&[
                ("productId", v_str(&tick.product_id)),
                ("spot", v_num(mid)),
                ("state", v_str(state.as_str())),
            ]),
        );

        // spot ticks only refresh features and health, never trade
        PipelineOutput {
            features: Some(features),
            dislocation: None,
            intent: None,
            state,
            ordering_collision: collision,
            dt_ms: None,
        }
    }

    fn handle_pm_book(&mut self, event: &PmBook, collision: bool) -> PipelineOutput {
        let book = self.books.entry(event.asset_id.clone()).or_default();
        if event.best_bid.is_some() {
            book.best_bid = event.best_bid;
        }
        if event.best_ask.is_some() {
            book.best_ask = event.best_ask;
        }
        let best_bid = book.best_bid;
        let best_ask = book.best_ask;

        let Some(spot) = self.spots.get(&self.spot_product_id).cloned() else {
            // no paired spot yet: cannot price a dislocation
            let health = make_health_snapshot(
                HealthInput {
                    exchange_ts: event.exchange_ts,
                    ingest_ts: event.ingest_ts,
                    spot_age_ms: None,
                    pm_age_ms: Some(0),
                    features_ready: false,
                },
                &self.limits,
            );
            let state = self.advance(&health);
            return PipelineOutput {
                features: None,
                dislocation: None,
                intent: None,
                state,
                ordering_collision: collision,
                dt_ms: None,
            };
        };

        let feature_cfg = self.feature_cfg;
        let engine = self
            .engines
            .entry(spot.product_id.clone())
            .or_insert_with(|| FeatureEngine::new(feature_cfg));
        let features = match engine.latest() {
            Some(latest) => latest.clone(),
            None => engine.update(spot.mid, event.exchange_ts),
        };

        let dislocation = event.mid.and_then(|pm_mid| {
            compute_dislocation(
                &features,
                pm_mid,
                &self.beta,
                event.exchange_ts,
                event.ingest_ts,
            )
        });

        let spot_age = (event.exchange_ts - spot.updated_at).max(0);
        let dt_ms = Some((event.exchange_ts - spot.updated_at).max(-1));
        let health = make_health_snapshot(
            HealthInput {
                exchange_ts: event.exchange_ts,
                ingest_ts: event.ingest_ts,
                spot_age_ms: Some(spot_age),
                pm_age_ms: Some(0),
                features_ready: features.is_ready(),
            },
            &self.limits,
        );
        let state = self.advance(&health);

        let mut intent = None;
        if state == TraderState::Running {
            if let (Some(bid), Some(ask)) = (best_bid, best_ask) {
                let condition_id = event.condition_id.as_deref().unwrap_or("unknown");
                if let Some(signal) = &dislocation {
                    intent = self.positions.entry_intent(
                        condition_id,
                        &event.asset_id,
                        signal,
                        bid,
                        ask,
                        event.exchange_ts,
                    );
                }
                if intent.is_none() {
                    intent = self.positions.unwind_intent(
                        condition_id,
                        &event.asset_id,
                        bid,
                        ask,
                        event.exchange_ts,
                    );
                }
                if let Some(emitted) = &intent {
                    json_log(
                        "intent",
                        obj(&[
                            ("intentId", v_str(&emitted.intent_id)),
                            ("conditionId", v_str(condition_id)),
                            ("assetId", v_str(&event.asset_id)),
                            ("side", v_str(emitted.side.as_str())),
                            ("price", v_num(emitted.price)),
                            ("size", v_num(emitted.size)),
                            ("reason", v_str(emitted.reason.as_str())),
                        ]),
                    );
                }
            }
        }

        PipelineOutput {
            features: Some(features),
            dislocation,
            intent,
            state,
            ordering_collision: collision,
            dt_ms,
        }
    }

    fn advance(&mut self, health: &HealthSnapshot) -> TraderState {
        let prev = self.state;
        let mut next = next_state(prev, health);
        // interlock: never enter RUNNING with no model deployed unless
        // explicitly overridden
        if next == TraderState::Running && self.beta_zero && !self.allow_zero_beta {
            next = TraderState::Warming;
        }
        if next != prev {
            self.log_transition(prev, next, health);
        }
        self.state = next;
        next
    }

    fn log_transition(&self, prev: TraderState, next: TraderState, health: &HealthSnapshot) {
        let mut causes: Vec<&str> = Vec::new();
        if !health.spot_fresh {
            causes.push("spotStale");
        }
        if !health.pm_fresh {
            causes.push("pmStale");
        }
        if !health.features_ready {
            causes.push("featuresNotReady");
        }
        if !health.latency_ok {
            causes.push("latencyBad");
        }
        if self.beta_zero && !self.allow_zero_beta {
            causes.push("betaBlocked");
        }
        json_log(
            "state_transition",
            obj(&[
                ("from", v_str(prev.as_str())),
                ("to", v_str(next.as_str())),
                ("causes", serde_json::json!(causes)),
                ("exchangeTs", v_int(health.exchange_ts)),
                ("latencyMs", v_int(health.latency_ms)),
                ("collisionCount", v_int(self.collision_count as i64)),
            ]),
        );
    }

    /// Two different kinds sharing an exchange timestamp hint at a feed
    /// race. Diagnostic only; decisions are unaffected.
    fn detect_collision(&mut self, event: &UnifiedEvent) -> bool {
        let ts = event.exchange_ts();
        let kind = event.kind();
        let collision = match (self.last_event_ts, self.last_event_kind) {
            (Some(last_ts), Some(last_kind)) => last_ts == ts && last_kind != kind,
            _ => false,
        };
        if collision {
            self.collision_count += 1;
            log_at(
                Level::Debug,
                "ordering_collision",
                obj(&[
                    ("exchangeTs", v_int(ts)),
                    ("kind", v_str(kind.as_str())),
                    ("count", v_int(self.collision_count as i64)),
                    ("collision", v_bool(true)),
                ]),
            );
        }
        self.last_event_ts = Some(ts);
        self.last_event_kind = Some(kind);
        collision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectSink;

    fn test_cfg() -> Config {
        let mut cfg = Config::from_env();
        cfg.beta_params = vec![0.0, 1.0, 0.0, 0.0];
        cfg.allow_zero_beta = false;
        cfg.delta_threshold = 0.01;
        cfg.inventory_cap = 100.0;
        cfg.order_size = 5.0;
        cfg.spot_product_id = "BTC-USD".to_string();
        cfg.max_latency_ms = 1_500;
        cfg.max_stale_ms = 5_000;
        cfg
    }

    fn spot(ts: i64, mid: f64) -> UnifiedEvent {
        UnifiedEvent::Spot(SpotTick {
            product_id: "BTC-USD".to_string(),
            base_asset: Some("BTC".to_string()),
            quote_asset: Some("USD".to_string()),
            mid: Some(mid),
            exchange_ts: ts,
            ingest_ts: ts,
        })
    }

    fn pm_book(ts: i64, bid: f64, ask: f64) -> UnifiedEvent {
        UnifiedEvent::PmBook(PmBook {
            asset_id: "asset-up".to_string(),
            condition_id: Some("cond-1".to_string()),
            best_bid: Some(bid),
            best_ask: Some(ask),
            mid: Some((bid + ask) / 2.0),
            exchange_ts: ts,
            ingest_ts: ts,
        })
    }

    fn drive(pipeline: &mut Pipeline, events: &[UnifiedEvent]) -> Vec<PipelineOutput> {
        let mut sink = CollectSink::new("test");
        let ctx = PipelineContext::new(Mode::Backtest);
        events
            .iter()
            .map(|ev| pipeline.handle_event(ev, &mut sink, &ctx))
            .collect()
    }

    #[test]
    fn test_spot_ticks_warm_up_but_never_trade() {
        let mut pipeline = Pipeline::new(&test_cfg());
        let outputs = drive(&mut pipeline, &[spot(1_000, 100.0), spot(2_000, 100.0)]);
        assert_eq!(outputs[0].state, TraderState::Warming);
        assert_eq!(outputs[1].state, TraderState::Running);
        assert!(outputs.iter().all(|o| o.intent.is_none()));
        assert!(outputs.iter().all(|o| o.dislocation.is_none()));
    }

    #[test]
    fn test_entry_scenario_sell_at_best_bid() {
        // spot 100 at warm-up, book 0.52/0.54: expected prob ~0.5 against
        // mid 0.53 gives delta ~ -0.03 and a SELL priced at the bid
        let mut pipeline = Pipeline::new(&test_cfg());
        let outputs = drive(
            &mut pipeline,
            &[
                spot(1_000, 100.0),
                spot(1_500, 100.0),
                pm_book(2_000, 0.52, 0.54),
            ],
        );
        let out = &outputs[2];
        assert_eq!(out.state, TraderState::Running);
        let signal = out.dislocation.as_ref().unwrap();
        assert!((signal.delta_spd - (0.5 - 0.53)).abs() < 1e-9);
        let intent = out.intent.as_ref().unwrap();
        assert_eq!(intent.side, crate::events::Side::Sell);
        assert_eq!(intent.price, 0.52);
        assert_eq!(intent.size, 5.0);
    }

    #[test]
    fn test_book_without_spot_degrades() {
        let mut pipeline = Pipeline::new(&test_cfg());
        let outputs = drive(&mut pipeline, &[pm_book(1_000, 0.52, 0.54)]);
        assert_eq!(outputs[0].state, TraderState::Starting);
        assert!(outputs[0].features.is_none());
        assert!(outputs[0].dislocation.is_none());
    }

    #[test]
    fn test_spot_without_mid_degrades_running() {
        let mut pipeline = Pipeline::new(&test_cfg());
        let mut events = vec![spot(1_000, 100.0), spot(2_000, 100.0)];
        events.push(UnifiedEvent::Spot(SpotTick {
            product_id: "BTC-USD".to_string(),
            base_asset: None,
            quote_asset: None,
            mid: None,
            exchange_ts: 3_000,
            ingest_ts: 3_000,
        }));
        let outputs = drive(&mut pipeline, &events);
        assert_eq!(outputs[1].state, TraderState::Running);
        assert_eq!(outputs[2].state, TraderState::Degraded);
    }

    #[test]
    fn test_collision_flag_and_counter() {
        let mut pipeline = Pipeline::new(&test_cfg());
        let outputs = drive(
            &mut pipeline,
            &[spot(1_000, 100.0), pm_book(1_000, 0.52, 0.54), spot(1_000, 100.0)],
        );
        assert!(!outputs[0].ordering_collision);
        assert!(outputs[1].ordering_collision);
        assert!(outputs[2].ordering_collision);
        assert_eq!(pipeline.collision_count(), 2);
    }

    #[test]
    fn test_equal_ts_same_kind_is_not_collision() {
        let mut pipeline = Pipeline::new(&test_cfg());
        let outputs = drive(&mut pipeline, &[spot(1_000, 100.0), spot(1_000, 100.0)]);
        assert!(!outputs[1].ordering_collision);
        assert_eq!(pipeline.collision_count(), 0);
    }

    #[test]
    fn test_zero_beta_interlock_holds_at_warming() {
        let mut cfg = test_cfg();
        cfg.beta_params = Vec::new();
        let mut pipeline = Pipeline::new(&cfg);
        let outputs = drive(
            &mut pipeline,
            &[spot(1_000, 100.0), spot(2_000, 100.0), spot(3_000, 100.0)],
        );
        assert!(outputs.iter().all(|o| o.state != TraderState::Running));
        assert_eq!(outputs[2].state, TraderState::Warming);
    }

    #[test]
    fn test_zero_beta_override_allows_running() {
        let mut cfg = test_cfg();
        cfg.beta_params = Vec::new();
        cfg.allow_zero_beta = true;
        let mut pipeline = Pipeline::new(&cfg);
        let outputs = drive(&mut pipeline, &[spot(1_000, 100.0), spot(2_000, 100.0)]);
        assert_eq!(outputs[1].state, TraderState::Running);
    }

    #[test]
    fn test_book_merges_partial_updates() {
        let mut pipeline = Pipeline::new(&test_cfg());
        let mut events = vec![spot(1_000, 100.0), spot(1_500, 100.0)];
        // bid-only update, then ask-only: the second sees the merged book
        events.push(UnifiedEvent::PmBook(PmBook {
            asset_id: "asset-up".to_string(),
            condition_id: Some("cond-1".to_string()),
            best_bid: Some(0.52),
            best_ask: None,
            mid: None,
            exchange_ts: 2_000,
            ingest_ts: 2_000,
        }));
        events.push(UnifiedEvent::PmBook(PmBook {
            asset_id: "asset-up".to_string(),
            condition_id: Some("cond-1".to_string()),
            best_bid: None,
            best_ask: Some(0.54),
            mid: Some(0.53),
            exchange_ts: 2_500,
            ingest_ts: 2_500,
        }));
        let outputs = drive(&mut pipeline, &events);
        // no mid on the bid-only event -> no dislocation, no intent
        assert!(outputs[2].dislocation.is_none());
        assert!(outputs[2].intent.is_none());
        // merged book has both sides: intent fires
        assert!(outputs[3].dislocation.is_some());
        assert!(outputs[3].intent.is_some());
    }

    #[test]
    fn test_dt_ms_tracks_spot_age() {
        let mut pipeline = Pipeline::new(&test_cfg());
        let outputs = drive(
            &mut pipeline,
            &[spot(1_000, 100.0), spot(1_200, 100.0), pm_book(1_900, 0.52, 0.54)],
        );
        assert_eq!(outputs[2].dt_ms, Some(700));
    }
}
