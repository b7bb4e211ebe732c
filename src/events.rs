//! Normalized event types shared by the live feeds and replay.
//!
//! `exchange_ts` is the authoritative ordering key everywhere; `ingest_ts`
//! only feeds latency observability.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// Sign applied to sizes: buys add, sells subtract.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PmBook,
    Spot,
}

impl EventKind {
    /// Fixed tie-break priority when exchange timestamps collide.
    pub fn priority(&self) -> u8 {
        match self {
            EventKind::PmBook => 0,
            EventKind::Spot => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PmBook => "pmBook",
            EventKind::Spot => "spot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotTick {
    pub product_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_asset: Option<String>,
    #[serde(default)]
    pub mid: Option<f64>,
    pub exchange_ts: i64,
    pub ingest_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmBook {
    pub asset_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_id: Option<String>,
    #[serde(default)]
    pub best_bid: Option<f64>,
    #[serde(default)]
    pub best_ask: Option<f64>,
    #[serde(default)]
    pub mid: Option<f64>,
    pub exchange_ts: i64,
    pub ingest_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum UnifiedEvent {
    #[serde(rename = "spot")]
    Spot(SpotTick),
    #[serde(rename = "pmBook")]
    PmBook(PmBook),
}

impl UnifiedEvent {
    pub fn exchange_ts(&self) -> i64 {
        match self {
            UnifiedEvent::Spot(e) => e.exchange_ts,
            UnifiedEvent::PmBook(e) => e.exchange_ts,
        }
    }

    pub fn ingest_ts(&self) -> i64 {
        match self {
            UnifiedEvent::Spot(e) => e.ingest_ts,
            UnifiedEvent::PmBook(e) => e.ingest_ts,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            UnifiedEvent::Spot(_) => EventKind::Spot,
            UnifiedEvent::PmBook(_) => EventKind::PmBook,
        }
    }
}

/// Execution feedback: a settled (possibly partial) fill for an intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillEvent {
    pub intent_id: String,
    pub condition_id: String,
    pub asset_id: String,
    pub side: Side,
    pub filled_size: f64,
    pub price: f64,
    pub timestamp: i64,
    pub partial: bool,
}

/// Execution feedback: an intent that will never settle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailEvent {
    pub intent_id: String,
    pub condition_id: String,
    pub asset_id: String,
    pub side: Side,
    pub size: f64,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Malformed feed payload, rejected at the adapter boundary before it can
/// reach the consumer. Dropped and logged, never fatal.
#[derive(Debug, Clone)]
pub struct DataError {
    pub feed: &'static str,
    pub msg: String,
}

impl DataError {
    pub fn new(feed: &'static str, msg: impl Into<String>) -> Self {
        Self {
            feed,
            msg: msg.into(),
        }
    }
}

impl std::fmt::Display for DataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bad {} payload: {}", self.feed, self.msg)
    }
}

impl std::error::Error for DataError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tag_roundtrip() {
        let raw = r#"{"kind":"pmBook","assetId":"a1","conditionId":"c1","bestBid":0.52,"bestAsk":0.54,"mid":0.53,"exchangeTs":1001,"ingestTs":1002}"#;
        let event: UnifiedEvent = serde_json::from_str(raw).unwrap();
        match &event {
            UnifiedEvent::PmBook(book) => {
                assert_eq!(book.asset_id, "a1");
                assert_eq!(book.best_bid, Some(0.52));
            }
            _ => panic!("expected pmBook"),
        }
        let encoded = serde_json::to_string(&event).unwrap();
        let back: UnifiedEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_spot_optional_fields_default() {
        let raw = r#"{"kind":"spot","productId":"BTC-USD","exchangeTs":1000,"ingestTs":1000}"#;
        let event: UnifiedEvent = serde_json::from_str(raw).unwrap();
        match event {
            UnifiedEvent::Spot(tick) => {
                assert_eq!(tick.mid, None);
                assert_eq!(tick.base_asset, None);
            }
            _ => panic!("expected spot"),
        }
    }

    #[test]
    fn test_kind_priority_orders_book_first() {
        assert!(EventKind::PmBook.priority() < EventKind::Spot.priority());
    }

    #[test]
    fn test_side_sign() {
        assert_eq!(Side::Buy.sign(), 1.0);
        assert_eq!(Side::Sell.sign(), -1.0);
    }
}
