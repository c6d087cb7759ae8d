use super::SubscriptionId;
use crate::candle::{Candle, Instrument, Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Every candle in the window, sent on create and on reset.
    Snapshot,
    /// New candles and in-place updates of the last delivered candle.
    Update,
    /// Empty message proving the delivery path is alive.
    Heartbeat,
}

/// Message pushed to a subscription's destination.
///
/// ### Raw Payload Examples
/// ```json
/// {
///   "subscription_id": "0192b6f0-6c1e-7d4a-9a55-1b7b1c7c2f10",
///   "instrument": {"id": 1, "platform": "alpaca", "symbol": "AAPL"},
///   "timeframe": "5m",
///   "kind": "UPDATE",
///   "candles": [{"instrument": 1, "timeframe": "5m", "timestamp": "2024-03-11T14:30:00Z", "open": "172.1", "high": "172.6", "low": "171.9", "close": "172.5", "volume": "51200", "sequence": 88}],
///   "sent_at": "2024-03-11T14:33:10.120Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CandleMessage {
    pub subscription_id: SubscriptionId,
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    pub kind: MessageKind,
    pub candles: Vec<Candle>,
    pub sent_at: DateTime<Utc>,
}

impl CandleMessage {
    pub fn new(
        subscription_id: SubscriptionId,
        instrument: Instrument,
        timeframe: Timeframe,
        kind: MessageKind,
        candles: Vec<Candle>,
    ) -> Self {
        Self {
            subscription_id,
            instrument,
            timeframe,
            kind,
            candles,
            sent_at: Utc::now(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == MessageKind::Heartbeat
    }
}
