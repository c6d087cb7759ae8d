use candle_data::{
    Timeframe,
    subscription::{CandleMessage, SubscriptionId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Request sent by a client over its WebSocket.
///
/// Subscribe fields are all optional on the wire so a missing one is reported back as a
/// validation error instead of a decode failure.
///
/// ### Raw Payload Examples
/// ```json
/// {"type": "subscribe", "symbol": "AAPL", "timeframe": "5m", "start": "2024-03-11T13:30:00Z", "end": "2024-03-11T20:00:00Z"}
/// {"type": "update", "subscription_id": "0192b6f0-6c1e-7d4a-9a55-1b7b1c7c2f10", "end": "2024-03-12T20:00:00Z", "reset": true}
/// {"type": "unsubscribe", "subscription_id": "0192b6f0-6c1e-7d4a-9a55-1b7b1c7c2f10"}
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        platform: Option<SmolStr>,
        symbol: Option<SmolStr>,
        timeframe: Option<Timeframe>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
    Update {
        subscription_id: SubscriptionId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        #[serde(default)]
        reset: bool,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
    },
}

/// Message pushed from the server to one client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome { destination: SmolStr },
    Subscribed { subscription_id: SubscriptionId },
    Updated { subscription_id: SubscriptionId },
    Unsubscribed { subscription_id: SubscriptionId },
    Error { message: String },
    Candles(CandleMessage),
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
