use crate::subscription::SubscriptionId;
use chrono::{DateTime, Utc};
use smol_str::SmolStr;
use thiserror::Error;

/// All errors generated by the background ingestion pipeline in `candle-data`.
///
/// These are logged by the loop that owns the failing unit of work (one page, one instrument,
/// one subscription poll) and never abort the surrounding loop.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum DataError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("upstream responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode upstream payload: {0}")]
    Decode(String),

    #[error("SocketError: {0}")]
    Socket(String),

    #[error("upstream rejected authentication: {0}")]
    Auth(String),

    #[error("candle store failure: {0}")]
    Store(String),

    #[error("malformed bar for {symbol}: {reason}")]
    MalformedBar { symbol: SmolStr, reason: String },
}

impl DataError {
    /// Determine if an error requires the streaming connection to be re-established.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            DataError::Socket(_) | DataError::Auth(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for DataError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DataError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Socket(value.to_string())
    }
}

impl From<serde_json::Error> for DataError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

/// Failures reported synchronously to a client creating, updating or cancelling a subscription.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum SubscriptionError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid window: start {start} is after end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("subscription not found: {0}")]
    NotFound(SubscriptionId),

    #[error(transparent)]
    Data(#[from] DataError),
}
