//! Upstream broker/data API: paged historical bars and the regular-session clock.

use crate::{
    candle::{Candle, Instrument, Timeframe},
    error::DataError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use smol_str::SmolStr;

/// [`MarketDataApi`] over the upstream REST endpoints.
pub mod rest;

pub use rest::RestMarketDataApi;

/// Request for one page of historical bars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarsRequest {
    pub symbol: SmolStr,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub limit: u32,
    pub page_token: Option<String>,
}

/// One page of undecoded bars plus the opaque continuation token, if more pages exist.
///
/// Bars stay as raw JSON so a single malformed record can be skipped without losing the page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBarPage {
    pub bars: Vec<serde_json::Value>,
    pub next_page_token: Option<String>,
}

/// Upstream data API consumed by the backfill pipeline and the session oracle.
#[async_trait]
pub trait MarketDataApi: Send + Sync {
    async fn fetch_bars(&self, request: &BarsRequest) -> Result<RawBarPage, DataError>;

    /// Query whether the regular-market session is open right now.
    async fn is_session_open(&self) -> Result<bool, DataError>;
}

/// ### Raw Payload Examples
/// ```json
/// {"t": "2024-03-11T14:31:00Z", "o": 172.1, "h": 172.4, "l": 171.9, "c": 172.3, "v": 10234, "n": 120, "vw": 172.2}
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BarRecord {
    #[serde(rename = "t")]
    pub time: DateTime<Utc>,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: f64,
}

impl BarRecord {
    /// Convert into an unsequenced 1-minute [`Candle`] for `instrument`.
    pub fn into_candle(self, instrument: &Instrument) -> Result<Candle, DataError> {
        let decimal = |field: &str, value: f64| {
            Decimal::try_from(value).map_err(|_| DataError::MalformedBar {
                symbol: instrument.symbol.clone(),
                reason: format!("unrepresentable {field}: {value}"),
            })
        };

        let candle = Candle::minute(
            instrument.id,
            self.time,
            decimal("open", self.open)?,
            decimal("high", self.high)?,
            decimal("low", self.low)?,
            decimal("close", self.close)?,
            decimal("volume", self.volume)?,
        );

        if !candle.is_valid() {
            return Err(DataError::MalformedBar {
                symbol: instrument.symbol.clone(),
                reason: format!("inconsistent OHLCV at {}", candle.timestamp),
            });
        }

        Ok(candle)
    }
}

/// Decode one raw upstream bar into a 1-minute [`Candle`].
pub fn parse_bar(instrument: &Instrument, raw: serde_json::Value) -> Result<Candle, DataError> {
    let record = serde_json::from_value::<BarRecord>(raw).map_err(|error| DataError::MalformedBar {
        symbol: instrument.symbol.clone(),
        reason: error.to_string(),
    })?;
    record.into_candle(instrument)
}
