//! Instruments, timeframes and OHLCV candles.
//!
//! Every [`Candle`] timestamp is the *start* of its bar, truncated to the [`Timeframe`]
//! boundary. At most one candle exists per (instrument, timeframe, timestamp); writers upsert.

use chrono::{DateTime, NaiveTime, TimeDelta, Timelike, Utc};
use derive_more::{Constructor, Display, From};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{fmt, str::FromStr};

/// Stable internal identifier an (platform, symbol) pair resolves to.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    Display,
    From,
    Constructor,
)]
pub struct InstrumentId(pub u64);

/// A tradable instrument on a given venue.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub platform: SmolStr,
    pub symbol: SmolStr,
}

impl Instrument {
    /// Always-on instruments (eg/ `BTC/USD`) carry a pair delimiter in their symbol and
    /// trade outside regular market sessions.
    pub fn is_always_on(&self) -> bool {
        is_always_on_symbol(&self.symbol)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.symbol)
    }
}

/// Determine if a symbol identifies an always-on (24/7) instrument.
pub fn is_always_on_symbol(symbol: &str) -> bool {
    symbol.contains('/')
}

/// Period length a [`Candle`] summarises.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// Timeframes derived from 1-minute bars by the aggregator.
    pub const ROLLUPS: [Timeframe; 5] = [
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Length of one period in minutes.
    pub fn minutes(&self) -> u32 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        }
    }

    pub fn duration(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.minutes()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// Start of the period containing `timestamp`.
    ///
    /// Period index is minutes-since-midnight divided by the period length; the boundary is
    /// that index multiplied back out. Seconds and sub-seconds are always dropped.
    pub fn truncate(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let period = self.minutes();
        let minutes_since_midnight = timestamp.hour() * 60 + timestamp.minute();
        let boundary = (minutes_since_midnight / period) * period;

        let midnight = timestamp.date_naive().and_time(NaiveTime::MIN).and_utc();
        midnight + TimeDelta::minutes(i64::from(boundary))
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("unknown timeframe: {other}")),
        }
    }
}

/// OHLCV summary of one bar.
///
/// `sequence` is assigned by the [`CandleStore`](crate::store::CandleStore) on every write and
/// increases monotonically per (instrument, timeframe).
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Candle {
    pub instrument: InstrumentId,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    #[serde(default)]
    pub sequence: u64,
}

impl Candle {
    /// Construct an unsequenced 1-minute [`Candle`], truncating the timestamp to the minute.
    pub fn minute(
        instrument: InstrumentId,
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            instrument,
            timeframe: Timeframe::M1,
            timestamp: Timeframe::M1.truncate(timestamp),
            open,
            high,
            low,
            close,
            volume,
            sequence: 0,
        }
    }

    /// Storage key of this candle.
    pub fn key(&self) -> (InstrumentId, Timeframe, DateTime<Utc>) {
        (self.instrument, self.timeframe, self.timestamp)
    }

    /// Compare every OHLCV field (and the timestamp), ignoring `sequence`.
    pub fn same_bar(&self, other: &Candle) -> bool {
        self.timestamp == other.timestamp
            && self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
    }

    /// Validate OHLCV integrity.
    pub fn is_valid(&self) -> bool {
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= Decimal::ZERO
    }
}
