//! Client subscriptions to live candle updates.
//!
//! A [`Subscription`] is a plain record owned by the [`SubscriptionManager`] registry. The poll
//! cycle works on a copy and writes the advanced cursor back only if the entry was not changed
//! in the meantime.

use crate::{
    candle::{Candle, Instrument, Timeframe},
    error::SubscriptionError,
};
use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

/// Subscription registry and poll loop.
pub mod manager;

/// Messages pushed to subscribers.
pub mod message;

pub use manager::{PollReport, SubscriptionManager};
pub use message::{CandleMessage, MessageKind};

/// Unique identifier of a [`Subscription`].
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display, From,
)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn random() -> Self {
        Self(Uuid::now_v7())
    }
}

/// Named per-client delivery target, eg/ one WebSocket connection.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display)]
pub struct Destination(pub SmolStr);

impl Destination {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self(name.into())
    }
}

/// Fire-and-forget push of [`CandleMessage`]s to client destinations.
pub trait DeliveryChannel: Send + Sync {
    fn send(&self, destination: &Destination, message: CandleMessage);
}

/// Inclusive requested time range.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, SubscriptionError> {
        if start > end {
            return Err(SubscriptionError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }
}

/// Client request to create a [`Subscription`]. Every field except the destination is required;
/// they are optional here so a missing one is reported rather than defaulted.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRequest {
    pub instrument: Option<Instrument>,
    pub timeframe: Option<Timeframe>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub destination: Destination,
}

impl SubscriptionRequest {
    pub fn validate(
        self,
    ) -> Result<(Instrument, Timeframe, TimeWindow, Destination), SubscriptionError> {
        let instrument = self
            .instrument
            .ok_or(SubscriptionError::MissingParameter("instrument"))?;
        let timeframe = self
            .timeframe
            .ok_or(SubscriptionError::MissingParameter("timeframe"))?;
        let start = self.start.ok_or(SubscriptionError::MissingParameter("start"))?;
        let end = self.end.ok_or(SubscriptionError::MissingParameter("end"))?;

        Ok((instrument, timeframe, TimeWindow::new(start, end)?, self.destination))
    }
}

/// Registered interest of one client in one instrument/timeframe/window.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    pub window: TimeWindow,
    pub destination: Destination,
    /// Timestamp of the chronologically last delivered candle. `None` until something is
    /// delivered, in which case polling starts at `window.start` inclusive.
    pub cursor: Option<DateTime<Utc>>,
    /// Most recently delivered candle, compared against the store to detect in-place updates.
    pub baseline: Option<Candle>,
    /// Bumped by every client-driven mutation.
    pub revision: u64,
}

/// Record the last candle of `delivered` as the baseline and advance the cursor to it.
///
/// `delivered` does not need to be sorted. An empty slice leaves the subscription untouched.
pub fn mark_delivered(subscription: &mut Subscription, delivered: &[Candle]) {
    if let Some(last) = delivered.iter().max_by_key(|candle| candle.timestamp) {
        subscription.cursor = Some(last.timestamp);
        subscription.baseline = Some(last.clone());
    }
}

/// Candles to push for one poll cycle: the modified baseline bar first (unless it is also among
/// `new_bars`), then new bars in chronological order.
pub fn poll_delta(
    subscription: &Subscription,
    mut new_bars: Vec<Candle>,
    current_baseline: Option<Candle>,
) -> Vec<Candle> {
    new_bars.retain(|candle| {
        subscription
            .cursor
            .is_none_or(|cursor| candle.timestamp > cursor)
            && candle.timestamp <= subscription.window.end
    });
    new_bars.sort_by_key(|candle| candle.timestamp);

    let modified = match (&subscription.baseline, current_baseline) {
        (Some(baseline), Some(current))
            if subscription.timeframe != Timeframe::M1
                && !baseline.same_bar(&current)
                && !new_bars.iter().any(|bar| bar.timestamp == current.timestamp) =>
        {
            Some(current)
        }
        _ => None,
    };

    modified.into_iter().chain(new_bars).collect()
}
