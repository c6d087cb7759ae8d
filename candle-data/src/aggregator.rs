use crate::{
    candle::{Candle, InstrumentId, Timeframe},
    error::DataError,
    store::{Actor, CandleStore},
};
use chrono::{DateTime, TimeDelta, Utc};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::debug;

/// Rolls 1-minute bars up into every [`Timeframe::ROLLUPS`] timeframe.
///
/// Each period touched by the input is rebuilt from every 1-minute bar known for it (stored bars
/// overlaid with the input):
/// - existing rollup: `open` is kept, `high`/`low` only widen, `close` is the chronologically
///   last known bar's close.
/// - new rollup: `open` and `close` from the first and last known bars, `high`/`low` from their
///   extrema.
///
/// `volume` is the sum over the known bars, so replaying any subset of bars, in any order, leaves
/// every rollup unchanged.
pub struct CandleAggregator {
    store: Arc<dyn CandleStore>,
    actor: Actor,
}

impl std::fmt::Debug for CandleAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleAggregator")
            .field("actor", &self.actor)
            .finish_non_exhaustive()
    }
}

impl CandleAggregator {
    pub fn new(store: Arc<dyn CandleStore>) -> Self {
        Self {
            store,
            actor: Actor::system("aggregator"),
        }
    }

    /// Update rollups for newly arrived or backfilled 1-minute `bars` of `instrument`.
    ///
    /// Every changed rollup across all timeframes is written in a single batch, which is also
    /// returned. Bars for another instrument or timeframe are ignored.
    pub async fn on_new_minute_bars(
        &self,
        instrument: InstrumentId,
        bars: &[Candle],
    ) -> Result<Vec<Candle>, DataError> {
        // Deduplicate by timestamp, last write wins, ordered chronologically
        let incoming = bars
            .iter()
            .filter(|bar| bar.instrument == instrument && bar.timeframe == Timeframe::M1)
            .map(|bar| (bar.timestamp, bar))
            .collect::<BTreeMap<_, _>>();

        let (Some(first), Some(last)) = (
            incoming.keys().next().copied(),
            incoming.keys().next_back().copied(),
        ) else {
            return Ok(Vec::new());
        };

        // The daily period spans every other rollup period, so one read covers them all
        let minutes_from = Timeframe::D1.truncate(first);
        let minutes_to = period_end(Timeframe::D1, Timeframe::D1.truncate(last));
        let mut minutes = self
            .store
            .find_by_range(instrument, Timeframe::M1, minutes_from, minutes_to)
            .await?
            .into_iter()
            .map(|bar| (bar.timestamp, bar))
            .collect::<BTreeMap<_, _>>();
        minutes.extend(incoming.iter().map(|(ts, bar)| (*ts, (*bar).clone())));

        let mut rollups = Vec::new();
        for timeframe in Timeframe::ROLLUPS {
            let boundaries = incoming
                .keys()
                .map(|timestamp| timeframe.truncate(*timestamp))
                .collect::<BTreeSet<_>>();

            let (Some(from), Some(to)) = (
                boundaries.first().copied(),
                boundaries.last().copied(),
            ) else {
                continue;
            };

            let existing = self
                .store
                .find_by_range(instrument, timeframe, from, to)
                .await?
                .into_iter()
                .map(|candle| (candle.timestamp, candle))
                .collect::<BTreeMap<_, _>>();

            for boundary in boundaries {
                // Every minute bar known for the period, in chronological order
                let period = minutes
                    .range(boundary..=period_end(timeframe, boundary))
                    .map(|(_, bar)| bar)
                    .collect::<Vec<_>>();

                let rollup = match existing.get(&boundary) {
                    Some(current) => merge_rollup(current, &period),
                    None => new_rollup(instrument, timeframe, boundary, &period),
                };

                let Some(rollup) = rollup else {
                    continue;
                };

                if existing
                    .get(&boundary)
                    .is_some_and(|current| current.same_bar(&rollup))
                {
                    continue;
                }

                rollups.push(rollup);
            }
        }

        if !rollups.is_empty() {
            self.store.upsert_batch(&self.actor, rollups.clone()).await?;
        }

        debug!(
            %instrument,
            minute_bars = incoming.len(),
            rollups = rollups.len(),
            "aggregated minute bars"
        );

        Ok(rollups)
    }
}

/// Inclusive timestamp of the last 1-minute bar belonging to the period starting at `boundary`.
fn period_end(timeframe: Timeframe, boundary: DateTime<Utc>) -> DateTime<Utc> {
    boundary + timeframe.duration() - TimeDelta::minutes(1)
}

fn new_rollup(
    instrument: InstrumentId,
    timeframe: Timeframe,
    boundary: DateTime<Utc>,
    period: &[&Candle],
) -> Option<Candle> {
    let first = period.first()?;
    let last = period.last()?;

    Some(Candle {
        instrument,
        timeframe,
        timestamp: boundary,
        open: first.open,
        high: period.iter().map(|bar| bar.high).max()?,
        low: period.iter().map(|bar| bar.low).min()?,
        close: last.close,
        volume: period.iter().map(|bar| bar.volume).sum(),
        sequence: 0,
    })
}

fn merge_rollup(current: &Candle, period: &[&Candle]) -> Option<Candle> {
    let last = period.last()?;
    let high = period.iter().map(|bar| bar.high).max()?;
    let low = period.iter().map(|bar| bar.low).min()?;

    Some(Candle {
        high: current.high.max(high),
        low: current.low.min(low),
        close: last.close,
        volume: period.iter().map(|bar| bar.volume).sum(),
        ..current.clone()
    })
}
