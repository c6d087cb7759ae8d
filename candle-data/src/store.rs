//! Repository-style seams to the durable candle store and the instrument directory.
//!
//! The production system backs these with a relational database owned by the surrounding
//! application. [`InMemoryCandleStore`] and [`InMemoryInstrumentDirectory`] honour the same
//! contracts and back the server binary when no database is wired in, as well as the tests.

use crate::{
    candle::{Candle, Instrument, InstrumentId, Timeframe},
    error::DataError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use smol_str::SmolStr;
use std::collections::BTreeMap;
use tracing::debug;

/// Explicit audit context attached to every storage write.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Display)]
pub struct Actor(SmolStr);

impl Actor {
    /// Actor used by background components (ingest, aggregation, polling).
    pub fn system(component: &str) -> Self {
        Self(SmolStr::new(format!("system:{component}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Durable candle storage.
///
/// Writes are upserts keyed on (instrument, timeframe, timestamp): an existing candle is
/// overwritten field-by-field, never duplicated. Range reads are inclusive on both ends and
/// ordered by ascending timestamp.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Upsert every candle, assigning each a fresh sequence number. Returns the number written.
    async fn upsert_batch(&self, actor: &Actor, candles: Vec<Candle>) -> Result<usize, DataError>;

    async fn find_latest(
        &self,
        instrument: InstrumentId,
        timeframe: Timeframe,
    ) -> Result<Option<Candle>, DataError>;

    async fn find_by_range(
        &self,
        instrument: InstrumentId,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError>;

    async fn find_at(
        &self,
        instrument: InstrumentId,
        timeframe: Timeframe,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Candle>, DataError>;
}

/// Resolves (platform, symbol) pairs to stable [`InstrumentId`]s.
#[async_trait]
pub trait InstrumentDirectory: Send + Sync {
    /// Idempotent: resolving the same pair twice yields the same [`Instrument`].
    async fn resolve_or_create(
        &self,
        actor: &Actor,
        platform: &str,
        symbol: &str,
    ) -> Result<Instrument, DataError>;

    async fn list_instruments(&self, platform: &str) -> Result<Vec<Instrument>, DataError>;
}

#[derive(Debug, Default)]
struct Series {
    candles: BTreeMap<DateTime<Utc>, Candle>,
    next_sequence: u64,
}

/// In-process [`CandleStore`].
#[derive(Debug, Default)]
pub struct InMemoryCandleStore {
    series: RwLock<FnvHashMap<(InstrumentId, Timeframe), Series>>,
}

impl InMemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored candles across every series.
    pub fn len(&self) -> usize {
        self.series
            .read()
            .values()
            .map(|series| series.candles.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CandleStore for InMemoryCandleStore {
    async fn upsert_batch(&self, actor: &Actor, candles: Vec<Candle>) -> Result<usize, DataError> {
        let written = candles.len();
        let mut series = self.series.write();

        for mut candle in candles {
            let entry = series
                .entry((candle.instrument, candle.timeframe))
                .or_default();
            entry.next_sequence += 1;
            candle.sequence = entry.next_sequence;
            entry.candles.insert(candle.timestamp, candle);
        }

        debug!(actor = %actor, written, "upserted candle batch");
        Ok(written)
    }

    async fn find_latest(
        &self,
        instrument: InstrumentId,
        timeframe: Timeframe,
    ) -> Result<Option<Candle>, DataError> {
        Ok(self
            .series
            .read()
            .get(&(instrument, timeframe))
            .and_then(|series| series.candles.values().next_back().cloned()))
    }

    async fn find_by_range(
        &self,
        instrument: InstrumentId,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError> {
        if from > to {
            return Ok(Vec::new());
        }

        Ok(self
            .series
            .read()
            .get(&(instrument, timeframe))
            .map(|series| series.candles.range(from..=to).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }

    async fn find_at(
        &self,
        instrument: InstrumentId,
        timeframe: Timeframe,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Candle>, DataError> {
        Ok(self
            .series
            .read()
            .get(&(instrument, timeframe))
            .and_then(|series| series.candles.get(&timestamp).cloned()))
    }
}

#[derive(Debug, Default)]
struct Directory {
    by_key: FnvHashMap<(SmolStr, SmolStr), Instrument>,
    next_id: u64,
}

/// In-process [`InstrumentDirectory`].
#[derive(Debug, Default)]
pub struct InMemoryInstrumentDirectory {
    inner: Mutex<Directory>,
}

impl InMemoryInstrumentDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstrumentDirectory for InMemoryInstrumentDirectory {
    async fn resolve_or_create(
        &self,
        actor: &Actor,
        platform: &str,
        symbol: &str,
    ) -> Result<Instrument, DataError> {
        let key = (SmolStr::new(platform), SmolStr::new(symbol));
        let mut directory = self.inner.lock();

        if let Some(instrument) = directory.by_key.get(&key) {
            return Ok(instrument.clone());
        }

        directory.next_id += 1;
        let instrument = Instrument {
            id: InstrumentId(directory.next_id),
            platform: key.0.clone(),
            symbol: key.1.clone(),
        };
        directory.by_key.insert(key, instrument.clone());

        debug!(actor = %actor, %instrument, id = %instrument.id, "created instrument");
        Ok(instrument)
    }

    async fn list_instruments(&self, platform: &str) -> Result<Vec<Instrument>, DataError> {
        let directory = self.inner.lock();
        let mut instruments = directory
            .by_key
            .values()
            .filter(|instrument| instrument.platform == platform)
            .cloned()
            .collect::<Vec<_>>();
        instruments.sort_by_key(|instrument| instrument.id);
        Ok(instruments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn candle(timeframe: Timeframe, minute: u32, close: rust_decimal::Decimal) -> Candle {
        Candle {
            instrument: InstrumentId(1),
            timeframe,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 11, 10, minute, 0).unwrap(),
            open: dec!(10),
            high: dec!(20),
            low: dec!(5),
            close,
            volume: dec!(100),
            sequence: 0,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_for_every_timeframe() {
        let store = InMemoryCandleStore::new();
        let actor = Actor::system("test");

        for timeframe in [Timeframe::M1].into_iter().chain(Timeframe::ROLLUPS) {
            store
                .upsert_batch(&actor, vec![candle(timeframe, 0, dec!(11))])
                .await
                .unwrap();
            store
                .upsert_batch(&actor, vec![candle(timeframe, 0, dec!(12))])
                .await
                .unwrap();

            let stored = store
                .find_by_range(
                    InstrumentId(1),
                    timeframe,
                    Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap(),
                    Utc.with_ymd_and_hms(2024, 3, 12, 0, 0, 0).unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(stored.len(), 1, "{timeframe} duplicated");
            assert!(stored[0].same_bar(&candle(timeframe, 0, dec!(12))));
        }
        assert_eq!(store.len(), 6);
    }

    #[tokio::test]
    async fn test_upsert_assigns_monotonic_sequence() {
        let store = InMemoryCandleStore::new();
        let actor = Actor::system("test");

        store
            .upsert_batch(
                &actor,
                vec![candle(Timeframe::M1, 0, dec!(11)), candle(Timeframe::M1, 1, dec!(11))],
            )
            .await
            .unwrap();
        store
            .upsert_batch(&actor, vec![candle(Timeframe::M1, 0, dec!(13))])
            .await
            .unwrap();

        let first = store
            .find_at(InstrumentId(1), Timeframe::M1, candle(Timeframe::M1, 0, dec!(0)).timestamp)
            .await
            .unwrap()
            .unwrap();
        let latest = store
            .find_latest(InstrumentId(1), Timeframe::M1)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.sequence, 3);
        assert_eq!(first.close, dec!(13));
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.timestamp, candle(Timeframe::M1, 1, dec!(0)).timestamp);
    }

    #[tokio::test]
    async fn test_find_by_range_is_inclusive_and_ordered() {
        let store = InMemoryCandleStore::new();
        let actor = Actor::system("test");
        store
            .upsert_batch(
                &actor,
                vec![
                    candle(Timeframe::M1, 3, dec!(1)),
                    candle(Timeframe::M1, 1, dec!(1)),
                    candle(Timeframe::M1, 2, dec!(1)),
                    candle(Timeframe::M1, 4, dec!(1)),
                ],
            )
            .await
            .unwrap();

        let range = store
            .find_by_range(
                InstrumentId(1),
                Timeframe::M1,
                candle(Timeframe::M1, 1, dec!(0)).timestamp,
                candle(Timeframe::M1, 3, dec!(0)).timestamp,
            )
            .await
            .unwrap();

        let minutes = range
            .iter()
            .map(|c| chrono::Timelike::minute(&c.timestamp))
            .collect::<Vec<_>>();
        assert_eq!(minutes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_resolve_or_create_is_idempotent() {
        let directory = InMemoryInstrumentDirectory::new();
        let actor = Actor::system("test");

        let first = directory.resolve_or_create(&actor, "alpaca", "AAPL").await.unwrap();
        let second = directory.resolve_or_create(&actor, "alpaca", "AAPL").await.unwrap();
        let other = directory.resolve_or_create(&actor, "alpaca", "BTC/USD").await.unwrap();
        let elsewhere = directory.resolve_or_create(&actor, "other", "AAPL").await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first.id, other.id);
        assert_ne!(first.id, elsewhere.id);
        assert_eq!(directory.list_instruments("alpaca").await.unwrap(), vec![first, other]);
    }
}
