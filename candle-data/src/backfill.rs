use crate::{
    aggregator::CandleAggregator,
    candle::{Candle, Instrument, InstrumentId, Timeframe},
    config::BackfillConfig,
    error::DataError,
    store::{Actor, CandleStore, InstrumentDirectory},
    streaming::{StreamBar, StreamingFeedClient},
    upstream::{BarRecord, BarsRequest, MarketDataApi, parse_bar},
};
use chrono::Utc;
use fnv::{FnvHashMap, FnvHashSet};
use itertools::Itertools;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Maximum live bars drained from the ingest channel per store write.
const INGEST_BATCH: usize = 256;

/// Result of one [`BackfillService::sync`] call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyncOutcome {
    Synced(SyncStats),
    /// Another sync for the same instrument is in progress; nothing was fetched.
    AlreadySyncing,
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SyncStats {
    pub pages: usize,
    pub bars: usize,
    pub skipped: usize,
}

/// Summary of a multi-instrument [`BackfillService::sync_all`] sweep.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    pub skipped: usize,
    pub bars: usize,
}

/// Removes the instrument from the in-progress set when the sync ends, however it ends.
struct SyncGuard<'a> {
    syncing: &'a Mutex<FnvHashSet<InstrumentId>>,
    instrument: InstrumentId,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.syncing.lock().remove(&self.instrument);
    }
}

/// Historical gap-fill plus live-bar registration.
///
/// Backfilled pages and live bars both end in an idempotent 1-minute upsert followed by
/// [`CandleAggregator::on_new_minute_bars`].
pub struct BackfillService {
    api: Arc<dyn MarketDataApi>,
    store: Arc<dyn CandleStore>,
    directory: Arc<dyn InstrumentDirectory>,
    aggregator: Arc<CandleAggregator>,
    streaming: Arc<StreamingFeedClient>,
    config: BackfillConfig,
    actor: Actor,
    syncing: Mutex<FnvHashSet<InstrumentId>>,
    live: Mutex<FnvHashMap<InstrumentId, Instrument>>,
    ingest_tx: mpsc::UnboundedSender<Candle>,
    ingest_rx: Mutex<Option<mpsc::UnboundedReceiver<Candle>>>,
}

impl std::fmt::Debug for BackfillService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackfillService")
            .field("config", &self.config)
            .field("syncing", &*self.syncing.lock())
            .field("live", &self.live.lock().len())
            .finish_non_exhaustive()
    }
}

impl BackfillService {
    pub fn new(
        api: Arc<dyn MarketDataApi>,
        store: Arc<dyn CandleStore>,
        directory: Arc<dyn InstrumentDirectory>,
        aggregator: Arc<CandleAggregator>,
        streaming: Arc<StreamingFeedClient>,
        config: BackfillConfig,
    ) -> Self {
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        Self {
            api,
            store,
            directory,
            aggregator,
            streaming,
            config,
            actor: Actor::system("backfill"),
            syncing: Mutex::new(FnvHashSet::default()),
            live: Mutex::new(FnvHashMap::default()),
            ingest_tx,
            ingest_rx: Mutex::new(Some(ingest_rx)),
        }
    }

    pub fn is_syncing(&self, instrument: InstrumentId) -> bool {
        self.syncing.lock().contains(&instrument)
    }

    /// Fetch and store every 1-minute bar between the last stored bar (or the default lookback)
    /// and now, then update rollups.
    ///
    /// Malformed bars are logged and skipped. Fetch and store failures abort this instrument's
    /// sync and are returned to the caller.
    pub async fn sync(&self, instrument: &Instrument) -> Result<SyncOutcome, DataError> {
        if !self.syncing.lock().insert(instrument.id) {
            debug!(%instrument, "sync already in progress");
            return Ok(SyncOutcome::AlreadySyncing);
        }
        let _guard = SyncGuard {
            syncing: &self.syncing,
            instrument: instrument.id,
        };

        let end = Utc::now();
        let start = match self.store.find_latest(instrument.id, Timeframe::M1).await? {
            Some(latest) => latest.timestamp,
            None => end - self.config.default_lookback,
        };

        info!(%instrument, %start, %end, "syncing minute bars");

        let mut stats = SyncStats::default();
        let mut page_token = None;
        loop {
            let request = BarsRequest {
                symbol: instrument.symbol.clone(),
                timeframe: Timeframe::M1,
                start,
                end,
                limit: self.config.page_size,
                page_token: page_token.take(),
            };

            let page = self.api.fetch_bars(&request).await?;
            if page.bars.is_empty() {
                break;
            }
            stats.pages += 1;

            let mut candles = Vec::with_capacity(page.bars.len());
            for raw in page.bars {
                match parse_bar(instrument, raw) {
                    Ok(candle) => candles.push(candle),
                    Err(error) => {
                        warn!(%instrument, %error, "skipping malformed bar");
                        stats.skipped += 1;
                    }
                }
            }

            if !candles.is_empty() {
                stats.bars += self.store.upsert_batch(&self.actor, candles.clone()).await?;
                self.aggregator
                    .on_new_minute_bars(instrument.id, &candles)
                    .await?;
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }

            tokio::time::sleep(self.config.page_delay).await;
        }

        info!(
            %instrument,
            pages = stats.pages,
            bars = stats.bars,
            skipped = stats.skipped,
            "sync complete"
        );
        Ok(SyncOutcome::Synced(stats))
    }

    /// [`Self::sync`] every instrument listed for `platform`, isolating per-instrument failures.
    pub async fn sync_all(&self, platform: &str) -> Result<SyncReport, DataError> {
        let instruments = self.directory.list_instruments(platform).await?;
        let mut report = SyncReport::default();

        for instrument in instruments {
            match self.sync(&instrument).await {
                Ok(SyncOutcome::Synced(stats)) => {
                    report.synced += 1;
                    report.bars += stats.bars;
                }
                Ok(SyncOutcome::AlreadySyncing) => report.skipped += 1,
                Err(error) => {
                    error!(%instrument, %error, "sync failed, continuing with next instrument");
                    report.failed += 1;
                }
            }
        }

        info!(
            platform,
            synced = report.synced,
            failed = report.failed,
            skipped = report.skipped,
            bars = report.bars,
            "gap-fill sweep complete"
        );
        Ok(report)
    }

    /// Sync `instrument`, then register it for live bars and add it to the streaming set.
    ///
    /// A failed sync is logged; the instrument is still registered so live bars keep flowing and
    /// the next gap-fill closes the hole.
    pub async fn setup_symbol(&self, instrument: &Instrument) -> Result<SyncOutcome, DataError> {
        let outcome = self.sync(instrument).await;
        if let Err(error) = &outcome {
            warn!(%instrument, %error, "initial sync failed, registering for live bars anyway");
        }

        let handler_instrument = instrument.clone();
        let ingest_tx = self.ingest_tx.clone();
        self.streaming.register_handler(
            instrument.symbol.clone(),
            Arc::new(move |bar: StreamBar| {
                match BarRecord::from(bar).into_candle(&handler_instrument) {
                    Ok(candle) => {
                        if ingest_tx.send(candle).is_err() {
                            warn!(
                                instrument = %handler_instrument,
                                "live ingest stopped, dropping bar"
                            );
                        }
                    }
                    Err(error) => warn!(
                        instrument = %handler_instrument,
                        %error,
                        "skipping malformed live bar"
                    ),
                }
            }),
        );

        self.live.lock().insert(instrument.id, instrument.clone());
        self.refresh_streaming();

        info!(%instrument, "symbol set up for live bars");
        outcome
    }

    /// Stop live bars for `instrument`. Stored candles are kept.
    pub fn remove_symbol(&self, instrument: &Instrument) {
        self.streaming.unregister_handler(&instrument.symbol);
        if self.live.lock().remove(&instrument.id).is_some() {
            info!(%instrument, "symbol removed from live bars");
        }
        self.refresh_streaming();
    }

    /// Instruments currently registered for live bars, ordered by id.
    pub fn live_symbols(&self) -> Vec<Instrument> {
        self.live
            .lock()
            .values()
            .cloned()
            .sorted_by_key(|instrument| instrument.id)
            .collect()
    }

    fn refresh_streaming(&self) {
        let symbols = self
            .live
            .lock()
            .values()
            .map(|instrument| instrument.symbol.clone())
            .collect::<Vec<_>>();
        self.streaming.update_subscriptions(symbols);
    }

    /// Spawn the task that stores live bars and updates rollups.
    ///
    /// Returns `None` if the task was already spawned.
    pub fn spawn_live_ingest(&self) -> Option<JoinHandle<()>> {
        let rx = self.ingest_rx.lock().take()?;
        Some(tokio::spawn(run_live_ingest(
            rx,
            Arc::clone(&self.store),
            Arc::clone(&self.aggregator),
            Actor::system("live-ingest"),
        )))
    }
}

async fn run_live_ingest(
    mut rx: mpsc::UnboundedReceiver<Candle>,
    store: Arc<dyn CandleStore>,
    aggregator: Arc<CandleAggregator>,
    actor: Actor,
) {
    let mut buffer = Vec::with_capacity(INGEST_BATCH);
    while rx.recv_many(&mut buffer, INGEST_BATCH).await > 0 {
        let by_instrument = buffer
            .drain(..)
            .into_group_map_by(|candle| candle.instrument);

        for (instrument, candles) in by_instrument {
            if let Err(error) = store.upsert_batch(&actor, candles.clone()).await {
                error!(%instrument, %error, "failed to store live bars");
                continue;
            }
            if let Err(error) = aggregator.on_new_minute_bars(instrument, &candles).await {
                error!(%instrument, %error, "failed to aggregate live bars");
            }
        }
    }

    info!("live ingest channel closed");
}
