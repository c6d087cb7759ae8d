use super::{
    CandleMessage, DeliveryChannel, Destination, MessageKind, Subscription, SubscriptionId,
    SubscriptionRequest, TimeWindow, mark_delivered, poll_delta,
};
use crate::{
    candle::{Candle, Timeframe},
    config::SubscriptionConfig,
    error::{DataError, SubscriptionError},
    store::CandleStore,
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Outcome counts of one [`SubscriptionManager::poll_once`] cycle.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PollReport {
    pub updates: usize,
    pub heartbeats: usize,
    pub failed: usize,
}

/// Tracks client subscriptions and pushes snapshots, updates and heartbeats to them.
///
/// Live delivery polls the [`CandleStore`] on a fixed cadence and diffs against the per
/// subscription cursor and baseline; ingestion never notifies subscribers directly.
pub struct SubscriptionManager {
    store: Arc<dyn CandleStore>,
    delivery: Arc<dyn DeliveryChannel>,
    config: SubscriptionConfig,
    subscriptions: RwLock<FnvHashMap<SubscriptionId, Subscription>>,
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("config", &self.config)
            .field("subscriptions", &self.subscriptions.read().len())
            .finish_non_exhaustive()
    }
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn CandleStore>,
        delivery: Arc<dyn DeliveryChannel>,
        config: SubscriptionConfig,
    ) -> Self {
        Self {
            store,
            delivery,
            config,
            subscriptions: RwLock::new(FnvHashMap::default()),
        }
    }

    /// Validate `request`, push the window snapshot and register the subscription.
    ///
    /// The last snapshot candle becomes both the modification baseline and the poll cursor.
    pub async fn create_subscription(
        &self,
        request: SubscriptionRequest,
    ) -> Result<SubscriptionId, SubscriptionError> {
        let (instrument, timeframe, window, destination) = request.validate()?;

        let mut subscription = Subscription {
            id: SubscriptionId::random(),
            instrument,
            timeframe,
            window,
            destination,
            cursor: None,
            baseline: None,
            revision: 0,
        };
        self.send_snapshot(&mut subscription).await?;

        let id = subscription.id;
        info!(
            subscription_id = %id,
            instrument = %subscription.instrument,
            %timeframe,
            destination = %subscription.destination,
            "subscription created"
        );
        self.subscriptions.write().insert(id, subscription);

        Ok(id)
    }

    pub fn cancel_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Subscription, SubscriptionError> {
        let removed = self
            .subscriptions
            .write()
            .remove(&id)
            .ok_or(SubscriptionError::NotFound(id))?;

        info!(subscription_id = %id, "subscription cancelled");
        Ok(removed)
    }

    /// Cancel every subscription delivering to `destination`, eg/ after its transport dropped.
    pub fn cancel_destination(&self, destination: &Destination) -> usize {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|_, subscription| subscription.destination != *destination);
        let cancelled = before - subscriptions.len();

        if cancelled > 0 {
            info!(%destination, cancelled, "cancelled subscriptions of closed destination");
        }
        cancelled
    }

    /// Change the window of a subscription; with `reset`, re-send the snapshot exactly as at
    /// creation and restart change detection from it.
    pub async fn update_subscription(
        &self,
        id: SubscriptionId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        reset: bool,
    ) -> Result<(), SubscriptionError> {
        let mut subscription = self
            .subscription(id)
            .ok_or(SubscriptionError::NotFound(id))?;

        subscription.window = TimeWindow::new(
            start.unwrap_or(subscription.window.start),
            end.unwrap_or(subscription.window.end),
        )?;
        subscription.revision += 1;

        if reset {
            subscription.cursor = None;
            subscription.baseline = None;
            self.send_snapshot(&mut subscription).await?;
        }

        let mut subscriptions = self.subscriptions.write();
        let Some(entry) = subscriptions.get_mut(&id) else {
            return Err(SubscriptionError::NotFound(id));
        };
        *entry = subscription;
        drop(subscriptions);

        info!(subscription_id = %id, reset, "subscription updated");
        Ok(())
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<Subscription> {
        self.subscriptions.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn send_snapshot(&self, subscription: &mut Subscription) -> Result<(), DataError> {
        let candles = self
            .store
            .find_by_range(
                subscription.instrument.id,
                subscription.timeframe,
                subscription.window.start,
                subscription.window.end,
            )
            .await?;

        mark_delivered(subscription, &candles);
        debug!(
            subscription_id = %subscription.id,
            candles = candles.len(),
            "sending snapshot"
        );
        self.deliver(subscription, MessageKind::Snapshot, candles);
        Ok(())
    }

    fn deliver(&self, subscription: &Subscription, kind: MessageKind, candles: Vec<Candle>) {
        self.delivery.send(
            &subscription.destination,
            CandleMessage::new(
                subscription.id,
                subscription.instrument.clone(),
                subscription.timeframe,
                kind,
                candles,
            ),
        );
    }

    /// Run one poll cycle over every active subscription.
    ///
    /// Each subscription receives exactly one message: an `UPDATE` with new and modified
    /// candles, or a `HEARTBEAT` if nothing changed. A failing subscription is logged and
    /// skipped.
    pub async fn poll_once(&self) -> PollReport {
        let subscriptions = self
            .subscriptions
            .read()
            .values()
            .cloned()
            .collect::<Vec<_>>();

        let mut report = PollReport::default();
        for subscription in subscriptions {
            let id = subscription.id;
            match self.poll_subscription(subscription).await {
                Ok(MessageKind::Heartbeat) => report.heartbeats += 1,
                Ok(_) => report.updates += 1,
                Err(error) => {
                    warn!(subscription_id = %id, %error, "subscription poll failed");
                    report.failed += 1;
                }
            }
        }

        report
    }

    async fn poll_subscription(
        &self,
        mut subscription: Subscription,
    ) -> Result<MessageKind, DataError> {
        let from = subscription.cursor.unwrap_or(subscription.window.start);
        let new_bars = self
            .store
            .find_by_range(
                subscription.instrument.id,
                subscription.timeframe,
                from,
                subscription.window.end,
            )
            .await?;

        let current_baseline = match (&subscription.baseline, subscription.timeframe) {
            (Some(baseline), timeframe) if timeframe != Timeframe::M1 => {
                self.store
                    .find_at(subscription.instrument.id, timeframe, baseline.timestamp)
                    .await?
            }
            _ => None,
        };

        let delta = poll_delta(&subscription, new_bars, current_baseline);
        if delta.is_empty() {
            self.deliver(&subscription, MessageKind::Heartbeat, Vec::new());
            return Ok(MessageKind::Heartbeat);
        }

        let revision = subscription.revision;
        mark_delivered(&mut subscription, &delta);
        debug!(
            subscription_id = %subscription.id,
            candles = delta.len(),
            cursor = ?subscription.cursor,
            "sending update"
        );
        self.deliver(&subscription, MessageKind::Update, delta);

        // Cancelled or changed by the client mid-poll: leave the registry alone
        if let Some(entry) = self.subscriptions.write().get_mut(&subscription.id) {
            if entry.revision == revision {
                entry.cursor = subscription.cursor;
                entry.baseline = subscription.baseline;
            }
        }

        Ok(MessageKind::Update)
    }

    /// Poll every [`SubscriptionConfig::poll_interval`] forever.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.config.poll_interval, "starting subscription poll loop");
        loop {
            interval.tick().await;
            let report = self.poll_once().await;
            debug!(
                updates = report.updates,
                heartbeats = report.heartbeats,
                failed = report.failed,
                "poll cycle complete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        candle::{Instrument, InstrumentId},
        store::{Actor, InMemoryCandleStore},
    };
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use smol_str::SmolStr;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDelivery(Mutex<Vec<(Destination, CandleMessage)>>);

    impl DeliveryChannel for RecordingDelivery {
        fn send(&self, destination: &Destination, message: CandleMessage) {
            self.0.lock().push((destination.clone(), message));
        }
    }

    impl RecordingDelivery {
        fn take(&self) -> Vec<CandleMessage> {
            self.0.lock().drain(..).map(|(_, message)| message).collect()
        }
    }

    /// Delegates to an in-memory store, failing every read for one instrument.
    struct FailingStore {
        inner: InMemoryCandleStore,
        failing: InstrumentId,
    }

    #[async_trait]
    impl CandleStore for FailingStore {
        async fn upsert_batch(
            &self,
            actor: &Actor,
            candles: Vec<Candle>,
        ) -> Result<usize, DataError> {
            self.inner.upsert_batch(actor, candles).await
        }

        async fn find_latest(
            &self,
            instrument: InstrumentId,
            timeframe: Timeframe,
        ) -> Result<Option<Candle>, DataError> {
            self.inner.find_latest(instrument, timeframe).await
        }

        async fn find_by_range(
            &self,
            instrument: InstrumentId,
            timeframe: Timeframe,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<Candle>, DataError> {
            if instrument == self.failing {
                return Err(DataError::Store("connection reset".to_string()));
            }
            self.inner.find_by_range(instrument, timeframe, from, to).await
        }

        async fn find_at(
            &self,
            instrument: InstrumentId,
            timeframe: Timeframe,
            timestamp: DateTime<Utc>,
        ) -> Result<Option<Candle>, DataError> {
            self.inner.find_at(instrument, timeframe, timestamp).await
        }
    }

    fn time(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 11, 10, minute, 0).unwrap()
    }

    fn instrument(id: u64) -> Instrument {
        Instrument {
            id: InstrumentId(id),
            platform: SmolStr::new("alpaca"),
            symbol: SmolStr::new(format!("SYM{id}")),
        }
    }

    fn candle(timeframe: Timeframe, minute: u32, high: Decimal) -> Candle {
        Candle {
            instrument: InstrumentId(1),
            timeframe,
            timestamp: time(minute),
            open: dec!(10),
            high,
            low: dec!(5),
            close: dec!(10),
            volume: dec!(100),
            sequence: 0,
        }
    }

    fn request(timeframe: Timeframe) -> SubscriptionRequest {
        SubscriptionRequest {
            instrument: Some(instrument(1)),
            timeframe: Some(timeframe),
            start: Some(time(0)),
            end: Some(time(59)),
            destination: Destination::new("client-1"),
        }
    }

    async fn store_candles(store: &InMemoryCandleStore, candles: Vec<Candle>) {
        store
            .upsert_batch(&Actor::system("test"), candles)
            .await
            .unwrap();
    }

    fn manager(store: Arc<dyn CandleStore>) -> (SubscriptionManager, Arc<RecordingDelivery>) {
        let delivery = Arc::new(RecordingDelivery::default());
        let manager =
            SubscriptionManager::new(store, delivery.clone(), SubscriptionConfig::default());
        (manager, delivery)
    }

    fn timestamps(message: &CandleMessage) -> Vec<DateTime<Utc>> {
        message.candles.iter().map(|candle| candle.timestamp).collect()
    }

    #[tokio::test]
    async fn test_snapshot_then_poll_does_not_redeliver_boundary() {
        let store = Arc::new(InMemoryCandleStore::new());
        store_candles(
            &store,
            (0..3).map(|minute| candle(Timeframe::M1, minute, dec!(12))).collect(),
        )
        .await;
        let (manager, delivery) = manager(store.clone());

        let id = manager.create_subscription(request(Timeframe::M1)).await.unwrap();
        let snapshot = delivery.take();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].kind, MessageKind::Snapshot);
        assert_eq!(timestamps(&snapshot[0]), vec![time(0), time(1), time(2)]);
        assert_eq!(manager.subscription(id).unwrap().cursor, Some(time(2)));

        // Nothing new: the bar at the snapshot boundary is not re-sent
        manager.poll_once().await;
        let heartbeat = delivery.take();
        assert_eq!(heartbeat.len(), 1);
        assert!(heartbeat[0].is_heartbeat());
        assert!(heartbeat[0].candles.is_empty());

        store_candles(&store, vec![candle(Timeframe::M1, 3, dec!(12))]).await;
        let report = manager.poll_once().await;
        assert_eq!(report, PollReport { updates: 1, heartbeats: 0, failed: 0 });

        let update = delivery.take();
        assert_eq!(update.len(), 1);
        assert_eq!(update[0].kind, MessageKind::Update);
        assert_eq!(update[0].subscription_id, id);
        assert_eq!(timestamps(&update[0]), vec![time(3)]);
        assert_eq!(manager.subscription(id).unwrap().cursor, Some(time(3)));
    }

    #[tokio::test]
    async fn test_modified_open_bar_delivered_once() {
        let store = Arc::new(InMemoryCandleStore::new());
        store_candles(
            &store,
            vec![candle(Timeframe::M5, 0, dec!(12)), candle(Timeframe::M5, 5, dec!(12))],
        )
        .await;
        let (manager, delivery) = manager(store.clone());

        manager.create_subscription(request(Timeframe::M5)).await.unwrap();
        delivery.take();

        // Still-open 10:05 bar widens
        store_candles(&store, vec![candle(Timeframe::M5, 5, dec!(14))]).await;
        manager.poll_once().await;

        let update = delivery.take();
        assert_eq!(update.len(), 1);
        assert_eq!(update[0].kind, MessageKind::Update);
        assert_eq!(timestamps(&update[0]), vec![time(5)]);
        assert_eq!(update[0].candles[0].high, dec!(14));

        // Same state again: heartbeat only
        manager.poll_once().await;
        let heartbeat = delivery.take();
        assert_eq!(heartbeat.len(), 1);
        assert!(heartbeat[0].is_heartbeat());
    }

    #[tokio::test]
    async fn test_modified_and_new_bars_share_one_update() {
        let store = Arc::new(InMemoryCandleStore::new());
        store_candles(&store, vec![candle(Timeframe::M15, 0, dec!(12))]).await;
        let (manager, delivery) = manager(store.clone());

        let id = manager.create_subscription(request(Timeframe::M15)).await.unwrap();
        delivery.take();

        store_candles(
            &store,
            vec![candle(Timeframe::M15, 0, dec!(15)), candle(Timeframe::M15, 15, dec!(11))],
        )
        .await;
        manager.poll_once().await;

        let update = delivery.take();
        assert_eq!(update.len(), 1);
        assert_eq!(timestamps(&update[0]), vec![time(0), time(15)]);

        let subscription = manager.subscription(id).unwrap();
        assert_eq!(subscription.cursor, Some(time(15)));
        assert_eq!(subscription.baseline.unwrap().high, dec!(11));
    }

    #[tokio::test]
    async fn test_empty_snapshot_polls_from_window_start() {
        let store = Arc::new(InMemoryCandleStore::new());
        let (manager, delivery) = manager(store.clone());

        let id = manager.create_subscription(request(Timeframe::M1)).await.unwrap();
        let snapshot = delivery.take();
        assert!(snapshot[0].candles.is_empty());
        assert_eq!(manager.subscription(id).unwrap().cursor, None);

        store_candles(&store, vec![candle(Timeframe::M1, 0, dec!(12))]).await;
        manager.poll_once().await;

        let update = delivery.take();
        assert_eq!(timestamps(&update[0]), vec![time(0)]);
    }

    #[tokio::test]
    async fn test_update_with_reset_resends_snapshot() {
        let store = Arc::new(InMemoryCandleStore::new());
        store_candles(
            &store,
            (0..5).map(|minute| candle(Timeframe::M1, minute, dec!(12))).collect(),
        )
        .await;
        let (manager, delivery) = manager(store.clone());

        let id = manager.create_subscription(request(Timeframe::M1)).await.unwrap();
        delivery.take();

        // Window change without reset: no message, cursor kept
        manager
            .update_subscription(id, Some(time(2)), None, false)
            .await
            .unwrap();
        assert!(delivery.take().is_empty());
        let subscription = manager.subscription(id).unwrap();
        assert_eq!(subscription.window.start, time(2));
        assert_eq!(subscription.cursor, Some(time(4)));

        manager
            .update_subscription(id, None, Some(time(3)), true)
            .await
            .unwrap();
        let snapshot = delivery.take();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].kind, MessageKind::Snapshot);
        assert_eq!(timestamps(&snapshot[0]), vec![time(2), time(3)]);
        assert_eq!(manager.subscription(id).unwrap().cursor, Some(time(3)));
    }

    #[tokio::test]
    async fn test_reported_failures() {
        let store = Arc::new(InMemoryCandleStore::new());
        let (manager, _delivery) = manager(store);
        let unknown = SubscriptionId::random();

        assert_eq!(
            manager.cancel_subscription(unknown),
            Err(SubscriptionError::NotFound(unknown))
        );
        assert_eq!(
            manager.update_subscription(unknown, None, None, true).await,
            Err(SubscriptionError::NotFound(unknown))
        );
        assert_eq!(
            manager
                .create_subscription(SubscriptionRequest {
                    timeframe: None,
                    ..request(Timeframe::M1)
                })
                .await,
            Err(SubscriptionError::MissingParameter("timeframe"))
        );

        let id = manager.create_subscription(request(Timeframe::M1)).await.unwrap();
        assert_eq!(
            manager.update_subscription(id, Some(time(59)), Some(time(0)), false).await,
            Err(SubscriptionError::InvalidWindow {
                start: time(59),
                end: time(0)
            })
        );
        assert!(manager.cancel_subscription(id).is_ok());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_failing_subscription_does_not_stop_cycle() {
        let store = Arc::new(FailingStore {
            inner: InMemoryCandleStore::new(),
            failing: InstrumentId(2),
        });
        let (manager, delivery) = manager(store.clone());

        manager.create_subscription(request(Timeframe::M1)).await.unwrap();
        assert!(
            manager
                .create_subscription(SubscriptionRequest {
                    instrument: Some(instrument(2)),
                    ..request(Timeframe::M1)
                })
                .await
                .is_err()
        );
        delivery.take();

        // Failing instrument sneaks in after a successful snapshot
        let id = SubscriptionId::random();
        manager.subscriptions.write().insert(
            id,
            Subscription {
                id,
                instrument: instrument(2),
                timeframe: Timeframe::M1,
                window: TimeWindow::new(time(0), time(59)).unwrap(),
                destination: Destination::new("client-2"),
                cursor: None,
                baseline: None,
                revision: 0,
            },
        );

        let report = manager.poll_once().await;
        assert_eq!(report, PollReport { updates: 0, heartbeats: 1, failed: 1 });
        assert_eq!(delivery.take().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_destination() {
        let store = Arc::new(InMemoryCandleStore::new());
        let (manager, _delivery) = manager(store);

        manager.create_subscription(request(Timeframe::M1)).await.unwrap();
        manager.create_subscription(request(Timeframe::M5)).await.unwrap();
        manager
            .create_subscription(SubscriptionRequest {
                destination: Destination::new("client-2"),
                ..request(Timeframe::M1)
            })
            .await
            .unwrap();

        assert_eq!(manager.cancel_destination(&Destination::new("client-1")), 2);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_on_interval() {
        let store = Arc::new(InMemoryCandleStore::new());
        let delivery = Arc::new(RecordingDelivery::default());
        let manager = Arc::new(SubscriptionManager::new(
            store,
            delivery.clone(),
            SubscriptionConfig::default().with_poll_interval(Duration::from_secs(10)),
        ));

        manager.create_subscription(request(Timeframe::M1)).await.unwrap();
        delivery.take();

        let task = tokio::spawn(Arc::clone(&manager).run());
        // First tick fires immediately, then every 10s
        tokio::time::sleep(Duration::from_secs(25)).await;
        task.abort();

        let heartbeats = delivery.take();
        assert_eq!(heartbeats.len(), 3);
        assert!(heartbeats.iter().all(CandleMessage::is_heartbeat));
    }
}
