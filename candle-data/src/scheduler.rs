use crate::{
    backfill::BackfillService,
    config::SchedulerConfig,
    market_hours::MarketHoursOracle,
    streaming::{FeedFamily, StreamingFeedClient},
    subscription::SubscriptionManager,
};
use smol_str::SmolStr;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Components driven by the background [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerContext {
    pub backfill: Arc<BackfillService>,
    pub streaming: Arc<StreamingFeedClient>,
    pub oracle: Arc<MarketHoursOracle>,
    pub subscriptions: Arc<SubscriptionManager>,
    /// Platforms swept by the daily gap-fill.
    pub platforms: Vec<SmolStr>,
}

/// Fixed set of background tasks: live ingest, subscription polling, daily gap-fill,
/// session-open pre-warm and the streaming connection health check.
#[derive(Debug)]
pub struct Scheduler {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn start(context: SchedulerContext, config: SchedulerConfig) -> Self {
        let mut tasks = Vec::new();

        if let Some(ingest) = context.backfill.spawn_live_ingest() {
            tasks.push(("live-ingest", ingest));
        }

        tasks.push((
            "subscription-poll",
            tokio::spawn(Arc::clone(&context.subscriptions).run()),
        ));

        let gap_fill = context.clone();
        tasks.push((
            "gap-fill",
            spawn_periodic(config.gap_fill_interval, move || {
                let context = gap_fill.clone();
                async move { run_gap_fill(&context.backfill, &context.platforms).await }
            }),
        ));

        let pre_warm = context.clone();
        let session = Arc::new(parking_lot::Mutex::new(SessionWatch::default()));
        tasks.push((
            "pre-warm",
            spawn_periodic(config.pre_warm_check_interval, move || {
                let context = pre_warm.clone();
                let session = Arc::clone(&session);
                async move {
                    let is_open = context.oracle.is_session_open().await;
                    let opened = session.lock().observe(is_open);
                    if opened {
                        pre_warm_session(&context.backfill, &context.oracle).await;
                    }
                }
            }),
        ));

        let health = context;
        tasks.push((
            "health-check",
            spawn_periodic(config.health_check_interval, move || {
                let context = health.clone();
                async move {
                    check_connection_health(&context.backfill, &context.streaming);
                }
            }),
        ));

        info!(tasks = tasks.len(), "scheduler started");
        Self { tasks }
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _)| *name).collect()
    }

    /// Abort every background task.
    pub fn shutdown(self) {
        for (name, task) in self.tasks {
            debug!(task = name, "aborting scheduled task");
            task.abort();
        }
        info!("scheduler stopped");
    }
}

/// Run `job` every `period`, first after one full period has elapsed.
fn spawn_periodic<F, Fut>(period: Duration, mut job: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            job().await;
        }
    })
}

/// Gap-fill every instrument of every platform, isolating per-platform failures.
pub async fn run_gap_fill(backfill: &BackfillService, platforms: &[SmolStr]) {
    for platform in platforms {
        if let Err(error) = backfill.sync_all(platform).await {
            error!(%platform, %error, "gap-fill sweep failed");
        }
    }
}

/// Tracks the last observed session state to detect the closed-to-open transition.
#[derive(Debug, Default)]
pub struct SessionWatch {
    last: Option<bool>,
}

impl SessionWatch {
    /// Record `is_open`, returning true only when the session just went from closed to open.
    pub fn observe(&mut self, is_open: bool) -> bool {
        let opened = self.last == Some(false) && is_open;
        self.last = Some(is_open);
        opened
    }
}

/// Sync every live session-gated instrument so the first bars after the open have no gap.
pub async fn pre_warm_session(backfill: &BackfillService, oracle: &MarketHoursOracle) {
    let instruments = backfill
        .live_symbols()
        .into_iter()
        .filter(|instrument| oracle.requires_session_gating(instrument))
        .collect::<Vec<_>>();

    info!(instruments = instruments.len(), "session opened, pre-warming");
    for instrument in instruments {
        if let Err(error) = backfill.sync(&instrument).await {
            warn!(%instrument, %error, "pre-warm sync failed");
        }
    }
}

/// Compare the streaming client against the live symbol set and repair it on mismatch.
///
/// Returns true if a reconnect was triggered.
pub fn check_connection_health(
    backfill: &BackfillService,
    streaming: &StreamingFeedClient,
) -> bool {
    let live = backfill
        .live_symbols()
        .into_iter()
        .map(|instrument| instrument.symbol)
        .collect::<Vec<_>>();
    let subscribed = streaming.get_subscription_count();

    if subscribed != live.len() {
        warn!(
            expected = live.len(),
            subscribed,
            "streaming subscription count mismatch, resubscribing"
        );
        streaming.update_subscriptions(live);
        return true;
    }

    if !live.is_empty() && !streaming.is_connected() {
        let states = FeedFamily::ALL.map(|family| (family, streaming.state(family)));
        warn!(?states, "streaming client not connected, forcing reconnect");
        streaming.force_reconnect();
        return true;
    }

    debug!(symbols = live.len(), "streaming connection healthy");
    false
}
