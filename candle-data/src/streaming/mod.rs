//! Persistent streaming feed client.
//!
//! One WebSocket connection is held per non-empty [`FeedFamily`]. Each connection runs its own
//! task through `Disconnected -> Connecting -> AuthPending -> Subscribed`, dispatching bar
//! events to per-symbol [`BarHandler`]s, and reconnects after
//! [`StreamingConfig::reconnect_backoff`] whenever the transport drops.

use crate::{candle::is_always_on_symbol, config::StreamingConfig, error::DataError};
use fnv::FnvHashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use smol_str::SmolStr;
use std::{collections::BTreeSet, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Streaming wire messages.
pub mod event;

pub use event::{FeedEvent, FeedRequest, StreamBar};

/// Partition of symbols that share one upstream streaming connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum FeedFamily {
    AlwaysOn,
    SessionGated,
}

impl FeedFamily {
    pub const ALL: [FeedFamily; 2] = [FeedFamily::AlwaysOn, FeedFamily::SessionGated];

    pub fn of(symbol: &str) -> Self {
        if is_always_on_symbol(symbol) {
            FeedFamily::AlwaysOn
        } else {
            FeedFamily::SessionGated
        }
    }

    fn url<'a>(&self, config: &'a StreamingConfig) -> &'a str {
        match self {
            FeedFamily::AlwaysOn => &config.always_on_url,
            FeedFamily::SessionGated => &config.session_gated_url,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AuthPending,
    Subscribed,
}

/// Receiver of live bars for one symbol.
///
/// Invoked on the connection task, so implementations must hand work off rather than block.
pub trait BarHandler: Send + Sync {
    fn on_bar(&self, bar: StreamBar);
}

impl<F> BarHandler for F
where
    F: Fn(StreamBar) + Send + Sync,
{
    fn on_bar(&self, bar: StreamBar) {
        self(bar)
    }
}

#[derive(Default)]
struct Handlers(RwLock<FnvHashMap<SmolStr, Arc<dyn BarHandler>>>);

impl Handlers {
    fn dispatch(&self, bar: StreamBar) {
        let handler = self.0.read().get(&bar.symbol).cloned();
        match handler {
            Some(handler) => handler.on_bar(bar),
            None => debug!(symbol = %bar.symbol, "dropping bar for symbol without handler"),
        }
    }
}

struct Connection {
    symbols: Vec<SmolStr>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Active {
    symbols: BTreeSet<SmolStr>,
    connections: FnvHashMap<FeedFamily, Connection>,
}

/// Long-lived streaming client shared by the backfill and maintenance components.
pub struct StreamingFeedClient {
    config: StreamingConfig,
    handlers: Arc<Handlers>,
    active: Mutex<Active>,
}

impl std::fmt::Debug for StreamingFeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let active = self.active.lock();
        f.debug_struct("StreamingFeedClient")
            .field("config", &self.config)
            .field("symbols", &active.symbols)
            .field("connections", &active.connections.len())
            .finish()
    }
}

impl StreamingFeedClient {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            handlers: Arc::new(Handlers::default()),
            active: Mutex::new(Active::default()),
        }
    }

    /// Converge the open connections onto `symbols`.
    ///
    /// An unchanged set is a no-op. Otherwise every existing connection is closed and one
    /// connection per non-empty [`FeedFamily`] is opened for the new set.
    pub fn update_subscriptions<I, S>(&self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
    {
        let symbols = symbols.into_iter().map(Into::into).collect::<BTreeSet<_>>();
        let mut active = self.active.lock();

        if active.symbols == symbols {
            debug!(count = symbols.len(), "streaming subscriptions unchanged");
            return;
        }

        info!(
            previous = active.symbols.len(),
            requested = symbols.len(),
            "updating streaming subscriptions"
        );
        active.symbols = symbols;
        self.reconnect_all(&mut active);
    }

    /// Close every connection and reopen them for the current symbol set.
    pub fn force_reconnect(&self) {
        let mut active = self.active.lock();
        warn!(count = active.symbols.len(), "forcing streaming reconnect");
        self.reconnect_all(&mut active);
    }

    fn reconnect_all(&self, active: &mut Active) {
        for (family, connection) in active.connections.drain() {
            debug!(?family, "closing streaming connection");
            connection.task.abort();
        }

        let mut partitions = FnvHashMap::<FeedFamily, Vec<SmolStr>>::default();
        for symbol in &active.symbols {
            partitions
                .entry(FeedFamily::of(symbol))
                .or_default()
                .push(symbol.clone());
        }

        for (family, symbols) in partitions {
            let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
            let task = tokio::spawn(run_connection(
                family,
                self.config.clone(),
                symbols.clone(),
                Arc::clone(&self.handlers),
                state_tx,
            ));

            active.connections.insert(
                family,
                Connection {
                    symbols,
                    state: state_rx,
                    task,
                },
            );
        }
    }

    pub fn register_handler(&self, symbol: impl Into<SmolStr>, handler: Arc<dyn BarHandler>) {
        self.handlers.0.write().insert(symbol.into(), handler);
    }

    pub fn unregister_handler(&self, symbol: &str) {
        self.handlers.0.write().remove(symbol);
    }

    /// True when at least one connection is open and every open connection has authenticated.
    pub fn is_connected(&self) -> bool {
        let active = self.active.lock();
        !active.connections.is_empty()
            && active
                .connections
                .values()
                .all(|connection| *connection.state.borrow() == ConnectionState::Subscribed)
    }

    /// Size of the locally tracked active symbol set.
    pub fn get_subscription_count(&self) -> usize {
        self.active.lock().symbols.len()
    }

    pub fn state(&self, family: FeedFamily) -> ConnectionState {
        self.active
            .lock()
            .connections
            .get(&family)
            .map(|connection| *connection.state.borrow())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Observe state transitions of the current connection for `family`, if one is open.
    pub fn watch_state(&self, family: FeedFamily) -> Option<watch::Receiver<ConnectionState>> {
        self.active
            .lock()
            .connections
            .get(&family)
            .map(|connection| connection.state.clone())
    }

    /// Symbols subscribed on the current connection for `family`.
    pub fn family_symbols(&self, family: FeedFamily) -> Vec<SmolStr> {
        self.active
            .lock()
            .connections
            .get(&family)
            .map(|connection| connection.symbols.clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn dispatch(&self, bar: StreamBar) {
        self.handlers.dispatch(bar)
    }
}

impl Drop for StreamingFeedClient {
    fn drop(&mut self) {
        for connection in self.active.get_mut().connections.values() {
            connection.task.abort();
        }
    }
}

/// Connection loop for one [`FeedFamily`]; runs until aborted.
async fn run_connection(
    family: FeedFamily,
    config: StreamingConfig,
    symbols: Vec<SmolStr>,
    handlers: Arc<Handlers>,
    state: watch::Sender<ConnectionState>,
) {
    let url = family.url(&config).to_string();
    info!(?family, %url, symbols = symbols.len(), "starting streaming connection");

    let mut attempt = 0;
    loop {
        let mut subscribed = false;
        match run_session(&url, &config, &symbols, &handlers, &state, &mut subscribed).await {
            Ok(()) => warn!(?family, "streaming connection closed by upstream"),
            Err(error) if error.is_terminal() => {
                warn!(?family, %error, "streaming connection lost")
            }
            Err(error) => error!(?family, %error, "streaming connection failed"),
        }
        state.send_replace(ConnectionState::Disconnected);

        if subscribed {
            attempt = 0;
        }
        let delay = config.reconnect_backoff(attempt);
        attempt = attempt.saturating_add(1);

        debug!(?family, ?delay, attempt, "waiting before reconnecting");
        tokio::time::sleep(delay).await;
    }
}

/// One connect-auth-subscribe-read cycle. Returns when the transport closes or fails.
async fn run_session(
    url: &str,
    config: &StreamingConfig,
    symbols: &[SmolStr],
    handlers: &Handlers,
    state: &watch::Sender<ConnectionState>,
    subscribed: &mut bool,
) -> Result<(), DataError> {
    state.send_replace(ConnectionState::Connecting);
    let (websocket, _) = connect_async(url).await?;
    let (mut write, mut read) = websocket.split();

    state.send_replace(ConnectionState::AuthPending);
    let auth = FeedRequest::Auth {
        key: &config.credentials.key_id,
        secret: &config.credentials.secret_key,
    };
    write
        .send(Message::text(serde_json::to_string(&auth)?))
        .await?;

    while let Some(message) = read.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                debug!(?frame, "received close frame");
                return Ok(());
            }
            _ => continue,
        };

        let events = match event::decode_frame(text.as_str()) {
            Ok(events) => events,
            Err(error) if error.is_terminal() => return Err(error),
            Err(error) => {
                warn!(%error, payload = %text.as_str(), "failed to decode streaming frame");
                continue;
            }
        };

        for event in events {
            match event {
                event if event.is_authenticated() => {
                    state.send_replace(ConnectionState::Subscribed);
                    *subscribed = true;

                    let subscribe = FeedRequest::Subscribe { bars: symbols };
                    write
                        .send(Message::text(serde_json::to_string(&subscribe)?))
                        .await?;
                    info!(symbols = symbols.len(), "authenticated, subscribed to bars");
                }
                FeedEvent::Success { msg } if msg == FeedEvent::MSG_CONNECTED => {
                    debug!("streaming connection established, awaiting authentication");
                }
                FeedEvent::Success { msg } => {
                    debug!(%msg, "streaming status");
                }
                FeedEvent::Error { code, msg } => {
                    if *state.borrow() != ConnectionState::Subscribed {
                        return Err(DataError::Auth(format!("{code}: {msg}")));
                    }
                    warn!(code, %msg, "streaming error event");
                }
                FeedEvent::SubscriptionAck { bars } => {
                    info!(bars = bars.len(), "streaming subscription acknowledged");
                }
                FeedEvent::Bar(bar) => handlers.dispatch(bar),
                FeedEvent::Unknown => {}
            }
        }
    }

    Ok(())
}
