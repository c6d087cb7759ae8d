use candle_data::{
    DataError, Instrument,
    aggregator::CandleAggregator,
    backfill::BackfillService,
    config::CandleDataConfig,
    http::RateLimitedHttpClient,
    market_hours::MarketHoursOracle,
    scheduler::{Scheduler, SchedulerContext},
    store::{
        Actor, CandleStore, InMemoryCandleStore, InMemoryInstrumentDirectory, InstrumentDirectory,
    },
    streaming::StreamingFeedClient,
    subscription::{
        CandleMessage, DeliveryChannel, Destination, SubscriptionId, SubscriptionManager,
        SubscriptionRequest,
    },
    upstream::{MarketDataApi, RestMarketDataApi},
};
use fnv::FnvHashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use protocol::{ClientMessage, ServerMessage};
use smol_str::SmolStr;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Client/server WebSocket messages.
mod protocol;

/// Server-level settings read from the environment.
#[derive(Debug, Clone, PartialEq)]
struct ServerConfig {
    addr: SocketAddr,
    platform: SmolStr,
    symbols: Vec<SmolStr>,
}

impl ServerConfig {
    fn from_env() -> Self {
        Self::from_vars(
            std::env::var("WS_ADDR").ok(),
            std::env::var("PLATFORM").ok(),
            std::env::var("SYMBOLS").ok(),
        )
    }

    fn from_vars(addr: Option<String>, platform: Option<String>, symbols: Option<String>) -> Self {
        Self {
            addr: addr
                .and_then(|addr| addr.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 9001))),
            platform: platform
                .filter(|platform| !platform.trim().is_empty())
                .map(|platform| SmolStr::new(platform.trim()))
                .unwrap_or_else(|| SmolStr::new_static("alpaca")),
            symbols: symbols
                .map(|symbols| {
                    symbols
                        .split(',')
                        .map(str::trim)
                        .filter(|symbol| !symbol.is_empty())
                        .map(SmolStr::new)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// [`DeliveryChannel`] routing each [`Destination`] to the outbound queue of one WebSocket client.
#[derive(Debug, Default)]
struct WebSocketDelivery {
    clients: RwLock<FnvHashMap<Destination, mpsc::UnboundedSender<ServerMessage>>>,
}

impl WebSocketDelivery {
    fn register(&self, destination: Destination, tx: mpsc::UnboundedSender<ServerMessage>) {
        self.clients.write().insert(destination, tx);
    }

    fn unregister(&self, destination: &Destination) {
        self.clients.write().remove(destination);
    }
}

impl DeliveryChannel for WebSocketDelivery {
    fn send(&self, destination: &Destination, message: CandleMessage) {
        match self.clients.read().get(destination) {
            Some(tx) => {
                if tx.send(ServerMessage::Candles(message)).is_err() {
                    debug!(%destination, "client closed, dropping candle message");
                }
            }
            None => debug!(%destination, "no client for destination, dropping candle message"),
        }
    }
}

/// State shared by every client connection.
struct AppState {
    platform: SmolStr,
    directory: Arc<dyn InstrumentDirectory>,
    subscriptions: Arc<SubscriptionManager>,
    delivery: Arc<WebSocketDelivery>,
}

impl AppState {
    /// Clients may only subscribe to instruments the server already tracks.
    async fn find_instrument(
        &self,
        platform: &str,
        symbol: &str,
    ) -> Result<Option<Instrument>, DataError> {
        Ok(self
            .directory
            .list_instruments(platform)
            .await?
            .into_iter()
            .find(|instrument| instrument.symbol.as_str() == symbol))
    }

    fn owns(&self, destination: &Destination, id: SubscriptionId) -> bool {
        self.subscriptions
            .subscription(id)
            .is_some_and(|subscription| subscription.destination == *destination)
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    info!("Starting candle-data WebSocket server");

    let config = CandleDataConfig::from_env();
    let server = ServerConfig::from_env();

    let http = match RateLimitedHttpClient::new(
        config.rate_limit.clone(),
        config.upstream.request_timeout,
    ) {
        Ok(http) => Arc::new(http),
        Err(error) => {
            error!(%error, "failed to build upstream HTTP client");
            return;
        }
    };

    let api: Arc<dyn MarketDataApi> =
        Arc::new(RestMarketDataApi::new(http, config.upstream.clone()));
    let store: Arc<dyn CandleStore> = Arc::new(InMemoryCandleStore::new());
    let directory: Arc<dyn InstrumentDirectory> = Arc::new(InMemoryInstrumentDirectory::new());
    let aggregator = Arc::new(CandleAggregator::new(Arc::clone(&store)));
    let streaming = Arc::new(StreamingFeedClient::new(config.streaming.clone()));
    let backfill = Arc::new(BackfillService::new(
        Arc::clone(&api),
        Arc::clone(&store),
        Arc::clone(&directory),
        aggregator,
        Arc::clone(&streaming),
        config.backfill.clone(),
    ));
    let oracle = Arc::new(MarketHoursOracle::new(api, config.market_hours.clone()));
    let delivery = Arc::new(WebSocketDelivery::default());
    let subscriptions = Arc::new(SubscriptionManager::new(
        Arc::clone(&store),
        Arc::clone(&delivery) as Arc<dyn DeliveryChannel>,
        config.subscription.clone(),
    ));

    let scheduler = Scheduler::start(
        SchedulerContext {
            backfill: Arc::clone(&backfill),
            streaming,
            oracle,
            subscriptions: Arc::clone(&subscriptions),
            platforms: vec![server.platform.clone()],
        },
        config.scheduler.clone(),
    );
    info!(tasks = ?scheduler.task_names(), "scheduler started");

    // Initial backfill can take a while, so clients are accepted meanwhile
    tokio::spawn(setup_symbols(
        backfill,
        Arc::clone(&directory),
        server.platform.clone(),
        server.symbols.clone(),
    ));

    let listener = match TcpListener::bind(server.addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(addr = %server.addr, %error, "failed to bind WebSocket server");
            scheduler.shutdown();
            return;
        }
    };
    info!("WebSocket server listening on ws://{}", server.addr);

    let state = Arc::new(AppState {
        platform: server.platform,
        directory,
        subscriptions,
        delivery,
    });

    tokio::select! {
        _ = accept_clients(listener, state) => {
            warn!("WebSocket listener stopped");
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(error) = signal {
                error!(%error, "failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        }
    }

    scheduler.shutdown();
    info!("candle-data WebSocket server stopped");
}

/// Resolve each configured symbol, sync its history and register it for live bars.
async fn setup_symbols(
    backfill: Arc<BackfillService>,
    directory: Arc<dyn InstrumentDirectory>,
    platform: SmolStr,
    symbols: Vec<SmolStr>,
) {
    let actor = Actor::system("server");

    for symbol in symbols {
        let instrument = match directory.resolve_or_create(&actor, &platform, &symbol).await {
            Ok(instrument) => instrument,
            Err(error) => {
                error!(%platform, %symbol, %error, "failed to resolve instrument");
                continue;
            }
        };

        match backfill.setup_symbol(&instrument).await {
            Ok(outcome) => info!(%instrument, ?outcome, "symbol ready"),
            Err(error) => warn!(%instrument, %error, "symbol registered without initial history"),
        }
    }
}

async fn accept_clients(listener: TcpListener, state: Arc<AppState>) {
    while let Ok((stream, peer_addr)) = listener.accept().await {
        info!("New WebSocket connection from {}", peer_addr);
        tokio::spawn(handle_client(stream, peer_addr, Arc::clone(&state)));
    }
}

/// Serve one client until either direction closes, then cancel its subscriptions.
async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, state: Arc<AppState>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    let destination = Destination::new(format!("ws-{}", Uuid::now_v7()));
    info!(%peer_addr, %destination, "WebSocket handshake completed");

    let (tx, mut rx) = mpsc::unbounded_channel();
    state.delivery.register(destination.clone(), tx.clone());
    let _ = tx.send(ServerMessage::Welcome {
        destination: destination.0.clone(),
    });

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(error) => {
                    warn!(%error, "failed to serialise server message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_state = Arc::clone(&state);
    let recv_destination = destination.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let reply = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(request) => {
                            handle_request(&recv_state, &recv_destination, request).await
                        }
                        Err(error) => ServerMessage::error(format!("invalid request: {error}")),
                    };
                    if tx.send(reply).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => debug!("Received ping from {}", peer_addr),
                Err(error) => {
                    warn!(%peer_addr, %error, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            debug!("Send task completed for {}", peer_addr);
        }
        _ = &mut recv_task => {
            debug!("Receive task completed for {}", peer_addr);
        }
    }

    let cancelled = close_client(&state, &destination, [send_task, recv_task]).await;
    info!(%peer_addr, %destination, cancelled, "WebSocket connection closed");
}

/// Stop the client's tasks, then drop its destination and cancel its subscriptions.
///
/// The tasks are awaited after aborting so a request still in flight cannot register a
/// subscription once its destination is gone.
async fn close_client(
    state: &AppState,
    destination: &Destination,
    tasks: [JoinHandle<()>; 2],
) -> usize {
    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }

    state.delivery.unregister(destination);
    state.subscriptions.cancel_destination(destination)
}

async fn handle_request(
    state: &AppState,
    destination: &Destination,
    request: ClientMessage,
) -> ServerMessage {
    match request {
        ClientMessage::Subscribe {
            platform,
            symbol,
            timeframe,
            start,
            end,
        } => {
            let instrument = match symbol {
                Some(symbol) => {
                    let platform = platform.unwrap_or_else(|| state.platform.clone());
                    match state.find_instrument(&platform, &symbol).await {
                        Ok(Some(instrument)) => Some(instrument),
                        Ok(None) => {
                            return ServerMessage::error(format!(
                                "unknown instrument: {platform}:{symbol}"
                            ));
                        }
                        Err(error) => return ServerMessage::error(error.to_string()),
                    }
                }
                None => None,
            };

            let request = SubscriptionRequest {
                instrument,
                timeframe,
                start,
                end,
                destination: destination.clone(),
            };
            match state.subscriptions.create_subscription(request).await {
                Ok(subscription_id) => ServerMessage::Subscribed { subscription_id },
                Err(error) => ServerMessage::error(error.to_string()),
            }
        }
        ClientMessage::Update {
            subscription_id,
            start,
            end,
            reset,
        } => {
            if !state.owns(destination, subscription_id) {
                return ServerMessage::error(format!("subscription not found: {subscription_id}"));
            }
            match state
                .subscriptions
                .update_subscription(subscription_id, start, end, reset)
                .await
            {
                Ok(()) => ServerMessage::Updated { subscription_id },
                Err(error) => ServerMessage::error(error.to_string()),
            }
        }
        ClientMessage::Unsubscribe { subscription_id } => {
            if !state.owns(destination, subscription_id) {
                return ServerMessage::error(format!("subscription not found: {subscription_id}"));
            }
            match state.subscriptions.cancel_subscription(subscription_id) {
                Ok(_) => ServerMessage::Unsubscribed { subscription_id },
                Err(error) => ServerMessage::error(error.to_string()),
            }
        }
    }
}

/// Initialize logging
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .flatten_event(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
