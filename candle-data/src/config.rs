//! Typed configuration for every `candle-data` component.
//!
//! Each struct carries production defaults, `with_*` setters, and a `from_env` constructor where
//! operators are expected to override values through environment variables.

use chrono::TimeDelta;
use std::{fmt, str::FromStr, time::Duration};

/// Parse an environment variable, returning `None` if it is unset or unparsable.
pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

/// Upstream API credentials, shared by the REST and streaming clients.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub key_id: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(key_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn from_env() -> Self {
        Self {
            key_id: std::env::var("UPSTREAM_KEY_ID").unwrap_or_default(),
            secret_key: std::env::var("UPSTREAM_SECRET_KEY").unwrap_or_default(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key_id", &self.key_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Sliding request-count window applied per request key.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Request ceiling per window
    pub max_requests: u32,
    /// Length of one window
    pub window: Duration,
    /// Fraction of the ceiling after which callers are held until the window elapses
    pub threshold: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 200,
            window: Duration::from_secs(60),
            threshold: 0.9,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_requests: env_parse("RATE_LIMIT_MAX_REQUESTS").unwrap_or(default.max_requests),
            window: env_parse("RATE_LIMIT_WINDOW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.window),
            ..default
        }
    }

    pub fn with_max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Request count a window must exceed before the next caller blocks.
    pub fn soft_limit(&self) -> f64 {
        f64::from(self.max_requests) * self.threshold
    }
}

/// Upstream REST endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamConfig {
    pub rest_url: String,
    pub clock_url: String,
    pub credentials: Credentials,
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://data.alpaca.markets".to_string(),
            clock_url: "https://api.alpaca.markets".to_string(),
            credentials: Credentials::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl UpstreamConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            rest_url: std::env::var("UPSTREAM_REST_URL").unwrap_or(default.rest_url),
            clock_url: std::env::var("UPSTREAM_CLOCK_URL").unwrap_or(default.clock_url),
            credentials: Credentials::from_env(),
            ..default
        }
    }

    pub fn with_rest_url(mut self, url: impl Into<String>) -> Self {
        self.rest_url = url.into();
        self
    }

    pub fn with_clock_url(mut self, url: impl Into<String>) -> Self {
        self.clock_url = url.into();
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Historical gap-fill behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillConfig {
    /// Maximum bars requested per page
    pub page_size: u32,
    /// Pause between pages so a sync does not burst the rate limiter
    pub page_delay: Duration,
    /// Fetch window used when nothing is stored yet
    pub default_lookback: TimeDelta,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            page_size: 10_000,
            page_delay: Duration::from_millis(100),
            default_lookback: TimeDelta::days(365),
        }
    }
}

impl BackfillConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            page_size: env_parse("BACKFILL_PAGE_SIZE").unwrap_or(default.page_size),
            default_lookback: env_parse("BACKFILL_LOOKBACK_DAYS")
                .map(TimeDelta::days)
                .unwrap_or(default.default_lookback),
            ..default
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn with_default_lookback(mut self, lookback: TimeDelta) -> Self {
        self.default_lookback = lookback;
        self
    }
}

/// Streaming feed connections.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingConfig {
    /// Feed for instruments that only trade during regular sessions
    pub session_gated_url: String,
    /// Feed for always-on instruments
    pub always_on_url: String,
    pub credentials: Credentials,
    /// Delay before the first reconnect attempt
    pub reconnect_delay: Duration,
    /// Upper bound for the doubling reconnect delay. Equal to `reconnect_delay` means fixed.
    pub max_reconnect_delay: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            session_gated_url: "wss://stream.data.alpaca.markets/v2/iex".to_string(),
            always_on_url: "wss://stream.data.alpaca.markets/v1beta3/crypto/us".to_string(),
            credentials: Credentials::default(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl StreamingConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        let reconnect_delay = env_parse("STREAM_RECONNECT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(default.reconnect_delay);
        Self {
            session_gated_url: std::env::var("STREAM_STOCKS_URL")
                .unwrap_or(default.session_gated_url),
            always_on_url: std::env::var("STREAM_CRYPTO_URL").unwrap_or(default.always_on_url),
            credentials: Credentials::from_env(),
            reconnect_delay,
            max_reconnect_delay: reconnect_delay.max(default.max_reconnect_delay),
        }
    }

    pub fn with_session_gated_url(mut self, url: impl Into<String>) -> Self {
        self.session_gated_url = url.into();
        self
    }

    pub fn with_always_on_url(mut self, url: impl Into<String>) -> Self {
        self.always_on_url = url.into();
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set a fixed reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_delay = delay;
        self
    }

    /// Allow the reconnect delay to double per failed attempt up to `max`.
    pub fn with_max_reconnect_delay(mut self, max: Duration) -> Self {
        self.max_reconnect_delay = max.max(self.reconnect_delay);
        self
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(16));
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

/// Session clock caching.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketHoursConfig {
    pub ttl: Duration,
}

impl Default for MarketHoursConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
        }
    }
}

/// Subscription polling cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionConfig {
    pub poll_interval: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
        }
    }
}

impl SubscriptionConfig {
    pub fn from_env() -> Self {
        Self {
            poll_interval: env_parse("POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(Self::default().poll_interval),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Periodic maintenance cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub gap_fill_interval: Duration,
    pub pre_warm_check_interval: Duration,
    pub health_check_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            gap_fill_interval: Duration::from_secs(24 * 60 * 60),
            pre_warm_check_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Complete library configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandleDataConfig {
    pub rate_limit: RateLimitConfig,
    pub upstream: UpstreamConfig,
    pub backfill: BackfillConfig,
    pub streaming: StreamingConfig,
    pub market_hours: MarketHoursConfig,
    pub subscription: SubscriptionConfig,
    pub scheduler: SchedulerConfig,
}

impl CandleDataConfig {
    pub fn from_env() -> Self {
        Self {
            rate_limit: RateLimitConfig::from_env(),
            upstream: UpstreamConfig::from_env(),
            backfill: BackfillConfig::from_env(),
            streaming: StreamingConfig::from_env(),
            market_hours: MarketHoursConfig::default(),
            subscription: SubscriptionConfig::from_env(),
            scheduler: SchedulerConfig::default(),
        }
    }
}
