use crate::{candle::Instrument, config::MarketHoursConfig, upstream::MarketDataApi};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Cached view of whether the regular-market session is open.
///
/// A successful clock query is cached for [`MarketHoursConfig::ttl`]. A failed query reports the
/// session as closed and leaves the cache untouched, so the next call queries again.
pub struct MarketHoursOracle {
    api: Arc<dyn MarketDataApi>,
    config: MarketHoursConfig,
    cached: Mutex<Option<(Instant, bool)>>,
}

impl std::fmt::Debug for MarketHoursOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketHoursOracle")
            .field("config", &self.config)
            .field("cached", &*self.cached.lock())
            .finish()
    }
}

impl MarketHoursOracle {
    pub fn new(api: Arc<dyn MarketDataApi>, config: MarketHoursConfig) -> Self {
        Self {
            api,
            config,
            cached: Mutex::new(None),
        }
    }

    pub async fn is_session_open(&self) -> bool {
        if let Some((fetched_at, is_open)) = *self.cached.lock() {
            if fetched_at.elapsed() < self.config.ttl {
                return is_open;
            }
        }

        match self.api.is_session_open().await {
            Ok(is_open) => {
                debug!(is_open, "refreshed market session clock");
                *self.cached.lock() = Some((Instant::now(), is_open));
                is_open
            }
            Err(error) => {
                warn!(%error, "failed to query market session clock, assuming closed");
                false
            }
        }
    }

    /// Determine if live/backfill work for `instrument` should only run during a regular session.
    pub fn requires_session_gating(&self, instrument: &Instrument) -> bool {
        !instrument.is_always_on()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        candle::InstrumentId,
        error::DataError,
        upstream::{BarsRequest, RawBarPage},
    };
    use async_trait::async_trait;
    use smol_str::SmolStr;
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[derive(Default)]
    struct MockClock {
        responses: Mutex<VecDeque<Result<bool, DataError>>>,
        calls: AtomicUsize,
    }

    impl MockClock {
        fn new(responses: Vec<Result<bool, DataError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MarketDataApi for MockClock {
        async fn fetch_bars(&self, _: &BarsRequest) -> Result<RawBarPage, DataError> {
            Ok(RawBarPage::default())
        }

        async fn is_session_open(&self) -> Result<bool, DataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(DataError::Http("exhausted".to_string())))
        }
    }

    fn oracle(clock: Arc<MockClock>) -> MarketHoursOracle {
        MarketHoursOracle::new(clock, MarketHoursConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_cached_within_ttl() {
        let clock = Arc::new(MockClock::new(vec![Ok(true), Ok(false)]));
        let oracle = oracle(clock.clone());

        assert!(oracle.is_session_open().await);
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(oracle.is_session_open().await);
        assert_eq!(clock.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!oracle.is_session_open().await);
        assert_eq!(clock.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_closed_and_not_cached() {
        let clock = Arc::new(MockClock::new(vec![
            Ok(true),
            Err(DataError::Status {
                status: 500,
                body: String::new(),
            }),
            Ok(true),
        ]));
        let oracle = oracle(clock.clone());

        assert!(oracle.is_session_open().await);
        tokio::time::sleep(Duration::from_secs(61)).await;

        // Expired cache + failing clock: closed, cache untouched
        assert!(!oracle.is_session_open().await);
        assert!(oracle.is_session_open().await);
        assert_eq!(clock.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_requires_session_gating() {
        let oracle = oracle(Arc::new(MockClock::default()));
        let instrument = |symbol: &str| Instrument {
            id: InstrumentId(1),
            platform: SmolStr::new("alpaca"),
            symbol: SmolStr::new(symbol),
        };

        assert!(oracle.requires_session_gating(&instrument("AAPL")));
        assert!(!oracle.requires_session_gating(&instrument("BTC/USD")));
    }
}
