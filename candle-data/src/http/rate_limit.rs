use crate::config::RateLimitConfig;
use fnv::FnvHashMap;
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::warn;

/// Per-key fixed request window: when it started and how many requests it has admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RateWindow {
    started: Instant,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Granted,
    Wait(Duration),
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            count: 0,
        }
    }

    fn reset(&mut self, now: Instant) {
        self.started = now;
        self.count = 0;
    }

    fn admit(&mut self, now: Instant, config: &RateLimitConfig) -> Admission {
        let elapsed = now.saturating_duration_since(self.started);

        if elapsed >= config.window {
            self.reset(now);
        } else if f64::from(self.count) > config.soft_limit() {
            return Admission::Wait(config.window - elapsed);
        }

        self.count += 1;
        Admission::Granted
    }
}

/// Request-count limiter keyed by logical upstream endpoint family.
///
/// A caller that arrives once a key's window count exceeds the soft limit is held until the window
/// elapses, then starts a fresh window. The hold happens while owning that key's lock, so every
/// caller for the same key queues behind it; other keys are unaffected.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: parking_lot::Mutex<FnvHashMap<SmolStr, Arc<tokio::sync::Mutex<RateWindow>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: parking_lot::Mutex::new(FnvHashMap::default()),
        }
    }

    fn window(&self, key: &str) -> Arc<tokio::sync::Mutex<RateWindow>> {
        self.windows
            .lock()
            .entry(SmolStr::new(key))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(RateWindow::new(Instant::now()))))
            .clone()
    }

    /// Account for one request against `key`, waiting first if the window is near its ceiling.
    ///
    /// Returns how long the caller was held.
    pub async fn acquire(&self, key: &str) -> Duration {
        let window = self.window(key);
        let mut window = window.lock().await;

        match window.admit(Instant::now(), &self.config) {
            Admission::Granted => Duration::ZERO,
            Admission::Wait(wait) => {
                warn!(
                    key,
                    count = window.count,
                    max_requests = self.config.max_requests,
                    wait_ms = wait.as_millis() as u64,
                    "approaching upstream rate limit, holding request until window elapses"
                );
                tokio::time::sleep(wait).await;

                window.reset(Instant::now());
                window.count += 1;
                wait
            }
        }
    }
}
