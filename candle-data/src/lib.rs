#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity)]

//! # Candle-Data
//! Minute-bar market data ingestion and multi-timeframe candle delivery.
//!
//! * **Ingest**: rate-limited REST backfill with page-token pagination, plus live minute bars
//!   from a streaming feed split into always-on and session-gated connections.
//! * **Aggregate**: every stored minute bar is rolled up into 5m, 15m, 1h, 4h and 1d candles
//!   with idempotent upserts.
//! * **Deliver**: clients subscribe to an instrument, timeframe and window. They receive a
//!   snapshot, then polled updates carrying new candles and in-place changes of the last one.
//! * **Maintain**: a [`Scheduler`](scheduler::Scheduler) runs gap-fill, session pre-warm and
//!   connection health checks in the background.
//!
//! Storage sits behind the [`CandleStore`](store::CandleStore) and
//! [`InstrumentDirectory`](store::InstrumentDirectory) traits.

/// Rolls minute bars up into higher timeframes.
pub mod aggregator;

/// Historical REST sync and live ingest registration.
pub mod backfill;

/// Instruments, timeframes and candles.
pub mod candle;

/// Environment-driven configuration.
pub mod config;

/// All [`Error`](std::error::Error)s generated in Candle-Data.
pub mod error;

/// Rate-limited HTTP transport.
pub mod http;

/// Cached regular-session open/closed oracle.
pub mod market_hours;

/// Background maintenance tasks.
pub mod scheduler;

/// Candle storage and instrument directory seams.
pub mod store;

/// Live minute-bar WebSocket feed.
pub mod streaming;

/// Client subscriptions and polled delivery.
pub mod subscription;

/// Upstream market data REST API.
pub mod upstream;

pub use candle::{Candle, Instrument, InstrumentId, Timeframe};
pub use error::{DataError, SubscriptionError};

