//! Adaptive Kafka to TimescaleDB candle ingestion service
//!
//! The service bridges a partitioned, offset-based broker topic and a
//! time-series relational store. The core is the coupled control loop
//! between the two sides:
//!
//! - the [`consumer`] loop polls the broker with tuning parameters that
//!   the [`controller`] continuously re-derives from observed write
//!   latency;
//! - the [`batcher`] accumulates records under a joint size/age bound;
//! - the [`writer`] upserts sealed batches transactionally, guarded by a
//!   [`breaker`] and a [`retry`] policy, and hands back commit tokens;
//! - the consumer loop turns commit tokens into broker offset commits,
//!   so broker progress is tied to database durability.
//!
//! Delivery is at-least-once; the database upsert is idempotent on
//! `(symbol, interval, open_time)`, so replays are safe. The
//! [`supervisor`] wires everything together and translates an external
//! shutdown signal into a cooperative, bounded drain.

pub mod batcher;
pub mod breaker;
pub mod consumer;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod server;
pub mod supervisor;
pub mod writer;

pub use error::{DbError, IngestError, Result};
