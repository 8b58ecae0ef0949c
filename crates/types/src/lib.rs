//! Core types for the candle ingestion service
//!
//! This crate provides the data structures that flow between the broker
//! consumer, the batcher and the writer: raw broker records, validated
//! candles, sealed batches and the commit tokens that tie database
//! durability back to broker offsets.

pub mod batch;
pub mod candle;
pub mod record;

pub use batch::{BatchEntry, CandleBatch, CommitToken};
pub use candle::{decode_record, Candle, DecodeOutcome, Interval, PoisonReason, ValidationError};
pub use record::Record;
