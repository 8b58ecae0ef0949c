//! Sealed batches and commit tokens
//!
//! A [`CandleBatch`] is the unit handed from the consumer loop to the
//! writer; a [`CommitToken`] is the unit handed back once the batch is
//! durable. The token carries, per partition, the highest offset the
//! batch covered, including offsets occupied by poison records, which
//! contribute no candle but must still advance the consumer group.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::candle::Candle;

/// A candle together with the broker position it came from.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub candle: Candle,
    pub partition: i32,
    pub offset: i64,
}

/// An ordered batch of candles sealed by the batcher.
#[derive(Debug, Clone)]
pub struct CandleBatch {
    /// Candles in broker delivery order (per partition)
    pub entries: Vec<BatchEntry>,
    /// Highest covered offset per partition
    pub offsets: HashMap<i32, i64>,
    /// Earliest broker timestamp seen in the batch
    pub earliest_timestamp: Option<DateTime<Utc>>,
    /// When the batcher sealed the batch
    pub sealed_at: Instant,
}

impl CandleBatch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the batch covers any broker offsets at all.
    ///
    /// A batch of only poison records has no entries but still covers
    /// offsets and must be committed.
    pub fn covers_offsets(&self) -> bool {
        !self.offsets.is_empty()
    }

    /// Build the commit token this batch will earn once durable.
    pub fn commit_token(&self) -> CommitToken {
        CommitToken {
            offsets: self.offsets.clone(),
        }
    }
}

/// The per-partition offsets that became durable with one batch.
///
/// Consumed exactly once by the consumer loop to advance the broker
/// group position. Offsets never move backwards: merging an older token
/// into newer ledger state is a no-op for the affected partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitToken {
    pub offsets: HashMap<i32, i64>,
}

impl CommitToken {
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn partitions(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.offsets.iter().map(|(p, o)| (*p, *o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::{decode_record, DecodeOutcome};
    use crate::record::Record;

    fn candle() -> Candle {
        let payload = r#"{
            "symbol": "ETH-USD",
            "interval": "5m",
            "open_time": "2024-05-01T12:00:00Z",
            "open": 10.0,
            "high": 12.0,
            "low": 9.0,
            "close": 11.0,
            "volume": 3.0,
            "trade_count": 5
        }"#;
        match decode_record(&Record::new(0, 0, payload.as_bytes().to_vec())) {
            DecodeOutcome::Valid(candle) => candle,
            DecodeOutcome::Poison { .. } => unreachable!(),
        }
    }

    #[test]
    fn test_commit_token_from_batch() {
        let batch = CandleBatch {
            entries: vec![
                BatchEntry {
                    candle: candle(),
                    partition: 0,
                    offset: 7,
                },
                BatchEntry {
                    candle: candle(),
                    partition: 1,
                    offset: 3,
                },
            ],
            offsets: HashMap::from([(0, 7), (1, 3)]),
            earliest_timestamp: None,
            sealed_at: Instant::now(),
        };

        let token = batch.commit_token();
        assert_eq!(token.offsets.get(&0), Some(&7));
        assert_eq!(token.offsets.get(&1), Some(&3));
        assert!(!token.is_empty());
    }

    #[test]
    fn test_empty_batch_with_covered_offsets() {
        // All records were poison: no entries, but offsets still advance.
        let batch = CandleBatch {
            entries: Vec::new(),
            offsets: HashMap::from([(2, 19)]),
            earliest_timestamp: None,
            sealed_at: Instant::now(),
        };

        assert!(batch.is_empty());
        assert!(batch.covers_offsets());
        assert_eq!(batch.commit_token().offsets.get(&2), Some(&19));
    }
}
