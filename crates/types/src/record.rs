//! Raw broker records

use chrono::{DateTime, Utc};

/// A single record as delivered by the broker, before any decoding.
///
/// Offsets are per-partition 64-bit monotonic integers assigned by the
/// broker; the record lives until the batch covering its offset has been
/// acknowledged.
#[derive(Debug, Clone)]
pub struct Record {
    /// Partition the record was read from
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Broker-assigned timestamp, if available
    pub timestamp: Option<DateTime<Utc>>,
    /// Undecoded payload bytes
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self {
            partition,
            offset,
            timestamp: None,
            payload,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}
