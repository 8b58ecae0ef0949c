//! Time- and size-bounded batch accumulation
//!
//! The batcher collects decoded candles until either the covered record
//! count reaches the current cap or the oldest record has been waiting
//! for the configured age, whichever trips first. Poison records
//! contribute no candle but still advance the covered offsets, so a
//! batch can seal non-empty in offsets while empty in candles. Partial
//! batches are never dropped; `drain` force-seals whatever is pending
//! during shutdown.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use timescale_ingest_types::{BatchEntry, Candle, CandleBatch};

pub struct Batcher {
    cap: usize,
    max_age: Duration,
    entries: Vec<BatchEntry>,
    offsets: HashMap<i32, i64>,
    earliest_timestamp: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    records_covered: usize,
}

impl Batcher {
    pub fn new(cap: usize, max_age: Duration) -> Self {
        Self {
            cap: cap.max(1),
            max_age,
            entries: Vec::new(),
            offsets: HashMap::new(),
            earliest_timestamp: None,
            opened_at: None,
            records_covered: 0,
        }
    }

    /// Apply a new cap from the controller. Takes effect on the next
    /// `tick`; an already-overfull batch seals then.
    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap.max(1);
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Candles currently pending.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records_covered == 0
    }

    /// Append a decoded candle.
    pub fn add(
        &mut self,
        candle: Candle,
        partition: i32,
        offset: i64,
        timestamp: Option<DateTime<Utc>>,
    ) {
        self.entries.push(BatchEntry {
            candle,
            partition,
            offset,
        });
        self.cover(partition, offset, timestamp);
    }

    /// Record a poison record's position so its offset is still
    /// committed with the batch it would have joined.
    pub fn note_offset(&mut self, partition: i32, offset: i64) {
        self.cover(partition, offset, None);
    }

    fn cover(&mut self, partition: i32, offset: i64, timestamp: Option<DateTime<Utc>>) {
        self.records_covered += 1;
        self.opened_at.get_or_insert_with(Instant::now);
        self.offsets
            .entry(partition)
            .and_modify(|o| *o = (*o).max(offset))
            .or_insert(offset);
        if let Some(ts) = timestamp {
            self.earliest_timestamp = Some(match self.earliest_timestamp {
                Some(existing) => existing.min(ts),
                None => ts,
            });
        }
    }

    /// Seal and emit a batch if either bound has tripped.
    pub fn tick(&mut self, now: Instant) -> Option<CandleBatch> {
        if self.records_covered == 0 {
            return None;
        }
        if self.records_covered >= self.cap {
            return Some(self.seal(now));
        }
        match self.opened_at {
            Some(opened_at) if now.duration_since(opened_at) >= self.max_age => {
                Some(self.seal(now))
            }
            _ => None,
        }
    }

    /// Force emission of whatever is pending, for shutdown.
    pub fn drain(&mut self) -> Option<CandleBatch> {
        if self.records_covered == 0 {
            return None;
        }
        Some(self.seal(Instant::now()))
    }

    fn seal(&mut self, now: Instant) -> CandleBatch {
        self.opened_at = None;
        self.records_covered = 0;
        CandleBatch {
            entries: std::mem::take(&mut self.entries),
            offsets: std::mem::take(&mut self.offsets),
            earliest_timestamp: self.earliest_timestamp.take(),
            sealed_at: now,
        }
    }
}
