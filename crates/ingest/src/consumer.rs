//! Broker consumer loop
//!
//! A single cooperative loop couples the broker to the writer. Each
//! iteration it reads the controller's current tuning parameters, polls
//! for up to `max_batch` records within `poll_timeout`, feeds the
//! batcher, and hands sealed batches to the writer over a capacity-1
//! channel. Commit tokens coming back are turned into synchronous
//! broker offset commits; broker-side auto-commit is disabled, so the
//! group position only ever advances past persisted batches.
//!
//! While the breaker is open the loop idles instead of polling; the
//! rejected batch at the front of the outbox doubles as the probe that
//! eventually closes the circuit again.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use timescale_ingest_config::KafkaConfig;
use timescale_ingest_types::{decode_record, CandleBatch, CommitToken, DecodeOutcome, Record};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::Batcher;
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::controller::AdaptiveController;
use crate::error::IngestError;
use crate::metrics::{IngestMetrics, PartitionLabels};
use crate::server::HealthState;
use crate::writer::WriteOutcome;

/// Constant back-off after a broker poll error.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on the breaker-open idle interval.
const OPEN_IDLE_CAP: Duration = Duration::from_secs(1);

/// Source of broker records, the seam in front of rdkafka.
#[async_trait]
pub trait RecordStream: Send {
    /// Wait up to `timeout` for one record. `Ok(None)` means the
    /// timeout elapsed quietly.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Record>, IngestError>;

    /// Durably advance the consumer group past the covered offsets.
    /// The token carries covered offsets; implementations commit the
    /// next-to-read position.
    fn commit(&mut self, token: &CommitToken) -> Result<(), IngestError>;
}

/// rdkafka-backed record stream with manual commits.
pub struct KafkaRecordStream {
    consumer: StreamConsumer,
    topic: String,
    metrics: IngestMetrics,
}

impl KafkaRecordStream {
    pub fn new(config: &KafkaConfig, metrics: IngestMetrics) -> Result<Self, IngestError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.broker_list())
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;

        consumer.subscribe(&[config.topic.as_str()])?;
        info!(topic = %config.topic, group_id = %config.group_id, "subscribed");

        Ok(Self {
            consumer,
            topic: config.topic.clone(),
            metrics,
        })
    }
}

#[async_trait]
impl RecordStream for KafkaRecordStream {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Record>, IngestError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_elapsed) => Ok(None),
            Ok(Err(e)) => Err(IngestError::Broker(e)),
            Ok(Ok(msg)) => {
                let mut record = Record::new(
                    msg.partition(),
                    msg.offset(),
                    msg.payload().unwrap_or_default().to_vec(),
                );
                if let Some(ts) = msg
                    .timestamp()
                    .to_millis()
                    .and_then(DateTime::from_timestamp_millis)
                {
                    record = record.with_timestamp(ts);
                }
                Ok(Some(record))
            }
        }
    }

    fn commit(&mut self, token: &CommitToken) -> Result<(), IngestError> {
        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in token.partitions() {
            tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))
                .map_err(|e| IngestError::OffsetCommit(e.to_string()))?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| IngestError::OffsetCommit(e.to_string()))?;

        // Lag is refreshed per commit rather than per record; watermark
        // fetches are not free.
        for (partition, offset) in token.partitions() {
            if let Ok((_, high)) = self.consumer.fetch_watermarks(
                &self.topic,
                partition,
                Duration::from_millis(500),
            ) {
                self.metrics
                    .consumer_lag
                    .get_or_create(&PartitionLabels {
                        partition: partition.to_string(),
                    })
                    .set((high - (offset + 1)).max(0));
            }
        }

        Ok(())
    }
}

/// Per-partition committed-offset bookkeeping.
///
/// Guards the monotonic-commit invariant: an entry that does not
/// advance a partition is dropped rather than committed.
#[derive(Debug, Default)]
pub struct OffsetLedger {
    committed: HashMap<i32, i64>,
}

impl OffsetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a token into the ledger, returning only the entries that
    /// actually advance their partition.
    pub fn advance(&mut self, token: &CommitToken) -> CommitToken {
        let mut advanced = CommitToken::default();
        for (partition, offset) in token.partitions() {
            match self.committed.get(&partition) {
                Some(&prev) if offset <= prev => {
                    warn!(
                        partition,
                        offset, prev, "dropping non-advancing commit entry"
                    );
                }
                _ => {
                    self.committed.insert(partition, offset);
                    advanced.offsets.insert(partition, offset);
                }
            }
        }
        advanced
    }

    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.committed.get(&partition).copied()
    }
}

/// The cooperative consumer loop.
pub struct ConsumerLoop<S: RecordStream> {
    stream: S,
    batcher: Batcher,
    controller: AdaptiveController,
    ledger: OffsetLedger,
    breaker: Arc<CircuitBreaker>,
    metrics: IngestMetrics,
    health: Arc<HealthState>,
    /// Hard cap from `INSERT_BATCH_SIZE`, applied on top of the controller
    insert_cap: usize,
    /// Breaker reset timeout, bounds the open-state idle interval
    breaker_reset_timeout: Duration,
    batches_tx: Option<mpsc::Sender<CandleBatch>>,
    replies_rx: mpsc::Receiver<Result<WriteOutcome, IngestError>>,
    cancel: CancellationToken,
    outbox: VecDeque<CandleBatch>,
    in_flight: usize,
}

#[allow(clippy::too_many_arguments)]
impl<S: RecordStream> ConsumerLoop<S> {
    pub fn new(
        stream: S,
        batcher: Batcher,
        controller: AdaptiveController,
        breaker: Arc<CircuitBreaker>,
        metrics: IngestMetrics,
        health: Arc<HealthState>,
        insert_cap: usize,
        breaker_reset_timeout: Duration,
        batches_tx: mpsc::Sender<CandleBatch>,
        replies_rx: mpsc::Receiver<Result<WriteOutcome, IngestError>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream,
            batcher,
            controller,
            ledger: OffsetLedger::new(),
            breaker,
            metrics,
            health,
            insert_cap,
            breaker_reset_timeout,
            batches_tx: Some(batches_tx),
            replies_rx,
            cancel,
            outbox: VecDeque::new(),
            in_flight: 0,
        }
    }

    /// Drive the loop until cancellation or a fatal error, then drain.
    pub async fn run(mut self) -> Result<(), IngestError> {
        info!("consumer loop started");
        let result = self.run_inner().await;
        match &result {
            Ok(()) => info!("consumer loop finished"),
            Err(e) => error!(error = %e, "consumer loop failed"),
        }
        result
    }

    async fn run_inner(&mut self) -> Result<(), IngestError> {
        while !self.cancel.is_cancelled() {
            self.drain_replies()?;
            self.flush_outbox().await?;

            if self.breaker.state() == BreakerState::Open {
                let idle = self.breaker_reset_timeout.min(OPEN_IDLE_CAP);
                debug!(idle_ms = idle.as_millis() as u64, "breaker open, idling");
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(idle) => {}
                }
                continue;
            }

            let params = self.controller.params();
            let cap = params.max_batch.min(self.insert_cap);
            self.batcher.set_cap(cap);
            self.metrics
                .poll_timeout_seconds
                .set(params.poll_timeout.as_secs_f64());
            self.metrics.max_batch_size.set(cap as i64);

            self.poll_once(params.poll_timeout, cap).await?;

            if let Some(batch) = self.batcher.tick(Instant::now()) {
                self.outbox.push_back(batch);
            }
        }

        self.drain().await
    }

    /// Poll the broker until the timeout elapses or `cap` records arrive.
    async fn poll_once(&mut self, poll_timeout: Duration, cap: usize) -> Result<(), IngestError> {
        let deadline = Instant::now() + poll_timeout;
        let mut received = 0usize;

        while received < cap {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let polled = tokio::select! {
                _ = self.cancel.cancelled() => break,
                polled = self.stream.poll(remaining) => polled,
            };

            match polled {
                Ok(Some(record)) => {
                    received += 1;
                    self.ingest_record(record);
                    if let Some(batch) = self.batcher.tick(Instant::now()) {
                        self.outbox.push_back(batch);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "broker poll failed, backing off");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                    break;
                }
            }
        }

        Ok(())
    }

    fn ingest_record(&mut self, record: Record) {
        self.metrics.records_consumed.inc();
        self.metrics
            .partition_offset
            .get_or_create(&PartitionLabels {
                partition: record.partition.to_string(),
            })
            .set(record.offset);

        match decode_record(&record) {
            DecodeOutcome::Valid(candle) => {
                self.batcher
                    .add(candle, record.partition, record.offset, record.timestamp);
            }
            DecodeOutcome::Poison {
                reason,
                partition,
                offset,
            } => {
                warn!(
                    partition,
                    offset,
                    reason = reason.as_str(),
                    "poison record excluded"
                );
                self.metrics.record_poison(reason.as_str());
                self.batcher.note_offset(partition, offset);
            }
        }
    }

    /// Hand pending batches to the writer, oldest first.
    ///
    /// At most one submission is outstanding: before sending the next
    /// batch the loop blocks until the previous writer call returns.
    /// This is the primary backpressure mechanism, and it also keeps
    /// per-partition batch order intact when a rejected batch has to go
    /// to the front of the queue.
    async fn flush_outbox(&mut self) -> Result<(), IngestError> {
        while !self.outbox.is_empty() {
            if self.in_flight > 0 {
                let Some(reply) = self.replies_rx.recv().await else {
                    return Err(IngestError::Internal("writer stopped unexpectedly".into()));
                };
                self.in_flight -= 1;
                self.handle_reply(reply)?;
                continue;
            }

            let Some(batch) = self.outbox.pop_front() else {
                break;
            };
            let Some(tx) = self.batches_tx.as_ref() else {
                return Err(IngestError::Internal("writer channel closed".into()));
            };
            if tx.send(batch).await.is_err() {
                // The writer is gone; its final reply carries the cause.
                return self.drain_replies();
            }
            self.in_flight += 1;
        }
        Ok(())
    }

    /// Process every reply currently available without blocking.
    fn drain_replies(&mut self) -> Result<(), IngestError> {
        loop {
            match self.replies_rx.try_recv() {
                Ok(reply) => {
                    self.in_flight -= 1;
                    self.handle_reply(reply)?;
                }
                Err(mpsc::error::TryRecvError::Empty)
                | Err(mpsc::error::TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    fn handle_reply(
        &mut self,
        reply: Result<WriteOutcome, IngestError>,
    ) -> Result<(), IngestError> {
        match reply? {
            WriteOutcome::Committed {
                token,
                latency,
                rows,
            } => {
                if rows > 0 {
                    self.health.mark_write_success();
                    let params = self.controller.observe(latency);
                    self.metrics
                        .poll_timeout_seconds
                        .set(params.poll_timeout.as_secs_f64());
                    self.metrics
                        .max_batch_size
                        .set(params.max_batch.min(self.insert_cap) as i64);
                }
                self.commit_token(&token)
            }
            WriteOutcome::Rejected(batch) => {
                debug!(
                    rows = batch.len(),
                    "batch returned unpersisted, queued for resubmission"
                );
                self.outbox.push_front(*batch);
                Ok(())
            }
        }
    }

    /// Synchronous offset commit; failure is fatal. Double ingestion is
    /// tolerable, commit loss is not.
    fn commit_token(&mut self, token: &CommitToken) -> Result<(), IngestError> {
        let advanced = self.ledger.advance(token);
        if advanced.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.stream.commit(&advanced) {
            self.metrics.commit_failures.inc();
            error!(error = %e, "offset commit failed");
            return Err(e);
        }
        debug!(partitions = advanced.offsets.len(), "offsets committed");
        Ok(())
    }

    /// Cooperative shutdown: stop polling, force-seal the batcher,
    /// flush everything to the writer, and commit what comes back.
    async fn drain(&mut self) -> Result<(), IngestError> {
        info!("draining consumer loop");

        if let Some(batch) = self.batcher.drain() {
            self.outbox.push_back(batch);
        }

        while let Some(batch) = self.outbox.pop_front() {
            let Some(tx) = self.batches_tx.as_ref() else {
                break;
            };
            if tx.send(batch).await.is_err() {
                warn!("writer unavailable during drain, residual batch abandoned");
                break;
            }
            self.in_flight += 1;
        }

        // Closing the channel lets the writer finish and stop.
        self.batches_tx.take();

        while self.in_flight > 0 {
            match self.replies_rx.recv().await {
                Some(Ok(WriteOutcome::Committed { token, rows, .. })) => {
                    self.in_flight -= 1;
                    if rows > 0 {
                        self.health.mark_write_success();
                    }
                    self.commit_token(&token)?;
                }
                Some(Ok(WriteOutcome::Rejected(batch))) => {
                    self.in_flight -= 1;
                    warn!(
                        rows = batch.len(),
                        "batch not persisted during drain, will be redelivered after restart"
                    );
                }
                Some(Err(IngestError::Cancelled)) => {
                    self.in_flight -= 1;
                    warn!("in-flight write abandoned during drain");
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        info!("drain complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_advances_monotonically() {
        let mut ledger = OffsetLedger::new();

        let first = CommitToken {
            offsets: HashMap::from([(0, 5), (1, 3)]),
        };
        let advanced = ledger.advance(&first);
        assert_eq!(advanced.offsets.len(), 2);
        assert_eq!(ledger.committed(0), Some(5));

        // A regressing entry is dropped, an advancing one kept.
        let second = CommitToken {
            offsets: HashMap::from([(0, 4), (1, 7)]),
        };
        let advanced = ledger.advance(&second);
        assert!(!advanced.offsets.contains_key(&0));
        assert_eq!(advanced.offsets.get(&1), Some(&7));
        assert_eq!(ledger.committed(0), Some(5));
        assert_eq!(ledger.committed(1), Some(7));
    }

    #[test]
    fn test_ledger_equal_offset_not_recommitted() {
        let mut ledger = OffsetLedger::new();
        let token = CommitToken {
            offsets: HashMap::from([(0, 5)]),
        };
        ledger.advance(&token);
        let advanced = ledger.advance(&token);
        assert!(advanced.is_empty());
    }

    #[test]
    fn test_ledger_unknown_partition_always_advances() {
        let mut ledger = OffsetLedger::new();
        let token = CommitToken {
            offsets: HashMap::from([(9, 0)]),
        };
        let advanced = ledger.advance(&token);
        assert_eq!(advanced.offsets.get(&9), Some(&0));
    }
}
