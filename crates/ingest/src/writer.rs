//! Transactional batch writer
//!
//! The writer turns sealed batches into durable rows and commit tokens.
//! One submission is in flight at any time: the writer runs as a single
//! task consuming a capacity-1 channel, which is the primary
//! backpressure mechanism of the whole service.
//!
//! Per submission: candles that fail validation are stripped and
//! counted as poison (their offsets stay covered); the circuit breaker
//! gates the database; the upsert runs inside one transaction under the
//! retry policy; on success the breaker records one success and the
//! commit token is handed back. The breaker sees one failure per
//! logical submission, not one per attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, QueryBuilder};
use timescale_ingest_config::TimescaleDbConfig;
use timescale_ingest_types::{Candle, CandleBatch, CommitToken, PoisonReason};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::breaker::{CircuitBreaker, Decision};
use crate::error::{DbError, IngestError};
use crate::metrics::IngestMetrics;
use crate::retry::{RetryError, RetryPolicy};

/// Destination for validated candles.
///
/// The production implementation is [`PostgresSink`]; tests substitute
/// an in-memory double behind the same seam.
#[async_trait]
pub trait CandleSink: Send + Sync {
    /// Insert the candles inside one transaction. Re-inserting any
    /// subset must be a no-op on the stored rows.
    async fn insert_batch(&self, candles: &[Candle]) -> Result<(), DbError>;

    /// Cheap connectivity probe.
    async fn ping(&self) -> Result<(), DbError>;
}

/// TimescaleDB-backed sink.
///
/// Assumes the `candles` hypertable keyed by
/// `(symbol, interval, open_time)` already exists; this service does
/// not own schema migrations.
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    /// Build the connection pool and verify connectivity.
    pub async fn connect(config: &TimescaleDbConfig) -> Result<Self, DbError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.dbname)
            .username(&config.user)
            .password(&config.password);

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.connection_timeout)
            .connect_with(options)
            .await
            .map_err(DbError::from_sqlx)?;

        info!(
            host = %config.host,
            port = config.port,
            dbname = %config.dbname,
            pool_size = config.pool_size,
            "database pool established"
        );

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CandleSink for PostgresSink {
    async fn insert_batch(&self, candles: &[Candle]) -> Result<(), DbError> {
        if candles.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(DbError::from_sqlx)?;

        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO candles \
             (symbol, \"interval\", open_time, open, high, low, close, volume, trade_count, ingest_time) ",
        );
        builder.push_values(candles, |mut row, candle| {
            row.push_bind(&candle.symbol)
                .push_bind(candle.interval.as_str())
                .push_bind(candle.open_time)
                .push_bind(candle.open)
                .push_bind(candle.high)
                .push_bind(candle.low)
                .push_bind(candle.close)
                .push_bind(candle.volume)
                .push_bind(candle.trade_count)
                .push_bind(candle.ingest_time);
        });
        // Replays must leave rows bit-identical, so ingest_time is not
        // updated on conflict.
        builder.push(
            " ON CONFLICT (symbol, \"interval\", open_time) DO UPDATE SET \
             open = EXCLUDED.open, high = EXCLUDED.high, low = EXCLUDED.low, \
             close = EXCLUDED.close, volume = EXCLUDED.volume, \
             trade_count = EXCLUDED.trade_count",
        );

        builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(DbError::from_sqlx)?;

        tx.commit().await.map_err(DbError::from_sqlx)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(DbError::from_sqlx)
    }
}

/// What the writer hands back for one submission.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The batch is durable; commit the covered offsets.
    Committed {
        token: CommitToken,
        /// Batch sealed to commit returned
        latency: Duration,
        /// Candles written (poison excluded)
        rows: usize,
    },
    /// The batch was not persisted and is returned for resubmission,
    /// either because the breaker rejected it or because the retry
    /// budget ran out on a transient error.
    Rejected(Box<CandleBatch>),
}

pub struct Writer<S: CandleSink> {
    sink: Arc<S>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    metrics: IngestMetrics,
    cancel: CancellationToken,
}

impl<S: CandleSink> Writer<S> {
    pub fn new(
        sink: Arc<S>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        metrics: IngestMetrics,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            breaker,
            retry,
            metrics,
            cancel,
        }
    }

    /// Consume batches until the channel closes or a fatal error occurs.
    ///
    /// Batches arrive on a capacity-1 channel, so at most one
    /// submission runs at a time and a second `submit` blocks the
    /// sender until this one returns.
    pub async fn run(
        self,
        mut batches: mpsc::Receiver<CandleBatch>,
        replies: mpsc::Sender<Result<WriteOutcome, IngestError>>,
    ) {
        while let Some(batch) = batches.recv().await {
            let result = self.submit(batch).await;
            let stop = result.is_err();
            if replies.send(result).await.is_err() {
                warn!("reply channel closed, stopping writer");
                break;
            }
            if stop {
                break;
            }
        }
        info!("writer stopped");
    }

    /// Process one batch: validate, gate, upsert, emit token.
    pub async fn submit(&self, mut batch: CandleBatch) -> Result<WriteOutcome, IngestError> {
        self.strip_poison(&mut batch);

        let token = batch.commit_token();
        let rows = batch.entries.len();

        // A batch of only poison records still advances offsets; the
        // database and the breaker are not involved.
        if rows == 0 {
            debug!("batch empty after validation, emitting bare commit token");
            return Ok(WriteOutcome::Committed {
                token,
                latency: batch.sealed_at.elapsed(),
                rows: 0,
            });
        }

        let decision = self.breaker.allow();
        self.sync_breaker_gauge();
        if decision == Decision::Reject {
            debug!(rows, "circuit breaker open, submission rejected");
            return Ok(WriteOutcome::Rejected(Box::new(batch)));
        }

        let candles: Vec<Candle> = batch.entries.iter().map(|e| e.candle.clone()).collect();
        let sink = self.sink.clone();
        let metrics = self.metrics.clone();

        let result = self
            .retry
            .run(
                &self.cancel,
                || {
                    let sink = sink.clone();
                    let candles = &candles;
                    async move { sink.insert_batch(candles).await }
                },
                |attempt, err| {
                    warn!(attempt, error = %err, "insert attempt failed, retrying");
                    metrics.insert_retries.inc();
                },
            )
            .await;

        match result {
            Ok(()) => {
                self.breaker.record_success();
                self.sync_breaker_gauge();

                let latency = batch.sealed_at.elapsed();
                self.metrics.write_latency.observe(latency.as_secs_f64());
                self.metrics.batch_size.observe(rows as f64);
                self.metrics.batches_written.inc();
                self.metrics.records_inserted.inc_by(rows as u64);

                info!(
                    rows,
                    latency_ms = latency.as_millis() as u64,
                    "batch committed"
                );
                Ok(WriteOutcome::Committed {
                    token,
                    latency,
                    rows,
                })
            }
            Err(RetryError::Cancelled) => {
                warn!(rows, "write abandoned by shutdown, batch will be redelivered");
                Err(IngestError::Cancelled)
            }
            Err(RetryError::Permanent(err)) => {
                error!(error = %err, "permanent database error");
                Err(IngestError::Database(err))
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                if self.breaker.record_failure() {
                    self.metrics.breaker_trips.inc();
                }
                self.sync_breaker_gauge();
                warn!(
                    attempts,
                    error = %last,
                    "insert attempts exhausted, batch returned for resubmission"
                );
                Ok(WriteOutcome::Rejected(Box::new(batch)))
            }
        }
    }

    /// Remove candles that fail validation, counting them as poison.
    /// Their offsets remain covered by the batch.
    fn strip_poison(&self, batch: &mut CandleBatch) {
        let metrics = &self.metrics;
        batch.entries.retain(|entry| match entry.candle.validate() {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    partition = entry.partition,
                    offset = entry.offset,
                    symbol = %entry.candle.symbol,
                    error = %err,
                    "poison candle excluded"
                );
                metrics.record_poison(PoisonReason::Validation.as_str());
                false
            }
        });
    }

    fn sync_breaker_gauge(&self) {
        self.metrics
            .breaker_state
            .set(self.breaker.state().gauge_value());
    }
}
