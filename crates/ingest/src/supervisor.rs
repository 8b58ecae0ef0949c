//! Service wiring and lifecycle
//!
//! The supervisor builds the components in dependency order (metrics,
//! breaker, HTTP surface, database sink, writer, controller, batcher,
//! consumer loop), owns the cancellation token, and translates an
//! external shutdown signal into a cooperative drain bounded by the
//! configured grace period. If the deadline expires, the residual batch
//! is abandoned; at-least-once delivery redelivers it on restart.

use std::sync::Arc;
use std::time::Duration;

use timescale_ingest_config::AppConfig;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::batcher::Batcher;
use crate::breaker::CircuitBreaker;
use crate::consumer::{ConsumerLoop, KafkaRecordStream};
use crate::controller::AdaptiveController;
use crate::error::IngestError;
use crate::metrics::{IngestMetrics, MetricsRegistry};
use crate::retry::RetryPolicy;
use crate::server::{HealthState, MetricsServer};
use crate::writer::{CandleSink, PostgresSink, Writer};

/// One batch in the channel plus one in flight plus slack.
const REPLY_CHANNEL_CAPACITY: usize = 4;

const WRITER_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Supervisor {
    config: AppConfig,
}

impl Supervisor {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Start the service and run until shutdown or a fatal error.
    pub async fn run(self) -> Result<(), IngestError> {
        let config = self.config;

        // Metrics registration is explicit and happens before anything
        // that records into them.
        let registry = MetricsRegistry::global();
        let metrics = IngestMetrics::registered(&registry);

        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        metrics.breaker_state.set(breaker.state().gauge_value());

        let health = Arc::new(HealthState::new(breaker.clone()));
        let cancel = CancellationToken::new();

        let server = MetricsServer::new(config.metrics.clone(), registry, health.clone());
        let listener = server.bind().await?;
        let server_handle = tokio::spawn(server.serve(listener, cancel.child_token()));

        let sink = PostgresSink::connect(&config.timescaledb)
            .await
            .map_err(|e| IngestError::Startup(format!("database connection failed: {e}")))?;
        sink.ping()
            .await
            .map_err(|e| IngestError::Startup(format!("database ping failed: {e}")))?;
        let sink = Arc::new(sink);

        let retry = RetryPolicy::new(config.insert.retry_attempts, config.insert.retry_delay);
        let (batches_tx, batches_rx) = mpsc::channel(1);
        let (replies_tx, replies_rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);

        let writer = Writer::new(
            sink,
            breaker.clone(),
            retry,
            metrics.clone(),
            cancel.child_token(),
        );
        let writer_handle = tokio::spawn(writer.run(batches_rx, replies_tx));

        let controller = AdaptiveController::new(
            config.controller.clone(),
            config.kafka.initial_poll_timeout,
            config.kafka.initial_max_batch_size,
        );
        let initial = controller.params();
        metrics
            .poll_timeout_seconds
            .set(initial.poll_timeout.as_secs_f64());
        metrics
            .max_batch_size
            .set(initial.max_batch.min(config.insert.batch_size) as i64);

        let batcher = Batcher::new(
            initial.max_batch.min(config.insert.batch_size),
            config.insert.time_interval,
        );

        let stream = KafkaRecordStream::new(&config.kafka, metrics.clone())
            .map_err(|e| IngestError::Startup(format!("kafka consumer creation failed: {e}")))?;

        let consumer = ConsumerLoop::new(
            stream,
            batcher,
            controller,
            breaker,
            metrics,
            health.clone(),
            config.insert.batch_size,
            config.breaker.reset_timeout,
            batches_tx,
            replies_rx,
            cancel.child_token(),
        );
        let mut consumer_handle = tokio::spawn(consumer.run());

        health.set_running(true);
        info!("service started");

        let result = tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received, draining");
                cancel.cancel();
                match tokio::time::timeout(config.shutdown.grace_period, &mut consumer_handle).await {
                    Ok(join) => flatten_join(join),
                    Err(_) => {
                        warn!(
                            grace_secs = config.shutdown.grace_period.as_secs_f64(),
                            "grace period expired, residual batch abandoned"
                        );
                        consumer_handle.abort();
                        Ok(())
                    }
                }
            }
            join = &mut consumer_handle => {
                cancel.cancel();
                flatten_join(join)
            }
        };

        health.set_running(false);

        if tokio::time::timeout(WRITER_STOP_TIMEOUT, writer_handle)
            .await
            .is_err()
        {
            warn!("writer did not stop within its deadline");
        }
        if tokio::time::timeout(SERVER_STOP_TIMEOUT, server_handle)
            .await
            .is_err()
        {
            warn!("metrics server did not stop within its deadline");
        }

        info!("all resources cleaned up");
        result
    }
}

fn flatten_join(join: Result<Result<(), IngestError>, JoinError>) -> Result<(), IngestError> {
    match join {
        // Cancellation is the shutdown path, not a failure.
        Ok(Err(IngestError::Cancelled)) => Ok(()),
        Ok(result) => result,
        Err(e) => Err(IngestError::Internal(format!("consumer task failed: {e}"))),
    }
}

/// Resolve when SIGTERM or SIGINT arrives.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
