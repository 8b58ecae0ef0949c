//! Prometheus metrics for the ingestion service
//!
//! A process-wide registry with explicit initialization: the supervisor
//! registers every metric at startup, nothing registers itself as an
//! import side effect. Counters are lock-free; histograms take a short
//! internal lock on observe.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::error::IngestError;

/// Global metrics registry instance
pub static METRICS_REGISTRY: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();

/// Thread-safe registry for Prometheus metrics
pub struct MetricsRegistry {
    registry: Arc<RwLock<Registry>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
        }
    }

    /// Get the global metrics registry, initializing it if necessary
    pub fn global() -> Arc<MetricsRegistry> {
        METRICS_REGISTRY
            .get_or_init(|| Arc::new(MetricsRegistry::new()))
            .clone()
    }

    pub fn registry(&self) -> Arc<RwLock<Registry>> {
        self.registry.clone()
    }

    /// Encode metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, IngestError> {
        let registry = self.registry.read();
        let mut buffer = String::new();

        prometheus_client::encoding::text::encode(&mut buffer, &registry)
            .map_err(|e| IngestError::Metrics(e.to_string()))?;

        Ok(buffer)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Label set for poison record counters
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
    pub reason: String,
}

/// Label set for per-partition gauges
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PartitionLabels {
    pub partition: String,
}

/// Every metric the service exports, cloneable handles.
#[derive(Clone)]
pub struct IngestMetrics {
    pub records_consumed: Counter,
    pub records_inserted: Counter,
    pub poison_records: Family<ReasonLabels, Counter>,
    pub batches_written: Counter,
    pub batch_size: Histogram,
    pub write_latency: Histogram,
    pub insert_retries: Counter,
    pub commit_failures: Counter,
    pub breaker_state: Gauge,
    pub breaker_trips: Counter,
    pub poll_timeout_seconds: Gauge<f64, AtomicU64>,
    pub max_batch_size: Gauge,
    pub consumer_lag: Family<PartitionLabels, Gauge>,
    pub partition_offset: Family<PartitionLabels, Gauge>,
}

impl IngestMetrics {
    /// Construct unregistered handles, used directly in tests.
    pub fn new() -> Self {
        Self {
            records_consumed: Counter::default(),
            records_inserted: Counter::default(),
            poison_records: Family::default(),
            batches_written: Counter::default(),
            batch_size: Histogram::new(
                [10.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0].into_iter(),
            ),
            write_latency: Histogram::new(
                [
                    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0,
                ]
                .into_iter(),
            ),
            insert_retries: Counter::default(),
            commit_failures: Counter::default(),
            breaker_state: Gauge::default(),
            breaker_trips: Counter::default(),
            poll_timeout_seconds: Gauge::default(),
            max_batch_size: Gauge::default(),
            consumer_lag: Family::default(),
            partition_offset: Family::default(),
        }
    }

    /// Construct handles and register them on the given registry.
    pub fn registered(registry: &MetricsRegistry) -> Self {
        let metrics = Self::new();
        let binding = registry.registry();
        let mut reg = binding.write();

        reg.register(
            "timescale_ingest_records_consumed",
            "Total number of records consumed from the broker",
            metrics.records_consumed.clone(),
        );
        reg.register(
            "timescale_ingest_records_inserted",
            "Total number of candles inserted into the store",
            metrics.records_inserted.clone(),
        );
        reg.register(
            "timescale_ingest_poison_records",
            "Total number of records excluded by validation",
            metrics.poison_records.clone(),
        );
        reg.register(
            "timescale_ingest_batches_written",
            "Total number of batches committed to the store",
            metrics.batches_written.clone(),
        );
        reg.register(
            "timescale_ingest_batch_size",
            "Distribution of written batch sizes",
            metrics.batch_size.clone(),
        );
        reg.register(
            "timescale_ingest_db_insert_latency_seconds",
            "Latency from batch sealed to commit returned",
            metrics.write_latency.clone(),
        );
        reg.register(
            "timescale_ingest_insert_retries",
            "Total number of insert attempt retries",
            metrics.insert_retries.clone(),
        );
        reg.register(
            "timescale_ingest_commit_failures",
            "Total number of broker offset commit failures",
            metrics.commit_failures.clone(),
        );
        reg.register(
            "timescale_ingest_circuit_breaker_state",
            "Circuit breaker state (0=closed, 1=half-open, 2=open)",
            metrics.breaker_state.clone(),
        );
        reg.register(
            "timescale_ingest_circuit_breaker_trips",
            "Number of times the circuit breaker has tripped",
            metrics.breaker_trips.clone(),
        );
        reg.register(
            "timescale_ingest_current_poll_timeout_seconds",
            "Current broker poll timeout setting",
            metrics.poll_timeout_seconds.clone(),
        );
        reg.register(
            "timescale_ingest_current_max_batch_size",
            "Current maximum batch size setting",
            metrics.max_batch_size.clone(),
        );
        reg.register(
            "timescale_ingest_kafka_consumer_lag",
            "Number of records the consumer is behind, per partition",
            metrics.consumer_lag.clone(),
        );
        reg.register(
            "timescale_ingest_kafka_partition_offset",
            "Latest consumed offset, per partition",
            metrics.partition_offset.clone(),
        );

        metrics
    }

    pub fn record_poison(&self, reason: &str) {
        self.poison_records
            .get_or_create(&ReasonLabels {
                reason: reason.to_string(),
            })
            .inc();
    }
}

impl Default for IngestMetrics {
    fn default() -> Self {
        Self::new()
    }
}
