//! Adaptive tuning of poll timeout and batch size
//!
//! The controller is a pure state machine fed with end-to-end write
//! latency samples (batch sealed to commit returned). It keeps a
//! sliding window of recent samples and compares the window median
//! against two thresholds: above the high threshold it trades
//! throughput for stability (smaller batches, longer polls), below the
//! low threshold it trades back. Between the thresholds it holds, which
//! is what keeps the loop from oscillating. Every move is a single
//! step, clamped to the configured rails.

use std::collections::VecDeque;
use std::time::Duration;

use timescale_ingest_config::ControllerConfig;
use tracing::debug;

/// The pair of knobs the consumer loop reads before each poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollParams {
    pub poll_timeout: Duration,
    pub max_batch: usize,
}

pub struct AdaptiveController {
    config: ControllerConfig,
    samples: VecDeque<Duration>,
    poll_timeout: Duration,
    max_batch: usize,
}

impl AdaptiveController {
    /// Create a controller with initial values clamped to the rails.
    pub fn new(config: ControllerConfig, initial_poll_timeout: Duration, initial_max_batch: usize) -> Self {
        let poll_timeout =
            initial_poll_timeout.clamp(config.poll_timeout_min, config.poll_timeout_max);
        let max_batch = initial_max_batch.clamp(config.batch_size_min, config.batch_size_max);
        Self {
            samples: VecDeque::with_capacity(config.window),
            config,
            poll_timeout,
            max_batch,
        }
    }

    /// Current `(poll_timeout, max_batch)`.
    pub fn params(&self) -> PollParams {
        PollParams {
            poll_timeout: self.poll_timeout,
            max_batch: self.max_batch,
        }
    }

    /// Feed one latency sample and re-derive the parameters.
    pub fn observe(&mut self, latency: Duration) -> PollParams {
        if self.samples.len() == self.config.window {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);

        let median = self.median();
        if median > self.config.latency_threshold_high {
            self.max_batch = self
                .max_batch
                .saturating_sub(self.config.batch_size_step)
                .max(self.config.batch_size_min);
            self.poll_timeout = (self.poll_timeout + self.config.poll_timeout_step)
                .min(self.config.poll_timeout_max);
            debug!(
                median_secs = median.as_secs_f64(),
                max_batch = self.max_batch,
                poll_timeout_secs = self.poll_timeout.as_secs_f64(),
                "latency above high threshold, backing off"
            );
        } else if median < self.config.latency_threshold_low {
            self.max_batch = self
                .max_batch
                .saturating_add(self.config.batch_size_step)
                .min(self.config.batch_size_max);
            self.poll_timeout = self
                .poll_timeout
                .saturating_sub(self.config.poll_timeout_step)
                .max(self.config.poll_timeout_min);
            debug!(
                median_secs = median.as_secs_f64(),
                max_batch = self.max_batch,
                poll_timeout_secs = self.poll_timeout.as_secs_f64(),
                "latency below low threshold, speeding up"
            );
        }

        self.params()
    }

    fn median(&self) -> Duration {
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        sorted[sorted.len() / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ControllerConfig {
        ControllerConfig {
            latency_threshold_high: Duration::from_secs(1),
            latency_threshold_low: Duration::from_millis(200),
            poll_timeout_min: Duration::from_millis(500),
            poll_timeout_max: Duration::from_secs(5),
            batch_size_min: 100,
            batch_size_max: 2000,
            poll_timeout_step: Duration::from_millis(500),
            batch_size_step: 100,
            window: 4,
        }
    }

    fn controller() -> AdaptiveController {
        AdaptiveController::new(config(), Duration::from_secs(1), 500)
    }

    #[test]
    fn test_initial_values_clamped_to_rails() {
        let c = AdaptiveController::new(config(), Duration::from_secs(60), 1_000_000);
        assert_eq!(c.params().poll_timeout, Duration::from_secs(5));
        assert_eq!(c.params().max_batch, 2000);

        let c = AdaptiveController::new(config(), Duration::from_millis(1), 1);
        assert_eq!(c.params().poll_timeout, Duration::from_millis(500));
        assert_eq!(c.params().max_batch, 100);
    }

    #[test]
    fn test_high_latency_steps_once() {
        let mut c = controller();
        let params = c.observe(Duration::from_secs(2));
        assert_eq!(params.max_batch, 400);
        assert_eq!(params.poll_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_low_latency_steps_once() {
        let mut c = controller();
        let params = c.observe(Duration::from_millis(50));
        assert_eq!(params.max_batch, 600);
        assert_eq!(params.poll_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_in_band_latency_holds() {
        let mut c = controller();
        let before = c.params();
        let after = c.observe(Duration::from_millis(500));
        assert_eq!(before, after);
    }

    #[test]
    fn test_sustained_slowdown_walks_to_rails() {
        let mut c = controller();
        for _ in 0..32 {
            c.observe(Duration::from_secs(2));
        }
        let params = c.params();
        assert_eq!(params.max_batch, 100);
        assert_eq!(params.poll_timeout, Duration::from_secs(5));

        // Stays pinned at the rails under continued pressure.
        let params = c.observe(Duration::from_secs(3));
        assert_eq!(params.max_batch, 100);
        assert_eq!(params.poll_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_sustained_speedup_walks_to_opposite_rails() {
        let mut c = controller();
        for _ in 0..32 {
            c.observe(Duration::from_millis(10));
        }
        let params = c.params();
        assert_eq!(params.max_batch, 2000);
        assert_eq!(params.poll_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_median_ignores_single_spike() {
        let mut c = controller();
        // Fill the window with in-band samples.
        for _ in 0..4 {
            c.observe(Duration::from_millis(500));
        }
        let before = c.params();
        // One spike does not move the median out of band.
        let after = c.observe(Duration::from_secs(10));
        assert_eq!(before, after);
    }

    #[test]
    fn test_window_slides() {
        let mut c = controller();
        for _ in 0..4 {
            c.observe(Duration::from_millis(500));
        }
        // Four fast samples push the old in-band samples out and the
        // median under the low threshold.
        let mut last = c.params();
        for _ in 0..4 {
            last = c.observe(Duration::from_millis(10));
        }
        assert!(last.max_batch > 500);
    }

    #[test]
    fn test_bounds_invariant_over_random_walk() {
        let mut c = controller();
        let cfg = config();
        let latencies = [
            Duration::from_millis(10),
            Duration::from_secs(3),
            Duration::from_millis(500),
            Duration::from_secs(2),
            Duration::from_millis(50),
        ];
        for i in 0..200 {
            let params = c.observe(latencies[i % latencies.len()]);
            assert!(params.poll_timeout >= cfg.poll_timeout_min);
            assert!(params.poll_timeout <= cfg.poll_timeout_max);
            assert!(params.max_batch >= cfg.batch_size_min);
            assert!(params.max_batch <= cfg.batch_size_max);
        }
    }
}
