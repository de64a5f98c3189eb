use crate::{config::duration_ms, error::ConfigError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Concurrency and batching knobs of a [`TickPipeline`](super::TickPipeline).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelinePerformanceOptions {
    /// Number of symbol partitions, each served by one lane task.
    pub partition_count: usize,
    /// Bounded queue capacity of each lane.
    pub lane_capacity: usize,
    /// Records per storage flush.
    pub batch_size: usize,
    /// Maximum time a record waits in the writer buffer before a flush.
    #[serde(with = "duration_ms", rename = "flush_interval_ms")]
    pub flush_interval: Duration,
    /// Bounded queue capacity of the buffered storage writer.
    pub writer_capacity: usize,
    /// Maximum concurrent alert deliveries across all lanes (`None` = uncapped).
    pub alerting_concurrency: Option<usize>,
    /// Graceful shutdown budget before remaining ticks are reported as dropped.
    #[serde(with = "duration_ms", rename = "drain_timeout_ms")]
    pub drain_timeout: Duration,
    /// Also persist raw ticks before conditioning.
    pub persist_raw_ticks: bool,
}

impl Default for PipelinePerformanceOptions {
    fn default() -> Self {
        Self {
            partition_count: default_partition_count(),
            lane_capacity: 1_024,
            batch_size: 500,
            flush_interval: Duration::from_millis(1_000),
            writer_capacity: 10_000,
            alerting_concurrency: Some(16),
            drain_timeout: Duration::from_secs(10),
            persist_raw_ticks: false,
        }
    }
}

impl PipelinePerformanceOptions {
    /// Untuned settings: one partition, one record per storage write.
    pub fn baseline() -> Self {
        Self {
            partition_count: 1,
            batch_size: 1,
            ..Default::default()
        }
    }

    /// Batching and partitioning tuned for throughput.
    pub fn tuned() -> Self {
        Self {
            partition_count: default_partition_count().max(4),
            batch_size: 500,
            flush_interval: Duration::from_millis(250),
            ..Default::default()
        }
    }

    pub fn with_partition_count(mut self, partition_count: usize) -> Self {
        self.partition_count = partition_count;
        self
    }

    pub fn with_lane_capacity(mut self, lane_capacity: usize) -> Self {
        self.lane_capacity = lane_capacity;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_writer_capacity(mut self, writer_capacity: usize) -> Self {
        self.writer_capacity = writer_capacity;
        self
    }

    pub fn with_alerting_concurrency(mut self, alerting_concurrency: Option<usize>) -> Self {
        self.alerting_concurrency = alerting_concurrency;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_persist_raw_ticks(mut self, persist_raw_ticks: bool) -> Self {
        self.persist_raw_ticks = persist_raw_ticks;
        self
    }

    /// Reject settings that would deadlock or divide by zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("partition_count", self.partition_count),
            ("lane_capacity", self.lane_capacity),
            ("batch_size", self.batch_size),
            ("writer_capacity", self.writer_capacity),
            ("alerting_concurrency", self.alerting_concurrency.unwrap_or(1)),
        ];

        match checks.iter().find(|(_, value)| *value == 0) {
            Some((key, value)) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            }),
            None if self.flush_interval.is_zero() => Err(ConfigError::InvalidValue {
                key: "flush_interval_ms".to_string(),
                value: "0".to_string(),
            }),
            None => Ok(()),
        }
    }
}

fn default_partition_count() -> usize {
    std::thread::available_parallelism()
        .map(|cores| cores.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = PipelinePerformanceOptions::default()
            .with_partition_count(3)
            .with_batch_size(50)
            .with_flush_interval(Duration::from_millis(20))
            .with_alerting_concurrency(None)
            .with_drain_timeout(Duration::from_secs(1));

        assert_eq!(options.partition_count, 3);
        assert_eq!(options.batch_size, 50);
        assert_eq!(options.flush_interval, Duration::from_millis(20));
        assert_eq!(options.alerting_concurrency, None);
        assert_eq!(options.drain_timeout, Duration::from_secs(1));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_options_validate() {
        struct TestCase {
            input: PipelinePerformanceOptions,
            expected_key: Option<&'static str>,
        }

        let tests = vec![
            TestCase {
                // TC0: baseline preset is valid
                input: PipelinePerformanceOptions::baseline(),
                expected_key: None,
            },
            TestCase {
                // TC1: zero partitions
                input: PipelinePerformanceOptions::default().with_partition_count(0),
                expected_key: Some("partition_count"),
            },
            TestCase {
                // TC2: zero batch size
                input: PipelinePerformanceOptions::default().with_batch_size(0),
                expected_key: Some("batch_size"),
            },
            TestCase {
                // TC3: zero alerting permits
                input: PipelinePerformanceOptions::default().with_alerting_concurrency(Some(0)),
                expected_key: Some("alerting_concurrency"),
            },
            TestCase {
                // TC4: zero flush interval
                input: PipelinePerformanceOptions::default().with_flush_interval(Duration::ZERO),
                expected_key: Some("flush_interval_ms"),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.validate();
            match (actual, test.expected_key) {
                (Ok(()), None) => {}
                (Err(ConfigError::InvalidValue { key, .. }), Some(expected)) => {
                    assert_eq!(key, expected, "TC{} failed", index)
                }
                (actual, expected) => {
                    panic!("TC{index} failed: actual {actual:?}, expected {expected:?}")
                }
            }
        }
    }

    #[test]
    fn test_options_deserialise_with_defaults() {
        let input = r#"{"partition_count": 2, "flush_interval_ms": 150}"#;
        let options = serde_json::from_str::<PipelinePerformanceOptions>(input).unwrap();

        assert_eq!(options.partition_count, 2);
        assert_eq!(options.flush_interval, Duration::from_millis(150));
        assert_eq!(options.batch_size, 500);
    }
}
