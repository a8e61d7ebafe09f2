//! Collector configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TelemetryError};
use crate::features::ActivityTransform;
use crate::writer::{BackpressurePolicy, BatchWriterConfig};

/// Full configuration for one collector instance.
///
/// Defaults suit a single-host deployment polling once per second into a
/// local InfluxDB. Validated once at start; a running collector never
/// re-reads its configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Target interval between poll cycles.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Bound on hypervisor connection establishment.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// How long a cached device topology stays valid.
    #[serde(with = "duration_secs")]
    pub device_cache_ttl: Duration,

    /// Sink base URL, e.g. `http://127.0.0.1:8181`.
    pub sink_url: String,
    /// Sink database name.
    pub sink_database: String,
    /// Bearer token; empty means unauthenticated.
    pub sink_token: String,

    /// Flush a batch at this many records.
    pub max_batch_lines: usize,
    /// Flush a batch when its oldest record reaches this age.
    #[serde(with = "duration_secs")]
    pub max_batch_age: Duration,
    /// Bounded queue capacity between poll loop and writer.
    pub queue_capacity: usize,
    /// Behavior when the queue is full.
    pub backpressure: BackpressurePolicy,
    /// Attempts per batch before it counts as dropped.
    pub sink_retry_attempts: u32,
    /// Base backoff between retries, scaled linearly per attempt.
    #[serde(with = "duration_secs")]
    pub sink_retry_backoff: Duration,
    /// Flush budget granted to the writer during stop.
    #[serde(with = "duration_secs")]
    pub stop_grace: Duration,

    /// Rate-to-activity transform parameters.
    pub transform: ActivityTransform,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            device_cache_ttl: Duration::from_secs(300),
            sink_url: "http://127.0.0.1:8181".to_string(),
            sink_database: "vmpulse".to_string(),
            sink_token: String::new(),
            max_batch_lines: 2_000,
            max_batch_age: Duration::from_secs(1),
            queue_capacity: 20_000,
            backpressure: BackpressurePolicy::DropOldest,
            sink_retry_attempts: 3,
            sink_retry_backoff: Duration::from_millis(250),
            stop_grace: Duration::from_secs(5),
            transform: ActivityTransform::default(),
        }
    }
}

impl CollectorConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval must be positive"));
        }
        if self.sink_url.is_empty() {
            return Err(invalid("sink_url must not be empty"));
        }
        if self.sink_database.is_empty() {
            return Err(invalid("sink_database must not be empty"));
        }
        if self.max_batch_lines == 0 {
            return Err(invalid("max_batch_lines must be positive"));
        }
        if self.queue_capacity < self.max_batch_lines {
            return Err(invalid(
                "queue_capacity must be at least max_batch_lines",
            ));
        }
        if self.sink_retry_attempts == 0 {
            return Err(invalid("sink_retry_attempts must be positive"));
        }
        if !(self.transform.max_degrees > 0.0) {
            return Err(invalid("transform.max_degrees must be positive"));
        }
        if !(self.transform.log_scale > 0.0) {
            return Err(invalid("transform.log_scale must be positive"));
        }
        Ok(())
    }

    /// Writer slice of this configuration.
    pub fn writer_config(&self) -> BatchWriterConfig {
        BatchWriterConfig {
            queue_capacity: self.queue_capacity,
            max_batch_lines: self.max_batch_lines,
            max_batch_age: self.max_batch_age,
            backpressure: self.backpressure,
            retry_attempts: self.sink_retry_attempts,
            retry_backoff: self.sink_retry_backoff,
            stop_grace: self.stop_grace,
        }
    }
}

fn invalid(msg: &str) -> TelemetryError {
    TelemetryError::ConfigValidation(msg.to_string())
}

/// Durations serialize as seconds in config files.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be non-negative"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
