//! Error taxonomy for the telemetry pipeline.
//!
//! No error raised inside the poll or writer loop escapes its thread: loop
//! code catches, classifies, counts and logs at the point of origin. These
//! types exist so each failure class has one unambiguous home.

use thiserror::Error;

/// Result type alias for vmpulse operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Failure classes of the collection pipeline.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Hypervisor endpoint unreachable or refused. Cycle-fatal; the poll
    /// loop retries on the next tick.
    #[error("hypervisor connection failed: {0}")]
    Connection(String),

    /// Counter or device extraction failed for one VM. That VM's samples
    /// are skipped for the cycle; the cycle continues.
    #[error("metric extraction failed for VM {vm_id}: {reason}")]
    Extraction { vm_id: u32, reason: String },

    /// Transient sink write failure, retried with backoff up to the
    /// configured attempt budget before the batch is counted as dropped.
    #[error("sink write failed: {0}")]
    SinkWrite(String),

    /// Invalid configuration. Fatal only at startup, before the collector
    /// ever reaches the running state.
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),
}
