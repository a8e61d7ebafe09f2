//! VM telemetry collection pipeline.
//!
//! Polls a hypervisor for per-VM CPU, memory, network and disk counters,
//! derives rate-of-change features with a bounded activity transform, and
//! ships everything as InfluxDB line protocol through a batched background
//! writer. The [`collector::Collector`] ties the pieces together behind a
//! start/stop/status lifecycle.

pub mod collector;
pub mod config;
pub mod error;
pub mod features;
pub mod hypervisor;
pub mod lineproto;
pub mod qemu;
pub mod sample;
pub mod writer;

pub use collector::{Collector, CollectorState, CollectorStatus, VmMetricsView};
pub use config::CollectorConfig;
pub use error::{Result, TelemetryError};
pub use features::{ActivityTransform, RateFeatureComputer};
pub use hypervisor::{DeviceTopology, DeviceTopologyCache, Hypervisor};
pub use qemu::QemuProcfsHypervisor;
pub use sample::{CounterField, DerivedSample, Measurement, RawSample, VmIdentity};
pub use writer::{
    BackpressurePolicy, BatchWriter, BatchWriterConfig, InfluxSink, MetricSink, WriterHandle,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
