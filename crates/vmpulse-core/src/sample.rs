//! Data model for collected metrics.
//!
//! Counters are a closed set: every field a VM can report belongs to exactly
//! one [`Measurement`] kind and has a fixed wire name. Samples are created by
//! the hypervisor connector and never mutated afterwards.

use std::time::SystemTime;

use serde::Serialize;

/// Identity of a live VM, re-resolved on every poll cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmIdentity {
    /// Hypervisor-assigned id (the QEMU process id for the procfs backend).
    pub id: u32,
    /// Guest name.
    pub name: String,
    /// Guest UUID, empty if the hypervisor did not report one.
    pub uuid: String,
    /// Current vCPU count.
    pub vcpu_count: u32,
    /// Maximum guest memory in KiB.
    pub memory_max_kb: u64,
}

/// Measurement kind a counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Measurement {
    Cpu,
    Memory,
    Network,
    Disk,
}

impl Measurement {
    /// Wire measurement name for raw samples.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Cpu => "vm_cpu",
            Self::Memory => "vm_memory",
            Self::Network => "vm_network",
            Self::Disk => "vm_disk",
        }
    }
}

/// Closed enumeration of per-VM counter fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterField {
    // Cpu
    CpuTimeNs,
    CpuUserNs,
    CpuSystemNs,
    VcpuCurrent,
    // Memory
    MemUsedKb,
    MemRssKb,
    MemAvailableKb,
    MemMajorFaults,
    MemMinorFaults,
    // Network
    NetRxBytes,
    NetRxPackets,
    NetRxErrors,
    NetRxDrops,
    NetTxBytes,
    NetTxPackets,
    NetTxErrors,
    NetTxDrops,
    // Disk
    DiskRdReqs,
    DiskRdBytes,
    DiskWrReqs,
    DiskWrBytes,
}

impl CounterField {
    /// Field key as written to the sink.
    pub fn name(self) -> &'static str {
        match self {
            Self::CpuTimeNs => "cpu_time_ns",
            Self::CpuUserNs => "cpu_user_ns",
            Self::CpuSystemNs => "cpu_system_ns",
            Self::VcpuCurrent => "vcpu_current",
            Self::MemUsedKb => "mem_used_kb",
            Self::MemRssKb => "mem_rss_kb",
            Self::MemAvailableKb => "mem_available_kb",
            Self::MemMajorFaults => "mem_major_faults",
            Self::MemMinorFaults => "mem_minor_faults",
            Self::NetRxBytes => "net_rx_bytes",
            Self::NetRxPackets => "net_rx_packets",
            Self::NetRxErrors => "net_rx_errors",
            Self::NetRxDrops => "net_rx_drops",
            Self::NetTxBytes => "net_tx_bytes",
            Self::NetTxPackets => "net_tx_packets",
            Self::NetTxErrors => "net_tx_errors",
            Self::NetTxDrops => "net_tx_drops",
            Self::DiskRdReqs => "disk_rd_reqs",
            Self::DiskRdBytes => "disk_rd_bytes",
            Self::DiskWrReqs => "disk_wr_reqs",
            Self::DiskWrBytes => "disk_wr_bytes",
        }
    }

    /// Measurement kind this field belongs to.
    pub fn measurement(self) -> Measurement {
        match self {
            Self::CpuTimeNs | Self::CpuUserNs | Self::CpuSystemNs | Self::VcpuCurrent => {
                Measurement::Cpu
            }
            Self::MemUsedKb
            | Self::MemRssKb
            | Self::MemAvailableKb
            | Self::MemMajorFaults
            | Self::MemMinorFaults => Measurement::Memory,
            Self::NetRxBytes
            | Self::NetRxPackets
            | Self::NetRxErrors
            | Self::NetRxDrops
            | Self::NetTxBytes
            | Self::NetTxPackets
            | Self::NetTxErrors
            | Self::NetTxDrops => Measurement::Network,
            Self::DiskRdReqs | Self::DiskRdBytes | Self::DiskWrReqs | Self::DiskWrBytes => {
                Measurement::Disk
            }
        }
    }

    /// Whether this counter feeds the rate feature computer.
    ///
    /// The set mirrors the derived-feature keys of the metrics schema:
    /// memory usage trend plus network/disk throughput counters.
    pub fn is_rate_feature(self) -> bool {
        matches!(
            self,
            Self::MemUsedKb
                | Self::NetRxBytes
                | Self::NetRxPackets
                | Self::NetTxBytes
                | Self::NetTxPackets
                | Self::DiskRdReqs
                | Self::DiskRdBytes
                | Self::DiskWrReqs
                | Self::DiskWrBytes
        )
    }
}

/// One raw counter sample for a VM, immutable after creation.
///
/// `device` is set for per-interface samples (network) and absent for per-VM
/// totals; rate features are only derived from total samples.
#[derive(Debug, Clone, Serialize)]
pub struct RawSample {
    pub vm_id: u32,
    pub measurement: Measurement,
    pub device: Option<String>,
    pub fields: Vec<(CounterField, u64)>,
    pub timestamp: SystemTime,
}

/// Rate feature derived from two successive observations of a counter.
///
/// Carries both the raw rate and its bounded activity angle, matching the
/// `<field>_rate` / `<field>_activity_deg` pair written to the sink.
#[derive(Debug, Clone, Serialize)]
pub struct DerivedSample {
    pub vm_id: u32,
    pub field: CounterField,
    pub rate: f64,
    pub activity_deg: f64,
    pub timestamp: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_measurement_mapping() {
        assert_eq!(CounterField::CpuTimeNs.measurement(), Measurement::Cpu);
        assert_eq!(CounterField::MemUsedKb.measurement(), Measurement::Memory);
        assert_eq!(CounterField::NetTxDrops.measurement(), Measurement::Network);
        assert_eq!(CounterField::DiskWrBytes.measurement(), Measurement::Disk);
    }

    #[test]
    fn test_rate_feature_set() {
        assert!(CounterField::MemUsedKb.is_rate_feature());
        assert!(CounterField::NetRxBytes.is_rate_feature());
        assert!(CounterField::DiskWrBytes.is_rate_feature());
        // Errors/drops and gauges are not rate features.
        assert!(!CounterField::NetRxErrors.is_rate_feature());
        assert!(!CounterField::VcpuCurrent.is_rate_feature());
        assert!(!CounterField::MemAvailableKb.is_rate_feature());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(Measurement::Cpu.wire_name(), "vm_cpu");
        assert_eq!(Measurement::Disk.wire_name(), "vm_disk");
        assert_eq!(CounterField::NetRxBytes.name(), "net_rx_bytes");
    }
}
