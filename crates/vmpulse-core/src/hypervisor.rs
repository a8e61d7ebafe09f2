//! Hypervisor abstraction and device-topology caching.
//!
//! Every backend implements the [`Hypervisor`] trait: connect, enumerate
//! live VMs, extract counter samples per VM, close. The poll loop holds the
//! backend exclusively; per-VM extraction failures never abort a cycle.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::sample::{RawSample, VmIdentity};

/// Connection to a virtualization host.
pub trait Hypervisor: Send {
    /// Establish the connection within a bounded timeout. Failure is a
    /// `Connection` error; the poll loop retries lazily on the next tick.
    fn connect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Current set of running VMs. An empty result is valid, not an error.
    fn list_live_vms(&mut self) -> Result<Vec<VmIdentity>>;

    /// Zero or more raw samples for one VM: CPU, memory, per-interface
    /// network counters, disk counters. Failure is VM-scoped.
    fn extract_metrics(&mut self, vm: &VmIdentity) -> Result<Vec<RawSample>>;

    /// Release the connection; idempotent.
    fn close(&mut self);
}

/// Virtual devices attached to a VM, expensive to re-derive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceTopology {
    /// Host-side network interface names.
    pub nics: Vec<String>,
    /// Disk drive names.
    pub disks: Vec<String>,
}

struct CacheEntry {
    topology: DeviceTopology,
    cached_at: Instant,
}

/// TTL cache of per-VM device topology, amortizing the parse of a VM's
/// device description across many polling cycles.
pub struct DeviceTopologyCache {
    ttl: Duration,
    entries: HashMap<u32, CacheEntry>,
}

impl DeviceTopologyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Fresh topology for a VM, or `None` on miss or expiry.
    pub fn lookup(&self, vm_id: u32) -> Option<&DeviceTopology> {
        let entry = self.entries.get(&vm_id)?;
        if entry.cached_at.elapsed() < self.ttl {
            Some(&entry.topology)
        } else {
            None
        }
    }

    pub fn insert(&mut self, vm_id: u32, topology: DeviceTopology) {
        self.entries.insert(
            vm_id,
            CacheEntry {
                topology,
                cached_at: Instant::now(),
            },
        );
    }

    /// Evict entries for VMs absent from the current cycle.
    pub fn evict_absent(&mut self, live: &HashSet<u32>) {
        self.entries.retain(|vm_id, _| live.contains(vm_id));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
