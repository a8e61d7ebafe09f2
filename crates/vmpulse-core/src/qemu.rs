//! QEMU/KVM hypervisor backend reading the host process table.
//!
//! Each running guest is a `qemu-system-*` process. Identity and device
//! topology come from the QEMU command line; counters come from
//! `/proc/<pid>/stat` (CPU jiffies), `/proc/<pid>/status` (resident memory),
//! `/sys/class/net/<if>/statistics` (per-interface network counters) and
//! `/proc/<pid>/io` (aggregate disk I/O). The proc and sys roots are
//! constructor parameters so tests can run against fixture trees.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};

use crate::error::{Result, TelemetryError};
use crate::hypervisor::{DeviceTopology, DeviceTopologyCache, Hypervisor};
use crate::sample::{CounterField, Measurement, RawSample, VmIdentity};

/// Clock ticks per second for jiffy conversion.
#[cfg(unix)]
fn clock_ticks_per_sec() -> f64 {
    // SAFETY: `sysconf` is thread-safe for this query and has no side effects.
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 { hz as f64 } else { 100.0 }
}

#[cfg(not(unix))]
fn clock_ticks_per_sec() -> f64 {
    100.0
}

/// Hypervisor backend over the local QEMU process table.
pub struct QemuProcfsHypervisor {
    proc_root: PathBuf,
    sys_root: PathBuf,
    cache: DeviceTopologyCache,
    connected: bool,
    clk_tck: f64,
}

impl QemuProcfsHypervisor {
    pub fn new(device_cache_ttl: Duration) -> Self {
        Self::with_roots("/proc", "/sys", device_cache_ttl)
    }

    /// Backend over alternate proc/sys roots (containers, test fixtures).
    pub fn with_roots(
        proc_root: impl Into<PathBuf>,
        sys_root: impl Into<PathBuf>,
        device_cache_ttl: Duration,
    ) -> Self {
        Self {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
            cache: DeviceTopologyCache::new(device_cache_ttl),
            connected: false,
            clk_tck: clock_ticks_per_sec(),
        }
    }

    fn extraction(&self, vm_id: u32, reason: impl Into<String>) -> TelemetryError {
        TelemetryError::Extraction {
            vm_id,
            reason: reason.into(),
        }
    }

    fn topology_for(&mut self, vm_id: u32) -> Result<DeviceTopology> {
        if let Some(topology) = self.cache.lookup(vm_id) {
            return Ok(topology.clone());
        }
        let raw = fs::read(self.proc_root.join(vm_id.to_string()).join("cmdline"))
            .map_err(|e| self.extraction(vm_id, format!("read cmdline: {e}")))?;
        let args = parse_cmdline(&raw);
        let topology = device_topology(&args);
        debug!(
            "parsed device topology for VM {vm_id}: {} nic(s), {} disk(s)",
            topology.nics.len(),
            topology.disks.len()
        );
        self.cache.insert(vm_id, topology.clone());
        Ok(topology)
    }

    fn network_samples(
        &self,
        vm_id: u32,
        topology: &DeviceTopology,
        ts: SystemTime,
    ) -> Vec<RawSample> {
        let mut samples = Vec::new();
        let mut totals = [0u64; 8];
        for nic in &topology.nics {
            let stats_dir = self
                .sys_root
                .join("class/net")
                .join(nic)
                .join("statistics");
            if !stats_dir.is_dir() {
                debug!("no statistics for interface {nic} of VM {vm_id}");
                continue;
            }
            let counters = [
                (CounterField::NetRxBytes, "rx_bytes"),
                (CounterField::NetRxPackets, "rx_packets"),
                (CounterField::NetRxErrors, "rx_errors"),
                (CounterField::NetRxDrops, "rx_dropped"),
                (CounterField::NetTxBytes, "tx_bytes"),
                (CounterField::NetTxPackets, "tx_packets"),
                (CounterField::NetTxErrors, "tx_errors"),
                (CounterField::NetTxDrops, "tx_dropped"),
            ];
            let mut fields = Vec::with_capacity(counters.len());
            for (i, (field, file)) in counters.iter().enumerate() {
                let value = read_sysfs_counter(&stats_dir.join(file));
                totals[i] += value;
                fields.push((*field, value));
            }
            samples.push(RawSample {
                vm_id,
                measurement: Measurement::Network,
                device: Some(nic.clone()),
                fields,
                timestamp: ts,
            });
        }
        if !samples.is_empty() {
            // Per-VM totals drive the rate features.
            samples.push(RawSample {
                vm_id,
                measurement: Measurement::Network,
                device: None,
                fields: vec![
                    (CounterField::NetRxBytes, totals[0]),
                    (CounterField::NetRxPackets, totals[1]),
                    (CounterField::NetRxErrors, totals[2]),
                    (CounterField::NetRxDrops, totals[3]),
                    (CounterField::NetTxBytes, totals[4]),
                    (CounterField::NetTxPackets, totals[5]),
                    (CounterField::NetTxErrors, totals[6]),
                    (CounterField::NetTxDrops, totals[7]),
                ],
                timestamp: ts,
            });
        }
        samples
    }
}

impl Hypervisor for QemuProcfsHypervisor {
    fn connect(&mut self) -> Result<()> {
        match fs::read_dir(&self.proc_root) {
            Ok(_) => {
                self.connected = true;
                info!("connected to process table at {}", self.proc_root.display());
                Ok(())
            }
            Err(e) => {
                self.connected = false;
                Err(TelemetryError::Connection(format!(
                    "process table {} unreadable: {e}",
                    self.proc_root.display()
                )))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn list_live_vms(&mut self) -> Result<Vec<VmIdentity>> {
        if !self.connected {
            return Err(TelemetryError::Connection("not connected".to_string()));
        }
        let entries = fs::read_dir(&self.proc_root).map_err(|e| {
            self.connected = false;
            TelemetryError::Connection(format!("list process table: {e}"))
        })?;

        let mut vms = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes can exit between readdir and read; skip quietly.
            let Ok(raw) = fs::read(entry.path().join("cmdline")) else {
                continue;
            };
            let args = parse_cmdline(&raw);
            let Some(argv0) = args.first() else {
                continue;
            };
            if !is_qemu_command(argv0) {
                continue;
            }
            vms.push(identity_from_args(pid, &args));
        }

        let live: HashSet<u32> = vms.iter().map(|v| v.id).collect();
        self.cache.evict_absent(&live);
        Ok(vms)
    }

    fn extract_metrics(&mut self, vm: &VmIdentity) -> Result<Vec<RawSample>> {
        let ts = SystemTime::now();
        let pid_dir = self.proc_root.join(vm.id.to_string());

        let stat_raw = fs::read_to_string(pid_dir.join("stat"))
            .map_err(|e| self.extraction(vm.id, format!("read stat: {e}")))?;
        let stat = parse_stat(&stat_raw)
            .ok_or_else(|| self.extraction(vm.id, "malformed stat file"))?;

        let status_raw = fs::read_to_string(pid_dir.join("status"))
            .map_err(|e| self.extraction(vm.id, format!("read status: {e}")))?;
        let rss_kb = parse_vm_rss(&status_raw).unwrap_or(0);

        let user_ns = ticks_to_ns(stat.utime_ticks, self.clk_tck);
        let system_ns = ticks_to_ns(stat.stime_ticks, self.clk_tck);

        let mut samples = vec![
            RawSample {
                vm_id: vm.id,
                measurement: Measurement::Cpu,
                device: None,
                fields: vec![
                    (CounterField::CpuTimeNs, user_ns + system_ns),
                    (CounterField::CpuUserNs, user_ns),
                    (CounterField::CpuSystemNs, system_ns),
                    (CounterField::VcpuCurrent, u64::from(vm.vcpu_count)),
                ],
                timestamp: ts,
            },
            RawSample {
                vm_id: vm.id,
                measurement: Measurement::Memory,
                device: None,
                fields: vec![
                    (CounterField::MemUsedKb, rss_kb),
                    (CounterField::MemRssKb, rss_kb),
                    (CounterField::MemAvailableKb, vm.memory_max_kb),
                    (CounterField::MemMajorFaults, stat.majflt),
                    (CounterField::MemMinorFaults, stat.minflt),
                ],
                timestamp: ts,
            },
        ];

        let topology = self.topology_for(vm.id)?;
        samples.extend(self.network_samples(vm.id, &topology, ts));

        match fs::read_to_string(pid_dir.join("io")) {
            Ok(io_raw) => {
                let io = parse_proc_io(&io_raw);
                samples.push(RawSample {
                    vm_id: vm.id,
                    measurement: Measurement::Disk,
                    device: None,
                    fields: vec![
                        (CounterField::DiskRdReqs, io.read_syscalls),
                        (CounterField::DiskRdBytes, io.read_bytes),
                        (CounterField::DiskWrReqs, io.write_syscalls),
                        (CounterField::DiskWrBytes, io.write_bytes),
                    ],
                    timestamp: ts,
                });
            }
            Err(e) => {
                // io accounting needs matching privileges; not cycle-fatal.
                debug!("disk counters unavailable for VM {}: {e}", vm.id);
            }
        }

        Ok(samples)
    }

    fn close(&mut self) {
        if self.connected {
            self.connected = false;
            info!("disconnected from process table");
        }
    }
}

// ---------------------------------------------------------------------------
// Command-line and procfs parsing
// ---------------------------------------------------------------------------

fn parse_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|&b| b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

fn is_qemu_command(argv0: &str) -> bool {
    let bin = Path::new(argv0)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(argv0);
    bin.starts_with("qemu-system") || bin == "qemu-kvm"
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn guest_name(args: &[String]) -> Option<String> {
    let value = arg_value(args, "-name")?;
    for part in value.split(',') {
        if let Some(name) = part.strip_prefix("guest=") {
            return Some(name.to_string());
        }
    }
    let first = value.split(',').next()?;
    if first.contains('=') {
        None
    } else {
        Some(first.to_string())
    }
}

fn vcpu_count(args: &[String]) -> u32 {
    let Some(value) = arg_value(args, "-smp") else {
        return 1;
    };
    for part in value.split(',') {
        let candidate = part.strip_prefix("cpus=").unwrap_or(part);
        if let Ok(n) = candidate.parse::<u32>() {
            return n.max(1);
        }
    }
    1
}

/// Guest memory size in KiB from `-m`. A bare number means MiB.
fn memory_max_kb(args: &[String]) -> u64 {
    let Some(value) = arg_value(args, "-m") else {
        return 0;
    };
    let first = value.split(',').next().unwrap_or(value);
    let spec = first.strip_prefix("size=").unwrap_or(first);
    let (digits, scale_kb) = match spec.chars().last() {
        Some('G') | Some('g') => (&spec[..spec.len() - 1], 1024 * 1024),
        Some('M') | Some('m') => (&spec[..spec.len() - 1], 1024),
        Some('K') | Some('k') => (&spec[..spec.len() - 1], 1),
        _ => (spec, 1024),
    };
    digits.parse::<u64>().map(|n| n * scale_kb).unwrap_or(0)
}

fn device_topology(args: &[String]) -> DeviceTopology {
    let mut topology = DeviceTopology::default();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-netdev" => {
                if let Some(value) = iter.peek() {
                    for part in value.split(',') {
                        if let Some(ifname) = part.strip_prefix("ifname=") {
                            topology.nics.push(ifname.to_string());
                        }
                    }
                }
            }
            "-drive" => {
                if let Some(value) = iter.peek() {
                    for part in value.split(',') {
                        if let Some(file) = part.strip_prefix("file=") {
                            let name = Path::new(file)
                                .file_name()
                                .and_then(|n| n.to_str())
                                .unwrap_or(file);
                            topology.disks.push(name.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }
    topology
}

fn identity_from_args(pid: u32, args: &[String]) -> VmIdentity {
    let name = guest_name(args).unwrap_or_else(|| format!("qemu-{pid}"));
    let uuid = arg_value(args, "-uuid").unwrap_or("").to_string();
    VmIdentity {
        id: pid,
        name,
        uuid,
        vcpu_count: vcpu_count(args),
        memory_max_kb: memory_max_kb(args),
    }
}

struct StatCounters {
    minflt: u64,
    majflt: u64,
    utime_ticks: u64,
    stime_ticks: u64,
}

/// Parse `/proc/<pid>/stat`. The comm field is parenthesized and may itself
/// contain spaces, so fields are counted from the last closing paren.
fn parse_stat(raw: &str) -> Option<StatCounters> {
    let rest = &raw[raw.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // After comm: state(0) ppid(1) pgrp(2) session(3) tty(4) tpgid(5)
    // flags(6) minflt(7) cminflt(8) majflt(9) cmajflt(10) utime(11) stime(12)
    Some(StatCounters {
        minflt: fields.get(7)?.parse().ok()?,
        majflt: fields.get(9)?.parse().ok()?,
        utime_ticks: fields.get(11)?.parse().ok()?,
        stime_ticks: fields.get(12)?.parse().ok()?,
    })
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

#[derive(Default)]
struct ProcIo {
    read_syscalls: u64,
    write_syscalls: u64,
    read_bytes: u64,
    write_bytes: u64,
}

fn parse_proc_io(raw: &str) -> ProcIo {
    let mut io = ProcIo::default();
    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };
        match key {
            "syscr" => io.read_syscalls = value,
            "syscw" => io.write_syscalls = value,
            "read_bytes" => io.read_bytes = value,
            "write_bytes" => io.write_bytes = value,
            _ => {}
        }
    }
    io
}

fn ticks_to_ns(ticks: u64, clk_tck: f64) -> u64 {
    (ticks as f64 * 1_000_000_000.0 / clk_tck) as u64
}

fn read_sysfs_counter(path: &Path) -> u64 {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or_else(|| {
            warn!("unreadable counter {}", path.display());
            0
        })
}
