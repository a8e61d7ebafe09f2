//! Collector orchestrator: poll loop, lifecycle, and status reads.
//!
//! One collector owns one hypervisor connection, one rate computer and one
//! batch writer. `start()`/`stop()` serialize on a transition lock, the poll
//! loop runs on its own thread, and readers see the most recent completed
//! cycle through a snapshot, never a live re-poll.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::CollectorConfig;
use crate::error::Result;
use crate::features::RateFeatureComputer;
use crate::hypervisor::Hypervisor;
use crate::lineproto;
use crate::qemu::QemuProcfsHypervisor;
use crate::sample::{DerivedSample, RawSample, VmIdentity};
use crate::writer::{BatchWriter, InfluxSink, MetricSink, WriterCounters, WriterHandle};

/// Lifecycle state of a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Point-in-time view of the collector, safe to read from any thread.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorStatus {
    pub state: CollectorState,
    pub cycles_completed: u64,
    pub vms_monitored: usize,
    pub samples_written: u64,
    pub samples_dropped: u64,
    pub errors: u64,
    /// Unix milliseconds of the last completed cycle, 0 before the first.
    pub last_cycle_unix_ms: u64,
}

/// Raw and derived samples for one VM from the last completed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct VmMetricsView {
    pub identity: VmIdentity,
    pub raw: Vec<RawSample>,
    pub derived: Vec<DerivedSample>,
}

#[derive(Default)]
struct CycleSnapshot {
    vms: Vec<VmIdentity>,
    metrics: HashMap<u32, VmMetricsView>,
}

#[derive(Default)]
struct CycleStats {
    cycles_completed: u64,
    vms_monitored: usize,
    errors: u64,
    last_cycle_unix_ms: u64,
    // Written/dropped totals captured when the writer is torn down.
    frozen_written: u64,
    frozen_dropped: u64,
}

/// Wakeable stop flag: the poll loop sleeps on it between cycles so a stop
/// request interrupts the inter-cycle wait immediately.
#[derive(Clone, Default)]
struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }

    fn reset(&self) {
        *self.inner.0.lock().unwrap() = false;
    }

    /// Wait up to `timeout`; returns true if the signal fired.
    fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut set = lock.lock().unwrap();
        let deadline = Instant::now() + timeout;
        while !*set {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = cvar.wait_timeout(set, remaining).unwrap();
            set = guard;
        }
        true
    }
}

struct Inner {
    stats: Mutex<CycleStats>,
    snapshot: Mutex<CycleSnapshot>,
    stop: StopSignal,
}

pub type HypervisorFactory = Box<dyn Fn() -> Box<dyn Hypervisor> + Send + Sync>;
pub type SinkFactory = Box<dyn Fn() -> Box<dyn MetricSink> + Send + Sync>;

/// Telemetry pipeline orchestrator.
pub struct Collector {
    config: CollectorConfig,
    hypervisor_factory: HypervisorFactory,
    sink_factory: SinkFactory,
    // Serializes start/stop so concurrent transitions cannot interleave.
    transitions: Mutex<()>,
    state: Mutex<CollectorState>,
    inner: Arc<Inner>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<BatchWriter>>,
    live_counters: Mutex<Option<Arc<WriterCounters>>>,
}

impl Collector {
    /// Collector over caller-supplied backends; tests inject mocks here.
    pub fn new(
        config: CollectorConfig,
        hypervisor_factory: HypervisorFactory,
        sink_factory: SinkFactory,
    ) -> Self {
        Self {
            config,
            hypervisor_factory,
            sink_factory,
            transitions: Mutex::new(()),
            state: Mutex::new(CollectorState::Stopped),
            inner: Arc::new(Inner {
                stats: Mutex::new(CycleStats::default()),
                snapshot: Mutex::new(CycleSnapshot::default()),
                stop: StopSignal::default(),
            }),
            poll_thread: Mutex::new(None),
            writer: Mutex::new(None),
            live_counters: Mutex::new(None),
        }
    }

    /// Production wiring: QEMU procfs backend plus InfluxDB sink.
    pub fn with_defaults(config: CollectorConfig) -> Self {
        let cache_ttl = config.device_cache_ttl;
        let url = config.sink_url.clone();
        let db = config.sink_database.clone();
        let token = config.sink_token.clone();
        Self::new(
            config,
            Box::new(move || Box::new(QemuProcfsHypervisor::new(cache_ttl))),
            Box::new(move || Box::new(InfluxSink::new(&url, &db, &token))),
        )
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Start the pipeline. A no-op when already running. Fails without side
    /// effects on invalid configuration or when the initial hypervisor
    /// connection cannot be established.
    pub fn start(&self) -> Result<()> {
        let _transition = self.transitions.lock().unwrap();
        if *self.state.lock().unwrap() != CollectorState::Stopped {
            debug!("start ignored, collector already running");
            return Ok(());
        }
        self.config.validate()?;
        *self.state.lock().unwrap() = CollectorState::Starting;

        let mut hypervisor = (self.hypervisor_factory)();
        if let Err(e) = hypervisor.connect() {
            *self.state.lock().unwrap() = CollectorState::Stopped;
            return Err(e);
        }

        *self.inner.stats.lock().unwrap() = CycleStats::default();
        *self.inner.snapshot.lock().unwrap() = CycleSnapshot::default();
        self.inner.stop.reset();

        let writer = BatchWriter::start(self.config.writer_config(), (self.sink_factory)());
        let handle = writer.handle();
        *self.live_counters.lock().unwrap() = Some(writer.counters());
        *self.writer.lock().unwrap() = Some(writer);

        let inner = Arc::clone(&self.inner);
        let config = self.config.clone();
        let join = thread::spawn(move || poll_loop(inner, config, hypervisor, handle));
        *self.poll_thread.lock().unwrap() = Some(join);

        *self.state.lock().unwrap() = CollectorState::Running;
        info!("collector started");
        Ok(())
    }

    /// Stop the pipeline: wake and join the poll loop, flush the writer
    /// within its grace period, freeze the written/dropped totals. A no-op
    /// unless running.
    pub fn stop(&self) {
        let _transition = self.transitions.lock().unwrap();
        if *self.state.lock().unwrap() != CollectorState::Running {
            debug!("stop ignored, collector not running");
            return;
        }
        *self.state.lock().unwrap() = CollectorState::Stopping;
        self.inner.stop.trigger();

        if let Some(join) = self.poll_thread.lock().unwrap().take() {
            let _ = join.join();
        }
        if let Some(writer) = self.writer.lock().unwrap().take() {
            writer.stop();
        }
        if let Some(counters) = self.live_counters.lock().unwrap().take() {
            let mut stats = self.inner.stats.lock().unwrap();
            stats.frozen_written = counters.written();
            stats.frozen_dropped = counters.dropped();
        }

        *self.state.lock().unwrap() = CollectorState::Stopped;
        info!("collector stopped");
    }

    pub fn state(&self) -> CollectorState {
        *self.state.lock().unwrap()
    }

    pub fn status(&self) -> CollectorStatus {
        let state = self.state();
        let stats = self.inner.stats.lock().unwrap();
        let (written, dropped) = match self.live_counters.lock().unwrap().as_ref() {
            Some(counters) => (counters.written(), counters.dropped()),
            None => (stats.frozen_written, stats.frozen_dropped),
        };
        CollectorStatus {
            state,
            cycles_completed: stats.cycles_completed,
            vms_monitored: stats.vms_monitored,
            samples_written: written,
            samples_dropped: dropped,
            errors: stats.errors,
            last_cycle_unix_ms: stats.last_cycle_unix_ms,
        }
    }

    /// VM identities from the last completed cycle.
    pub fn vms(&self) -> Vec<VmIdentity> {
        self.inner.snapshot.lock().unwrap().vms.clone()
    }

    /// Raw and derived samples for one VM from the last completed cycle.
    pub fn vm_metrics(&self, vm_id: u32) -> Option<VmMetricsView> {
        self.inner.snapshot.lock().unwrap().metrics.get(&vm_id).cloned()
    }
}

fn poll_loop(
    inner: Arc<Inner>,
    config: CollectorConfig,
    mut hypervisor: Box<dyn Hypervisor>,
    handle: WriterHandle,
) {
    let mut features = RateFeatureComputer::new(config.transform);
    loop {
        if inner.stop.is_set() {
            break;
        }
        let cycle_start = Instant::now();
        run_cycle(&inner, hypervisor.as_mut(), &handle, &mut features);
        let remaining = config.poll_interval.saturating_sub(cycle_start.elapsed());
        if !remaining.is_zero() && inner.stop.wait(remaining) {
            break;
        }
    }
    hypervisor.close();
    debug!("poll loop exited");
}

/// One polling cycle. Errors are counted and logged, never propagated; a
/// per-VM extraction failure skips that VM only.
fn run_cycle(
    inner: &Inner,
    hypervisor: &mut dyn Hypervisor,
    handle: &WriterHandle,
    features: &mut RateFeatureComputer,
) {
    let cycle_start = Instant::now();
    let cycle_ts = SystemTime::now();

    if !hypervisor.is_connected() {
        if let Err(e) = hypervisor.connect() {
            warn!("hypervisor reconnect failed: {e}");
            inner.stats.lock().unwrap().errors += 1;
            return;
        }
        info!("hypervisor reconnected");
    }

    let vms = match hypervisor.list_live_vms() {
        Ok(vms) => vms,
        Err(e) => {
            warn!("listing VMs failed: {e}");
            inner.stats.lock().unwrap().errors += 1;
            return;
        }
    };

    let mut snapshot = CycleSnapshot {
        vms: vms.clone(),
        metrics: HashMap::with_capacity(vms.len()),
    };
    let mut cycle_errors = 0u64;
    let mut feature_time = Duration::ZERO;

    for vm in &vms {
        let raw = match hypervisor.extract_metrics(vm) {
            Ok(raw) => raw,
            Err(e) => {
                debug!("metric extraction failed: {e}");
                cycle_errors += 1;
                continue;
            }
        };

        let mut derived = Vec::new();
        for sample in &raw {
            handle.enqueue(lineproto::encode_raw_sample(vm, sample));
            // Rate features derive from per-VM totals, not per-device rows.
            if sample.device.is_some() {
                continue;
            }
            let feature_start = Instant::now();
            for &(field, value) in &sample.fields {
                if !field.is_rate_feature() {
                    continue;
                }
                if let Some(d) = features.compute(vm.id, field, value as f64, sample.timestamp) {
                    handle.enqueue(lineproto::encode_derived_sample(vm, &d));
                    derived.push(d);
                }
            }
            feature_time += feature_start.elapsed();
        }

        snapshot.metrics.insert(
            vm.id,
            VmMetricsView {
                identity: vm.clone(),
                raw,
                derived,
            },
        );
    }

    let live: HashSet<u32> = vms.iter().map(|vm| vm.id).collect();
    features.retain_vms(&live);

    let loop_ms = cycle_start.elapsed().as_secs_f64() * 1000.0;
    let feature_ms = feature_time.as_secs_f64() * 1000.0;
    handle.enqueue(lineproto::encode_latency(feature_ms, loop_ms, cycle_ts));

    *inner.snapshot.lock().unwrap() = snapshot;

    let mut stats = inner.stats.lock().unwrap();
    stats.cycles_completed += 1;
    stats.vms_monitored = vms.len();
    stats.errors += cycle_errors;
    stats.last_cycle_unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
}
