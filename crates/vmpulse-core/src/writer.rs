//! Batched metric writer with a bounded queue and a background flush loop.
//!
//! Records enter through [`WriterHandle::enqueue`] and leave in sealed
//! batches: a batch flushes when it reaches `max_batch_lines` or when its
//! oldest record reaches `max_batch_age`, whichever comes first. A full
//! queue resolves per the configured backpressure policy; nothing grows
//! unbounded and nothing disappears without hitting the dropped counter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TelemetryError};

/// Behavior when the bounded queue is at capacity.
///
/// In config files: `"drop_oldest"` or `{"block": {"timeout": 0.5}}` with
/// the timeout in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Evict the oldest queued record to make room, counting it dropped.
    DropOldest,
    /// Block the caller up to the timeout; on timeout the incoming record
    /// is counted dropped.
    Block {
        #[serde(with = "crate::config::duration_secs")]
        timeout: Duration,
    },
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::DropOldest
    }
}

/// Destination for sealed batches of line-protocol records.
pub trait MetricSink: Send {
    /// Write one newline-joined payload. An `Err` is treated as transient
    /// and retried by the flush loop.
    fn write_lines(&mut self, payload: &str) -> Result<()>;
}

/// InfluxDB v3 line-protocol sink (`/api/v3/write_lp`, ns precision).
pub struct InfluxSink {
    agent: ureq::Agent,
    endpoint: String,
    auth: String,
}

impl InfluxSink {
    pub fn new(url: &str, database: &str, token: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(10))
            .build();
        let endpoint = format!(
            "{}/api/v3/write_lp?db={}&precision=ns",
            url.trim_end_matches('/'),
            database
        );
        Self {
            agent,
            endpoint,
            auth: format!("Bearer {token}"),
        }
    }
}

impl MetricSink for InfluxSink {
    fn write_lines(&mut self, payload: &str) -> Result<()> {
        match self
            .agent
            .post(&self.endpoint)
            .set("Authorization", &self.auth)
            .send_string(payload)
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, resp)) => {
                let body: String = resp
                    .into_string()
                    .unwrap_or_default()
                    .chars()
                    .take(200)
                    .collect();
                Err(TelemetryError::SinkWrite(format!("HTTP {code}: {body}")))
            }
            Err(e) => Err(TelemetryError::SinkWrite(e.to_string())),
        }
    }
}

/// Shared written/dropped accounting, readable from any thread.
#[derive(Debug, Default)]
pub struct WriterCounters {
    written: AtomicU64,
    dropped: AtomicU64,
}

impl WriterCounters {
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

/// Writer tuning knobs; see [`crate::config::CollectorConfig`] for defaults.
#[derive(Debug, Clone, Copy)]
pub struct BatchWriterConfig {
    pub queue_capacity: usize,
    pub max_batch_lines: usize,
    pub max_batch_age: Duration,
    pub backpressure: BackpressurePolicy,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub stop_grace: Duration,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 20_000,
            max_batch_lines: 2_000,
            max_batch_age: Duration::from_secs(1),
            backpressure: BackpressurePolicy::DropOldest,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            stop_grace: Duration::from_secs(5),
        }
    }
}

struct Shared {
    queue: Mutex<VecDeque<String>>,
    data: Condvar,
    space: Condvar,
    stopping: AtomicBool,
    counters: Arc<WriterCounters>,
    capacity: usize,
    policy: BackpressurePolicy,
}

impl Shared {
    fn new(cfg: &BatchWriterConfig) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(cfg.queue_capacity.min(4096))),
            data: Condvar::new(),
            space: Condvar::new(),
            stopping: AtomicBool::new(false),
            counters: Arc::new(WriterCounters::default()),
            capacity: cfg.queue_capacity,
            policy: cfg.backpressure,
        }
    }

    fn drop_records(&self, n: u64) {
        self.counters.dropped.fetch_add(n, Ordering::SeqCst);
    }
}

/// Cheap cloneable producer handle for the poll loop.
#[derive(Clone)]
pub struct WriterHandle {
    shared: Arc<Shared>,
}

impl WriterHandle {
    /// Append a record. Returns false if it was refused (writer stopping,
    /// or block-policy timeout); refusals are already counted as dropped.
    pub fn enqueue(&self, line: String) -> bool {
        let shared = &self.shared;
        if shared.stopping.load(Ordering::SeqCst) {
            shared.drop_records(1);
            return false;
        }

        let mut q = shared.queue.lock().unwrap();
        if q.len() >= shared.capacity {
            match shared.policy {
                BackpressurePolicy::DropOldest => {
                    q.pop_front();
                    shared.drop_records(1);
                }
                BackpressurePolicy::Block { timeout } => {
                    let deadline = Instant::now() + timeout;
                    while q.len() >= shared.capacity && !shared.stopping.load(Ordering::SeqCst) {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        let (guard, _) = shared.space.wait_timeout(q, remaining).unwrap();
                        q = guard;
                    }
                    if q.len() >= shared.capacity {
                        shared.drop_records(1);
                        return false;
                    }
                }
            }
        }
        q.push_back(line);
        drop(q);
        shared.data.notify_one();
        true
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    pub fn counters(&self) -> Arc<WriterCounters> {
        Arc::clone(&self.shared.counters)
    }
}

/// Owner of the background flush thread.
pub struct BatchWriter {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl BatchWriter {
    /// Spawn the flush loop over the given sink.
    pub fn start(cfg: BatchWriterConfig, sink: Box<dyn MetricSink>) -> Self {
        let shared = Arc::new(Shared::new(&cfg));
        let loop_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || run_loop(loop_shared, cfg, sink));
        info!("metric batch writer started");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> WriterHandle {
        WriterHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn counters(&self) -> Arc<WriterCounters> {
        Arc::clone(&self.shared.counters)
    }

    /// Stop accepting records, flush what is buffered within the grace
    /// period, and join the flush thread. Unflushed records count as dropped.
    pub fn stop(mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.data.notify_all();
        self.shared.space.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        info!("metric batch writer stopped");
    }
}

fn run_loop(shared: Arc<Shared>, cfg: BatchWriterConfig, mut sink: Box<dyn MetricSink>) {
    let mut batch: Vec<String> = Vec::new();
    let mut batch_opened: Option<Instant> = None;
    let mut stop_deadline: Option<Instant> = None;

    loop {
        if shared.stopping.load(Ordering::SeqCst) && stop_deadline.is_none() {
            stop_deadline = Some(Instant::now() + cfg.stop_grace);
        }
        if let Some(deadline) = stop_deadline {
            if Instant::now() >= deadline {
                let mut q = shared.queue.lock().unwrap();
                let remaining = (q.len() + batch.len()) as u64;
                q.clear();
                drop(q);
                batch.clear();
                if remaining > 0 {
                    shared.drop_records(remaining);
                    warn!("stop grace expired, dropped {remaining} buffered record(s)");
                }
                break;
            }
        }

        // Drain the queue; when idle, wait just long enough that an
        // age-based flush still fires during quiet periods.
        {
            let mut q = shared.queue.lock().unwrap();
            if q.is_empty() && !shared.stopping.load(Ordering::SeqCst) {
                let wait = match batch_opened {
                    Some(opened) => cfg.max_batch_age.saturating_sub(opened.elapsed()),
                    None => cfg.max_batch_age,
                };
                let wait = wait.max(Duration::from_millis(1));
                let (guard, _) = shared.data.wait_timeout(q, wait).unwrap();
                q = guard;
            }
            while batch.len() < cfg.max_batch_lines {
                match q.pop_front() {
                    Some(line) => batch.push(line),
                    None => break,
                }
            }
        }
        shared.space.notify_all();

        if !batch.is_empty() && batch_opened.is_none() {
            batch_opened = Some(Instant::now());
        }

        let stopping = shared.stopping.load(Ordering::SeqCst);
        let size_due = batch.len() >= cfg.max_batch_lines;
        let age_due = batch_opened.is_some_and(|opened| opened.elapsed() >= cfg.max_batch_age);
        if !batch.is_empty() && (size_due || age_due || stopping) {
            flush_with_retry(&shared, &cfg, sink.as_mut(), &mut batch);
            batch_opened = None;
        }

        if stopping && batch.is_empty() && shared.queue.lock().unwrap().is_empty() {
            break;
        }
    }
}

fn flush_with_retry(
    shared: &Shared,
    cfg: &BatchWriterConfig,
    sink: &mut dyn MetricSink,
    batch: &mut Vec<String>,
) {
    let n = batch.len() as u64;
    let payload = batch.join("\n");
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match sink.write_lines(&payload) {
            Ok(()) => {
                shared.counters.written.fetch_add(n, Ordering::SeqCst);
                debug!("flushed {n} record(s) to sink");
                break;
            }
            Err(e) if attempt >= cfg.retry_attempts => {
                error!("sink write failed after {attempt} attempt(s), dropping {n} record(s): {e}");
                shared.drop_records(n);
                break;
            }
            Err(e) => {
                warn!(
                    "sink write failed (attempt {attempt}/{}): {e}",
                    cfg.retry_attempts
                );
                if shared.stopping.load(Ordering::SeqCst) {
                    // Shutting down: no backoff budget left to spend.
                    warn!("dropping {n} record(s) during shutdown");
                    shared.drop_records(n);
                    break;
                }
                thread::sleep(cfg.retry_backoff * attempt);
            }
        }
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    // -----------------------------------------------------------------------
    // Mock sinks
    // -----------------------------------------------------------------------

    /// Records every flushed payload.
    struct MemorySink {
        lines: Arc<Mutex<Vec<String>>>,
        flushes: Arc<AtomicU32>,
    }

    impl MemorySink {
        fn new() -> (Self, Arc<Mutex<Vec<String>>>, Arc<AtomicU32>) {
            let lines = Arc::new(Mutex::new(Vec::new()));
            let flushes = Arc::new(AtomicU32::new(0));
            (
                Self {
                    lines: Arc::clone(&lines),
                    flushes: Arc::clone(&flushes),
                },
                lines,
                flushes,
            )
        }
    }

    impl MetricSink for MemorySink {
        fn write_lines(&mut self, payload: &str) -> Result<()> {
            let mut lines = self.lines.lock().unwrap();
            lines.extend(payload.lines().map(String::from));
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Always fails, counting attempts.
    struct FailingSink {
        attempts: Arc<AtomicU32>,
    }

    impl MetricSink for FailingSink {
        fn write_lines(&mut self, _payload: &str) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TelemetryError::SinkWrite("sink unreachable".to_string()))
        }
    }

    fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        pred()
    }

    fn quick_cfg() -> BatchWriterConfig {
        BatchWriterConfig {
            queue_capacity: 100,
            max_batch_lines: 10,
            max_batch_age: Duration::from_millis(50),
            backpressure: BackpressurePolicy::DropOldest,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            stop_grace: Duration::from_secs(2),
        }
    }

    // -----------------------------------------------------------------------
    // Flush triggers
    // -----------------------------------------------------------------------

    #[test]
    fn test_size_triggered_flush() {
        let cfg = BatchWriterConfig {
            max_batch_lines: 3,
            max_batch_age: Duration::from_secs(60),
            ..quick_cfg()
        };
        let (sink, lines, _) = MemorySink::new();
        let writer = BatchWriter::start(cfg, Box::new(sink));
        let handle = writer.handle();
        for i in 0..3 {
            assert!(handle.enqueue(format!("m v={i}i 1")));
        }
        // max_batch_age is a minute away: only the size cap can fire this.
        assert!(wait_until(Duration::from_secs(2), || lines
            .lock()
            .unwrap()
            .len()
            == 3));
        assert_eq!(writer.counters().written(), 3);
        writer.stop();
    }

    #[test]
    fn test_age_triggered_flush_with_single_record() {
        let cfg = BatchWriterConfig {
            max_batch_lines: 1000,
            max_batch_age: Duration::from_millis(50),
            ..quick_cfg()
        };
        let (sink, lines, _) = MemorySink::new();
        let writer = BatchWriter::start(cfg, Box::new(sink));
        writer.handle().enqueue("m v=1i 1".to_string());
        assert!(wait_until(Duration::from_secs(2), || lines
            .lock()
            .unwrap()
            .len()
            == 1));
        writer.stop();
    }

    // -----------------------------------------------------------------------
    // Backpressure
    // -----------------------------------------------------------------------

    #[test]
    fn test_drop_oldest_at_capacity() {
        // No flush thread: exercise the queue policy directly.
        let cfg = BatchWriterConfig {
            queue_capacity: 2,
            ..quick_cfg()
        };
        let handle = WriterHandle {
            shared: Arc::new(Shared::new(&cfg)),
        };
        assert!(handle.enqueue("a".to_string()));
        assert!(handle.enqueue("b".to_string()));
        assert!(handle.enqueue("c".to_string()));
        assert_eq!(handle.queue_len(), 2);
        assert_eq!(handle.counters().dropped(), 1);
        let q = handle.shared.queue.lock().unwrap();
        assert_eq!(q.front().unwrap(), "b");
        assert_eq!(q.back().unwrap(), "c");
    }

    #[test]
    fn test_block_policy_times_out_and_drops_incoming() {
        let cfg = BatchWriterConfig {
            queue_capacity: 1,
            backpressure: BackpressurePolicy::Block {
                timeout: Duration::from_millis(20),
            },
            ..quick_cfg()
        };
        let handle = WriterHandle {
            shared: Arc::new(Shared::new(&cfg)),
        };
        assert!(handle.enqueue("a".to_string()));
        let t0 = Instant::now();
        assert!(!handle.enqueue("b".to_string()));
        assert!(t0.elapsed() >= Duration::from_millis(20));
        assert_eq!(handle.counters().dropped(), 1);
        assert_eq!(handle.queue_len(), 1);
    }

    #[test]
    fn test_block_policy_proceeds_when_space_frees() {
        let cfg = BatchWriterConfig {
            queue_capacity: 1,
            backpressure: BackpressurePolicy::Block {
                timeout: Duration::from_secs(2),
            },
            ..quick_cfg()
        };
        let shared = Arc::new(Shared::new(&cfg));
        let handle = WriterHandle {
            shared: Arc::clone(&shared),
        };
        assert!(handle.enqueue("a".to_string()));

        let popper = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                shared.queue.lock().unwrap().pop_front();
                shared.space.notify_all();
            })
        };
        assert!(handle.enqueue("b".to_string()));
        popper.join().unwrap();
        assert_eq!(handle.counters().dropped(), 0);
    }

    // -----------------------------------------------------------------------
    // Retry and drop accounting
    // -----------------------------------------------------------------------

    #[test]
    fn test_retry_exhaustion_converts_batch_to_dropped() {
        let cfg = BatchWriterConfig {
            max_batch_lines: 2,
            max_batch_age: Duration::from_secs(60),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            ..quick_cfg()
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let sink = FailingSink {
            attempts: Arc::clone(&attempts),
        };
        let writer = BatchWriter::start(cfg, Box::new(sink));
        let handle = writer.handle();
        handle.enqueue("a".to_string());
        handle.enqueue("b".to_string());

        let counters = writer.counters();
        assert!(wait_until(Duration::from_secs(2), || counters.dropped() == 2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(counters.written(), 0);

        // Pipeline still accepts records afterwards.
        assert!(handle.enqueue("c".to_string()));
        writer.stop();
    }

    // -----------------------------------------------------------------------
    // Stop semantics
    // -----------------------------------------------------------------------

    #[test]
    fn test_stop_flushes_buffered_records() {
        let cfg = BatchWriterConfig {
            max_batch_lines: 1000,
            max_batch_age: Duration::from_secs(60),
            ..quick_cfg()
        };
        let (sink, lines, _) = MemorySink::new();
        let writer = BatchWriter::start(cfg, Box::new(sink));
        let handle = writer.handle();
        for i in 0..5 {
            handle.enqueue(format!("m v={i}i 1"));
        }
        let counters = writer.counters();
        writer.stop();
        assert_eq!(lines.lock().unwrap().len(), 5);
        assert_eq!(counters.written(), 5);
        assert_eq!(counters.dropped(), 0);
    }

    #[test]
    fn test_enqueue_after_stop_is_refused_and_counted() {
        let (sink, _, _) = MemorySink::new();
        let writer = BatchWriter::start(quick_cfg(), Box::new(sink));
        let handle = writer.handle();
        let counters = writer.counters();
        writer.stop();
        assert!(!handle.enqueue("late".to_string()));
        assert_eq!(counters.dropped(), 1);
    }

    #[test]
    fn test_counters_frozen_after_stop() {
        let (sink, _, _) = MemorySink::new();
        let writer = BatchWriter::start(quick_cfg(), Box::new(sink));
        let handle = writer.handle();
        handle.enqueue("a".to_string());
        let counters = writer.counters();
        writer.stop();
        let total = counters.written() + counters.dropped();
        assert_eq!(total, 1);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counters.written() + counters.dropped(), total);
    }
}
