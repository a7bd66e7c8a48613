//! # Worker Pool
//!
//! A pool of OS threads, each repeatedly dequeuing a `Req`, invoking its
//! protocol handler, and releasing its reference — per spec.md §4.5/§5. Each
//! worker owns one pre-allocated `WaitEntry` for its whole lifetime and reuses
//! it across every park, rather than allocating one per park cycle.
//!
//! Threads are optionally pinned to specific CPU cores via `core_affinity`,
//! to control where latency-sensitive work runs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::metrics::Collector;
use crate::queue::MultiQueue;
use crate::req::{HandlerOutcome, Req};
use crate::waitlist::{WaitEntry, Waitlist};

/// Default handler used when a `Req` was enqueued without a function
/// descriptor bound (should not happen in practice; guards against a panic
/// on a malformed request rather than crashing a worker thread).
fn missing_handler(req: &Req) -> HandlerOutcome {
    warn!(xid = req.header.xid, "request has no bound handler, dropping");
    HandlerOutcome::Dropped
}

/// Cooperative shutdown flag shared by every channel and every worker.
/// Checked at every waitlist wakeup (spurious or real), giving shutdown a
/// worst-case latency of one 5-second timed wait, per spec.md §5.
#[derive(Clone)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A running pool of worker threads.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: ShutdownFlag,
    active: Arc<AtomicUsize>,
    waitlist: Arc<Waitlist>,
}

impl WorkerPool {
    /// Spawn `count` worker threads against `queue`/`waitlist`. `core_ids`,
    /// when provided, pins worker `i` to `core_ids[i % core_ids.len()]`.
    /// `metrics` records each dispatched request's time spent in queue,
    /// per SPEC_FULL.md's observability surface.
    pub fn spawn(
        count: usize,
        queue: Arc<MultiQueue>,
        waitlist: Arc<Waitlist>,
        core_ids: Option<Vec<core_affinity::CoreId>>,
        metrics: Arc<Collector>,
    ) -> Self {
        let shutdown = ShutdownFlag::new();
        let active = Arc::new(AtomicUsize::new(count));
        let mut handles = Vec::with_capacity(count);

        for worker_id in 0..count {
            let queue = queue.clone();
            let waitlist = waitlist.clone();
            let shutdown = shutdown.clone();
            let active = active.clone();
            let metrics = metrics.clone();
            let pin = core_ids
                .as_ref()
                .map(|ids| ids[worker_id % ids.len()]);

            let builder = std::thread::Builder::new().name(format!("nfs-worker-{worker_id}"));
            let handle = builder
                .spawn(move || {
                    if let Some(core_id) = pin {
                        if !core_affinity::set_for_current(core_id) {
                            warn!(worker_id, ?core_id, "failed to pin worker to core");
                        }
                    }
                    run_worker_loop(worker_id, &queue, &waitlist, &shutdown, &metrics);
                    active.fetch_sub(1, Ordering::AcqRel);
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        info!(count, "worker pool started");
        Self {
            handles,
            shutdown,
            active,
            waitlist,
        }
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Signal cooperative shutdown and join every worker thread. All workers
    /// are expected to exit within the waitlist's 5-second timed-wait bound
    /// once signalled; this gives that bound a small margin, then logs by
    /// name which workers (if any) haven't observed shutdown yet, rather
    /// than joining silently forever.
    pub fn join(self) {
        self.shutdown.signal();
        // Parked workers would otherwise wait out their own 5-second timed
        // wait before re-checking `should_break`; wake them immediately so
        // shutdown is prompt without weakening the waitlist's normal
        // one-handoff-per-enqueue contract.
        self.waitlist.wake_all();

        let deadline = Instant::now() + SHUTDOWN_OBSERVE_BOUND;
        while self.active_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        let stragglers = self.active_count();
        if stragglers > 0 {
            warn!(
                stragglers,
                bound_secs = SHUTDOWN_OBSERVE_BOUND.as_secs(),
                "worker(s) had not observed shutdown within the expected bound, still waiting for them to exit"
            );
        }

        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Margin over the waitlist's 5-second timed wait within which every worker
/// is expected to observe `SHUTDOWN` and exit.
const SHUTDOWN_OBSERVE_BOUND: Duration = Duration::from_secs(6);

fn run_worker_loop(
    worker_id: usize,
    queue: &MultiQueue,
    waitlist: &Waitlist,
    shutdown: &ShutdownFlag,
    metrics: &Collector,
) {
    let entry = WaitEntry::new();
    let should_break = || shutdown.is_set();

    loop {
        let req = match queue.dequeue_blocking(waitlist, &entry, &should_break) {
            Some(req) => req,
            None => {
                debug!(worker_id, "worker exiting on cooperative shutdown");
                return;
            }
        };
        if let Some(queue_time) = req.time_in_queue() {
            metrics.record(queue_time);
        }
        dispatch_one(&req);
    }
}

/// Invoke the bound protocol handler and release the request, mirroring
/// spec.md §4.5's "dequeues a Req, invokes the appropriate protocol handler
/// via the request's function descriptor, releases its reference". The
/// refcount handed to `dequeue_blocking`'s caller represents both the
/// queue's membership reference and the handler-runner's reference (spec.md
/// §3: bumped from 1 to 2 before enqueue); this function retires both in
/// order, releasing the transport once the second hits zero.
fn dispatch_one(req: &Arc<Req>) {
    // Leaving queue membership.
    req.release();

    let handler = req.handler.unwrap_or(missing_handler);
    let outcome = handler(req);
    debug!(xid = req.header.xid, ?outcome, "handler completed");

    // The handler-runner's own reference.
    if req.release() == 0 {
        if req.xprt.release() == 0 {
            info!(xprt_id = req.xprt.id, "transport destroyed");
        }
    }
}
