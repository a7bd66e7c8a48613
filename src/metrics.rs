//! # Dispatch Metrics
//!
//! A `Collector` holding a queue-time latency histogram plus the raw
//! counters `queue.rs` already exposes (`enqueued_reqs`, `dequeued_reqs`,
//! `outstanding_reqs_est`), reduced to a plain `DispatchMetrics` snapshot on
//! demand, per SPEC_FULL.md §F. This follows the same shape as the
//! `LatencyCollector`/`get_metrics()` pair this crate started from — an
//! `HdrHistogram` doing the O(1) recording, a small struct with percentile
//! values handed back to the caller — just repointed at queue wait time
//! instead of IPC round-trip time.

use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

use crate::queue::MultiQueue;

/// One percentile/value pair, nanoseconds.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_ns: u64,
}

/// A point-in-time snapshot of dispatch-core load, suitable for logging at
/// `info` on shutdown or returning from a handle method, per SPEC_FULL.md §F.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchMetrics {
    pub enqueued_reqs: u64,
    pub dequeued_reqs: u64,
    pub outstanding_reqs_est: usize,
    pub queue_time_samples: u64,
    pub queue_time_min_ns: u64,
    pub queue_time_max_ns: u64,
    pub queue_time_mean_ns: f64,
    pub queue_time_percentiles: Vec<PercentileValue>,
}

/// Default percentiles reported when a caller doesn't ask for specific ones.
pub const DEFAULT_PERCENTILES: &[f64] = &[50.0, 95.0, 99.0, 99.9];

/// Accumulates queue-time-in-queue samples into an HDR histogram and reduces
/// them, alongside a `MultiQueue`'s own counters, into a `DispatchMetrics`
/// snapshot. One `Collector` is shared by every worker via the dispatcher
/// handle, each call to `record` protected by a lock — recording happens
/// once per dequeue, not once per frame byte, so contention here is never
/// the bottleneck the queue/waitlist pair are built to avoid.
pub struct Collector {
    histogram: Mutex<Histogram<u64>>,
}

impl Collector {
    pub fn new() -> Self {
        // Three significant decimal digits, same precision the teacher's
        // `LatencyCollector` used for IPC round-trip latency.
        let histogram = Histogram::<u64>::new(3).expect("valid histogram sigfigs");
        Self { histogram: Mutex::new(histogram) }
    }

    /// Record one request's time spent parked in a queue before dispatch.
    pub fn record(&self, queue_time: Duration) {
        let ns = queue_time.as_nanos().min(u128::from(u64::MAX)) as u64;
        let mut h = self.histogram.lock();
        // A value that overflows the histogram's configured range is
        // clamped to the max trackable value rather than dropped, so an
        // outlier never silently vanishes from the sample count.
        let clamped = ns.min(h.high());
        let _ = h.record(clamped);
    }

    /// Reduce the histogram plus `queue`'s live counters into a snapshot.
    pub fn snapshot(&self, queue: &MultiQueue, percentiles: &[f64]) -> DispatchMetrics {
        let h = self.histogram.lock();
        let queue_time_percentiles = percentiles
            .iter()
            .map(|&p| PercentileValue { percentile: p, value_ns: h.value_at_percentile(p) })
            .collect();

        DispatchMetrics {
            enqueued_reqs: queue.enqueued_reqs(),
            dequeued_reqs: queue.dequeued_reqs(),
            outstanding_reqs_est: queue.outstanding_reqs_est(),
            queue_time_samples: h.len(),
            queue_time_min_ns: if h.is_empty() { 0 } else { h.min() },
            queue_time_max_ns: h.max(),
            queue_time_mean_ns: h.mean(),
            queue_time_percentiles,
        }
    }

    pub fn reset(&self) {
        self.histogram.lock().reset();
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::req::{Lookahead, Req, ReqKind, RpcHeader};
    use crate::waitlist::Waitlist;
    use crate::xprt::{Family, Protocol, Role, Xprt, XprtIo};
    use std::sync::Arc;

    fn fake_xprt() -> Arc<Xprt> {
        let handle = crate::testutil::background_runtime_handle();
        let _guard = handle.enter();
        let std_sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        std_sock.set_nonblocking(true).unwrap();
        Xprt::new(
            1,
            Family::Inet4,
            Role::Datagram,
            Protocol::Nfs,
            None,
            None,
            XprtIo::Udp(tokio::net::UdpSocket::from_std(std_sock).unwrap()),
        )
    }

    #[test]
    fn empty_collector_snapshot_has_zero_samples() {
        let collector = Collector::new();
        let queue = MultiQueue::new();
        let snap = collector.snapshot(&queue, DEFAULT_PERCENTILES);
        assert_eq!(snap.queue_time_samples, 0);
        assert_eq!(snap.queue_time_min_ns, 0);
    }

    #[test]
    fn recorded_sample_is_reflected_in_percentiles() {
        let collector = Collector::new();
        for _ in 0..10 {
            collector.record(Duration::from_millis(5));
        }
        let queue = MultiQueue::new();
        let snap = collector.snapshot(&queue, &[50.0, 99.0]);
        assert_eq!(snap.queue_time_samples, 10);
        assert!(snap.queue_time_percentiles[0].value_ns >= Duration::from_millis(4).as_nanos() as u64);
    }

    #[test]
    fn snapshot_reflects_live_queue_counters() {
        let collector = Collector::new();
        let queue = MultiQueue::new();
        let waitlist = Waitlist::new();
        let header = RpcHeader { xid: 1, program: 100003, version: 3, procedure: 0, cred_flavor: 1 };
        let req = Arc::new(Req::new(ReqKind::NfsRequest, fake_xprt(), header, Lookahead::default()));
        assert!(queue.enqueue(req, &waitlist));

        let snap = collector.snapshot(&queue, DEFAULT_PERCENTILES);
        assert_eq!(snap.enqueued_reqs, 1);
        assert_eq!(snap.dequeued_reqs, 0);
    }

    #[test]
    fn reset_clears_previously_recorded_samples() {
        let collector = Collector::new();
        collector.record(Duration::from_micros(50));
        collector.reset();
        let queue = MultiQueue::new();
        let snap = collector.snapshot(&queue, DEFAULT_PERCENTILES);
        assert_eq!(snap.queue_time_samples, 0);
    }
}
