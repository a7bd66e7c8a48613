//! # Request Classifier + Multi-Queue
//!
//! Four queues — MOUNT, CALL, LOW_LATENCY, HIGH_LATENCY — each a pair of
//! singly-locked producer/consumer sub-queues with tail-splice, per spec.md
//! §3/§4.4. This module owns classification, enqueue, and the worker-side
//! dequeue scan; it does not itself own the waitlist (see `waitlist.rs`) but
//! drives it directly, since the enqueue-time handoff and the dequeue-time
//! park/wake are both defined in terms of queue state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::req::{Lookahead, Req, ReqKind};
use crate::waitlist::{WaitEntry, Waitlist};

/// The four priority classes spec.md §4.4 defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Mount,
    Call,
    LowLatency,
    HighLatency,
}

const QUEUE_COUNT: usize = 4;
const QUEUE_ORDER: [QueueKind; QUEUE_COUNT] = [
    QueueKind::Mount,
    QueueKind::Call,
    QueueKind::LowLatency,
    QueueKind::HighLatency,
];

/// Classify a request per spec.md §4.4's table. Returns `None` for a kind
/// that has no home queue, which the caller treats as a silent drop.
pub fn classify(kind: ReqKind, lookahead: Lookahead) -> Option<QueueKind> {
    match kind {
        ReqKind::NfsRequest if lookahead.mount => Some(QueueKind::Mount),
        ReqKind::NfsRequest if lookahead.high_latency => Some(QueueKind::HighLatency),
        ReqKind::NfsRequest => Some(QueueKind::LowLatency),
        ReqKind::NfsCall => Some(QueueKind::Call),
        ReqKind::NinePRequest => Some(QueueKind::LowLatency),
    }
}

/// One producer or consumer sub-queue: an ordered sequence of requests with
/// its own lock and a size counter kept in lockstep, per spec.md §3.
struct SubQueue {
    items: Mutex<VecDeque<Arc<Req>>>,
    size: AtomicUsize,
}

impl SubQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            size: AtomicUsize::new(0),
        }
    }

    fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }
}

/// A producer/consumer pair backing one `QueueKind`.
struct QueuePair {
    producer: SubQueue,
    consumer: SubQueue,
}

impl QueuePair {
    fn new() -> Self {
        Self {
            producer: SubQueue::new(),
            consumer: SubQueue::new(),
        }
    }

    fn push(&self, req: Arc<Req>) {
        let mut guard = self.producer.items.lock();
        guard.push_back(req);
        self.producer.size.fetch_add(1, Ordering::AcqRel);
    }

    /// Pop the next request per spec.md §4.4's dequeue path: try the
    /// consumer alone first; only if it is empty, also lock the producer
    /// (consumer lock held throughout — never the reverse order) and splice.
    fn try_pop(&self) -> Option<Arc<Req>> {
        let mut consumer = self.consumer.items.lock();
        if let Some(req) = consumer.pop_front() {
            self.consumer.size.fetch_sub(1, Ordering::AcqRel);
            return Some(req);
        }

        let mut producer = self.producer.items.lock();
        if producer.is_empty() {
            return None;
        }
        let moved = producer.len();
        consumer.append(&mut producer);
        self.consumer.size.fetch_add(moved, Ordering::AcqRel);
        self.producer.size.store(0, Ordering::Release);
        drop(producer);

        let req = consumer.pop_front();
        if req.is_some() {
            self.consumer.size.fetch_sub(1, Ordering::AcqRel);
        }
        req
    }

    fn size(&self) -> usize {
        self.producer.len() + self.consumer.len()
    }
}

/// The four-queue classifier plus the bookkeeping counters spec.md §6/§8
/// requires (`enqueued_reqs`, `dequeued_reqs`, `outstanding_reqs_est`).
pub struct MultiQueue {
    queues: [QueuePair; QUEUE_COUNT],
    /// Process-wide slot counter driving the weighted round-robin scan.
    slot: AtomicUsize,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    /// Sampled every 10th dequeue attempt per spec.md §4.4.
    sample_calls: AtomicU64,
    outstanding_estimate: AtomicUsize,
}

impl Default for MultiQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiQueue {
    pub fn new() -> Self {
        Self {
            queues: [
                QueuePair::new(),
                QueuePair::new(),
                QueuePair::new(),
                QueuePair::new(),
            ],
            slot: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            sample_calls: AtomicU64::new(0),
            outstanding_estimate: AtomicUsize::new(0),
        }
    }

    fn index_of(kind: QueueKind) -> usize {
        QUEUE_ORDER.iter().position(|k| *k == kind).expect("exhaustive QueueKind")
    }

    /// Current size of one queue (producer + consumer), for tests and the
    /// integration scenarios in spec.md §8.
    pub fn queue_len(&self, kind: QueueKind) -> usize {
        self.queues[Self::index_of(kind)].size()
    }

    pub fn enqueued_reqs(&self) -> u64 {
        self.enqueued.load(Ordering::Acquire)
    }

    pub fn dequeued_reqs(&self) -> u64 {
        self.dequeued.load(Ordering::Acquire)
    }

    pub fn outstanding_reqs_est(&self) -> usize {
        self.outstanding_estimate.load(Ordering::Acquire)
    }

    /// Classify and enqueue `req`, then attempt a single waiter handoff.
    /// Returns `false` if the request's kind had no home queue and was
    /// dropped (spec.md §4.4's "other -> drop (no-op)" row).
    pub fn enqueue(&self, req: Arc<Req>, waitlist: &Waitlist) -> bool {
        let Some(kind) = classify(req.kind, req.lookahead) else {
            return false;
        };
        req.mark_enqueued();
        self.queues[Self::index_of(kind)].push(req);
        self.enqueued.fetch_add(1, Ordering::AcqRel);
        waitlist.try_handoff();
        true
    }

    /// One non-blocking scan across all four queues in weighted
    /// round-robin order starting at the next process-wide slot.
    fn try_dequeue_once(&self) -> Option<Arc<Req>> {
        let call = self.sample_calls.fetch_add(1, Ordering::AcqRel) + 1;
        if call % 10 == 0 {
            self.refresh_outstanding_estimate();
        }

        let start = self.slot.fetch_add(1, Ordering::AcqRel) % QUEUE_COUNT;
        for i in 0..QUEUE_COUNT {
            let idx = (start + i) % QUEUE_COUNT;
            if let Some(req) = self.queues[idx].try_pop() {
                self.dequeued.fetch_add(1, Ordering::AcqRel);
                return Some(req);
            }
        }
        None
    }

    fn refresh_outstanding_estimate(&self) {
        let total: usize = self.queues.iter().map(|q| q.size()).sum();
        self.outstanding_estimate.store(total, Ordering::Release);
    }

    /// Dequeue a request, blocking on `waitlist` when all four queues are
    /// empty. `should_break` is polled on every wakeup (spurious or real) as
    /// the cooperative shutdown predicate; when it returns true while
    /// parked, the worker unlinks itself and returns `None`.
    pub fn dequeue_blocking(
        &self,
        waitlist: &Waitlist,
        entry: &Arc<WaitEntry>,
        should_break: &dyn Fn() -> bool,
    ) -> Option<Arc<Req>> {
        loop {
            if let Some(req) = self.try_dequeue_once() {
                return Some(req);
            }
            if should_break() {
                return None;
            }

            waitlist.park(entry);
            loop {
                if waitlist.wait_timeout(entry, Duration::from_secs(5)) {
                    break;
                }
                if should_break() {
                    waitlist.remove_if_linked(entry);
                    return None;
                }
            }
            // Woken: flags were cleared by wait_timeout. Restart the scan
            // from the top per spec.md §4.4.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::req::RpcHeader;
    use crate::xprt::{Family, Protocol, Role, Xprt, XprtIo};
    use tokio::net::UdpSocket;

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
            XprtIo::Udp(UdpSocket::from_std(std_sock).unwrap()),
        )
    }

    fn req_with(kind: ReqKind, lookahead: Lookahead, xid: u32) -> Arc<Req> {
        Arc::new(Req::new(
            kind,
            fake_xprt(),
            RpcHeader {
                xid,
                program: 100003,
                version: 3,
                procedure: 0,
                cred_flavor: 0,
            },
            lookahead,
        ))
    }

    #[test]
    fn mount_flagged_request_classifies_to_mount_queue() {
        let mq = MultiQueue::new();
        let waitlist = Waitlist::new();
        let req = req_with(
            ReqKind::NfsRequest,
            Lookahead { mount: true, high_latency: false },
            1,
        );
        assert!(mq.enqueue(req, &waitlist));
        assert_eq!(mq.queue_len(QueueKind::Mount), 1);
        assert_eq!(mq.queue_len(QueueKind::Call), 0);
        assert_eq!(mq.queue_len(QueueKind::LowLatency), 0);
        assert_eq!(mq.queue_len(QueueKind::HighLatency), 0);

        let entry = WaitEntry::new();
        let popped = mq.dequeue_blocking(&waitlist, &entry, &|| false).unwrap();
        assert_eq!(popped.header.xid, 1);
    }

    #[test]
    fn high_latency_flagged_request_classifies_to_high_latency_queue() {
        let mq = MultiQueue::new();
        let waitlist = Waitlist::new();
        let req = req_with(
            ReqKind::NfsRequest,
            Lookahead { mount: false, high_latency: true },
            2,
        );
        assert!(mq.enqueue(req, &waitlist));
        assert_eq!(mq.queue_len(QueueKind::Mount), 0);
        assert_eq!(mq.queue_len(QueueKind::Call), 0);
        assert_eq!(mq.queue_len(QueueKind::LowLatency), 0);
        assert_eq!(mq.queue_len(QueueKind::HighLatency), 1);
    }

    #[test]
    fn splice_preserves_fifo_order_across_two_dequeues() {
        let mq = MultiQueue::new();
        let waitlist = Waitlist::new();
        for i in 0..5u32 {
            let req = req_with(ReqKind::NfsRequest, Lookahead::default(), i);
            assert!(mq.enqueue(req, &waitlist));
        }
        assert_eq!(mq.queue_len(QueueKind::LowLatency), 5);

        let entry = WaitEntry::new();
        let first = mq.dequeue_blocking(&waitlist, &entry, &|| false).unwrap();
        assert_eq!(first.header.xid, 0);
        assert_eq!(mq.queue_len(QueueKind::LowLatency), 4);

        let second = mq.dequeue_blocking(&waitlist, &entry, &|| false).unwrap();
        assert_eq!(second.header.xid, 1);
        assert_eq!(mq.queue_len(QueueKind::LowLatency), 3);
    }

    #[test]
    fn nfs_call_routes_to_call_queue() {
        let mq = MultiQueue::new();
        let waitlist = Waitlist::new();
        let req = req_with(ReqKind::NfsCall, Lookahead::default(), 9);
        assert!(mq.enqueue(req, &waitlist));
        assert_eq!(mq.queue_len(QueueKind::Call), 1);
    }

    #[test]
    fn ninep_routes_to_low_latency() {
        let mq = MultiQueue::new();
        let waitlist = Waitlist::new();
        let req = req_with(ReqKind::NinePRequest, Lookahead::default(), 10);
        assert!(mq.enqueue(req, &waitlist));
        assert_eq!(mq.queue_len(QueueKind::LowLatency), 1);
    }

    #[test]
    fn conservation_enqueued_minus_dequeued_equals_queue_sizes() {
        let mq = MultiQueue::new();
        let waitlist = Waitlist::new();
        for i in 0..7u32 {
            let lookahead = if i % 2 == 0 {
                Lookahead { mount: true, high_latency: false }
            } else {
                Lookahead::default()
            };
            mq.enqueue(req_with(ReqKind::NfsRequest, lookahead, i), &waitlist);
        }
        let entry = WaitEntry::new();
        for _ in 0..3 {
            mq.dequeue_blocking(&waitlist, &entry, &|| false);
        }
        let total_remaining: usize = [QueueKind::Mount, QueueKind::Call, QueueKind::LowLatency, QueueKind::HighLatency]
            .iter()
            .map(|k| mq.queue_len(*k))
            .sum();
        assert_eq!(mq.enqueued_reqs() - mq.dequeued_reqs(), total_remaining as u64);
    }
}
