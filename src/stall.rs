//! # Stall List
//!
//! spec.md §3's "Stall queue": a list of transports whose reads have been
//! paused due to per-connection backpressure. The core itself never pauses
//! or resumes a transport — that decision belongs to the external RPC
//! library/collaborator that owns per-connection flow control (spec.md §1)
//! — it only owns the list and the lock guarding it, per spec.md §3's "the
//! core exposes the list and a mutex."
//!
//! spec.md §5 requires this lock stay independent of the queue/waitlist
//! locking discipline: "Stall queue: independent, never nested with queue
//! locks." `StallList` therefore never takes a `MultiQueue`/`Waitlist` lock
//! while holding its own, and nothing in `queue.rs`/`waitlist.rs` takes this
//! one.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::xprt::Xprt;

/// The list of transports currently paused for backpressure, plus the
/// single lock spec.md §3 describes it as exposing.
#[derive(Default)]
pub struct StallList {
    paused: Mutex<Vec<Arc<Xprt>>>,
}

impl StallList {
    pub fn new() -> Self {
        Self { paused: Mutex::new(Vec::new()) }
    }

    /// Mark `xprt` as stalled (its reads paused). A transport already on the
    /// list is not duplicated.
    pub fn pause(&self, xprt: Arc<Xprt>) {
        let mut paused = self.paused.lock();
        if !paused.iter().any(|x| x.id == xprt.id) {
            paused.push(xprt);
        }
    }

    /// Resume `xprt`, removing it from the list. Returns whether it was
    /// actually present.
    pub fn resume(&self, xprt_id: u64) -> bool {
        let mut paused = self.paused.lock();
        let before = paused.len();
        paused.retain(|x| x.id != xprt_id);
        paused.len() != before
    }

    pub fn is_stalled(&self, xprt_id: u64) -> bool {
        self.paused.lock().iter().any(|x| x.id == xprt_id)
    }

    pub fn len(&self) -> usize {
        self.paused.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
