//! # Worker Waitlist
//!
//! A single list of worker-wait entries, per spec.md §3/§4.4/§4.5. The
//! waitlist guarantees "at-most-one-handoff-per-wake": a producer that finds
//! a waiter removes exactly one entry and signals it; the woken worker is
//! responsible for re-scanning the queues from scratch, since the signal
//! only means "something was enqueued since you parked", not "here is your
//! request".
//!
//! ## Lock ordering (spec.md §5)
//!
//! The waitlist's own lock is always acquired *after* any queue lock has
//! already been released, and a wait entry's mutex is always acquired
//! *after* the waitlist lock has already been released. Violating either
//! ordering is a correctness hazard this module is structured to make
//! difficult to get wrong: `try_handoff` drops the waitlist guard before
//! touching the entry's mutex.
//!
//! ## The linked-bit open question (spec.md §9)
//!
//! spec.md's design notes call out that the original implementation tested
//! list membership via a raw `next/prev` pointer check and flags that as a
//! correctness hazard. This module instead keeps an explicit `linked` flag,
//! set and cleared only while holding the waitlist lock, and rejects the raw
//! pointer check entirely.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// The two flag bits spec.md's data model assigns to a wait entry.
#[derive(Debug, Default, Clone, Copy)]
struct WaitFlags {
    /// Posted when the worker parks, cleared once it wakes and rescans.
    wait_sync: bool,
    /// Posted by the producer on handoff.
    sync_done: bool,
}

/// A single worker's wait entry: a condition variable, its mutex, and the
/// flag bits that coordinate a single handoff.
pub struct WaitEntry {
    flags: Mutex<WaitFlags>,
    condvar: Condvar,
    /// Whether this entry currently sits on the waitlist. Set and cleared
    /// only while the owning `Waitlist`'s lock is held — see module docs.
    linked: AtomicBool,
}

impl WaitEntry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flags: Mutex::new(WaitFlags::default()),
            condvar: Condvar::new(),
            linked: AtomicBool::new(false),
        })
    }

    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }
}

/// The shared waitlist all idle workers park on.
pub struct Waitlist {
    list: Mutex<VecDeque<Arc<WaitEntry>>>,
    /// Global waiter count, kept in lockstep with `list.len()` so callers
    /// (and tests asserting invariant 7) can read it without locking the
    /// list, matching spec.md's "waiters == count(list)" invariant.
    waiters: AtomicUsize,
}

impl Default for Waitlist {
    fn default() -> Self {
        Self::new()
    }
}

impl Waitlist {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(VecDeque::new()),
            waiters: AtomicUsize::new(0),
        }
    }

    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Publish `entry` on the waitlist: mark `WAIT_SYNC`, set the global and
    /// per-entry waiter bookkeeping, and link it. Per spec.md §4.4's dequeue
    /// path, called only once a worker has scanned all four queues and found
    /// them empty.
    pub fn park(&self, entry: &Arc<WaitEntry>) {
        {
            let mut flags = entry.flags.lock();
            flags.wait_sync = true;
            flags.sync_done = false;
        }
        let mut list = self.list.lock();
        list.push_back(entry.clone());
        entry.linked.store(true, Ordering::Release);
        self.waiters.fetch_add(1, Ordering::AcqRel);
    }

    /// Wait up to `timeout` for a handoff. Returns `true` if `SYNC_DONE` was
    /// observed (spurious wakeups are absorbed internally: this only returns
    /// once `SYNC_DONE` is set or the timeout elapses). On a true return the
    /// flags are cleared, per spec.md §4.4 ("On wake, clear
    /// `WAIT_SYNC | SYNC_DONE` and restart the dequeue scan from the top").
    pub fn wait_timeout(&self, entry: &Arc<WaitEntry>, timeout: Duration) -> bool {
        let mut flags = entry.flags.lock();
        if !flags.sync_done {
            let result = entry.condvar.wait_for(&mut flags, timeout);
            if result.timed_out() && !flags.sync_done {
                return false;
            }
        }
        if flags.sync_done {
            flags.wait_sync = false;
            flags.sync_done = false;
            true
        } else {
            false
        }
    }

    /// Unlink `entry` if it is still linked, e.g. because a worker was
    /// cancelled while parked and no producer reached it first. Returns
    /// whether it was actually unlinked.
    pub fn remove_if_linked(&self, entry: &Arc<WaitEntry>) -> bool {
        if !entry.is_linked() {
            return false;
        }
        let mut list = self.list.lock();
        let before = list.len();
        list.retain(|e| !Arc::ptr_eq(e, entry));
        let removed = list.len() != before;
        if removed {
            entry.linked.store(false, Ordering::Release);
            self.waiters.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Wake every currently parked entry. Not part of the enqueue-time
    /// protocol (which always hands off to exactly one waiter per spec.md
    /// §4.4) — used only by shutdown, where parked workers would otherwise
    /// have to wait out their own 5-second timed wait before noticing
    /// `should_break`.
    pub fn wake_all(&self) {
        while self.try_handoff() {}
    }

    /// Attempt a single waiter handoff after an enqueue, per spec.md §4.4.
    /// Removes at most one entry from the head of the list, signals it, and
    /// returns whether a waiter was actually woken.
    pub fn try_handoff(&self) -> bool {
        let popped = {
            let mut list = self.list.lock();
            list.pop_front()
        };
        let Some(entry) = popped else {
            return false;
        };
        entry.linked.store(false, Ordering::Release);
        self.waiters.fetch_sub(1, Ordering::AcqRel);

        let mut flags = entry.flags.lock();
        flags.sync_done = true;
        if flags.wait_sync {
            entry.condvar.notify_one();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::thread;

    #[test]
    fn handoff_wakes_exactly_one_of_three_parked_waiters() {
        let waitlist = Arc::new(Waitlist::new());
        let entries: Vec<_> = (0..3).map(|_| WaitEntry::new()).collect();
        for e in &entries {
            waitlist.park(e);
        }
        assert_eq!(waitlist.waiters(), 3);

        let woken_count = Arc::new(StdAtomicUsize::new(0));
        let mut handles = Vec::new();
        for e in entries.iter().cloned() {
            let waitlist = waitlist.clone();
            let woken_count = woken_count.clone();
            handles.push(thread::spawn(move || {
                if waitlist.wait_timeout(&e, Duration::from_secs(2)) {
                    woken_count.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        // Give the threads a moment to actually park before the handoff.
        thread::sleep(Duration::from_millis(50));
        assert!(waitlist.try_handoff());

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(woken_count.load(Ordering::SeqCst), 1);
        assert_eq!(waitlist.waiters(), 2);
    }

    #[test]
    fn cancelled_parked_waiter_unlinks_cleanly() {
        let waitlist = Waitlist::new();
        let entry = WaitEntry::new();
        waitlist.park(&entry);
        assert_eq!(waitlist.waiters(), 1);
        assert!(entry.is_linked());

        assert!(waitlist.remove_if_linked(&entry));
        assert_eq!(waitlist.waiters(), 0);
        assert!(!entry.is_linked());
        // Second removal is a no-op: already unlinked.
        assert!(!waitlist.remove_if_linked(&entry));
    }

    #[test]
    fn handoff_with_no_waiters_is_a_no_op() {
        let waitlist = Waitlist::new();
        assert!(!waitlist.try_handoff());
    }
}
