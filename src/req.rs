//! # Request (`Req`) Model
//!
//! One pending RPC, per spec.md §3. A `Req` is allocated by the decoder with
//! refcount 1 (held by the caller), bumped to 2 before it is handed to the
//! classifier for enqueue (one reference for queue membership, one for the
//! caller to release after `SVC_STAT`), and dropped once both references are
//! released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::xprt::Xprt;

/// What kind of unit of work a `Req` represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqKind {
    /// An inbound RPC call awaiting a protocol handler.
    NfsRequest,
    /// An RPC callback — e.g. an NLM callback the server itself issues and
    /// must route back through the dispatch core.
    NfsCall,
    /// Optional 9P-style request, present only when the 9P front end is
    /// compiled in; routed identically to a low-latency NFS request.
    NinePRequest,
}

/// Lookahead metadata the partial decoder fills in before classification.
///
/// spec.md §9 contractualizes this: the codec MUST populate `Lookahead`
/// before returning from decode, or classification defaults to
/// `LOW_LATENCY`. `Lookahead::default()` therefore encodes that fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lookahead {
    pub mount: bool,
    pub high_latency: bool,
}

/// The decoded RPC header fields needed for classification and replies.
#[derive(Debug, Clone, Copy)]
pub struct RpcHeader {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub cred_flavor: u32,
}

/// A protocol handler function descriptor. The actual handler bodies
/// (`handle_NFS`, `handle_MNT`, `handle_NLM`, `handle_RQUOTA`) are external
/// collaborators per spec.md §1; the core only needs to be able to name and
/// invoke one.
pub type HandlerFn = fn(&Req) -> HandlerOutcome;

/// What a protocol handler reports back to the worker. The worker turns
/// this into transport status; it never propagates an error past itself
/// (spec.md §7, "Propagation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Replied,
    Dropped,
}

/// One pending RPC.
pub struct Req {
    pub kind: ReqKind,
    pub xprt: Arc<Xprt>,
    pub header: RpcHeader,
    pub lookahead: Lookahead,
    pub handler: Option<HandlerFn>,
    /// Opaque decoded argument slot. The real XDR codec would put a typed
    /// argument struct here; the core treats it as an external payload it
    /// owns for the lifetime of the request and frees on release.
    pub args: Option<Vec<u8>>,
    pub enqueued_at: Mutex<Option<Instant>>,
    refcount: AtomicU64,
}

use parking_lot::Mutex;

impl Req {
    /// Allocate a new request bound to `xprt`, with refcount 1 held by the
    /// caller (the decoder), per spec.md §3/§4.3 step 1. This does **not**
    /// take the transport reference the decoder is required to take
    /// separately — see `Req::bind_transport`.
    pub fn new(kind: ReqKind, xprt: Arc<Xprt>, header: RpcHeader, lookahead: Lookahead) -> Self {
        Self {
            kind,
            xprt,
            header,
            lookahead,
            handler: None,
            args: None,
            enqueued_at: Mutex::new(None),
            refcount: AtomicU64::new(1),
        }
    }

    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Bump the refcount to 2 immediately before enqueue, per spec.md §3's
    /// lifecycle note ("incremented to 2 before enqueue: one for queue, one
    /// for caller to release after SVC_STAT").
    pub fn mark_enqueued(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        *self.enqueued_at.lock() = Some(Instant::now());
    }

    /// Release one reference. Returns the refcount after release.
    pub fn release(&self) -> u64 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "Req refcount underflow");
        prev - 1
    }

    pub fn time_in_queue(&self) -> Option<std::time::Duration> {
        self.enqueued_at.lock().map(|t| t.elapsed())
    }
}

impl std::fmt::Debug for Req {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Req")
            .field("kind", &self.kind)
            .field("xid", &self.header.xid)
            .field("refcount", &self.refcount())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn fake_header() -> RpcHeader {
        RpcHeader {
            xid: 42,
            program: 100003,
            version: 3,
            procedure: 1,
            cred_flavor: 0,
        }
    }

    #[test]
    fn refcount_goes_1_to_2_on_enqueue_then_to_0_on_double_release() {
        let req = Req::new(ReqKind::NfsRequest, fake_xprt(), fake_header(), Lookahead::default());
        assert_eq!(req.refcount(), 1);
        req.mark_enqueued();
        assert_eq!(req.refcount(), 2);
        assert_eq!(req.release(), 1);
        assert_eq!(req.release(), 0);
    }

    #[test]
    fn lookahead_defaults_to_low_latency_shape() {
        let lookahead = Lookahead::default();
        assert!(!lookahead.mount);
        assert!(!lookahead.high_latency);
    }
}
