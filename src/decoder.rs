//! # Decoder / Rendezvous Callbacks
//!
//! The per-message callback invoked by an event channel reactor, per spec.md
//! §4.3. For a rendezvous transport this means accepting a connection and
//! registering it on a worker channel; for a datagram or connected
//! transport it means running the decode → authenticate → checksum →
//! classify pipeline described there, and never invoking a protocol handler
//! inline — only a rejection reply or an enqueue leaves this module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::channel::{ChannelContext, ReplyHandle, XprtCallback};
use crate::codec::RpcCodec;
use crate::error::DispatchError;
use crate::queue::MultiQueue;
use crate::req::{HandlerFn, Req, ReqKind};
use crate::waitlist::Waitlist;
use crate::xprt::{Family, Protocol, Role, Xprt, XprtIo};

/// A capability record mapping an RPC program number to its bound handler,
/// per spec.md §9's "function tables" design note.
#[derive(Default)]
pub struct HandlerTable {
    by_program: HashMap<u32, HandlerFn>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, program: u32, handler: HandlerFn) {
        self.by_program.insert(program, handler);
    }

    pub fn resolve(&self, program: u32) -> Option<HandlerFn> {
        self.by_program.get(&program).copied()
    }
}

/// Per-message decode/authenticate/checksum/classify pipeline, bound as the
/// callback on every datagram, connected, and rendezvous transport.
#[derive(Clone)]
pub struct Decoder {
    codec: Arc<dyn RpcCodec>,
    queue: Arc<MultiQueue>,
    waitlist: Arc<Waitlist>,
    handlers: Arc<HandlerTable>,
    next_xprt_id: Arc<AtomicU64>,
}

impl Decoder {
    pub fn new(
        codec: Arc<dyn RpcCodec>,
        queue: Arc<MultiQueue>,
        waitlist: Arc<Waitlist>,
        handlers: Arc<HandlerTable>,
        next_xprt_id: Arc<AtomicU64>,
    ) -> Self {
        Self { codec, queue, waitlist, handlers, next_xprt_id }
    }
}

#[async_trait]
impl XprtCallback for Decoder {
    /// Rendezvous path: allocate a connected child transport and hand it off
    /// to a worker channel, round-robined per spec.md §4.2/§4.3.
    async fn on_accept(&self, parent: Arc<Xprt>, child: tokio::net::TcpStream, ctx: Arc<ChannelContext>) {
        let peer = child.peer_addr().ok();
        let id = self.next_xprt_id.fetch_add(1, Ordering::AcqRel);
        let child_xprt = Xprt::new(
            id,
            parent.family,
            Role::Connected,
            parent.protocol,
            peer,
            Some(parent.id),
            XprtIo::TcpStream(child),
        );
        debug!(xprt_id = id, parent_id = parent.id, ?peer, "registering accepted connection");
        ctx.assign_to_worker_channel(child_xprt, Arc::new(self.clone()));
    }

    /// Datagram/connected path: the 4-step pipeline of spec.md §4.3.
    async fn on_message(&self, xprt: Arc<Xprt>, frame: Vec<u8>, reply: ReplyHandle, _ctx: Arc<ChannelContext>) {
        let decoded = match self.codec.decode(&frame).await {
            Ok(d) => d,
            Err(DispatchError::DecodeFailed(reason)) => {
                debug!(xprt_id = xprt.id, reason, "decode failed");
                let resp = self.codec.decode_error_reply(0);
                let _ = reply.send(&resp).await;
                return;
            }
            Err(other) => {
                warn!(xprt_id = xprt.id, error = %other, "unexpected codec error during decode");
                return;
            }
        };

        if let Err(DispatchError::AuthReject { flavor }) = self.codec.authenticate(&decoded.header).await {
            debug!(xprt_id = xprt.id, xid = decoded.header.xid, flavor, "authentication rejected");
            let resp = self.codec.auth_reject_reply(&decoded.header, flavor);
            let _ = reply.send(&resp).await;
            return;
        }

        if decoded.no_dispatch {
            debug!(xprt_id = xprt.id, xid = decoded.header.xid, "GSS negotiation message, no dispatch");
            return;
        }

        if !self.codec.checksum(&decoded.header, &frame).await {
            debug!(xprt_id = xprt.id, xid = decoded.header.xid, "checksum verification failed");
            let resp = self.codec.decode_error_reply(decoded.header.xid);
            let _ = reply.send(&resp).await;
            return;
        }

        // Step 1/4: allocate the Req, take the decoder's reference on the
        // transport (released when the Req is freed, see worker::dispatch_one).
        xprt.acquire();
        let mut req = Req::new(ReqKind::NfsRequest, xprt.clone(), decoded.header, decoded.lookahead);
        req.handler = self.handlers.resolve(decoded.header.program);
        let req = Arc::new(req);

        if !self.queue.enqueue(req.clone(), &self.waitlist) {
            debug!(xprt_id = xprt.id, xid = decoded.header.xid, "request kind has no home queue, dropped");
            req.release();
            if req.xprt.release() == 0 {
                info!(xprt_id = xprt.id, "transport destroyed");
            }
        }
    }
}

/// Allocates a fresh, process-wide-unique transport id. Shared by the
/// Endpoint Manager (listener/datagram transports) and the decoder
/// (accepted connections) so no two live transports collide.
pub fn new_xprt_id_counter() -> Arc<AtomicU64> {
    Arc::new(AtomicU64::new(1))
}

/// Bind a datagram transport's family/protocol pair directly, for callers
/// that construct a `Decoder` ahead of any accepted connection (e.g. the
/// Endpoint Manager wiring up `UDP_NFS`).
pub fn datagram_xprt(id: u64, family: Family, protocol: Protocol, io: XprtIo) -> Arc<Xprt> {
    Xprt::new(id, family, Role::Datagram, protocol, None, None, io)
}
