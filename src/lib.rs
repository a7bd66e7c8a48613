//! # NFS Dispatch Core
//!
//! The RPC dispatch and request-queueing core of an NFS-family server:
//! endpoint management, per-channel event reactors, an RPC decode/auth/
//! checksum pipeline, a four-queue priority classifier with a waitlist
//! handoff protocol, a worker pool, and portmap/lifecycle registration.
//!
//! `registry::Dispatcher` is the single entry point: construct one with
//! `Dispatcher::new`, bring it up with `start`, and tear it down with
//! `dispatch_stop`.

pub mod channel;
pub mod cli;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod req;
pub mod stall;
pub mod testutil;
pub mod waitlist;
pub mod worker;
pub mod xprt;

pub use codec::{FakeCodec, FakePortmapClient, PortmapClient, ProgramVersion, RpcCodec};
pub use config::Config;
pub use decoder::{Decoder, HandlerTable};
pub use error::DispatchError;
pub use metrics::{Collector, DispatchMetrics};
pub use queue::{MultiQueue, QueueKind};
pub use registry::{Dispatcher, FakeNetconfigClient, NetconfigClient};
pub use req::{HandlerFn, HandlerOutcome, Req, ReqKind};
pub use stall::StallList;
pub use waitlist::Waitlist;
pub use worker::WorkerPool;
pub use xprt::Xprt;

/// The current version of the dispatch core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Defaults for values spec.md §6 leaves to the implementation, mirrored
/// in `Config`'s own `Default` impl.
pub mod defaults {
    /// `N_TCP_EVENT_CHAN` default, spec.md §4.2.
    pub const N_TCP_EVENT_CHAN: usize = 4;

    /// Event-channel readiness queue depth default, spec.md §4.2.
    pub const EVENT_QUEUE_DEPTH: usize = 1024;

    /// Idle connection reap timeout, in seconds.
    pub const IDLE_TIMEOUT_SECS: u64 = 300;
}
