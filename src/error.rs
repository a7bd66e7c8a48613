//! # Error Taxonomy
//!
//! This module defines the typed error surface for the dispatch core. It
//! separates the handful of conditions that must abort the process (fatal
//! startup failures) from the much larger set of per-request conditions that
//! are turned into RPC replies and never unwind past the worker that handled
//! them.
//!
//! ## Design
//!
//! - `DispatchError` is the error type returned by fallible core operations
//!   (`Result<T, DispatchError>`). It implements `std::error::Error` via
//!   `thiserror` so it composes cleanly with `anyhow::Context` at the process
//!   boundary in `main.rs`.
//! - Per-request failures (auth reject, decode/checksum failure) are
//!   represented as `DispatchError` values but are *handled*, not propagated:
//!   the decoder converts them into a reply on the transport and releases the
//!   request, per spec's "Propagation" rule.

use std::net::SocketAddr;

use thiserror::Error;

use crate::xprt::{Family, Protocol};

/// The complete error taxonomy for the dispatch core.
///
/// Every variant maps to one of the categories spec.md enumerates in its
/// error-handling design: fatal startup, recoverable startup, per-request,
/// and transport-lifecycle conditions.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A required netconfig entry (`udp`, `tcp`) was not found. Fatal.
    #[error("missing required netconfig entry: {0}")]
    MissingNetconfig(&'static str),

    /// Socket allocation failed for a reason other than address-family
    /// disablement. Fatal.
    #[error("failed to allocate {protocol:?} socket for {family:?}: {source}")]
    SocketAllocate {
        protocol: Protocol,
        family: Family,
        #[source]
        source: std::io::Error,
    },

    /// A TCP allocation failed immediately after a successful UDP allocation
    /// on the same family — cannot be explained by family disablement, so it
    /// is always fatal regardless of `v6_disabled`.
    #[error("TCP socket allocation failed for {family:?} after UDP succeeded: {source}")]
    InconsistentFamilyFailure {
        family: Family,
        #[source]
        source: std::io::Error,
    },

    /// Bind failed on IPv4 or IPv6. Fatal.
    #[error("bind failed for {protocol:?}/{family:?} on {addr}: {source}")]
    BindFailed {
        protocol: Protocol,
        family: Family,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// vsock bind failed. Non-fatal: logged as a warning by the caller.
    #[error("vsock bind failed: {0}")]
    VsockBindFailed(std::io::Error),

    /// The RPC library (the external codec/transport contract) failed to
    /// initialize. Fatal.
    #[error("RPC library initialization failed: {0}")]
    RpcInitFailed(String),

    /// Registering a (program, version) with portmap failed. Fatal unless the
    /// no-tcp-register / no-portmapper build variants are selected, which is
    /// decided by the caller before constructing this error.
    #[error("portmap registration failed for program {program} version {version}: {reason}")]
    PortmapRegister {
        program: u32,
        version: u32,
        reason: String,
    },

    /// GSS service-principal import or credential acquisition failed.
    /// Recoverable: the caller logs and continues with GSS disabled.
    #[error("GSS credential acquisition failed: {0}")]
    GssCredential(String),

    /// Authentication rejected an incoming request. Per-request, handled: the
    /// decoder sends an auth-reject reply and releases the request.
    #[error("authentication rejected request (flavor {flavor})")]
    AuthReject { flavor: u32 },

    /// The codec failed to decode the RPC header. Per-request, handled.
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    /// The message checksum did not match. Per-request, handled: the decoder
    /// sends a decode-error reply.
    #[error("checksum verification failed for xid {xid}")]
    ChecksumFailed { xid: u32 },

    /// The transport died or was destroyed mid-operation. Logged at info;
    /// the reactor drops it from its readiness set.
    #[error("transport {0} died or was destroyed")]
    TransportDied(u64),

    /// A generic I/O failure not covered by a more specific variant.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    /// Whether this error must abort the dispatcher's startup sequence.
    ///
    /// Per-request and transport-lifecycle variants are never fatal: they are
    /// handled at the point they occur and never reach this check in
    /// practice, but the predicate is kept total so callers can assert on it
    /// in tests without partial matches.
    pub fn is_fatal_startup(&self) -> bool {
        matches!(
            self,
            DispatchError::MissingNetconfig(_)
                | DispatchError::SocketAllocate { .. }
                | DispatchError::InconsistentFamilyFailure { .. }
                | DispatchError::BindFailed { .. }
                | DispatchError::RpcInitFailed(_)
                | DispatchError::PortmapRegister { .. }
        )
    }
}
