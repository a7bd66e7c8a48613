//! # Codec & Portmap Contracts
//!
//! spec.md §6 treats the XDR wire codec and the portmap/rpcbind client as
//! external collaborators referenced only by interface. This module is that
//! interface, expressed as traits, plus a minimal fake implementation good
//! enough to drive the decoder and registry end-to-end in tests without a
//! real XDR library or a running rpcbind.
//!
//! Swapping in a real codec (a binding to an actual XDR/RPC library) means
//! implementing `RpcCodec`/`PortmapClient` against it; nothing upstream of
//! these traits needs to change.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::error::DispatchError;
use crate::req::{Lookahead, RpcHeader};

/// Outcome of decoding one inbound frame's RPC header, before authentication.
pub struct Decoded {
    pub header: RpcHeader,
    pub lookahead: Lookahead,
    /// Set when the message is an internal security-context negotiation
    /// (e.g. a GSS `RPCSEC_GSS_INIT`) that the library itself replies to —
    /// per spec.md §4.3, such messages are never enqueued.
    pub no_dispatch: bool,
}

/// The external RPC/XDR wire codec contract (spec.md §6).
///
/// Implementations own header parsing, authentication, and checksum
/// verification; the decoder (`decoder.rs`) only sequences these calls.
#[async_trait]
pub trait RpcCodec: Send + Sync {
    /// Parse the RPC header out of `frame`, per spec.md §4.3 step 2. Fails
    /// only when the frame cannot be parsed at all; credential validity is
    /// checked separately by `authenticate`.
    async fn decode(&self, frame: &[u8]) -> Result<Decoded, DispatchError>;

    /// Validate the header's credentials, per spec.md §4.3 step 3's
    /// `authenticate(req, &no_dispatch)` call.
    async fn authenticate(&self, header: &RpcHeader) -> Result<(), DispatchError>;

    /// Verify the message checksum for an already-decoded, already
    /// authenticated request. Only called when `no_dispatch == false`.
    async fn checksum(&self, header: &RpcHeader, frame: &[u8]) -> bool;

    /// Build an auth-reject reply frame for `flavor`.
    fn auth_reject_reply(&self, header: &RpcHeader, flavor: u32) -> Vec<u8>;

    /// Build a decode-error reply frame.
    fn decode_error_reply(&self, xid: u32) -> Vec<u8>;
}

/// A fake codec good enough for integration tests and local development.
///
/// Frame format: `xid:u32 | program:u32 | version:u32 | procedure:u32 |
/// cred_flavor:u32 | flags:u8 | payload...` (all little-endian). `flags` bit
/// 0 marks MOUNT lookahead, bit 1 marks high-latency lookahead, bit 2 marks
/// the frame as a GSS negotiation message (`no_dispatch`). `cred_flavor ==
/// UNKNOWN_AUTH_FLAVOR` is treated as an auth failure; any frame shorter
/// than the fixed header is a decode failure.
pub struct FakeCodec;

const HEADER_LEN: usize = 4 * 5 + 1;
pub const UNKNOWN_AUTH_FLAVOR: u32 = 0xFFFF_FFFF;

impl FakeCodec {
    pub fn new() -> Self {
        Self
    }

    /// Build a frame a test can feed straight into the fake codec.
    pub fn encode_frame(header: RpcHeader, mount: bool, high_latency: bool, gss_negotiation: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(&header.xid.to_le_bytes());
        buf.extend_from_slice(&header.program.to_le_bytes());
        buf.extend_from_slice(&header.version.to_le_bytes());
        buf.extend_from_slice(&header.procedure.to_le_bytes());
        buf.extend_from_slice(&header.cred_flavor.to_le_bytes());
        let mut flags = 0u8;
        if mount {
            flags |= 0b001;
        }
        if high_latency {
            flags |= 0b010;
        }
        if gss_negotiation {
            flags |= 0b100;
        }
        buf.push(flags);
        buf
    }
}

impl Default for FakeCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcCodec for FakeCodec {
    async fn decode(&self, frame: &[u8]) -> Result<Decoded, DispatchError> {
        if frame.len() < HEADER_LEN {
            return Err(DispatchError::DecodeFailed(format!(
                "frame too short: {} bytes, need {HEADER_LEN}",
                frame.len()
            )));
        }
        let xid = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        let program = u32::from_le_bytes(frame[4..8].try_into().unwrap());
        let version = u32::from_le_bytes(frame[8..12].try_into().unwrap());
        let procedure = u32::from_le_bytes(frame[12..16].try_into().unwrap());
        let cred_flavor = u32::from_le_bytes(frame[16..20].try_into().unwrap());
        let flags = frame[20];

        let header = RpcHeader { xid, program, version, procedure, cred_flavor };

        Ok(Decoded {
            header,
            lookahead: Lookahead {
                mount: flags & 0b001 != 0,
                high_latency: flags & 0b010 != 0,
            },
            no_dispatch: flags & 0b100 != 0,
        })
    }

    async fn authenticate(&self, header: &RpcHeader) -> Result<(), DispatchError> {
        if header.cred_flavor == UNKNOWN_AUTH_FLAVOR {
            return Err(DispatchError::AuthReject { flavor: header.cred_flavor });
        }
        Ok(())
    }

    async fn checksum(&self, _header: &RpcHeader, frame: &[u8]) -> bool {
        // The fake codec's only notion of corruption is a truncated payload
        // past the fixed header; anything that decoded successfully passes.
        frame.len() >= HEADER_LEN
    }

    fn auth_reject_reply(&self, header: &RpcHeader, flavor: u32) -> Vec<u8> {
        format!("AUTH_REJECT xid={} flavor={flavor}", header.xid).into_bytes()
    }

    fn decode_error_reply(&self, xid: u32) -> Vec<u8> {
        format!("GARBAGE_ARGS xid={xid}").into_bytes()
    }
}

/// A program/version pair registered with portmap, per spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramVersion {
    pub program: u32,
    pub version: u32,
}

/// The portmap/rpcbind client contract (spec.md §4.6/§6).
#[async_trait]
pub trait PortmapClient: Send + Sync {
    async fn register(&self, pv: ProgramVersion) -> Result<(), DispatchError>;
    async fn unregister(&self, pv: ProgramVersion) -> Result<(), DispatchError>;
}

/// An in-memory fake portmap client. Registration always succeeds unless
/// `fail_program` is set, letting tests exercise the fatal-registration path
/// (spec.md §4.6 step 8) without a real rpcbind daemon.
pub struct FakePortmapClient {
    fail_program: Option<u32>,
    registrations: AtomicU32,
}

impl FakePortmapClient {
    pub fn new() -> Self {
        Self { fail_program: None, registrations: AtomicU32::new(0) }
    }

    pub fn failing_on(program: u32) -> Self {
        Self { fail_program: Some(program), registrations: AtomicU32::new(0) }
    }

    pub fn registration_count(&self) -> u32 {
        self.registrations.load(Ordering::Acquire)
    }
}

impl Default for FakePortmapClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortmapClient for FakePortmapClient {
    async fn register(&self, pv: ProgramVersion) -> Result<(), DispatchError> {
        if self.fail_program == Some(pv.program) {
            return Err(DispatchError::PortmapRegister {
                program: pv.program,
                version: pv.version,
                reason: "simulated portmap failure".to_string(),
            });
        }
        self.registrations.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn unregister(&self, pv: ProgramVersion) -> Result<(), DispatchError> {
        if self.fail_program == Some(pv.program) {
            return Err(DispatchError::PortmapRegister {
                program: pv.program,
                version: pv.version,
                reason: "simulated portmap failure".to_string(),
            });
        }
        self.registrations.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }
}
