//! # Test Support
//!
//! `tokio::net::UdpSocket::from_std` (and the equivalent `TcpListener`/
//! `TcpStream` conversions) require a live Tokio runtime context to register
//! with — they panic if called with no runtime entered. Production code
//! only ever does this from inside `Dispatcher::start`'s own `#[tokio::main]`
//! context, but plain `#[test]` functions across this crate build fake
//! transports directly on the calling thread, with no runtime of their own.
//!
//! This module hands out a `Handle` to a single background multi-thread
//! runtime, built once and kept running for the lifetime of the test
//! binary, so any thread can `enter()` it before converting a std socket.
//! Its worker threads keep turning the reactor even while the calling test
//! thread is blocked in `std::thread::sleep`, which a runtime created and
//! dropped inline would not do.
//!
//! Exported unconditionally (not `#[cfg(test)]`) so integration tests under
//! `tests/`, which link against the compiled library rather than its test
//! configuration, can use it too.

use std::sync::OnceLock;

use tokio::runtime::Handle;

/// A `Handle` into a background Tokio runtime that outlives every caller.
/// The `Runtime` itself is intentionally leaked: nothing here ever calls
/// `dispatch_stop`-style teardown, since the runtime backs the whole test
/// binary's process lifetime, not a single test.
pub fn background_runtime_handle() -> Handle {
    static HANDLE: OnceLock<Handle> = OnceLock::new();
    HANDLE
        .get_or_init(|| {
            let runtime = tokio::runtime::Runtime::new().expect("failed to build background test runtime");
            let handle = runtime.handle().clone();
            std::mem::forget(runtime);
            handle
        })
        .clone()
}
