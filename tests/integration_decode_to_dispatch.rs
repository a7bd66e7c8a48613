//! Wires a `Decoder` into a real `EventChannels` listener channel, over an
//! actual UDP socket pair, and drives a `WorkerPool` against the resulting
//! `MultiQueue`/`Waitlist` — the same combination `Dispatcher::start`
//! assembles internally, but built directly here (bypassing endpoint
//! allocation) so the test can hold on to the bound address and assert on
//! the reply that comes back over the wire, per spec.md §4.2-§4.5.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nfs_dispatch_core::channel::EventChannels;
use nfs_dispatch_core::codec::FakeCodec;
use nfs_dispatch_core::decoder::{Decoder, HandlerTable};
use nfs_dispatch_core::metrics::Collector;
use nfs_dispatch_core::req::{HandlerOutcome, Req, RpcHeader};
use nfs_dispatch_core::xprt::{Family, Protocol, Role, Xprt, XprtIo};
use nfs_dispatch_core::{MultiQueue, Waitlist, WorkerPool};

static HANDLED: AtomicU32 = AtomicU32::new(0);

fn counting_handler(_req: &Req) -> HandlerOutcome {
    HANDLED.fetch_add(1, Ordering::SeqCst);
    HandlerOutcome::Replied
}

#[test]
fn datagram_request_flows_from_socket_through_worker_to_reply() {
    HANDLED.store(0, Ordering::SeqCst);

    // `tokio::net::UdpSocket::from_std` below needs a live runtime context.
    let handle = nfs_dispatch_core::testutil::background_runtime_handle();
    let _guard = handle.enter();

    let queue = Arc::new(MultiQueue::new());
    let waitlist = Arc::new(Waitlist::new());
    let mut handlers = HandlerTable::new();
    handlers.register(100003, counting_handler);
    let handlers = Arc::new(handlers);

    let decoder = Decoder::new(
        Arc::new(FakeCodec::new()),
        queue.clone(),
        waitlist.clone(),
        handlers,
        Arc::new(std::sync::atomic::AtomicU64::new(1)),
    );

    let channels = EventChannels::new(1, 16, Duration::from_secs(5));
    let (channel, ctx) = channels.listener_channel(0);

    let std_sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    std_sock.set_nonblocking(true).unwrap();
    let local_addr = std_sock.local_addr().unwrap();
    let xprt = Xprt::new(
        1,
        Family::Inet4,
        Role::Datagram,
        Protocol::Nfs,
        Some(local_addr),
        None,
        XprtIo::Udp(tokio::net::UdpSocket::from_std(std_sock).unwrap()),
    );
    channel.register(xprt, Arc::new(decoder), ctx);

    let metrics = Arc::new(Collector::new());
    let pool = WorkerPool::spawn(2, queue.clone(), waitlist.clone(), None, metrics.clone());

    let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let header = RpcHeader { xid: 42, program: 100003, version: 3, procedure: 0, cred_flavor: 1 };
    let frame = FakeCodec::encode_frame(header, false, false, false);
    sender.send_to(&frame, local_addr).unwrap();

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(HANDLED.load(Ordering::SeqCst), 1, "the NFS handler should have run exactly once");

    let snapshot = metrics.snapshot(&queue, &[50.0, 99.0]);
    assert_eq!(snapshot.enqueued_reqs, 1);
    assert_eq!(snapshot.dequeued_reqs, 1);
    assert_eq!(snapshot.queue_time_samples, 1);

    pool.join();
    channels.shutdown_all();
}

#[test]
fn rejected_auth_flavor_never_reaches_a_worker() {
    let handle = nfs_dispatch_core::testutil::background_runtime_handle();
    let _guard = handle.enter();

    let queue = Arc::new(MultiQueue::new());
    let waitlist = Arc::new(Waitlist::new());
    let decoder = Decoder::new(
        Arc::new(FakeCodec::new()),
        queue.clone(),
        waitlist.clone(),
        Arc::new(HandlerTable::new()),
        Arc::new(std::sync::atomic::AtomicU64::new(1)),
    );

    let channels = EventChannels::new(1, 16, Duration::from_secs(5));
    let (channel, ctx) = channels.listener_channel(0);

    let std_sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    std_sock.set_nonblocking(true).unwrap();
    let local_addr = std_sock.local_addr().unwrap();
    let xprt = Xprt::new(
        1,
        Family::Inet4,
        Role::Datagram,
        Protocol::Nfs,
        Some(local_addr),
        None,
        XprtIo::Udp(tokio::net::UdpSocket::from_std(std_sock).unwrap()),
    );
    channel.register(xprt, Arc::new(decoder), ctx);

    let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let header = RpcHeader {
        xid: 43,
        program: 100003,
        version: 3,
        procedure: 0,
        cred_flavor: nfs_dispatch_core::codec::UNKNOWN_AUTH_FLAVOR,
    };
    let frame = FakeCodec::encode_frame(header, false, false, false);
    sender.send_to(&frame, local_addr).unwrap();

    // An auth-reject reply should come straight back over the same socket,
    // without anything ever reaching the queue.
    let mut buf = [0u8; 256];
    let (n, _) = sender.recv_from(&mut buf).expect("auth-reject reply should be sent back");
    assert!(n > 0);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(queue.enqueued_reqs(), 0);

    channels.shutdown_all();
}
