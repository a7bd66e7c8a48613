//! Throughput benchmark for `MultiQueue`'s enqueue/dequeue path, grounded in
//! the teacher's `benches`-less Criterion usage pattern via `IpcTransport`
//! micro-benchmarking style (one black-boxed hot loop per group).

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use nfs_dispatch_core::req::{Lookahead, Req, ReqKind, RpcHeader};
use nfs_dispatch_core::xprt::{Family, Protocol, Role, Xprt, XprtIo};
use nfs_dispatch_core::{MultiQueue, Waitlist};

fn fake_xprt() -> Arc<Xprt> {
    // `from_std` needs a live Tokio runtime context; Criterion drives these
    // benchmarks on plain threads with no runtime of their own.
    let handle = nfs_dispatch_core::testutil::background_runtime_handle();
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
        XprtIo::Udp(tokio::net::UdpSocket::from_std(std_sock).unwrap()),
    )
}

fn make_req(xprt: &Arc<Xprt>, xid: u32, lookahead: Lookahead) -> Arc<Req> {
    let header = RpcHeader { xid, program: 100003, version: 3, procedure: 0, cred_flavor: 1 };
    Arc::new(Req::new(ReqKind::NfsRequest, xprt.clone(), header, lookahead))
}

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("multiqueue_enqueue");
    for &n in &[100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let xprt = fake_xprt();
            b.iter(|| {
                let queue = MultiQueue::new();
                let waitlist = Waitlist::new();
                for i in 0..n {
                    let req = make_req(&xprt, i as u32, Lookahead::default());
                    black_box(queue.enqueue(req, &waitlist));
                }
            });
        });
    }
    group.finish();
}

fn bench_enqueue_dequeue_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("multiqueue_round_trip");
    for &n in &[100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let xprt = fake_xprt();
            b.iter(|| {
                let queue = MultiQueue::new();
                let waitlist = Waitlist::new();
                for i in 0..n {
                    queue.enqueue(make_req(&xprt, i as u32, Lookahead::default()), &waitlist);
                }
                let entry = nfs_dispatch_core::waitlist::WaitEntry::new();
                for _ in 0..n {
                    black_box(queue.dequeue_blocking(&waitlist, &entry, &|| false));
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_enqueue_dequeue_round_trip);
criterion_main!(benches);
