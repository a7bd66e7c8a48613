//! End-to-end exercise of `Dispatcher::new` / `start` / `dispatch_stop`
//! against the full startup sequence of spec.md §4.6, using ephemeral ports
//! and the fake portmap/netconfig collaborators so the test never touches a
//! real NFS port or a real rpcbind daemon.

use std::sync::Arc;

use nfs_dispatch_core::codec::{FakeCodec, FakePortmapClient};
use nfs_dispatch_core::decoder::HandlerTable;
use nfs_dispatch_core::registry::{Dispatcher, FakeNetconfigClient};
use nfs_dispatch_core::Config;

fn ephemeral_config() -> Config {
    let mut config = Config::default();
    config.ports.nfs = 0;
    config.ports.mount = 0;
    config.ports.nlm = 0;
    config.ports.rquota = 0;
    config.max_io_worker_threads = 2;
    config.n_tcp_event_chan = 1;
    config
}

#[tokio::test]
async fn full_lifecycle_starts_binds_and_stops_cleanly() {
    let portmap = Arc::new(FakePortmapClient::new());
    let dispatcher = Dispatcher::new(
        ephemeral_config(),
        Arc::new(FakeCodec::new()),
        portmap.clone(),
        Arc::new(FakeNetconfigClient::default()),
        HandlerTable::new(),
    );

    dispatcher.start().await.expect("startup should succeed on a clean host");
    assert!(portmap.registration_count() > 0, "expected at least NFS+MOUNT to register");

    let snapshot = dispatcher.metrics_snapshot();
    assert_eq!(snapshot.enqueued_reqs, 0);
    assert_eq!(snapshot.dequeued_reqs, 0);

    dispatcher.dispatch_stop().await;
    assert_eq!(portmap.registration_count(), 0, "shutdown must unregister every program");
}

#[tokio::test]
async fn disabling_every_nfs_version_skips_endpoint_bring_up_but_still_stops_cleanly() {
    let mut config = ephemeral_config();
    config.core_options.nfs_v3 = false;
    config.core_options.nfs_v4 = false;

    let portmap = Arc::new(FakePortmapClient::new());
    let dispatcher = Dispatcher::new(
        config,
        Arc::new(FakeCodec::new()),
        portmap.clone(),
        Arc::new(FakeNetconfigClient::default()),
        HandlerTable::new(),
    );

    dispatcher.start().await.expect("startup should succeed with no endpoints bound");
    // MOUNT is only registered alongside an enabled NFS version.
    assert_eq!(portmap.registration_count(), 0);

    dispatcher.dispatch_stop().await;
}

#[tokio::test]
async fn no_portmapper_build_variant_skips_registration_entirely() {
    let mut config = ephemeral_config();
    config.no_portmapper = true;

    let portmap = Arc::new(FakePortmapClient::new());
    let dispatcher = Dispatcher::new(
        config,
        Arc::new(FakeCodec::new()),
        portmap.clone(),
        Arc::new(FakeNetconfigClient::default()),
        HandlerTable::new(),
    );

    dispatcher.start().await.expect("startup should succeed with portmapper disabled");
    assert_eq!(portmap.registration_count(), 0);

    dispatcher.dispatch_stop().await;
}
