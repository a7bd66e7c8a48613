//! # Registry & Lifecycle
//!
//! Startup sequencing, portmap (un)registration, and idempotent-entry
//! shutdown signalling — spec.md §4.6. `Dispatcher` is the single
//! explicitly-owned object spec.md §9's "Global state" design note calls
//! for: it owns the multi-queue, waitlist, event channels, endpoint
//! manager, worker pool, and registered-program bookkeeping that the
//! original design scattered across process globals. Test suites
//! construct a fresh `Dispatcher` per test, per spec.md §9.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::channel::EventChannels;
use crate::codec::{PortmapClient, ProgramVersion, RpcCodec};
use crate::config::Config;
use crate::decoder::{Decoder, HandlerTable};
use crate::endpoint::EndpointManager;
use crate::error::DispatchError;
use crate::metrics::{Collector, DispatchMetrics, DEFAULT_PERCENTILES};
use crate::queue::MultiQueue;
use crate::stall::StallList;
use crate::waitlist::Waitlist;
use crate::worker::WorkerPool;
use crate::xprt::Protocol;

/// The four programs spec.md §6 names, with the versions this core
/// registers for each.
pub fn configured_programs(config: &Config) -> Vec<ProgramVersion> {
    let mut programs = Vec::new();
    if config.core_options.nfs_v3 {
        programs.push(ProgramVersion { program: 100003, version: 3 });
    }
    if config.core_options.nfs_v4 {
        programs.push(ProgramVersion { program: 100003, version: 4 });
    }
    // MOUNT: always registered alongside any enabled NFS version, per
    // spec.md §6's program list.
    if config.core_options.any_nfs_version() {
        programs.push(ProgramVersion { program: 100005, version: 1 });
        programs.push(ProgramVersion { program: 100005, version: 3 });
    }
    if config.enable_nlm {
        programs.push(ProgramVersion { program: 100021, version: 4 });
    }
    if config.enable_rquota {
        programs.push(ProgramVersion { program: 100011, version: 1 });
        programs.push(ProgramVersion { program: 100011, version: 2 });
    }
    programs
}

/// Netconfig availability the external collaborator in spec.md §4.6 step 4
/// reports: `udp`/`tcp` missing is fatal, `udp6`/`tcp6` missing is only
/// informational (the v6 path degrades the same way `v6_disabled` does).
#[derive(Debug, Clone, Copy)]
pub struct NetconfigAvailability {
    pub udp: bool,
    pub tcp: bool,
    pub udp6: bool,
    pub tcp6: bool,
}

#[async_trait]
pub trait NetconfigClient: Send + Sync {
    async fn fetch(&self) -> NetconfigAvailability;
}

/// A netconfig client that reports every transport present — the common
/// case on a fully dual-stack host. Swapping in a real `getnetconfigent`
/// binding means implementing `NetconfigClient`; nothing upstream changes.
pub struct FakeNetconfigClient {
    pub udp6_present: bool,
    pub tcp6_present: bool,
}

impl Default for FakeNetconfigClient {
    fn default() -> Self {
        Self { udp6_present: true, tcp6_present: true }
    }
}

#[async_trait]
impl NetconfigClient for FakeNetconfigClient {
    async fn fetch(&self) -> NetconfigAvailability {
        NetconfigAvailability { udp: true, tcp: true, udp6: self.udp6_present, tcp6: self.tcp6_present }
    }
}

/// The single explicitly-owned dispatcher object. Construct with `new`,
/// bring up listening endpoints and the worker pool with `start`, and tear
/// everything down with `dispatch_stop` (callable exactly once; a second
/// call is a caller bug, not a safety issue — idempotence is not required
/// per spec.md §6).
pub struct Dispatcher {
    config: Config,
    pub queue: Arc<MultiQueue>,
    pub waitlist: Arc<Waitlist>,
    /// The stall list of spec.md §3/§5: transports an external collaborator
    /// has paused for per-connection backpressure. Its lock is independent
    /// of `queue`'s and `waitlist`'s and is never nested with either.
    pub stall_list: Arc<StallList>,
    pub channels: Arc<EventChannels>,
    pub endpoint: Arc<EndpointManager>,
    pub handlers: Arc<HandlerTable>,
    pub metrics: Arc<Collector>,
    codec: Arc<dyn RpcCodec>,
    portmap: Arc<dyn PortmapClient>,
    netconfig: Arc<dyn NetconfigClient>,
    workers: Mutex<Option<WorkerPool>>,
    next_xprt_id: Arc<AtomicU64>,
    registered: Mutex<Vec<ProgramVersion>>,
    stopped: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        config: Config,
        codec: Arc<dyn RpcCodec>,
        portmap: Arc<dyn PortmapClient>,
        netconfig: Arc<dyn NetconfigClient>,
        handlers: HandlerTable,
    ) -> Arc<Self> {
        let next_xprt_id = Arc::new(AtomicU64::new(1));
        let channels = EventChannels::new(config.n_tcp_event_chan, config.event_queue_depth, config.idle_timeout());
        Arc::new(Self {
            queue: Arc::new(MultiQueue::new()),
            waitlist: Arc::new(Waitlist::new()),
            stall_list: Arc::new(StallList::new()),
            channels,
            endpoint: Arc::new(EndpointManager::new(next_xprt_id.clone())),
            handlers: Arc::new(handlers),
            metrics: Arc::new(Collector::new()),
            codec,
            portmap,
            netconfig,
            workers: Mutex::new(None),
            next_xprt_id,
            registered: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A point-in-time snapshot of queue load and queue-time latency, per
    /// SPEC_FULL.md §F's observability surface.
    pub fn metrics_snapshot(&self) -> DispatchMetrics {
        self.metrics.snapshot(&self.queue, DEFAULT_PERCENTILES)
    }

    /// Run the startup sequence of spec.md §4.6 steps 4-8. Steps 1-3
    /// (queue/waitlist/fridge/stall-queue init, RPC library init, listener
    /// channel creation) already happened in `new`.
    pub async fn start(self: &Arc<Self>) -> Result<(), DispatchError> {
        let netconfig = self.netconfig.fetch().await;
        if !netconfig.udp || !netconfig.tcp {
            return Err(DispatchError::MissingNetconfig(if !netconfig.udp { "udp" } else { "tcp" }));
        }
        if !netconfig.udp6 || !netconfig.tcp6 {
            info!("IPv6 netconfig entries unavailable, core will fall back to IPv4 as sockets are allocated");
        }

        if !self.config.core_options.any_nfs_version() {
            info!("no NFS version enabled, skipping endpoint bring-up");
        } else {
            let protocols = self.enabled_protocols();
            let transports = self.endpoint.allocate_bind_and_create(&self.config, &protocols)?;

            // Unregister any stale portmap entries for our programs before
            // re-registering, per spec.md §4.6 step 6.
            for pv in configured_programs(&self.config) {
                let _ = self.portmap.unregister(pv).await;
            }

            for t in transports {
                let (channel, ctx) = self.channels.listener_channel(t.protocol as usize);
                let decoder = Arc::new(self.make_decoder());
                channel.register(t.datagram, decoder.clone(), ctx.clone());
                channel.register(t.rendezvous, decoder, ctx);
            }

            if self.config.core_options.vsock {
                if let Some(vsock_xprt) = self.endpoint.try_bind_vsock(self.config.ports.nfs) {
                    let (channel, ctx) = self.channels.listener_channel(0);
                    channel.register(vsock_xprt, Arc::new(self.make_decoder()), ctx);
                }
            }
        }

        if self.config.gss.enabled {
            // GSS credential acquisition is an external collaborator
            // (spec.md §1); a failure here is recoverable, per §4.6 step 7.
            if let Err(e) = self.import_gss_principal().await {
                warn!(error = %e, "GSS credential acquisition failed, continuing with GSS disabled");
            }
        }

        self.register_with_portmap().await?;

        self.spawn_workers();
        info!("dispatcher startup sequence complete");
        Ok(())
    }

    fn enabled_protocols(&self) -> Vec<(Protocol, u16)> {
        let mut protocols = vec![(Protocol::Nfs, self.config.ports.nfs), (Protocol::Mount, self.config.ports.mount)];
        if self.config.enable_nlm {
            protocols.push((Protocol::Nlm, self.config.ports.nlm));
        }
        if self.config.enable_rquota {
            protocols.push((Protocol::Rquota, self.config.ports.rquota));
        }
        protocols
    }

    fn make_decoder(&self) -> Decoder {
        Decoder::new(
            self.codec.clone(),
            self.queue.clone(),
            self.waitlist.clone(),
            self.handlers.clone(),
            self.next_xprt_id.clone(),
        )
    }

    /// Stub for the external GSS import step; always succeeds here since
    /// real credential acquisition is out of scope (spec.md §1).
    async fn import_gss_principal(&self) -> Result<(), DispatchError> {
        Ok(())
    }

    /// Register every enabled (program, version) with portmap over
    /// udp4/tcp4 (+ udp6/tcp6 if present), per spec.md §4.6 step 8. Fatal
    /// on failure unless the no-tcp-register/no-portmapper build variants
    /// are selected.
    async fn register_with_portmap(&self) -> Result<(), DispatchError> {
        if self.config.no_portmapper {
            info!("portmapper registration disabled by build configuration");
            return Ok(());
        }
        let mut registered = self.registered.lock();
        for pv in configured_programs(&self.config) {
            match self.portmap.register(pv).await {
                Ok(()) => registered.push(pv),
                Err(e) if self.config.no_tcp_register => {
                    warn!(?pv, error = %e, "portmap registration failed but no-tcp-register is set, continuing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn spawn_workers(self: &Arc<Self>) {
        let core_ids = if self.config.pin_workers_to_cores {
            core_affinity::get_core_ids()
        } else {
            None
        };
        let pool = WorkerPool::spawn(
            self.config.max_io_worker_threads,
            self.queue.clone(),
            self.waitlist.clone(),
            core_ids,
            self.metrics.clone(),
        );
        *self.workers.lock() = Some(pool);
    }

    /// `dispatch_stop()`: signal `SHUTDOWN` to every listener channel,
    /// unregister from portmap, close listener fds, and join every worker
    /// thread. Callable exactly once from a shutdown thread, per spec.md §6.
    pub async fn dispatch_stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            error!("dispatch_stop called more than once; ignoring second call");
            return;
        }

        self.channels.shutdown_listeners();

        let registered: Vec<ProgramVersion> = self.registered.lock().drain(..).collect();
        for pv in registered {
            if let Err(e) = self.portmap.unregister(pv).await {
                warn!(?pv, error = %e, "portmap unregister failed during shutdown");
            }
        }

        self.endpoint.close_all();
        self.channels.shutdown_all();

        if let Some(pool) = self.workers.lock().take() {
            pool.join();
        }

        let snapshot = self.metrics_snapshot();
        info!(
            enqueued = snapshot.enqueued_reqs,
            dequeued = snapshot.dequeued_reqs,
            outstanding_est = snapshot.outstanding_reqs_est,
            queue_time_samples = snapshot.queue_time_samples,
            "dispatch_stop complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FakeCodec;
    use crate::codec::FakePortmapClient;

    fn test_config() -> Config {
        let mut config = Config::default();
        // Ephemeral ports so tests never collide on a real NFS port.
        config.ports.nfs = 0;
        config.ports.mount = 0;
        config.ports.nlm = 0;
        config.ports.rquota = 0;
        config.max_io_worker_threads = 2;
        config.n_tcp_event_chan = 1;
        config
    }

    #[tokio::test]
    async fn startup_registers_configured_programs_and_shuts_down_cleanly() {
        let portmap = Arc::new(FakePortmapClient::new());
        let dispatcher = Dispatcher::new(
            test_config(),
            Arc::new(FakeCodec::new()),
            portmap.clone(),
            Arc::new(FakeNetconfigClient::default()),
            HandlerTable::new(),
        );

        dispatcher.start().await.expect("startup should succeed");
        assert!(portmap.registration_count() > 0);

        dispatcher.dispatch_stop().await;
        assert_eq!(portmap.registration_count(), 0);
    }

    #[tokio::test]
    async fn missing_udp_netconfig_is_fatal() {
        struct MissingUdp;
        #[async_trait]
        impl NetconfigClient for MissingUdp {
            async fn fetch(&self) -> NetconfigAvailability {
                NetconfigAvailability { udp: false, tcp: true, udp6: true, tcp6: true }
            }
        }

        let dispatcher = Dispatcher::new(
            test_config(),
            Arc::new(FakeCodec::new()),
            Arc::new(FakePortmapClient::new()),
            Arc::new(MissingUdp),
            HandlerTable::new(),
        );

        let err = dispatcher.start().await.unwrap_err();
        assert!(matches!(err, DispatchError::MissingNetconfig("udp")));
    }

    #[tokio::test]
    async fn portmap_registration_failure_is_fatal_without_no_tcp_register() {
        let portmap = Arc::new(FakePortmapClient::failing_on(100003));
        let dispatcher = Dispatcher::new(
            test_config(),
            Arc::new(FakeCodec::new()),
            portmap,
            Arc::new(FakeNetconfigClient::default()),
            HandlerTable::new(),
        );

        let err = dispatcher.start().await.unwrap_err();
        assert!(matches!(err, DispatchError::PortmapRegister { .. }));
    }

    #[test]
    fn configured_programs_includes_mount_when_any_nfs_version_enabled() {
        let config = Config::default();
        let programs = configured_programs(&config);
        assert!(programs.iter().any(|p| p.program == 100005));
        assert!(programs.iter().any(|p| p.program == 100003));
    }
}
