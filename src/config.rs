//! # Configuration Surface
//!
//! Everything spec.md §6 enumerates under "Configuration (enumerated)":
//! per-protocol ports, buffer sizing, connection/idle limits, worker thread
//! count, GSS knobs, feature toggles, keepalive tuning, decoder fridge
//! timing, and the core option bitmask. Loaded from a JSON file via `serde`
//! (the same crate the teacher used for its CLI/result types) with CLI
//! overrides layered on top, mirroring how the teacher's
//! `BenchmarkConfig::from_args` merged parsed `Args` into an internal config
//! struct.
//!
//! Validation happens once, at load time, and returns `Result<Config,
//! DispatchError>` rather than panicking on a bad value.

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// The core option bitmask spec.md §6 describes (`NFSv3`, `NFSv4`, `VSOCK`,
/// `RDMA`, `ALL_NFS_VERS`), modeled as a dedicated struct rather than a raw
/// integer so (de)serialization stays self-describing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreOptions {
    pub nfs_v3: bool,
    pub nfs_v4: bool,
    pub vsock: bool,
    pub rdma: bool,
}

impl CoreOptions {
    /// `ALL_NFS_VERS`: every NFS version enabled, vsock/RDMA left to the
    /// caller.
    pub fn all_nfs_vers(vsock: bool, rdma: bool) -> Self {
        Self { nfs_v3: true, nfs_v4: true, vsock, rdma }
    }

    pub fn any_nfs_version(&self) -> bool {
        self.nfs_v3 || self.nfs_v4
    }
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self { nfs_v3: true, nfs_v4: true, vsock: false, rdma: false }
    }
}

/// TCP keepalive tuning, applied only when `enable_tcp_keepalive` is set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    pub enabled: bool,
    pub keepcnt: u32,
    pub keepidle_secs: u64,
    pub keepintvl_secs: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { enabled: false, keepcnt: 5, keepidle_secs: 60, keepintvl_secs: 10 }
    }
}

/// GSS context cache sizing, spec.md §6.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GssConfig {
    pub enabled: bool,
    pub hash_partitions: u32,
    pub max_contexts: u32,
    pub max_gc: u32,
}

impl Default for GssConfig {
    fn default() -> Self {
        Self { enabled: false, hash_partitions: 16, max_contexts: 8192, max_gc: 200 }
    }
}

/// The decoder fridge: the thread-pool abstraction spec.md's GLOSSARY
/// defines (min/max workers, idle expiration, block-on-saturation policy).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FridgeConfig {
    pub expiration_delay_secs: u64,
    pub block_timeout_secs: u64,
}

impl Default for FridgeConfig {
    fn default() -> Self {
        Self { expiration_delay_secs: 600, block_timeout_secs: 5 }
    }
}

/// Per-protocol UDP/TCP port numbers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ports {
    pub nfs: u16,
    pub mount: u16,
    pub nlm: u16,
    pub rquota: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self { nfs: 2049, mount: 20048, nlm: 32803, rquota: 875 }
    }
}

/// The complete dispatch-core configuration surface, spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub ports: Ports,
    pub max_send_buffer: usize,
    pub max_recv_buffer: usize,
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
    pub max_io_worker_threads: usize,
    pub gss: GssConfig,
    pub enable_nlm: bool,
    pub enable_rquota: bool,
    pub keepalive: KeepaliveConfig,
    pub fridge: FridgeConfig,
    pub core_options: CoreOptions,
    /// `N_TCP_EVENT_CHAN`: the number of worker event channels accepted TCP
    /// connections are round-robined across, spec.md §2/§4.2.
    pub n_tcp_event_chan: usize,
    /// Readiness-queue depth per event channel, spec.md §4.2's default 1024.
    pub event_queue_depth: usize,
    /// `_NO_TCP_REGISTER` build variant: a portmap registration failure is
    /// logged and tolerated rather than fatal, spec.md §4.6 step 8.
    pub no_tcp_register: bool,
    /// `_NO_PORTMAPPER` build variant: skip portmap registration entirely.
    pub no_portmapper: bool,
    /// Pin each worker thread to a distinct CPU core via `core_affinity`,
    /// when the platform exposes core ids.
    pub pin_workers_to_cores: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ports: Ports::default(),
            max_send_buffer: 1 << 20,
            max_recv_buffer: 1 << 20,
            max_connections: 1024,
            idle_timeout_secs: 300,
            max_io_worker_threads: num_cpus::get(),
            gss: GssConfig::default(),
            enable_nlm: true,
            enable_rquota: true,
            keepalive: KeepaliveConfig::default(),
            fridge: FridgeConfig::default(),
            core_options: CoreOptions::default(),
            n_tcp_event_chan: 4,
            event_queue_depth: 1024,
            no_tcp_register: false,
            no_portmapper: false,
            pin_workers_to_cores: false,
        }
    }
}

impl Config {
    /// Load from a JSON config file, then validate.
    pub fn load_from_file(path: &std::path::Path) -> Result<Self, DispatchError> {
        let text = std::fs::read_to_string(path).map_err(DispatchError::Io)?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| DispatchError::RpcInitFailed(format!("invalid config file {path:?}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants not expressible in the type alone.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.max_io_worker_threads == 0 {
            return Err(DispatchError::RpcInitFailed(
                "max_io_worker_threads must be at least 1".to_string(),
            ));
        }
        if self.n_tcp_event_chan == 0 {
            return Err(DispatchError::RpcInitFailed(
                "n_tcp_event_chan must be at least 1".to_string(),
            ));
        }
        if !self.core_options.any_nfs_version() {
            return Err(DispatchError::RpcInitFailed(
                "at least one NFS version must be enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_timeout_secs)
    }
}
