//! Server configuration.

use std::time::Duration;

use crate::connections::ConnectionLimits;
use crate::health::HealthConfig;
use crate::shutdown::ShutdownConfig;

/// Cookie carrying the console session token.
pub const DEFAULT_TOKEN_COOKIE: &str = "openshift-session-token";

/// Cookie set on every stream to identify the session.
pub const DEFAULT_SESSION_COOKIE: &str = "fleet-session";

/// Configuration for the event stream server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interval between keep-alive comments.
    pub keepalive_interval: Duration,
    /// How long a drain loop may run before its session is reaped.
    pub session_timeout: Duration,
    /// How often the reaper looks for stuck sessions.
    pub reaper_interval: Duration,
    /// How long an access decision is reused.
    pub access_ttl: Duration,
    /// How often expired access decisions are dropped.
    pub access_sweep_interval: Duration,
    /// How often the compliance throttle is purged.
    pub throttle_sweep_interval: Duration,
    /// Kinds delivered to every session without an access review.
    pub public_kinds: Vec<String>,
    /// Frames buffered per session before the drain loop waits.
    pub sink_capacity: usize,
    /// Cookie holding the bearer token.
    pub token_cookie: String,
    /// Cookie set to the session ID.
    pub session_cookie: String,
    /// Response compression.
    pub compression: CompressionConfig,
    /// Initial snapshot packing.
    pub snapshot: SnapshotConfig,
    /// Stream admission limits.
    pub limits: ConnectionLimits,
    /// Probe settings.
    pub health: HealthConfig,
    /// Shutdown settings.
    pub shutdown: ShutdownConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(10),
            session_timeout: Duration::from_secs(4 * 60 * 60),
            reaper_interval: Duration::from_secs(60),
            access_ttl: Duration::from_secs(60),
            access_sweep_interval: Duration::from_secs(60),
            throttle_sweep_interval: Duration::from_secs(5),
            public_kinds: vec!["FeatureGate".to_string()],
            sink_capacity: 64,
            token_cookie: DEFAULT_TOKEN_COOKIE.to_string(),
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
            compression: CompressionConfig::default(),
            snapshot: SnapshotConfig::default(),
            limits: ConnectionLimits::default(),
            health: HealthConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

/// Compression configuration.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Negotiate gzip or deflate when the client accepts it.
    pub enabled: bool,
    /// Compression level, 0 to 9.
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 6,
        }
    }
}

impl CompressionConfig {
    /// Always send identity.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// How the initial snapshot is split into packets.
///
/// Each round takes up to `*_per_round` events from every bucket in order
/// cluster, info, install, policy, addon, other, then emits an EOP marker.
/// Kinds not listed in any bucket go to the remainder, flushed afterwards in
/// chunks of `remainder_chunk`.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Cluster-like kinds.
    pub cluster_kinds: Vec<String>,
    /// Cluster info kinds.
    pub info_kinds: Vec<String>,
    /// Install-progress kinds.
    pub install_kinds: Vec<String>,
    /// Policy-like kinds.
    pub policy_kinds: Vec<String>,
    /// Addon kinds.
    pub addon_kinds: Vec<String>,
    /// Other fleet kinds.
    pub other_kinds: Vec<String>,
    /// Cluster events per round.
    pub cluster_per_round: usize,
    /// Info events per round.
    pub info_per_round: usize,
    /// Install-progress events per round.
    pub install_per_round: usize,
    /// Policy events per round.
    pub policy_per_round: usize,
    /// Addon events per round.
    pub addon_per_round: usize,
    /// Other events per round.
    pub other_per_round: usize,
    /// Remainder events per packet.
    pub remainder_chunk: usize,
}

fn kinds(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            cluster_kinds: kinds(&[
                "ManagedCluster",
                "ClusterDeployment",
                "ClusterPool",
                "ClusterClaim",
                "ManagedClusterSet",
                "ManagedClusterSetBinding",
            ]),
            info_kinds: kinds(&["ManagedClusterInfo"]),
            install_kinds: kinds(&["ClusterProvision", "ClusterCurator", "AnsibleJob"]),
            policy_kinds: kinds(&["Policy", "PolicyReport"]),
            addon_kinds: kinds(&["ManagedClusterAddOn", "ClusterManagementAddOn"]),
            other_kinds: kinds(&[
                "Namespace",
                "Secret",
                "ConfigMap",
                "FeatureGate",
                "MultiClusterHub",
                "BareMetalAsset",
                "ClusterImageSet",
                "MachinePool",
                "CertificateSigningRequest",
                "DiscoveryConfig",
                "DiscoveredCluster",
                "SubmarinerConfig",
            ]),
            cluster_per_round: 200,
            info_per_round: 200,
            install_per_round: 200,
            policy_per_round: 200,
            addon_per_round: 400,
            other_per_round: 100,
            remainder_chunk: 1000,
        }
    }
}
