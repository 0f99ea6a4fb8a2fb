//! The resource collections the console needs.

use fleet_core::ResourceKey;
use fleet_watch::{BackoffPolicy, WatchTarget};

/// Default API server address inside the cluster.
pub const IN_CLUSTER_API_URL: &str = "https://kubernetes.default.svc";

/// Where to watch and what.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// API server base URL.
    pub api_url: String,
    /// Skip certificate verification.
    pub insecure_skip_tls_verify: bool,
    /// Reconnection policy shared by every watch.
    pub backoff: BackoffPolicy,
    /// ConfigMap published as SETTINGS.
    pub settings: Option<ResourceKey>,
    /// Collections to watch.
    pub targets: Vec<WatchTarget>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            api_url: IN_CLUSTER_API_URL.to_string(),
            insecure_skip_tls_verify: false,
            backoff: BackoffPolicy::default(),
            settings: None,
            targets: default_targets(),
        }
    }
}

impl WatchConfig {
    /// Every collection to watch, including the settings ConfigMap.
    pub fn all_targets(&self) -> Vec<WatchTarget> {
        let mut targets = self.targets.clone();
        if let Some(settings) = &self.settings {
            let target = settings_target(settings);
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        targets
    }
}

/// Watch narrowed to one ConfigMap.
pub fn settings_target(key: &ResourceKey) -> WatchTarget {
    WatchTarget::new("v1", "configmaps")
        .field("metadata.namespace", key.namespace.as_str())
        .field("metadata.name", key.name.as_str())
}

/// Collections watched by default.
pub fn default_targets() -> Vec<WatchTarget> {
    const CLUSTER_V1: &str = "cluster.open-cluster-management.io/v1";
    const CLUSTER_V1ALPHA1: &str = "cluster.open-cluster-management.io/v1alpha1";
    const CLUSTER_V1BETA1: &str = "cluster.open-cluster-management.io/v1beta1";
    const HIVE: &str = "hive.openshift.io/v1";
    const ADDON: &str = "addon.open-cluster-management.io/v1alpha1";
    const DISCOVERY: &str = "discovery.open-cluster-management.io/v1alpha1";

    vec![
        WatchTarget::new("v1", "namespaces"),
        WatchTarget::new(CLUSTER_V1BETA1, "clusterCurators"),
        WatchTarget::new(CLUSTER_V1ALPHA1, "managedClusterSets"),
        WatchTarget::new(CLUSTER_V1ALPHA1, "managedClusterSetBindings"),
        WatchTarget::new(CLUSTER_V1, "managedClusters"),
        WatchTarget::new("internal.open-cluster-management.io/v1beta1", "managedClusterInfos"),
        WatchTarget::new("inventory.open-cluster-management.io/v1alpha1", "bareMetalAssets"),
        WatchTarget::new("operator.open-cluster-management.io/v1", "multiClusterHubs"),
        WatchTarget::new("certificates.k8s.io/v1", "certificateSigningRequests")
            .label("open-cluster-management.io/cluster-name", ""),
        WatchTarget::new(HIVE, "clusterClaims"),
        WatchTarget::new(HIVE, "clusterDeployments"),
        WatchTarget::new(HIVE, "clusterPools"),
        WatchTarget::new(HIVE, "clusterImageSets"),
        WatchTarget::new(HIVE, "clusterProvisions"),
        WatchTarget::new(HIVE, "machinePools"),
        WatchTarget::new(ADDON, "clusterManagementAddons"),
        WatchTarget::new(ADDON, "managedClusterAddons"),
        WatchTarget::new("v1", "secrets").label("cluster.open-cluster-management.io/credentials", ""),
        WatchTarget::new(DISCOVERY, "discoveryConfigs"),
        WatchTarget::new(DISCOVERY, "discoveredClusters"),
        WatchTarget::new("config.openshift.io/v1", "featureGates")
            .label("console.open-cluster-management.io", ""),
        WatchTarget::new("v1", "configmaps")
            .field("metadata.namespace", "openshift-config-managed")
            .field("metadata.name", "console-public"),
        WatchTarget::new("v1", "configmaps").field("metadata.name", "insight-content-data"),
        WatchTarget::new("wgpolicyk8s.io/v1alpha2", "policyreports"),
        WatchTarget::new("submarineraddon.open-cluster-management.io/v1alpha1", "submarinerconfigs"),
        WatchTarget::new("tower.ansible.com/v1alpha1", "ansiblejobs"),
        WatchTarget::new("policy.open-cluster-management.io/v1", "policies"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn default_targets_are_unique() {
        let targets = default_targets();
        let unique: HashSet<_> = targets.iter().collect();
        assert_eq!(unique.len(), targets.len());
    }

    #[test]
    fn console_config_maps_are_watched() {
        let paths: Vec<_> = default_targets().iter().map(|t| t.path(None)).collect();
        let config_maps: Vec<_> = paths
            .iter()
            .filter(|p| p.starts_with("/api/v1/configmaps?watch"))
            .collect();
        assert_eq!(config_maps.len(), 2);
        assert!(config_maps.iter().any(|p| p.contains("console-public")));
        assert!(config_maps
            .iter()
            .any(|p| p.contains("&fieldSelector=metadata.name=insight-content-data&")));
    }

    #[test]
    fn core_and_group_paths() {
        let targets = default_targets();
        assert!(targets[0].path(None).starts_with("/api/v1/namespaces?watch"));
        assert!(targets
            .iter()
            .any(|t| t.path(None).starts_with("/apis/policy.open-cluster-management.io/v1/policies?watch")));
    }

    #[test]
    fn settings_config_map_is_watched_once() {
        let mut config = WatchConfig {
            settings: Some(ResourceKey::new("ConfigMap", "multicluster-engine", "console-mce-config")),
            ..WatchConfig::default()
        };
        let count = config.all_targets().len();
        assert_eq!(count, default_targets().len() + 1);

        config.targets.push(settings_target(
            config.settings.as_ref().unwrap(),
        ));
        assert_eq!(config.all_targets().len(), count);
    }
}
