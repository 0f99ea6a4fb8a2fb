//! Generated fleet data for load testing.
//!
//! Produces a managed cluster, its cluster info and a set of add-ons per
//! synthetic cluster, plus one policy reporting per-cluster compliance. The
//! events are pushed straight into the [`EventLog`], bypassing the cache, the
//! same way any external producer would inject them.

use fleet_core::{EventData, Resource};
use serde_json::{json, Value};
use tracing::info;

use crate::event_log::EventLog;

const ADDONS: &[&str] = &[
    "application-manager",
    "cert-policy-controller",
    "cluster-proxy",
    "config-policy-controller",
    "governance-policy-framework",
    "hypershift-addon",
    "work-manager",
    "managed-serviceaccount",
];

/// Cluster indexes (zero based) reported as non-compliant.
const NON_COMPLIANT: &[usize] = &[3, 18, 23, 55, 60, 80, 93];

fn resource(value: Value) -> Option<Resource> {
    serde_json::from_value(value).ok()
}

fn cluster(name: &str, index: usize) -> Option<Resource> {
    resource(json!({
        "kind": "ManagedCluster",
        "apiVersion": "cluster.open-cluster-management.io/v1",
        "metadata": {
            "name": name,
            "uid": format!("mock-cluster-{index}"),
            "resourceVersion": "1",
            "labels": {"cloud": "Amazon", "name": name, "vendor": "OpenShift"}
        },
        "spec": {"hubAcceptsClient": true, "leaseDurationSeconds": 60},
        "status": {
            "conditions": [
                {"type": "ManagedClusterConditionAvailable", "status": "True"},
                {"type": "ManagedClusterJoined", "status": "True"}
            ],
            "version": {"kubernetes": "v1.29.5"}
        }
    }))
}

fn cluster_info(name: &str, index: usize) -> Option<Resource> {
    resource(json!({
        "kind": "ManagedClusterInfo",
        "apiVersion": "internal.open-cluster-management.io/v1beta1",
        "metadata": {
            "name": name,
            "namespace": name,
            "uid": format!("mock-info-{index}"),
            "resourceVersion": "1"
        },
        "status": {
            "distributionInfo": {"type": "OCP"},
            "nodeList": [{"name": format!("{name}-master-0")}]
        }
    }))
}

fn addon(cluster: &str, addon: &str, index: usize) -> Option<Resource> {
    resource(json!({
        "kind": "ManagedClusterAddOn",
        "apiVersion": "addon.open-cluster-management.io/v1alpha1",
        "metadata": {
            "name": addon,
            "namespace": cluster,
            "uid": format!("mock-addon-{index}-{addon}"),
            "resourceVersion": "1"
        },
        "status": {
            "conditions": [{"type": "Available", "status": "True"}]
        }
    }))
}

fn policy(clusters: usize) -> Option<Resource> {
    let status: Vec<Value> = (0..clusters)
        .map(|index| {
            let compliant = match index {
                20 | 71 => "Pending",
                22 | 98 => "Unknown",
                i if NON_COMPLIANT.contains(&i) => "NonCompliant",
                _ => "Compliant",
            };
            let name = format!("cluster{}", index + 1);
            json!({"clustername": name, "clusternamespace": name, "compliant": compliant})
        })
        .collect();

    resource(json!({
        "kind": "Policy",
        "apiVersion": "policy.open-cluster-management.io/v1",
        "metadata": {
            "name": "mockPolicy",
            "namespace": "open-cluster-management-global-set",
            "uid": "mock-policy",
            "resourceVersion": "1"
        },
        "spec": {"disabled": false, "remediationAction": "inform"},
        "status": {"compliant": "NonCompliant", "status": status}
    }))
}

/// Generate events describing `clusters` synthetic managed clusters.
pub fn generate(clusters: usize) -> Vec<EventData> {
    let mut resources = Vec::with_capacity(clusters * (2 + ADDONS.len()) + 1);
    for index in 0..clusters {
        let name = format!("cluster{}", index + 1);
        resources.extend(cluster(&name, index));
        resources.extend(cluster_info(&name, index));
    }
    for addon_name in ADDONS {
        for index in 0..clusters {
            let name = format!("cluster{}", index + 1);
            resources.extend(addon(&name, addon_name, index));
        }
    }
    if clusters > 0 {
        resources.extend(policy(clusters));
    }

    resources
        .into_iter()
        .map(|object| EventData::Modified { object })
        .collect()
}

/// Push synthetic events into the log. Returns the number pushed.
pub fn inject(log: &EventLog, clusters: usize) -> usize {
    let events = generate(clusters);
    let count = events.len();
    for data in events {
        log.push_event(data);
    }
    info!(clusters, events = count, "injected synthetic fleet");
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_all_kinds() {
        let events = generate(3);
        // 3 clusters, 3 infos, 3 * 8 addons, 1 policy
        assert_eq!(events.len(), 3 + 3 + 24 + 1);

        let kinds: std::collections::BTreeSet<_> = events
            .iter()
            .filter_map(|e| e.resource().map(|r| r.kind.clone()))
            .collect();
        assert!(kinds.contains("ManagedCluster"));
        assert!(kinds.contains("ManagedClusterInfo"));
        assert!(kinds.contains("ManagedClusterAddOn"));
        assert!(kinds.contains("Policy"));
    }

    #[test]
    fn policy_reports_each_cluster() {
        let events = generate(100);
        let policy = events
            .iter()
            .filter_map(EventData::resource)
            .find(|r| r.kind == "Policy")
            .unwrap();
        let status = policy.status.as_ref().unwrap()["status"].as_array().unwrap();
        assert_eq!(status.len(), 100);
        assert_eq!(status[3]["compliant"], "NonCompliant");
        assert_eq!(status[20]["compliant"], "Pending");
        assert_eq!(status[22]["compliant"], "Unknown");
        assert_eq!(status[0]["compliant"], "Compliant");
    }

    #[test]
    fn inject_pushes_into_log() {
        let log = EventLog::new();
        let pushed = inject(&log, 2);
        assert_eq!(log.len(), pushed + 2);
        assert!(generate(0).is_empty());
    }
}
