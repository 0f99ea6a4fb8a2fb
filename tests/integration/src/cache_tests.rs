//! Watch-to-cache integration tests.
//!
//! A scripted transport replays watch bodies through [`WatchManager`] into a
//! [`ResourceCache`], and the tests check what lands in the event log.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fleet_events::prelude::*;
use parking_lot::Mutex;

/// Serves one body per request, then hangs.
#[derive(Default)]
struct Replay {
    bodies: Mutex<VecDeque<Vec<String>>>,
    paths: Mutex<Vec<String>>,
}

impl Replay {
    fn new(bodies: Vec<Vec<&str>>) -> Arc<Self> {
        Arc::new(Self {
            bodies: Mutex::new(
                bodies
                    .into_iter()
                    .map(|lines| lines.into_iter().map(str::to_string).collect())
                    .collect(),
            ),
            paths: Mutex::default(),
        })
    }
}

#[async_trait]
impl WatchTransport for Replay {
    async fn open(&self, path: &str) -> FleetResult<WatchResponse> {
        self.paths.lock().push(path.to_string());
        let Some(lines) = self.bodies.lock().pop_front() else {
            return futures::future::pending().await;
        };
        // Split every line in two chunks to exercise line buffering.
        let mut chunks: Vec<FleetResult<Bytes>> = Vec::new();
        for line in lines {
            let line = format!("{line}\n");
            let (head, tail) = line.split_at(line.len() / 2);
            chunks.push(Ok(Bytes::from(head.to_string())));
            chunks.push(Ok(Bytes::from(tail.to_string())));
        }
        Ok(WatchResponse {
            status: 200,
            retry_after: None,
            body: Box::pin(futures::stream::iter(chunks)),
        })
    }
}

fn cluster(kind: &str, name: &str, version: u32) -> String {
    serde_json::json!({
        "type": kind,
        "object": {
            "kind": "ManagedCluster",
            "apiVersion": "cluster.open-cluster-management.io/v1",
            "metadata": {
                "name": name,
                "uid": format!("uid-{name}"),
                "resourceVersion": version.to_string(),
                "labels": {"cloud": "Amazon"}
            },
            "spec": {"hubAcceptsClient": true}
        }
    })
    .to_string()
}

fn target() -> WatchTarget {
    WatchTarget::new("cluster.open-cluster-management.io/v1", "managedClusters")
}

fn key(name: &str) -> ResourceKey {
    ResourceKey::cluster_scoped("ManagedCluster", name)
}

async fn settle() {
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn watch_feeds_cache_and_resumes() {
    let first = cluster("ADDED", "c1", 5);
    let second = cluster("MODIFIED", "c1", 6);
    let transport = Replay::new(vec![vec![&first, &second]]);
    let cache = Arc::new(ResourceCache::builder().build());
    let manager = WatchManager::new(transport.clone(), cache.clone(), BackoffPolicy::default());

    assert!(manager.watch(target()));
    settle().await;

    let cached = cache.get(&key("c1")).expect("cluster should be cached");
    assert_eq!(cached.resource_version(), Some(&ResourceVersion::new("6")));
    // START, the cluster, LOADED
    assert_eq!(cache.event_log().len(), 3);

    let paths = transport.paths.lock().clone();
    assert_eq!(paths.len(), 2);
    assert!(!paths[0].contains("resourceVersion"));
    assert!(paths[1].ends_with("&resourceVersion=6"));

    manager.stop_all();
}

#[tokio::test(start_paused = true)]
async fn stale_replay_does_not_regress() {
    let newer = cluster("MODIFIED", "c1", 7);
    let older = cluster("MODIFIED", "c1", 6);
    let transport = Replay::new(vec![vec![&newer], vec![&older]]);
    let cache = Arc::new(ResourceCache::builder().build());
    let manager = WatchManager::new(transport, cache.clone(), BackoffPolicy::default());

    manager.watch(target());
    settle().await;

    let cached = cache.get(&key("c1")).unwrap();
    assert_eq!(cached.resource_version(), Some(&ResourceVersion::new("7")));
    assert_eq!(cache.stats().stale(), 1);
    manager.stop_all();
}

#[tokio::test(start_paused = true)]
async fn deleted_reaches_log_as_tombstone() {
    let added = cluster("ADDED", "c1", 1);
    let deleted = cluster("DELETED", "c1", 2);
    let transport = Replay::new(vec![vec![&added, &deleted]]);
    let cache = Arc::new(ResourceCache::builder().build());
    let manager = WatchManager::new(transport, cache.clone(), BackoffPolicy::default());

    manager.watch(target());
    settle().await;

    let events = cache.event_log().events();
    let object = events
        .iter()
        .find_map(|event| match &event.data {
            EventData::Deleted { object } => Some(object.clone()),
            _ => None,
        })
        .expect("delete should be logged");
    assert_eq!(object.name(), Some("c1"));
    assert!(object.metadata.labels.is_none());
    assert!(object.spec.is_none());

    // The ADDED event was superseded.
    assert!(!events
        .iter()
        .any(|event| matches!(event.data, EventData::Added { .. })));
    manager.stop_all();
}

#[tokio::test(start_paused = true)]
async fn unparseable_lines_are_skipped() {
    let good = cluster("ADDED", "c2", 3);
    let transport = Replay::new(vec![vec!["{not json", &good]]);
    let cache = Arc::new(ResourceCache::builder().build());
    let manager = WatchManager::new(transport, cache.clone(), BackoffPolicy::default());

    manager.watch(target());
    settle().await;

    assert!(cache.get(&key("c2")).is_some());
    assert_eq!(cache.len(), 1);
    manager.stop_all();
}

#[test]
fn exactly_one_loaded_after_many_pushes() {
    let cache = ResourceCache::builder().build();
    for version in 1..=50 {
        let line = cluster("MODIFIED", &format!("c{}", version % 7), version);
        cache.apply(WatchRecord::from_line(line.as_bytes()).unwrap());
    }

    let events = cache.event_log().events();
    let loaded = events
        .iter()
        .filter(|event| matches!(event.data, EventData::Loaded))
        .count();
    assert_eq!(loaded, 1);
    assert!(matches!(events.last().unwrap().data, EventData::Loaded));
    assert!(matches!(events.first().unwrap().data, EventData::Start));
    // START, seven clusters, LOADED
    assert_eq!(events.len(), 9);
}
