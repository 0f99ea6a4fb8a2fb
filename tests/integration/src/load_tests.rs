//! Load tests for the session registry with synthetic fleets.
//!
//! These tests verify the system can handle high load scenarios:
//! - Hundreds of sessions receiving a large packed snapshot
//! - Concurrent pushes broadcast to every session in order
//! - Slow consumers that do not hold up the others
//!
//! Run with: `cargo test --package integration-tests --test load_tests -- --nocapture`

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use fleet_events::cache::synthetic;
use fleet_events::prelude::*;
use tokio::sync::mpsc;

struct AllowAll;

#[async_trait]
impl AccessReviewer for AllowAll {
    async fn review(&self, _: &str, _: &AccessTarget, _: Verb) -> FleetResult<bool> {
        Ok(true)
    }
}

fn start(cache: Arc<ResourceCache>) -> ServerHandle {
    FleetServerBuilder::new()
        .cache(cache)
        .reviewer(Arc::new(AllowAll))
        .keepalive_interval(Duration::from_secs(3600))
        .build()
        .unwrap()
        .start()
        .unwrap()
}

fn connect(handle: &ServerHandle, token: &str, capacity: usize) -> mpsc::Receiver<Bytes> {
    let id = SessionId::new();
    let (sink, rx) = ChannelSink::channel(id, capacity);
    let encoder = StreamEncoder::new(Encoding::Identity, &CompressionConfig::default());
    handle
        .registry()
        .register(id, Arc::from(token), SessionFilter::default(), encoder, Arc::new(sink));
    rx
}

/// Parsed `(id, type)` of an identity frame.
fn parse(frame: &Bytes) -> (u64, String) {
    let text = std::str::from_utf8(frame).unwrap();
    let id = text
        .lines()
        .find_map(|line| line.strip_prefix("id:"))
        .unwrap()
        .parse()
        .unwrap();
    let data = text
        .lines()
        .find_map(|line| line.strip_prefix("data:"))
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(data).unwrap();
    (id, value["type"].as_str().unwrap().to_string())
}

/// Read frames until the first LOADED. Returns the number of frames.
async fn read_snapshot(rx: &mut mpsc::Receiver<Bytes>) -> usize {
    let mut frames = 0;
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("snapshot timed out")
            .expect("session closed");
        frames += 1;
        if parse(&frame).1 == "LOADED" {
            return frames;
        }
    }
}

fn cluster(index: usize) -> WatchRecord {
    let line = serde_json::json!({
        "type": "ADDED",
        "object": {
            "kind": "ManagedCluster",
            "apiVersion": "cluster.open-cluster-management.io/v1",
            "metadata": {"name": format!("live-{index}"), "resourceVersion": "1"}
        }
    })
    .to_string();
    WatchRecord::from_line(line.as_bytes()).unwrap()
}

/// Every session receives the whole synthetic fleet.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_200_sessions_snapshot() {
    let cache = Arc::new(ResourceCache::builder().build());
    let injected = synthetic::inject(cache.event_log(), 100);
    let handle = start(Arc::clone(&cache));
    let num_sessions = 200;

    let start = Instant::now();
    let readers: Vec<_> = (0..num_sessions)
        .map(|i| {
            let mut rx = connect(&handle, &format!("user-{}", i % 10), 64);
            tokio::spawn(async move { read_snapshot(&mut rx).await })
        })
        .collect();

    let mut counts = Vec::with_capacity(num_sessions);
    for reader in readers {
        counts.push(reader.await.unwrap());
    }
    let duration = start.elapsed();
    println!(
        "{} sessions received {} events each in {:?}",
        num_sessions, injected, duration
    );

    let min = counts.iter().min().copied().unwrap();
    let max = counts.iter().max().copied().unwrap();
    assert_eq!(min, max, "every session sees the same snapshot");
    assert!(min > injected, "snapshot holds every injected event plus markers");

    handle.dispose(Duration::from_secs(1)).await;
}

/// Concurrent pushes reach every session, in log order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pushes_are_ordered() {
    let cache = Arc::new(ResourceCache::builder().build());
    let handle = start(Arc::clone(&cache));
    let num_sessions = 50;
    let num_writers = 4;
    let per_writer = 250;

    let mut receivers: Vec<_> = (0..num_sessions)
        .map(|_| connect(&handle, "admin", 4096))
        .collect();
    for rx in &mut receivers {
        read_snapshot(rx).await;
    }

    let start = Instant::now();
    let writers: Vec<_> = (0..num_writers)
        .map(|w| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                for i in 0..per_writer {
                    cache.apply(cluster(w * per_writer + i));
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let total = num_writers * per_writer;
    let readers: Vec<_> = receivers
        .into_iter()
        .map(|mut rx| {
            tokio::spawn(async move {
                let mut added = 0;
                let mut last = 0;
                while added < total {
                    let frame = tokio::time::timeout(Duration::from_secs(30), rx.recv())
                        .await
                        .expect("live events timed out")
                        .expect("session closed");
                    let (id, kind) = parse(&frame);
                    assert!(id > last, "ids must increase: {id} after {last}");
                    last = id;
                    if kind == "ADDED" {
                        added += 1;
                    }
                }
                added
            })
        })
        .collect();
    for reader in readers {
        assert_eq!(reader.await.unwrap(), total);
    }
    println!(
        "broadcast {} pushes to {} sessions in {:?}",
        total,
        num_sessions,
        start.elapsed()
    );

    let live = cache
        .event_log()
        .events()
        .iter()
        .filter(|e| matches!(e.data, EventData::Added { .. }))
        .count();
    assert_eq!(live, total);
    handle.dispose(Duration::from_secs(1)).await;
}

/// A consumer that never reads does not hold up the others.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_consumer_does_not_block_broadcast() {
    let cache = Arc::new(ResourceCache::builder().build());
    let handle = start(Arc::clone(&cache));

    let _stalled = connect(&handle, "admin", 1);
    let mut healthy = connect(&handle, "admin", 1024);
    read_snapshot(&mut healthy).await;

    for i in 0..200 {
        cache.apply(cluster(i));
    }

    let mut added = 0;
    while added < 200 {
        let frame = tokio::time::timeout(Duration::from_secs(10), healthy.recv())
            .await
            .expect("healthy session stalled")
            .unwrap();
        if parse(&frame).1 == "ADDED" {
            added += 1;
        }
    }
    assert_eq!(handle.registry().len(), 2);
    handle.dispose(Duration::from_secs(1)).await;
}
