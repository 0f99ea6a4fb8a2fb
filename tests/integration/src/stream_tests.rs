//! End-to-end tests of the `/events` stream over a real socket.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::{GzDecoder, ZlibDecoder};
use fleet_events::prelude::*;
use futures::StreamExt;
use reqwest::header;
use tokio::net::TcpListener;

/// `admin` sees everything, `alice` only namespace `team-a`.
struct TeamReviewer;

#[async_trait]
impl AccessReviewer for TeamReviewer {
    async fn review(&self, token: &str, target: &AccessTarget, _verb: Verb) -> FleetResult<bool> {
        Ok(match token {
            "admin" => true,
            "alice" => target.namespace.as_deref() == Some("team-a"),
            _ => false,
        })
    }
}

fn config_map(namespace: &str, name: &str, version: u32) -> WatchRecord {
    let line = serde_json::json!({
        "type": "ADDED",
        "object": {
            "kind": "ConfigMap",
            "apiVersion": "v1",
            "metadata": {"name": name, "namespace": namespace, "resourceVersion": version.to_string()},
            "data": {"owner": namespace}
        }
    })
    .to_string();
    WatchRecord::from_line(line.as_bytes()).unwrap()
}

struct TestServer {
    server: FleetServer,
    handle: Arc<ServerHandle>,
    addr: SocketAddr,
}

impl TestServer {
    async fn start(cache: Arc<ResourceCache>, builder: FleetServerBuilder) -> Self {
        let server = builder
            .cache(cache)
            .reviewer(Arc::new(TeamReviewer))
            .build()
            .unwrap();
        let handle = Arc::new(server.start().unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = Arc::clone(&handle);
        tokio::spawn(async move { serving.serve_with_listener(listener).await });
        Self {
            server,
            handle,
            addr,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn connect(&self, token: &str, query: &str, accept: Option<&str>) -> reqwest::Response {
        let mut request = reqwest::Client::new()
            .get(self.url(&format!("/events{query}")))
            .header(header::COOKIE, format!("openshift-session-token={token}"));
        if let Some(accept) = accept {
            request = request.header(header::ACCEPT_ENCODING, accept);
        }
        request.send().await.unwrap()
    }
}

enum Decoder {
    Identity(Vec<u8>),
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(ZlibDecoder<Vec<u8>>),
}

/// Reads and decodes a stream incrementally.
struct StreamReader {
    body: futures::stream::LocalBoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: Decoder,
}

impl StreamReader {
    fn new(response: reqwest::Response) -> Self {
        let decoder = match response
            .headers()
            .get(header::CONTENT_ENCODING)
            .map(|v| v.to_str().unwrap().to_string())
            .as_deref()
        {
            Some("gzip") => Decoder::Gzip(GzDecoder::new(Vec::new())),
            Some("deflate") => Decoder::Deflate(ZlibDecoder::new(Vec::new())),
            _ => Decoder::Identity(Vec::new()),
        };
        Self {
            body: response.bytes_stream().boxed_local(),
            decoder,
        }
    }

    fn text(&self) -> String {
        let bytes = match &self.decoder {
            Decoder::Identity(out) => out.as_slice(),
            Decoder::Gzip(d) => d.get_ref().as_slice(),
            Decoder::Deflate(d) => d.get_ref().as_slice(),
        };
        String::from_utf8_lossy(bytes).into_owned()
    }

    async fn read_until(&mut self, needle: &str) -> String {
        while !self.text().contains(needle) {
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.body.next())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {needle}"))
                .expect("stream ended")
                .unwrap();
            match &mut self.decoder {
                Decoder::Identity(out) => out.extend_from_slice(&chunk),
                Decoder::Gzip(d) => {
                    d.write_all(&chunk).unwrap();
                    d.flush().unwrap();
                }
                Decoder::Deflate(d) => {
                    d.write_all(&chunk).unwrap();
                    d.flush().unwrap();
                }
            }
        }
        self.text()
    }
}

const LOADED: &str = "{\"type\":\"LOADED\"}";

fn seeded_cache() -> Arc<ResourceCache> {
    let cache = Arc::new(ResourceCache::builder().build());
    cache.apply(config_map("team-a", "cm-a", 1));
    cache.apply(config_map("team-b", "cm-b", 2));
    cache
}

#[tokio::test]
async fn gzip_stream_is_filtered_per_user() {
    let cache = seeded_cache();
    let server = TestServer::start(cache.clone(), FleetServerBuilder::new()).await;

    let response = server.connect("alice", "", Some("gzip, deflate, br")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(
        response.headers()[header::CACHE_CONTROL],
        "no-store, no-transform"
    );
    let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Strict"));

    let mut reader = StreamReader::new(response);
    let snapshot = reader.read_until(LOADED).await;
    assert!(snapshot.starts_with("id:1\ndata:{\"type\":\"START\"}\n\n"));
    assert!(snapshot.contains("\"name\":\"cm-a\""));
    assert!(!snapshot.contains("\"name\":\"cm-b\""));

    // Withheld events come first so a leak would show before the marker.
    cache.apply(config_map("team-b", "cm-b2", 3));
    cache.apply(config_map("team-a", "cm-a2", 4));
    let live = reader.read_until("\"name\":\"cm-a2\"").await;
    assert!(!live.contains("cm-b2"));

    server.handle.dispose(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn deflate_and_identity_negotiation() {
    let cache = seeded_cache();
    let server = TestServer::start(cache, FleetServerBuilder::new()).await;

    let response = server.connect("admin", "", Some("deflate")).await;
    assert_eq!(response.headers()[header::CONTENT_ENCODING], "deflate");
    let text = StreamReader::new(response).read_until(LOADED).await;
    assert!(text.contains("cm-a") && text.contains("cm-b"));

    let response = server.connect("admin", "", None).await;
    assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    let text = StreamReader::new(response).read_until(LOADED).await;
    assert!(text.contains("cm-a") && text.contains("cm-b"));

    server.handle.dispose(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn compression_can_be_disabled() {
    let server = TestServer::start(
        seeded_cache(),
        FleetServerBuilder::new().disable_compression(),
    )
    .await;

    let response = server.connect("admin", "", Some("gzip")).await;
    assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    StreamReader::new(response).read_until(LOADED).await;
    server.handle.dispose(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn namespace_query_filters_stream() {
    let server = TestServer::start(seeded_cache(), FleetServerBuilder::new()).await;

    let response = server.connect("admin", "?namespaces=team-b", None).await;
    let text = StreamReader::new(response).read_until(LOADED).await;
    assert!(text.contains("cm-b"));
    assert!(!text.contains("cm-a"));

    server.handle.dispose(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let server = TestServer::start(seeded_cache(), FleetServerBuilder::new()).await;

    let response = reqwest::get(server.url("/events")).await.unwrap();
    assert_eq!(response.status(), 401);
    assert!(server.handle.registry().is_empty());

    server.handle.dispose(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn closed_connection_deregisters_session() {
    let server = TestServer::start(seeded_cache(), FleetServerBuilder::new()).await;

    let response = server.connect("admin", "", None).await;
    let mut reader = StreamReader::new(response);
    reader.read_until(LOADED).await;
    assert_eq!(server.handle.registry().len(), 1);
    assert_eq!(server.server.connections().active_connections(), 1);

    drop(reader);
    for _ in 0..100 {
        if server.handle.registry().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(server.handle.registry().is_empty());
    assert_eq!(server.server.connections().active_connections(), 0);

    server.handle.dispose(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn keepalive_reaches_idle_clients() {
    let server = TestServer::start(
        seeded_cache(),
        FleetServerBuilder::new()
            .disable_compression()
            .keepalive_interval(Duration::from_millis(50)),
    )
    .await;

    let response = server.connect("admin", "", None).await;
    let mut reader = StreamReader::new(response);
    let snapshot = reader.read_until(LOADED).await;
    let text = reader.read_until(&format!("{snapshot}:\n\n")).await;
    assert!(text.ends_with(":\n\n"));

    server.handle.dispose(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn probes_and_shutdown() {
    let server = TestServer::start(seeded_cache(), FleetServerBuilder::new()).await;

    let live = reqwest::get(server.url("/livenessProbe")).await.unwrap();
    assert_eq!(live.status(), 200);
    let ready = reqwest::get(server.url("/readinessProbe")).await.unwrap();
    assert_eq!(ready.status(), 200);

    let response = server.connect("admin", "", None).await;
    let mut reader = StreamReader::new(response);
    reader.read_until(LOADED).await;

    assert!(server.handle.dispose(Duration::from_secs(1)).await);
    assert!(!server.server.health().is_ready());

    // Disposal ends open streams.
    let end = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = reader.body.next().await {
            if chunk.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(end.is_ok());
}
