//! fleet-events server binary.
//!
//! Run with:
//! ```bash
//! CLUSTER_API_URL=https://api.hub:6443 TOKEN=sha256~... fleet-events --listen 0.0.0.0:4010
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use fleet_cache::{synthetic, ResourceCache, ThrottleConfig};
use fleet_core::ResourceKey;
use fleet_events::watch_list::{WatchConfig, IN_CLUSTER_API_URL};
use fleet_server::{shutdown, FleetServer, SelfSubjectAccessReviewer};
use fleet_watch::{build_client, HttpTransport, WatchManager};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Parser, Debug)]
#[command(version, about = "Live event stream of fleet resources")]
struct Args {
    /// API server base URL
    #[arg(long, env = "CLUSTER_API_URL", default_value = IN_CLUSTER_API_URL)]
    cluster_api_url: String,

    /// Bearer token for the watches; read from --token-file when absent
    #[arg(long, env = "TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// File holding the service account token
    #[arg(long, env = "TOKEN_FILE", default_value = SERVICE_ACCOUNT_TOKEN)]
    token_file: PathBuf,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:4010")]
    listen: SocketAddr,

    /// Never compress event streams
    #[arg(long, env = "DISABLE_COMPRESSION", default_value_t = false)]
    disable_compression: bool,

    /// Skip API server certificate verification
    #[arg(long, env = "INSECURE_SKIP_TLS_VERIFY", default_value_t = false)]
    insecure_skip_tls_verify: bool,

    /// Seconds a session may stay behind before it is dropped
    #[arg(long, env = "SESSION_TIMEOUT_SECS", default_value_t = 4 * 60 * 60)]
    session_timeout_secs: u64,

    /// ConfigMap published as SETTINGS, as namespace/name
    #[arg(long, env = "SETTINGS_CONFIGMAP")]
    settings_configmap: Option<String>,

    /// Inject this many synthetic managed clusters
    #[arg(long, env = "MOCK_CLUSTERS", default_value_t = 0)]
    mock_clusters: usize,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn watch_token(&self) -> anyhow::Result<String> {
        if let Some(token) = self.token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(token.to_string());
        }
        let token = std::fs::read_to_string(&self.token_file)
            .with_context(|| format!("service account token not found at {}", self.token_file.display()))?;
        Ok(token.trim().to_string())
    }

    fn settings_key(&self) -> anyhow::Result<Option<ResourceKey>> {
        let Some(value) = self.settings_configmap.as_deref() else {
            return Ok(None);
        };
        match value.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Some(ResourceKey::new("ConfigMap", namespace, name)))
            }
            _ => bail!("--settings-configmap must be namespace/name, got {value:?}"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = fleet_events::version::VERSION, "starting fleet-events");

    let watch = WatchConfig {
        api_url: args.cluster_api_url.clone(),
        insecure_skip_tls_verify: args.insecure_skip_tls_verify,
        settings: args.settings_key()?,
        ..WatchConfig::default()
    };
    let token = args.watch_token()?;
    let client = build_client(watch.insecure_skip_tls_verify)?;

    let mut cache = ResourceCache::builder().throttle(ThrottleConfig::default());
    if let Some(settings) = watch.settings.clone() {
        cache = cache.settings_source(settings);
    }
    let cache = Arc::new(cache.build());

    let transport = Arc::new(HttpTransport::new(client.clone(), watch.api_url.as_str(), token));
    let manager = Arc::new(WatchManager::new(transport, cache.clone(), watch.backoff));

    let mut builder = FleetServer::builder()
        .cache(Arc::clone(&cache))
        .reviewer(Arc::new(SelfSubjectAccessReviewer::new(client, watch.api_url.as_str())))
        .liveness_probe(manager.clone())
        .session_timeout(Duration::from_secs(args.session_timeout_secs));
    if args.disable_compression {
        builder = builder.disable_compression();
    }
    let server = builder.build()?;
    let grace_period = server.config().shutdown.grace_period;
    let handle = Arc::new(server.start()?);

    let targets = watch.all_targets();
    info!(watches = targets.len(), api = %watch.api_url, "starting watches");
    manager.watch_all(targets);

    if args.mock_clusters > 0 {
        synthetic::inject(cache.event_log(), args.mock_clusters);
    }

    let mut serving = tokio::spawn({
        let handle = Arc::clone(&handle);
        let addr = args.listen;
        async move { handle.serve(addr).await }
    });

    tokio::select! {
        joined = &mut serving => {
            manager.stop_all();
            joined.context("server task panicked")??;
            return Ok(());
        }
        signal = shutdown::wait_for_signal() => signal?,
    }

    info!("shutting down");
    manager.stop_all();
    handle.dispose(grace_period).await;
    match tokio::time::timeout(grace_period, serving).await {
        Ok(joined) => joined.context("server task panicked")??,
        Err(_) => warn!(grace_period = ?grace_period, "server did not stop within grace period"),
    }
    info!("fleet-events stopped");
    Ok(())
}
