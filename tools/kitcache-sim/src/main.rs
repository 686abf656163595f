//! Service worker cache simulator.
//!
//! Loads a build manifest, installs and activates a cache worker for a live
//! origin, then replays requests through it and reports where each
//! response came from.
//!
//! ## Usage
//!
//! ```bash
//! # Precache and fetch a few paths
//! kitcache-sim --manifest build/manifest.json --origin http://localhost:4173/ / /about
//!
//! # Same, but drop the network after install to exercise the fallbacks
//! kitcache-sim -m build/manifest.json -o http://localhost:4173/ --offline-after-install /
//!
//! # Keep the cache between runs
//! kitcache-sim -m build/manifest.json -o http://localhost:4173/ --snapshot caches.json /
//!
//! # Deploy a second build on top and accept the update prompt
//! kitcache-sim -m v1.json -o http://localhost:4173/ --update-manifest v2.json --accept-updates /
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use kitcache_common::{init_logging, LogConfig, LogFormat};
use kitcache_net::{HttpNetwork, LoaderConfig, NetError, Network, Request, Response};
use kitcache_sw::{
    BuildManifest, CacheStorage, CacheWorker, FetchEvent, NotifierAction, PageHost,
    ResponseSource, ServiceWorkerContainer, ServiceWorkerEvent, SharedCacheStorage,
    UpdateNotifier, WorkerConfig,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "kitcache-sim")]
#[command(about = "Replay requests through the kitcache service worker")]
struct Cli {
    /// Build manifest (version, build, files)
    #[arg(short, long)]
    manifest: PathBuf,

    /// Origin the app is served from
    #[arg(short, long)]
    origin: Url,

    /// Worker script path, relative to the origin
    #[arg(long, default_value = "/service-worker.js")]
    script: String,

    /// Cache storage snapshot to load before and save after the run
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Manifest of a newer build to install once the first one is active
    #[arg(long)]
    update_manifest: Option<PathBuf>,

    /// Answer yes to the update prompt
    #[arg(long)]
    accept_updates: bool,

    /// Treat the network as down once the worker is active
    #[arg(long)]
    offline_after_install: bool,

    /// Log output format (pretty, compact, json)
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,

    /// Log filter directives, e.g. "kitcache_sw=debug"
    #[arg(long)]
    log_filter: Option<String>,

    /// Debug-level logging with source locations and spans
    #[arg(short, long)]
    verbose: bool,

    /// Print the report as JSON lines
    #[arg(long)]
    json: bool,

    /// Paths to request after activation
    paths: Vec<String>,
}

/// Outcome of one replayed request.
#[derive(Debug, Serialize)]
struct RequestReport {
    path: String,
    status: Option<u16>,
    source: Option<&'static str>,
    bytes: usize,
    error: Option<String>,
}

impl RequestReport {
    fn line(&self) -> String {
        match (&self.error, self.status) {
            (Some(error), _) => format!("{:<40} FAILED  {}", self.path, error),
            (None, Some(status)) => format!(
                "{:<40} {:<7} {:>8} bytes  {}",
                self.path,
                status,
                self.bytes,
                self.source.unwrap_or("-")
            ),
            (None, None) => format!("{:<40} passthrough", self.path),
        }
    }
}

/// Network wrapper with an offline switch.
struct SwitchableNetwork {
    inner: HttpNetwork,
    offline: AtomicBool,
}

impl SwitchableNetwork {
    fn new(inner: HttpNetwork) -> Self {
        Self {
            inner,
            offline: AtomicBool::new(false),
        }
    }

    fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Network for SwitchableNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(request.url.to_string()));
        }
        self.inner.fetch(request).await
    }
}

/// Page stand-in that answers the update prompt from a flag.
struct ConsolePage {
    accept: bool,
}

impl PageHost for ConsolePage {
    fn confirm(&self, message: &str) -> bool {
        info!(accept = self.accept, "{}", message);
        self.accept
    }

    fn reload(&self) {
        info!("Page reloaded");
    }
}

type Notifier = UpdateNotifier<ServiceWorkerContainer, ConsolePage>;

/// Feed every queued registration event to the notifier.
async fn drain_events(
    notifier: &mut Notifier,
    events: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>,
) -> Result<Vec<NotifierAction>> {
    let mut actions = Vec::new();
    while let Ok(event) = events.try_recv() {
        let action = notifier.handle_event(&event).await?;
        if action != NotifierAction::None {
            actions.push(action);
        }
    }
    Ok(actions)
}

async fn load_worker(
    path: &Path,
    origin: &Url,
    caches: &SharedCacheStorage,
    network: &Arc<SwitchableNetwork>,
) -> Result<CacheWorker> {
    let manifest = BuildManifest::load(path)
        .await
        .with_context(|| format!("reading manifest {}", path.display()))?;
    let config = WorkerConfig::from_manifest(&manifest, origin.clone());
    info!(cache = %config.cache_name, assets = config.assets.len(), "Manifest loaded");

    Ok(CacheWorker::new(
        config,
        Arc::clone(caches),
        Arc::clone(network) as Arc<dyn Network>,
    ))
}

async fn load_storage(snapshot: Option<&Path>) -> Result<CacheStorage> {
    match snapshot {
        Some(path) if path.exists() => CacheStorage::load(path)
            .await
            .with_context(|| format!("loading snapshot {}", path.display())),
        _ => Ok(CacheStorage::new()),
    }
}

async fn replay(container: &ServiceWorkerContainer, origin: &Url, path: &str) -> RequestReport {
    let mut report = RequestReport {
        path: path.to_string(),
        status: None,
        source: None,
        bytes: 0,
        error: None,
    };

    let url = match origin.join(path) {
        Ok(url) => url,
        Err(e) => {
            report.error = Some(e.to_string());
            return report;
        }
    };

    let mut event = FetchEvent::new(Request::get(url));
    match container.handle_fetch(&mut event).await {
        Ok(decision) => {
            if let Some(response) = decision.response() {
                report.status = Some(response.status);
                report.bytes = response.body.len();
            }
            report.source = decision.source().map(|source| match source {
                ResponseSource::Cache => "cache",
                ResponseSource::Network => "network",
            });
        }
        Err(e) => report.error = Some(e.to_string()),
    }
    event.settled().await;
    report
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let base = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    let mut log_config = base.with_format(cli.log_format);
    if let Some(filter) = cli.log_filter.clone() {
        log_config = log_config.with_filter(filter);
    }
    init_logging(&log_config)?;

    let caches = load_storage(cli.snapshot.as_deref()).await?.shared();
    let network = Arc::new(SwitchableNetwork::new(HttpNetwork::new(LoaderConfig::default())?));

    let (container, mut events) = ServiceWorkerContainer::new();
    let mut notifier = UpdateNotifier::new(
        container.clone(),
        ConsolePage {
            accept: cli.accept_updates,
        },
    );
    let script = cli.origin.join(&cli.script)?;

    let worker = load_worker(&cli.manifest, &cli.origin, &caches, &network).await?;
    container
        .register(script.as_str(), Arc::new(worker))
        .await
        .context("installing service worker")?;
    drain_events(&mut notifier, &mut events).await?;

    if let Some(ref path) = cli.update_manifest {
        let worker = load_worker(path, &cli.origin, &caches, &network).await?;
        if let Err(e) = container.register(script.as_str(), Arc::new(worker)).await {
            warn!(error = %e, "Update failed to install, keeping current worker");
        }
        let actions = drain_events(&mut notifier, &mut events).await?;
        info!(?actions, "Update handled");
    }

    if cli.offline_after_install {
        warn!("Network switched off");
        network.go_offline();
    }

    for path in &cli.paths {
        let report = replay(&container, &cli.origin, path).await;
        if cli.json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            println!("{}", report.line());
        }
    }

    if let Some(ref path) = cli.snapshot {
        caches.read().await.save(path).await?;
    }

    Ok(())
}
