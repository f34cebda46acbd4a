//! Offline shell smoke harness
//!
//! Registers the worker against a live origin, then replays a list of URLs
//! through its fetch handler: once cold, once warm, and optionally once with
//! the network switched off. Prints a JSON summary of where every response
//! came from.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use offline_common::{init_logging, LogConfig, LogFormat};
use offline_net::{
    Fetcher, LoaderConfig, NetError, Request, RequestMode, ResourceLoader, Response, Url,
};
use offline_sw::{
    BestEffort, CacheStorage, FetchOutcome, MemoryCacheStorage, ServiceWorkerHost,
    WorkerSettings,
};
use serde_json::{json, Value};
use tracing::{error, info};

/// Wraps the real loader with an offline switch.
struct SwitchableNetwork {
    inner: ResourceLoader,
    offline: AtomicBool,
}

#[async_trait]
impl Fetcher for SwitchableNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline);
        }
        self.inner.fetch(request).await
    }
}

/// Parse command line arguments
struct Args {
    scope: Option<String>,
    version: Option<String>,
    config: Option<PathBuf>,
    offline_pass: bool,
    navigations: Vec<String>,
    urls: Vec<String>,
    verbosity: u8,
    log_format: LogFormat,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            scope: None,
            version: None,
            config: None,
            offline_pass: false,
            navigations: Vec::new(),
            urls: Vec::new(),
            verbosity: 0,
            log_format: LogFormat::default(),
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--scope" => parsed.scope = args.next(),
                "--version" => parsed.version = args.next(),
                "--config" => parsed.config = args.next().map(PathBuf::from),
                "--offline" => parsed.offline_pass = true,
                "--navigate" => {
                    if let Some(url) = args.next() {
                        parsed.navigations.push(url);
                    }
                }
                "--log-format" => {
                    if let Some(format) = args.next() {
                        parsed.log_format = format.parse().unwrap_or_default();
                    }
                }
                "-v" => parsed.verbosity += 1,
                "-vv" => parsed.verbosity += 2,
                _ => parsed.urls.push(arg),
            }
        }

        parsed
    }

    fn settings(&self) -> anyhow::Result<WorkerSettings> {
        let mut settings = match self.config {
            Some(ref path) => WorkerSettings::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => WorkerSettings::default(),
        };
        if let Some(ref version) = self.version {
            settings.version = version.clone();
        }
        Ok(settings)
    }
}

fn usage() -> &'static str {
    "usage: offline-smoke --scope <url> [--version <tag>] [--config <file.json>] \
     [--offline] [--navigate <url>]... [-v|-vv] [--log-format pretty|compact|json] <url>..."
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_config = LogConfig::from_verbosity(args.verbosity).with_format(args.log_format);
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Warning: logging not initialised: {e}");
    }

    match run(args).await {
        Ok(summary) => match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                error!(error = %e, "Failed to serialise summary");
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!(error = %format!("{e:#}"), "Smoke run failed");
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<Value> {
    let Some(scope) = args.scope.clone() else {
        bail!("--scope is required\n{}", usage());
    };
    let settings = args.settings()?;
    let scope_url = Url::parse(&scope).context("parsing --scope")?;

    let network = Arc::new(SwitchableNetwork {
        inner: ResourceLoader::new(LoaderConfig::default())?,
        offline: AtomicBool::new(false),
    });
    let (host, _events) = ServiceWorkerHost::new(
        &scope,
        Arc::new(MemoryCacheStorage::new()),
        network.clone(),
    )?;

    let install = host.register(&settings).await?;
    info!(
        cache = %install.cache_name,
        precached = install.precached,
        "Worker registered"
    );

    let mut passes = vec![
        replay("cold", &host, &args, &scope_url).await?,
        replay("warm", &host, &args, &scope_url).await?,
    ];
    if args.offline_pass {
        network.offline.store(true, Ordering::SeqCst);
        passes.push(replay("offline", &host, &args, &scope_url).await?);
    }

    Ok(json!({
        "scope": scope,
        "cache": install.cache_name,
        "precached": install.precached,
        "active_version": host.active_version().await,
        "caches": host.caches().keys().await?,
        "passes": passes,
    }))
}

async fn replay(
    label: &str,
    host: &ServiceWorkerHost,
    args: &Args,
    page: &Url,
) -> anyhow::Result<Value> {
    let mut results = Vec::new();

    let navigations = args.navigations.iter().map(|u| (u, true));
    let subresources = args.urls.iter().map(|u| (u, false));

    for (url, is_navigation) in navigations.chain(subresources) {
        let url = Url::parse(url).with_context(|| format!("parsing {url}"))?;
        let request = if is_navigation {
            Request::navigate(url.clone())
        } else {
            Request::get(url.clone())
                .mode(RequestMode::NoCors)
                .referrer(page.clone())
        };

        let entry = match host.handle_fetch(&request).await {
            Ok(FetchOutcome::PassThrough) => json!({ "url": url.as_str(), "handled": false }),
            Ok(FetchOutcome::Respond(handled)) => {
                let write = match handled.cache_update.settle().await {
                    None => Value::Null,
                    Some(BestEffort::Stored) => json!("stored"),
                    Some(BestEffort::NotCacheable { status }) => json!(format!("skipped ({status})")),
                    Some(BestEffort::Failed(e)) => json!(format!("failed: {e}")),
                };
                json!({
                    "url": url.as_str(),
                    "handled": true,
                    "source": format!("{:?}", handled.source),
                    "status": handled.response.status,
                    "bytes": handled.response.bytes().len(),
                    "cache_write": write,
                })
            }
            Err(e) => json!({ "url": url.as_str(), "handled": true, "error": e.to_string() }),
        };
        results.push(entry);
    }

    Ok(json!({ "pass": label, "results": results }))
}
