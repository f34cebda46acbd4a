//! Install and activate handlers.
//!
//! Install precaches the manifest into the current version's store as one
//! unit: every entry is fetched before anything is written, and a store
//! created by a failed attempt is removed again. Activate evicts stale
//! stores of this app and claims open clients; each deletion stands alone.

use futures::future::{join_all, try_join_all};
use offline_net::{Fetcher, Request, RequestMode, Response};
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheError, CacheStorage};
use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::registration::ServiceWorkerId;
use crate::ServiceWorkerError;

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub cache_name: String,
    /// Number of manifest entries stored.
    pub precached: usize,
    /// Activate right away instead of waiting for old clients to close.
    pub skip_waiting: bool,
}

/// What activation did.
#[derive(Debug, Default)]
pub struct ActivateReport {
    /// Stale stores that were deleted.
    pub deleted: Vec<String>,
    /// Stale stores whose deletion failed; they were skipped.
    pub failed: Vec<(String, CacheError)>,
    /// Set when the store names could not be listed at all.
    pub listing_error: Option<CacheError>,
    /// Clients whose controller changed.
    pub claimed: Vec<String>,
}

/// Precache the manifest into the current version's store.
pub async fn install(
    config: &WorkerConfig,
    caches: &dyn CacheStorage,
    fetcher: &dyn Fetcher,
) -> Result<InstallOutcome, ServiceWorkerError> {
    let existed = caches.has(&config.cache_name).await?;
    let cache = caches.open(&config.cache_name).await?;

    info!(
        cache = %config.cache_name,
        entries = config.precache_urls.len(),
        "Installing"
    );

    match precache(config, cache.as_ref(), fetcher).await {
        Ok(precached) => {
            info!(cache = %config.cache_name, precached, "Install complete");
            Ok(InstallOutcome {
                cache_name: config.cache_name.clone(),
                precached,
                skip_waiting: true,
            })
        }
        Err(e) => {
            warn!(cache = %config.cache_name, error = %e, "Install failed");
            if !existed {
                if let Err(cleanup) = caches.delete(&config.cache_name).await {
                    warn!(cache = %config.cache_name, error = %cleanup, "Could not remove partial cache");
                }
            }
            Err(e)
        }
    }
}

async fn precache(
    config: &WorkerConfig,
    cache: &dyn Cache,
    fetcher: &dyn Fetcher,
) -> Result<usize, ServiceWorkerError> {
    let requests: Vec<Request> = config
        .precache_urls
        .iter()
        .map(|url| Request::get(url.clone()).mode(RequestMode::SameOrigin))
        .collect();

    let responses = try_join_all(requests.iter().map(|request| fetch_ok(fetcher, request))).await?;

    for (request, response) in requests.iter().zip(&responses) {
        cache.put(request, response).await?;
    }
    Ok(responses.len())
}

async fn fetch_ok(fetcher: &dyn Fetcher, request: &Request) -> Result<Response, ServiceWorkerError> {
    let response = fetcher
        .fetch(request)
        .await
        .map_err(|source| ServiceWorkerError::Precache {
            url: request.url.clone(),
            source,
        })?;
    if !response.ok() {
        return Err(ServiceWorkerError::PrecacheStatus {
            url: request.url.clone(),
            status: response.status,
        });
    }
    debug!(url = %request.url, "Precached");
    Ok(response)
}

/// Delete stale stores, then claim clients under the scope.
///
/// A failed deletion is logged and skipped; it never blocks the claim.
pub async fn activate(
    config: &WorkerConfig,
    caches: &dyn CacheStorage,
    clients: &Clients,
    worker: ServiceWorkerId,
) -> ActivateReport {
    let mut report = ActivateReport::default();

    match caches.keys().await {
        Ok(names) => {
            let stale: Vec<String> = names
                .into_iter()
                .filter(|name| config.is_stale_cache(name))
                .collect();

            let results = join_all(stale.iter().map(|name| caches.delete(name))).await;

            for (name, result) in stale.into_iter().zip(results) {
                match result {
                    Ok(true) => {
                        info!(cache = %name, "Deleted stale cache");
                        report.deleted.push(name);
                    }
                    Ok(false) => debug!(cache = %name, "Stale cache already gone"),
                    Err(e) => {
                        warn!(cache = %name, error = %e, "Failed to delete stale cache");
                        report.failed.push((name, e));
                    }
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "Could not list caches, skipping eviction");
            report.listing_error = Some(e);
        }
    }

    report.claimed = clients.claim(&config.scope, worker).await;
    info!(
        cache = %config.cache_name,
        deleted = report.deleted.len(),
        claimed = report.claimed.len(),
        "Activated"
    );
    report
}
