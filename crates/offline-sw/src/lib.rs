//! # Offline Service Worker
//!
//! An offline caching worker for a static web app: it precaches the app
//! shell, evicts caches left by older versions, and answers intercepted
//! requests from a versioned cache.
//!
//! ## Features
//!
//! - **Scope resolution**: base path prefix derived from the registration scope
//! - **Lifecycle**: install (precache), activate (stale eviction, client claim)
//! - **Routing**: navigation / app resource / runtime CDN resource / pass-through
//! - **Strategies**: cache-first and network-first with offline fallback
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerHost
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing / waiting / active (ServiceWorker + WorkerConfig)
//!     ├── CacheStorage ── Cache ── CacheKey → CacheEntry
//!     ├── Fetcher (network)
//!     └── Clients
//!
//! fetch event ─▶ Router::classify ─▶ cache_first | navigation_fallback | pass-through
//! ```

use std::sync::Arc;

use offline_net::{Fetcher, NetError, Request, Url};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

pub mod cache;
pub mod clients;
pub mod config;
pub mod lifecycle;
pub mod registration;
pub mod router;
pub mod strategy;

pub use cache::{Cache, CacheEntry, CacheError, CacheKey, CacheStorage, MemoryCache, MemoryCacheStorage};
pub use clients::{Client, Clients};
pub use config::{base_prefix, ConfigError, WorkerConfig, WorkerSettings};
pub use lifecycle::{ActivateReport, InstallOutcome};
pub use registration::{ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState};
pub use router::{FetchOutcome, Route, Router};
pub use strategy::{BestEffort, CacheUpdate, HandledResponse, ResponseSource, OFFLINE_PAGE};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Precache of {url} failed: {source}")]
    Precache {
        url: Url,
        #[source]
        source: NetError,
    },

    #[error("Precache of {url} returned status {status}")]
    PrecacheStatus { url: Url, status: u16 },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    StateError(String),
}

// ==================== Events ====================

/// Notifications emitted by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        version: String,
        new_state: ServiceWorkerState,
    },
    /// A client is now controlled by a different worker.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
    /// Stale stores were removed during activation.
    CachesDeleted { names: Vec<String> },
}

// ==================== Host ====================

/// Runs one registration: dispatches install, activate and fetch events to
/// the right worker version.
pub struct ServiceWorkerHost {
    scope: String,
    registration: RwLock<ServiceWorkerRegistration>,
    caches: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<Clients>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerHost {
    /// Create a host for `scope`.
    pub fn new(
        scope: &str,
        caches: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>), ServiceWorkerError> {
        let scope_url = Url::parse(scope).map_err(|e| ConfigError::InvalidScope {
            scope: scope.to_string(),
            reason: e.to_string(),
        })?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                scope: scope.to_string(),
                registration: RwLock::new(ServiceWorkerRegistration::new(scope_url)),
                caches,
                fetcher,
                clients: Arc::new(Clients::new()),
                event_tx,
            },
            event_rx,
        ))
    }

    pub fn clients(&self) -> Arc<Clients> {
        Arc::clone(&self.clients)
    }

    pub fn caches(&self) -> Arc<dyn CacheStorage> {
        Arc::clone(&self.caches)
    }

    /// Install a new version and, when it asks to skip waiting, activate it.
    ///
    /// On install failure the new version becomes redundant and the current
    /// active version, if any, stays in control.
    pub async fn register(
        &self,
        settings: &WorkerSettings,
    ) -> Result<InstallOutcome, ServiceWorkerError> {
        let config = Arc::new(WorkerConfig::resolve(settings, &self.scope)?);
        let worker_id = self.registration.write().await.update(Arc::clone(&config));
        self.emit_state(worker_id, &config.version, ServiceWorkerState::Installing);

        let outcome =
            match lifecycle::install(&config, self.caches.as_ref(), self.fetcher.as_ref()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.registration.write().await.install_failed(e.to_string());
                    self.emit_state(worker_id, &config.version, ServiceWorkerState::Redundant);
                    return Err(e);
                }
            };

        self.registration.write().await.install_complete();
        self.emit_state(worker_id, &config.version, ServiceWorkerState::Installed);

        if outcome.skip_waiting {
            self.activate_waiting().await?;
        }
        Ok(outcome)
    }

    /// Activate the waiting worker.
    pub async fn activate_waiting(&self) -> Result<ActivateReport, ServiceWorkerError> {
        let worker = self
            .registration
            .write()
            .await
            .begin_activation()
            .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".into()))?;
        self.emit_state(worker.id, worker.version(), ServiceWorkerState::Activating);

        let report =
            lifecycle::activate(&worker.config, self.caches.as_ref(), &self.clients, worker.id)
                .await;

        let previous = self.registration.write().await.activate();
        if let Some(old) = previous {
            info!(version = old.version(), "Previous worker is redundant");
            self.emit_state(old.id, old.version(), ServiceWorkerState::Redundant);
        }
        self.emit_state(worker.id, worker.version(), ServiceWorkerState::Activated);

        if !report.deleted.is_empty() {
            self.emit(ServiceWorkerEvent::CachesDeleted {
                names: report.deleted.clone(),
            });
        }
        for client_id in &report.claimed {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                worker_id: worker.id,
            });
        }
        Ok(report)
    }

    /// Dispatch a fetch event to the active worker. Without one, nothing is
    /// intercepted.
    pub async fn handle_fetch(&self, request: &Request) -> Result<FetchOutcome, NetError> {
        match self.router().await {
            Some(router) => router.handle(request).await,
            None => Ok(FetchOutcome::PassThrough),
        }
    }

    /// Router for the active worker.
    pub async fn router(&self) -> Option<Router> {
        let registration = self.registration.read().await;
        let active = registration.get_active()?;
        Some(Router::new(
            Arc::clone(&active.config),
            Arc::clone(&self.caches),
            Arc::clone(&self.fetcher),
        ))
    }

    /// Version tag of the active worker.
    pub async fn active_version(&self) -> Option<String> {
        let registration = self.registration.read().await;
        registration.get_active().map(|w| w.version().to_string())
    }

    /// Unregister: every worker becomes redundant and fetches pass through.
    pub async fn unregister(&self) {
        self.registration.write().await.unregister();
    }

    fn emit_state(&self, worker_id: ServiceWorkerId, version: &str, new_state: ServiceWorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id,
            version: version.to_string(),
            new_state,
        });
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        if self.event_tx.send(event).is_err() {
            warn!("Service worker event receiver dropped");
        }
    }
}
