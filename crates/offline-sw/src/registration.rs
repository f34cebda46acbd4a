//! Worker versions and the registration state machine.
//!
//! ```text
//! ServiceWorkerRegistration (scope)
//!     ├── installing (ServiceWorker)
//!     ├── waiting    (ServiceWorker)
//!     └── active     (ServiceWorker)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use offline_net::Url;
use serde::{Deserialize, Serialize};

use crate::config::WorkerConfig;

/// Unique identifier for a worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Precaching.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Evicting stale caches and claiming clients.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}

/// One version of the worker.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,
    pub config: Arc<WorkerConfig>,
    pub state: ServiceWorkerState,
    /// Error message if install failed.
    pub error: Option<String>,
}

impl ServiceWorker {
    pub fn new(config: Arc<WorkerConfig>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            config,
            state: ServiceWorkerState::Parsed,
            error: None,
        }
    }

    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
    }

    /// Version tag of this worker.
    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

/// A registration: one scope, up to three worker slots.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    pub scope: Url,
    pub installing: Option<ServiceWorker>,
    pub waiting: Option<ServiceWorker>,
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Start installing a new version. Any previous installing worker
    /// becomes redundant.
    pub fn update(&mut self, config: Arc<WorkerConfig>) -> ServiceWorkerId {
        if let Some(mut previous) = self.installing.take() {
            previous.set_state(ServiceWorkerState::Redundant);
        }
        let mut worker = ServiceWorker::new(config);
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;
        self.installing = Some(worker);
        id
    }

    /// Installing → waiting. A worker already waiting is replaced.
    pub fn install_complete(&mut self) -> Option<ServiceWorkerId> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Installed);
        if let Some(mut replaced) = self.waiting.replace(worker) {
            replaced.set_state(ServiceWorkerState::Redundant);
        }
        self.waiting.as_ref().map(|w| w.id)
    }

    /// Installing → redundant. The active worker keeps control.
    pub fn install_failed(&mut self, error: impl Into<String>) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.error = Some(error.into());
        worker.set_state(ServiceWorkerState::Redundant);
        Some(worker)
    }

    /// Mark the waiting worker as activating and return a copy of it.
    pub fn begin_activation(&mut self) -> Option<ServiceWorker> {
        let worker = self.waiting.as_mut()?;
        worker.set_state(ServiceWorkerState::Activating);
        Some(worker.clone())
    }

    /// Waiting → active. The previous active worker becomes redundant and is
    /// returned.
    pub fn activate(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activated);
        self.active.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Mark every worker redundant.
    pub fn unregister(&mut self) {
        for slot in [&mut self.installing, &mut self.waiting, &mut self.active] {
            if let Some(mut worker) = slot.take() {
                worker.set_state(ServiceWorkerState::Redundant);
            }
        }
    }
}
