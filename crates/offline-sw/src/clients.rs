//! Open pages and which worker controls them.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use offline_net::Url;
use tokio::sync::RwLock;
use tracing::debug;

use crate::registration::ServiceWorkerId;

/// An open window.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub url: Url,
    /// Worker controlling this client, if any.
    pub controller: Option<ServiceWorkerId>,
}

/// Registry of clients (the `clients` global).
#[derive(Debug, Default)]
pub struct Clients {
    clients: RwLock<HashMap<String, Client>>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an uncontrolled window client.
    pub async fn open_window(&self, url: Url) -> Client {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let client = Client {
            id: format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed)),
            url,
            controller: None,
        };
        self.clients
            .write()
            .await
            .insert(client.id.clone(), client.clone());
        client
    }

    pub async fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    /// Make `worker` the controller of every client under `scope`. Returns
    /// the ids of clients whose controller changed.
    pub async fn claim(&self, scope: &Url, worker: ServiceWorkerId) -> Vec<String> {
        let mut clients = self.clients.write().await;
        let mut changed = Vec::new();
        for client in clients.values_mut() {
            if !client.url.as_str().starts_with(scope.as_str()) {
                continue;
            }
            if client.controller != Some(worker) {
                client.controller = Some(worker);
                changed.push(client.id.clone());
            }
        }
        debug!(scope = %scope, worker = ?worker, claimed = changed.len(), "Claimed clients");
        changed
    }
}
