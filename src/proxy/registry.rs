//! Live-connection registry.
//!
//! Sessions admitted under access control register here so an external
//! revalidation signal can re-check them and tear down the ones whose
//! permission has been revoked. The sweep never removes entries; the
//! owning session does that on its own teardown path.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::warn;

use super::policy::AbacClient;

#[derive(Debug)]
struct SessionEntry {
    id: u64,
    client_ip: String,
    client_port: u16,
    shutdown: Arc<Notify>,
}

/// Mutex-guarded list of live sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<Vec<SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Register a session; the returned handle is fired to ask the owner
    /// to shut down.
    pub async fn insert(&self, id: u64, client_ip: &str, client_port: u16) -> Arc<Notify> {
        let shutdown = Arc::new(Notify::new());
        self.sessions.lock().await.push(SessionEntry {
            id,
            client_ip: client_ip.to_string(),
            client_port,
            shutdown: Arc::clone(&shutdown),
        });
        shutdown
    }

    pub async fn remove(&self, id: u64) {
        self.sessions.lock().await.retain(|entry| entry.id != id);
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Re-check every live session against the access-control service and
    /// fire the shutdown handle of each session no longer permitted.
    ///
    /// Returns the number of sessions revoked.
    pub async fn revalidate(&self, policy: &AbacClient) -> usize {
        let sessions = self.sessions.lock().await;
        let mut revoked = 0;
        for entry in sessions.iter() {
            if !policy.permitted(&entry.client_ip, entry.client_port).await {
                warn!(
                    "invalidating connection {}:{}",
                    entry.client_ip, entry.client_port
                );
                entry.shutdown.notify_one();
                revoked += 1;
            }
        }
        revoked
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
