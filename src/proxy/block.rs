//! Per-source handshake-failure accounting and host blocking.

use std::collections::{BTreeMap, BTreeSet};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::endpoint::SourceKey;
use super::packet;

#[derive(Default)]
#[derive(Debug)]
struct BlockTableInner {
    counters: BTreeMap<SourceKey, u64>,
    blocked: BTreeSet<SourceKey>,
}

/// Counts handshake failures per source address and marks sources blocked
/// once they reach `max_connect_errors`.
///
/// `note_failure` is the only writer. Admission tests the counter against
/// the threshold; the blocked set is kept as an observable snapshot of the
/// same condition.
#[derive(Debug)]
pub struct BlockTable {
    route: String,
    max_connect_errors: u64,
    inner: Mutex<BlockTableInner>,
}

impl BlockTable {
    pub fn new(route: impl Into<String>, max_connect_errors: u64) -> Self {
        Self {
            route: route.into(),
            max_connect_errors,
            inner: Mutex::new(BlockTableInner::default()),
        }
    }

    /// Record a handshake failure for `key`.
    ///
    /// Returns whether the source is now blocked. When a backend socket is
    /// given, a credential-less handshake response is written to it so the
    /// backend sees a clean protocol close; the write is best-effort and
    /// happens outside the table lock.
    pub async fn note_failure(
        &self,
        key: SourceKey,
        source: &str,
        backend: Option<&mut TcpStream>,
    ) -> bool {
        let blocked = {
            let mut inner = self.inner.lock().await;
            let counter = inner.counters.entry(key).or_insert(0);
            *counter += 1;
            let count = *counter;
            if count >= self.max_connect_errors {
                warn!(route = %self.route, "blocking client host {source}");
                inner.blocked.insert(key);
                true
            } else {
                info!(
                    route = %self.route,
                    "{count} authentication errors for {source} (max {max})",
                    max = self.max_connect_errors
                );
                false
            }
        };

        if let Some(stream) = backend {
            if let Err(e) = stream.write_all(&packet::fake_handshake_response()).await {
                debug!(route = %self.route, "write error: {e}");
            }
        }

        blocked
    }

    /// Whether `key` has reached the failure threshold.
    pub async fn is_blocked(&self, key: &SourceKey) -> bool {
        let inner = self.inner.lock().await;
        inner
            .counters
            .get(key)
            .is_some_and(|count| *count >= self.max_connect_errors)
    }

    /// Recorded failure count for `key`.
    pub async fn error_count(&self, key: &SourceKey) -> u64 {
        let inner = self.inner.lock().await;
        inner.counters.get(key).copied().unwrap_or(0)
    }

    /// Snapshot of the blocked set.
    pub async fn blocked_hosts(&self) -> Vec<SourceKey> {
        let inner = self.inner.lock().await;
        inner.blocked.iter().copied().collect()
    }
}
