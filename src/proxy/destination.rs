//! Destination selection strategies.
//!
//! A destination set is an ordered list of backend endpoints plus the
//! policy for picking the next one: read-only routes rotate round-robin,
//! read-write routes always walk the list from the front so the first
//! reachable server wins.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::endpoint::TcpEndpoint;

/// How the next backend is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Round-robin over the whole list.
    ReadOnly,
    /// Failover-ordered: always the first reachable endpoint.
    ReadWrite,
}

impl AccessMode {
    pub fn name(&self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "read-only",
            AccessMode::ReadWrite => "read-write",
        }
    }
}

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("no destinations available")]
    Empty,

    /// Every endpoint was tried once and none accepted within the timeout.
    #[error("no destination reachable")]
    NoneReachable,
}

/// Ordered backend list with a selection mode.
#[derive(Debug)]
pub struct DestinationSet {
    mode: AccessMode,
    destinations: Vec<TcpEndpoint>,
    cursor: AtomicUsize,
}

impl DestinationSet {
    pub fn new(mode: AccessMode) -> Self {
        Self {
            mode,
            destinations: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn add(&mut self, endpoint: TcpEndpoint) {
        self.destinations.push(endpoint);
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TcpEndpoint> {
        self.destinations.iter()
    }

    /// Open a connection to the next backend per the selection mode.
    ///
    /// Each candidate gets `connect_timeout`; the set is walked at most
    /// once per call.
    pub async fn connect(&self, connect_timeout: Duration) -> Result<TcpStream, DestinationError> {
        let count = self.destinations.len();
        if count == 0 {
            return Err(DestinationError::Empty);
        }

        let start = match self.mode {
            AccessMode::ReadOnly => self.cursor.fetch_add(1, Ordering::Relaxed) % count,
            AccessMode::ReadWrite => 0,
        };

        for i in 0..count {
            let endpoint = &self.destinations[(start + i) % count];
            match self.try_connect(endpoint, connect_timeout).await {
                Ok(stream) => {
                    debug!(backend = %endpoint, "connected to destination");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(backend = %endpoint, "destination connect failed: {e}");
                }
            }
        }

        Err(DestinationError::NoneReachable)
    }

    async fn try_connect(
        &self,
        endpoint: &TcpEndpoint,
        connect_timeout: Duration,
    ) -> io::Result<TcpStream> {
        match timeout(
            connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn empty_set_fails() {
        let set = DestinationSet::new(AccessMode::ReadOnly);
        assert!(matches!(
            set.connect(Duration::from_secs(1)).await,
            Err(DestinationError::Empty)
        ));
    }

    #[tokio::test]
    async fn read_write_skips_dead_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap();

        // A port nothing listens on; the listener that picked it is gone.
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let mut set = DestinationSet::new(AccessMode::ReadWrite);
        set.add(TcpEndpoint::new("127.0.0.1", dead.port()));
        set.add(TcpEndpoint::new("127.0.0.1", live.port()));

        let stream = set.connect(Duration::from_secs(2)).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), live);
    }

    #[tokio::test]
    async fn all_dead_reports_unreachable() {
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let mut set = DestinationSet::new(AccessMode::ReadWrite);
        set.add(TcpEndpoint::new("127.0.0.1", dead.port()));

        assert!(matches!(
            set.connect(Duration::from_secs(1)).await,
            Err(DestinationError::NoneReachable)
        ));
    }

    #[tokio::test]
    async fn round_robin_rotates_start() {
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut set = DestinationSet::new(AccessMode::ReadOnly);
        set.add(TcpEndpoint::new("127.0.0.1", a.local_addr().unwrap().port()));
        set.add(TcpEndpoint::new("127.0.0.1", b.local_addr().unwrap().port()));

        let first = set.connect(Duration::from_secs(2)).await.unwrap();
        let second = set.connect(Duration::from_secs(2)).await.unwrap();
        assert_ne!(first.peer_addr().unwrap(), second.peer_addr().unwrap());
    }
}
