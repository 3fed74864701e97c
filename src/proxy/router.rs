//! The acceptor: binds the service, admits or rejects clients, and spawns
//! session workers.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::block::BlockTable;
use super::destination::{AccessMode, DestinationSet};
use super::endpoint::{parse_csv, AddressError, SourceKey, TcpEndpoint};
use super::packet;
use super::policy::AbacClient;
use super::registry::SessionRegistry;
use super::session;
use crate::config::RoutingConfig;

const LISTEN_BACKLOG: u32 = 20;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Invalid bind address, was '{address}', port {port}")]
    InvalidBindAddress { address: String, port: u16 },

    #[error(transparent)]
    Destinations(#[from] AddressError),

    /// URI destinations need the group directory service, which is an
    /// external collaborator; only CSV destinations resolve here.
    #[error("Invalid URI scheme '{scheme}' for URI {uri}")]
    UnsupportedUriScheme { scheme: String, uri: String },

    #[error("Failed getting address information for {address} ({source})")]
    Resolve { address: String, source: io::Error },

    #[error("Failed to setup service using {address} ({source})")]
    Bind { address: String, source: io::Error },
}

/// One configured routing service: a listen socket, a destination set, and
/// the admission state shared by its sessions.
#[derive(Debug)]
pub struct Router {
    pub(crate) name: String,
    mode: AccessMode,
    pub(crate) bind_address: TcpEndpoint,
    listener: TcpListener,
    pub(crate) destinations: DestinationSet,
    pub(crate) block_table: BlockTable,
    pub(crate) registry: SessionRegistry,
    pub(crate) policy: AbacClient,
    max_connections: u32,
    pub(crate) destination_connect_timeout: Duration,
    pub(crate) client_connect_timeout: Duration,
    pub(crate) net_buffer_length: usize,
    pub(crate) active: AtomicU32,
    pub(crate) handled: AtomicU64,
    pub(crate) next_session_id: AtomicU64,
    stopping: AtomicBool,
    stop_notify: Notify,
}

impl Router {
    /// Validate the destination list, resolve the bind address, and bind
    /// the listen socket.
    pub async fn bind(config: RoutingConfig) -> Result<Self, RouterError> {
        if !config.bind_address.is_valid() {
            return Err(RouterError::InvalidBindAddress {
                address: config.bind_address.host.clone(),
                port: config.bind_address.port,
            });
        }

        let mut destinations = DestinationSet::new(config.mode);
        if let Some((scheme, _)) = config.destinations.split_once("://") {
            return Err(RouterError::UnsupportedUriScheme {
                scheme: scheme.to_string(),
                uri: config.destinations.clone(),
            });
        }
        for endpoint in parse_csv(&config.destinations, &config.bind_address)? {
            destinations.add(endpoint);
        }

        let listener = Self::setup_service(&config.bind_address).await?;

        Ok(Self {
            name: config.name.clone(),
            mode: config.mode,
            listener,
            destinations,
            block_table: BlockTable::new(config.name.as_str(), u64::from(config.max_connect_errors)),
            registry: SessionRegistry::new(),
            policy: AbacClient::new(config.abac.clone()),
            max_connections: u32::from(config.max_connections),
            destination_connect_timeout: Duration::from_secs(u64::from(config.connect_timeout)),
            client_connect_timeout: Duration::from_secs(u64::from(config.client_connect_timeout)),
            net_buffer_length: config.net_buffer_length as usize,
            active: AtomicU32::new(0),
            handled: AtomicU64::new(0),
            next_session_id: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
            stop_notify: Notify::new(),
            bind_address: config.bind_address,
        })
    }

    /// Bind the first address the bind endpoint resolves to.
    async fn setup_service(bind: &TcpEndpoint) -> Result<TcpListener, RouterError> {
        let lookup = bind.lookup_str();
        let addrs: Vec<SocketAddr> = lookup_host(lookup.as_str())
            .await
            .map_err(|source| RouterError::Resolve {
                address: lookup.clone(),
                source,
            })?
            .collect();

        let mut last_error = io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved");
        for addr in addrs {
            match Self::bind_socket(addr) {
                Ok(listener) => return Ok(listener),
                Err(source) => last_error = source,
            }
        }
        Err(RouterError::Bind {
            address: lookup,
            source: last_error,
        })
    }

    fn bind_socket(addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = if addr.is_ipv6() {
            TcpSocket::new_v6()?
        } else {
            TcpSocket::new_v4()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(LISTEN_BACKLOG)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn active_connections(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn handled_connections(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub async fn blocked_hosts(&self) -> Vec<SourceKey> {
        self.block_table.blocked_hosts().await
    }

    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    /// Ask the accept loop to stop. In-flight sessions drain naturally.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        self.stop_notify.notify_one();
    }

    /// Re-check every live session against the access-control service and
    /// tear down the revoked ones.
    pub async fn revalidate(&self) -> usize {
        self.registry.revalidate(&self.policy).await
    }

    /// Accept and admit connections until asked to stop.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        info!(
            route = %self.name,
            "listening on {}; {}", self.bind_address, self.mode.name()
        );

        while !self.stopping() {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(route = %self.name, "Failed opening socket: {e}");
                        continue;
                    }
                },
                _ = self.stop_notify.notified() => break,
            };

            let key = SourceKey::from(peer.ip());
            if self.block_table.is_blocked(&key).await {
                let message = format!("Too many connection errors from {}", peer.ip());
                self.reject(
                    stream,
                    &packet::error_packet(
                        0,
                        packet::ERR_HOST_BLOCKED,
                        &message,
                        packet::SQL_STATE_GENERAL,
                    ),
                )
                .await;
                continue;
            }

            if self.active.load(Ordering::Relaxed) >= self.max_connections {
                self.reject(
                    stream,
                    &packet::error_packet(
                        0,
                        packet::ERR_TOO_MANY_CONNECTIONS,
                        "Too many connections",
                        packet::SQL_STATE_GENERAL,
                    ),
                )
                .await;
                warn!(
                    route = %self.name,
                    "reached max active connections ({})", self.max_connections
                );
                continue;
            }

            if let Err(e) = stream.set_nodelay(true) {
                error!(route = %self.name, "client setsockopt error: {e}");
                self.reject(
                    stream,
                    &packet::error_packet(
                        0,
                        packet::ERR_OUT_OF_RESOURCES,
                        "Out of resources (please check logs)",
                        packet::SQL_STATE_GENERAL,
                    ),
                )
                .await;
                continue;
            }

            self.active.fetch_add(1, Ordering::Relaxed);
            let router = Arc::clone(&self);
            tokio::spawn(async move {
                session::run_session(&router, stream, peer).await;
                router.active.fetch_sub(1, Ordering::Relaxed);
            });
        }

        info!(route = %self.name, "stopped");
        Ok(())
    }

    /// Write an admission error to the client and drop the socket without
    /// shutdown.
    async fn reject(&self, mut stream: TcpStream, packet: &[u8]) {
        if let Err(e) = stream.write_all(packet).await {
            debug!(route = %self.name, "write error: {e}");
        }
    }
}
