//! Per-connection session worker.
//!
//! Owns the client and backend sockets for one proxied connection: opens
//! the backend, runs the access-control check, then splices bytes in both
//! directions, inspecting handshake framing until the exchange completes.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::endpoint::SourceKey;
use super::packet::{self, FramingError};
use super::router::Router;

/// Why a splice direction stopped.
#[derive(Debug, Error)]
pub enum SpliceError {
    /// The sender closed its end.
    #[error("connection closed")]
    Disconnected,

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Copy whatever `sender` has ready over to `receiver`.
///
/// Returns the number of bytes moved; zero means the sender simply was not
/// readable. During the handshake phase the buffer is inspected and
/// `pkt_seq` advanced before the write-through.
async fn copy_packets(
    sender: &TcpStream,
    receiver: &mut TcpStream,
    buffer: &mut [u8],
    pkt_seq: &mut u8,
    handshake_done: bool,
) -> Result<usize, SpliceError> {
    let read = match sender.try_read(buffer) {
        Ok(0) => return Err(SpliceError::Disconnected),
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
        Err(e) => return Err(SpliceError::Io(e)),
    };

    if !handshake_done {
        packet::inspect_handshake(&buffer[..read], pkt_seq)?;
    }

    receiver.write_all(&buffer[..read]).await?;
    Ok(read)
}

/// Handle one admitted client connection to completion.
pub(crate) async fn run_session(router: &Router, mut client: TcpStream, peer: SocketAddr) {
    let mut backend = match router
        .destinations
        .connect(router.destination_connect_timeout)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            warn!(route = %router.name, "Can't connect to MySQL server ({e})");
            let error = packet::error_packet(
                0,
                packet::ERR_CANT_CONNECT,
                "Can't connect to MySQL server",
                packet::SQL_STATE_GENERAL,
            );
            if let Err(e) = client.write_all(&error).await {
                debug!(route = %router.name, "write error: {e}");
            }
            let _ = client.shutdown().await;
            return;
        }
    };

    let client_ip = peer.ip().to_string();
    let client_port = peer.port();

    // Only a permitted source may proceed; everything else is told the
    // server is unreachable and torn down.
    if !router.policy.permitted(&client_ip, client_port).await {
        let message = format!(
            "Can't connect to remote MySQL server for client '{}', ABAC check failure.",
            router.bind_address
        );
        warn!(route = %router.name, "{message}");
        let error =
            packet::error_packet(0, packet::ERR_CANT_CONNECT, &message, packet::SQL_STATE_GENERAL);
        if let Err(e) = client.write_all(&error).await {
            debug!(route = %router.name, "write error: {e}");
        }
        let _ = client.shutdown().await;
        let _ = backend.shutdown().await;
        return;
    }

    let session_id = router.next_session_id.fetch_add(1, Ordering::Relaxed);
    let registered = router.policy.enabled();
    let shutdown = if registered {
        router
            .registry
            .insert(session_id, &client_ip, client_port)
            .await
    } else {
        Arc::new(Notify::new())
    };

    router.handled.fetch_add(1, Ordering::Relaxed);
    if let Ok(server) = backend.peer_addr() {
        debug!(route = %router.name, client = %peer, server = %server, "routing started");
    }

    let mut buffer = vec![0u8; router.net_buffer_length];
    let mut pkt_seq: u8 = 0;
    let mut handshake_done = false;
    let mut bytes_up: u64 = 0;
    let mut bytes_down: u64 = 0;
    let mut extra_msg = String::new();

    loop {
        // One readiness wait over both sockets plus the revocation handle.
        // The server always talks first, so its direction is tried first.
        let wait = async {
            tokio::select! {
                ready = backend.readable() => ready.map(|()| true),
                ready = client.readable() => ready.map(|()| true),
                _ = shutdown.notified() => Ok(false),
            }
        };
        let ready = if handshake_done {
            wait.await
        } else {
            match timeout(router.client_connect_timeout, wait).await {
                Ok(ready) => ready,
                Err(_) => {
                    extra_msg = "Select timed out".to_string();
                    break;
                }
            }
        };
        match ready {
            Ok(true) => {}
            Ok(false) => {
                extra_msg = "connection revoked".to_string();
                break;
            }
            Err(e) => {
                extra_msg = format!("Select failed with error: {e}");
                break;
            }
        }

        if !handshake_done && pkt_seq == 2 {
            handshake_done = true;
        }

        match copy_packets(&backend, &mut client, &mut buffer, &mut pkt_seq, handshake_done).await {
            Ok(n) => bytes_up += n as u64,
            Err(e) => {
                if !matches!(e, SpliceError::Disconnected) {
                    extra_msg = format!("Copy server-client failed: {e}");
                }
                break;
            }
        }

        if !handshake_done && pkt_seq == 2 {
            handshake_done = true;
        }

        match copy_packets(&client, &mut backend, &mut buffer, &mut pkt_seq, handshake_done).await {
            Ok(n) => bytes_down += n as u64,
            Err(_) => break,
        }
    }

    if !handshake_done {
        debug!(route = %router.name, "Routing failed for {client_ip}: {extra_msg}");
        router
            .block_table
            .note_failure(SourceKey::from(peer.ip()), &client_ip, Some(&mut backend))
            .await;
    }

    if registered {
        router.registry.remove(session_id).await;
    }
    let _ = client.shutdown().await;
    let _ = backend.shutdown().await;

    debug!(
        route = %router.name,
        "Routing stopped (up:{bytes_up}b;down:{bytes_down}b) {extra_msg}"
    );
}
