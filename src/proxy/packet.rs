//! Minimal MySQL client/server protocol framing.
//!
//! Only what the relay needs: the 4-byte packet header (3-byte
//! little-endian payload length, 1-byte sequence number), error-packet
//! detection, the `CLIENT_SSL` capability bit in the client's handshake
//! response, and synthesis of error packets and a fake handshake response.
//! The relay never decrypts, authenticates, or interprets payloads beyond
//! this.

use thiserror::Error;

/// Size of the packet header.
pub const HEADER_SIZE: usize = 4;

/// Capability flag set by a client requesting a TLS upgrade.
pub const CLIENT_SSL: u32 = 0x0000_0800;

/// Server error code: can't connect to the MySQL server.
pub const ERR_CANT_CONNECT: u16 = 2003;
/// Server error code: too many connections.
pub const ERR_TOO_MANY_CONNECTIONS: u16 = 1040;
/// Server error code: out of resources.
pub const ERR_OUT_OF_RESOURCES: u16 = 1041;
/// Server error code: host blocked because of too many connection errors.
pub const ERR_HOST_BLOCKED: u16 = 1129;

/// SQL state used when no more specific one applies.
pub const SQL_STATE_GENERAL: &str = "HY000";

const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

const MAX_ALLOWED_PACKET: u32 = 16 * 1024 * 1024;
const DEFAULT_CHARSET: u8 = 8;

const FAKE_USERNAME: &str = "ROUTER";
const FAKE_DATABASE: &str = "fake_router_login";
const FAKE_AUTH_PLUGIN: &str = "mysql_native_password";

/// Handshake framing violations. Any of these aborts the session and
/// counts toward blocking the source.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// The read did not cover the field the current state requires.
    #[error("handshake packet too short ({0} bytes)")]
    Truncated(usize),

    /// Sequence numbers stopped increasing by one.
    #[error("received incorrect packet number; aborting (was {0})")]
    SequenceBreak(u8),
}

/// Inspect one handshake-phase read and advance the packet-sequence state.
///
/// `pkt_seq` reaching 2 means the handshake phase is over: either the
/// server answered the client's response (possibly with an error packet,
/// which still completes the exchange from the relay's point of view), or
/// the client asked to switch to TLS and nothing after the request can be
/// inspected. The caller forwards the buffer verbatim on `Ok`.
pub fn inspect_handshake(buffer: &[u8], pkt_seq: &mut u8) -> Result<(), FramingError> {
    if buffer.len() < HEADER_SIZE {
        return Err(FramingError::Truncated(buffer.len()));
    }
    let seq = buffer[3];
    if *pkt_seq > 0 && seq != pkt_seq.wrapping_add(1) {
        return Err(FramingError::SequenceBreak(seq));
    }

    if buffer.len() < HEADER_SIZE + 1 {
        // Header only; the first payload byte drives every decision below.
        return Err(FramingError::Truncated(buffer.len()));
    }
    if buffer[4] == 0xff {
        // Error packet from the server while handshaking. Not a failed
        // handshake; the exchange is over once it is forwarded.
        *pkt_seq = 2;
        return Ok(());
    }

    if seq == 1 {
        // Client handshake response; the first four payload bytes are the
        // capability flags.
        if buffer.len() < HEADER_SIZE + 4 {
            return Err(FramingError::Truncated(buffer.len()));
        }
        let capabilities =
            u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
        if capabilities & CLIENT_SSL != 0 {
            // TLS upgrade requested; everything after this is opaque.
            *pkt_seq = 2;
            return Ok(());
        }
    }

    *pkt_seq = seq;
    Ok(())
}

/// Build a server error packet.
///
/// Layout: `length(3 LE) | seq | 0xFF | code(2 LE) | '#' | sqlstate | message`.
pub fn error_packet(sequence_id: u8, code: u16, message: &str, sql_state: &str) -> Vec<u8> {
    debug_assert_eq!(sql_state.len(), 5);
    let payload_len = 1 + 2 + 1 + sql_state.len() + message.len();
    let mut packet = Vec::with_capacity(HEADER_SIZE + payload_len);
    packet.extend_from_slice(&(payload_len as u32).to_le_bytes()[..3]);
    packet.push(sequence_id);
    packet.push(0xff);
    packet.extend_from_slice(&code.to_le_bytes());
    packet.push(b'#');
    packet.extend_from_slice(sql_state.as_bytes());
    packet.extend_from_slice(message.as_bytes());
    packet
}

/// Build the credential-less handshake response written to a backend when
/// its client is being rejected, so the backend observes a clean protocol
/// close instead of a naked reset.
pub fn fake_handshake_response() -> Vec<u8> {
    let capabilities = CLIENT_LONG_PASSWORD
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH;

    let mut payload = Vec::with_capacity(64);
    payload.extend_from_slice(&capabilities.to_le_bytes());
    payload.extend_from_slice(&MAX_ALLOWED_PACKET.to_le_bytes());
    payload.push(DEFAULT_CHARSET);
    payload.extend_from_slice(&[0u8; 23]);
    payload.extend_from_slice(FAKE_USERNAME.as_bytes());
    payload.push(0);
    payload.push(0); // empty auth response, length-encoded
    payload.extend_from_slice(FAKE_DATABASE.as_bytes());
    payload.push(0);
    payload.extend_from_slice(FAKE_AUTH_PLUGIN.as_bytes());
    payload.push(0);

    let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len());
    packet.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
    packet.push(1);
    packet.extend_from_slice(&payload);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
        packet.push(seq);
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn short_read_aborts() {
        let mut pkt_seq = 0;
        assert_eq!(
            inspect_handshake(&[0x01, 0x00], &mut pkt_seq),
            Err(FramingError::Truncated(2))
        );
    }

    #[test]
    fn header_only_read_aborts() {
        let mut pkt_seq = 0;
        assert_eq!(
            inspect_handshake(&[0x00, 0x00, 0x00, 0x01], &mut pkt_seq),
            Err(FramingError::Truncated(4))
        );
    }

    #[test]
    fn sequence_advances() {
        let mut pkt_seq = 0;
        inspect_handshake(&framed(0, &[0x0a, 0x35]), &mut pkt_seq).unwrap();
        assert_eq!(pkt_seq, 0);
        inspect_handshake(&framed(1, &[0x00, 0x00, 0x00, 0x00]), &mut pkt_seq).unwrap();
        assert_eq!(pkt_seq, 1);
        inspect_handshake(&framed(2, &[0x00]), &mut pkt_seq).unwrap();
        assert_eq!(pkt_seq, 2);
    }

    #[test]
    fn sequence_break_aborts() {
        let mut pkt_seq = 1;
        assert_eq!(
            inspect_handshake(&framed(3, &[0x00]), &mut pkt_seq),
            Err(FramingError::SequenceBreak(3))
        );
    }

    #[test]
    fn server_error_completes_handshake() {
        let mut pkt_seq = 1;
        let packet = error_packet(2, 1045, "Access denied", SQL_STATE_GENERAL);
        inspect_handshake(&packet, &mut pkt_seq).unwrap();
        assert_eq!(pkt_seq, 2);
    }

    #[test]
    fn ssl_request_completes_handshake() {
        let mut pkt_seq = 0;
        let caps = CLIENT_SSL | CLIENT_PROTOCOL_41;
        inspect_handshake(&framed(1, &caps.to_le_bytes()), &mut pkt_seq).unwrap();
        assert_eq!(pkt_seq, 2);
    }

    #[test]
    fn handshake_response_without_ssl_keeps_counting() {
        let mut pkt_seq = 0;
        let caps = CLIENT_PROTOCOL_41;
        inspect_handshake(&framed(1, &caps.to_le_bytes()), &mut pkt_seq).unwrap();
        assert_eq!(pkt_seq, 1);
    }

    #[test]
    fn truncated_capabilities_abort() {
        let mut pkt_seq = 0;
        assert_eq!(
            inspect_handshake(&framed(1, &[0x00, 0x08]), &mut pkt_seq),
            Err(FramingError::Truncated(6))
        );
    }

    #[test]
    fn error_packet_layout() {
        let packet = error_packet(0, ERR_TOO_MANY_CONNECTIONS, "Too many connections", "HY000");
        let payload_len = packet.len() - HEADER_SIZE;
        assert_eq!(
            u32::from_le_bytes([packet[0], packet[1], packet[2], 0]) as usize,
            payload_len
        );
        assert_eq!(packet[3], 0);
        assert_eq!(packet[4], 0xff);
        assert_eq!(u16::from_le_bytes([packet[5], packet[6]]), 1040);
        assert_eq!(packet[7], b'#');
        assert_eq!(&packet[8..13], b"HY000");
        assert_eq!(&packet[13..], b"Too many connections");
    }

    #[test]
    fn fake_handshake_response_layout() {
        let packet = fake_handshake_response();
        let payload_len =
            u32::from_le_bytes([packet[0], packet[1], packet[2], 0]) as usize;
        assert_eq!(packet.len(), HEADER_SIZE + payload_len);
        assert_eq!(packet[3], 1);

        let payload = &packet[HEADER_SIZE..];
        let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert_ne!(caps & CLIENT_PROTOCOL_41, 0);
        assert_eq!(caps & CLIENT_SSL, 0);
        // 4 caps + 4 max packet + 1 charset + 23 filler.
        assert_eq!(&payload[32..38], b"ROUTER");
        assert_eq!(payload[38], 0);
        assert_eq!(payload[39], 0);
        assert_eq!(&payload[40..57], b"fake_router_login");
    }
}
