use std::net::SocketAddr;

use bytes::Bytes;

use crate::packet::SEQUENCED_HEADER_LEN;

/// Maximum datagram size the protocol guarantees deliverable, chosen to fit the
/// IPv4 minimum reassembly buffer. Must match the server.
pub const MTU: usize = 548;

/// Payload bytes available in a sequenced datagram (MTU minus channel id and
/// sequence start).
pub const MAX_PACKET_PAYLOAD: usize = MTU - SEQUENCED_HEADER_LEN;

/// An in-flight packet is re-sent once this much time passed without a
/// confirmation. No backoff - the keep-alive timeout bounds the retry loop.
pub const RESEND_TIMEOUT_MS: u64 = 500;

/// Re-send cadence of the long INIT while the server has not answered yet.
pub const INIT_RESEND_INTERVAL_MS: u64 = 100;

/// Upper bound on confirmation entries per CONFIRMATION datagram.
pub const CONFIRMATION_BATCH_SIZE: usize = 16;

pub const KEEP_ALIVE_INTERVAL_MS: u64 = 2_000;

/// Four missed keep-alive intervals mean the server is gone.
pub const KEEP_ALIVE_TIMEOUT_MS: u64 = 8_000;

/// Period of the tick that drives sends, confirmation flushes and timeouts.
pub const TICK_INTERVAL_MS: u64 = 20;

/// Construction-time parameters of a client connection.
///
/// The wire-level constants above are fixed by the protocol and deliberately
/// not configurable - both sides must agree on them.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// address of the game server
    pub server_addr: SocketAddr,

    /// protocol id of the application handshake message that is queued on the
    /// `FAST` channel as soon as the server's INIT arrives
    pub handshake_protocol_id: u8,

    /// pre-built body of the application handshake message
    pub handshake_payload: Bytes,
}
