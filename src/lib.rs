//! Client-side transport for a voxel game's custom UDP protocol: a single UDP
//!  flow to the game server carrying three independent reliable byte streams,
//!  with sequence-number negotiation, per-packet acknowledgments, timeout-driven
//!  retransmission and keep-alive based liveness detection.
//!
//! ## Design goals
//!
//! * One connection is one remote peer - the game server. There is no listening
//!   mode and no multi-peer multiplexing.
//! * The abstraction is sending / receiving *messages* (defined-length chunks of
//!   data), transported over per-channel byte streams. Messages may span packet
//!   boundaries; a packet never carries more than one message.
//! * Three reliable channels (`LOSSY`, `FAST`, `SLOW`) with identical
//!   loss-recovery behavior - the names reflect transport intent of the game
//!   protocol, not different guarantees. Ordering is per channel only.
//! * Loss recovery is positive-ack based: every received sequenced packet is
//!   confirmed, and unconfirmed packets are re-sent after a fixed timeout. There
//!   is no congestion control and no RTT estimation - the server echoes a coarse
//!   delay field that this implementation ignores.
//! * Packets are bounded by a fixed MTU of 548 bytes (the IPv4 minimum
//!   reassembly buffer) since path discovery does not work reliably.
//!
//! ## Datagram formats
//!
//! The leading byte of every datagram selects the channel; all integers are in
//! network byte order (BE):
//!
//! ```ascii
//! sequenced data  [channel id: u8 in 0..=2][start: i32][frame bytes...]
//! CONFIRMATION    [3] followed by 7-byte entries:
//!                     [channel id: u8][delay half-RTT: u16][start: i32]
//! INIT (long)     [4][connection id: i64][seq lossy: i32][seq fast: i32][seq slow: i32]
//! INIT (ack)      [4][remote connection id: i64]
//! KEEP_ALIVE      [5]
//! DISCONNECT      [6]
//! ```
//!
//! `start` is the 32-bit byte-stream offset, modulo 2^32, at which the packet's
//! payload begins within its channel. Sequence numbers are compared by signed
//! difference, so the stream survives wraparound.
//!
//! Message frame (laid down contiguously on a channel's byte stream, possibly
//! across packet boundaries):
//!
//! ```ascii
//! 0: protocol id (u8)
//! 1: body size (varint, 7-bit continuation, low byte first, at most 5 bytes)
//! *: body
//! ```
//!
//! ## Connection lifecycle
//!
//! The client sends a long INIT announcing its connection id and the initial
//! sequence of each channel, re-sending every 100 ms until the server's long
//! INIT arrives. That INIT dictates the receive-side sequence origins, so
//! receive channels are created only at that point. The client answers with the
//! short INIT ack, queues the application handshake message on the `FAST`
//! channel and is connected. A fixed 20 ms tick then drives INIT and keep-alive
//! emission, confirmation batching, retransmission and timeout detection;
//! 8 seconds of silence from the server end the session.

pub mod config;
pub mod connection;
pub mod control_messages;
pub mod error;
pub mod event;
pub mod packet;
pub mod receive_channel;
pub mod send_channel;
pub mod send_socket;
pub mod seq_nr;
pub mod wire;
