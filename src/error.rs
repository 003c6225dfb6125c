use thiserror::Error;

/// Protocol-violation errors.
///
/// These are fatal to the current decoding step (the offending datagram is
/// dropped) or, for [`ProtocolError::MessageTooLarge`], surfaced synchronously
/// to the caller that queued the message. None of them tears down the session
/// on its own - liveness is bounded by the keep-alive timeout instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message frame of {len} bytes exceeds the {max} byte packet payload limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("frame length varint does not terminate within 5 bytes")]
    VarintTooLarge,

    #[error("sequenced datagram of {len} bytes is shorter than the {min} byte header")]
    TruncatedDatagram { len: usize, min: usize },

    #[error("leading byte {0:#04x} is not a sequenced channel id")]
    NotASequencedChannel(u8),
}
