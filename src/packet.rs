use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::ProtocolError;
use crate::seq_nr::SeqNr;

/// The three reliable channels. All of them are identical ordered byte streams;
/// the names reflect what the game puts on them.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ChannelId {
    Lossy = 0,
    Fast = 1,
    Slow = 2,
}

impl ChannelId {
    pub const ALL: [ChannelId; 3] = [ChannelId::Lossy, ChannelId::Fast, ChannelId::Slow];
}

/// Control channel ids. These never carry sequenced payload and bypass the
/// reliable channels entirely.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ControlId {
    Confirmation = 3,
    Init = 4,
    KeepAlive = 5,
    Disconnect = 6,
}

/// Header of a sequenced datagram: channel id plus 4-byte sequence start.
pub const SEQUENCED_HEADER_LEN: usize = 5;

/// A sequenced datagram after header parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedPacket {
    pub channel_id: ChannelId,
    pub start: SeqNr,
    pub payload: Bytes,
}

/// Parse a raw datagram whose leading byte should be a sequenced channel id.
///
/// Control ids and datagrams shorter than the sequenced header are rejected;
/// the caller is expected to have routed control datagrams off beforehand.
pub fn parse_channel_packet(buffer: &[u8]) -> Result<SequencedPacket, ProtocolError> {
    if buffer.len() < SEQUENCED_HEADER_LEN {
        return Err(ProtocolError::TruncatedDatagram {
            len: buffer.len(),
            min: SEQUENCED_HEADER_LEN,
        });
    }

    let channel_id = ChannelId::try_from(buffer[0])
        .map_err(|_| ProtocolError::NotASequencedChannel(buffer[0]))?;

    let mut buf = &buffer[1..];
    let start = SeqNr::from_raw(buf.get_i32());

    Ok(SequencedPacket {
        channel_id,
        start,
        payload: Bytes::copy_from_slice(buf),
    })
}

pub fn ser_sequenced_header(buf: &mut impl BufMut, channel_id: ChannelId, start: SeqNr) {
    buf.put_u8(channel_id.into());
    buf.put_i32(start.to_raw());
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::lossy(vec![0, 0,0,0,100, 7,3,0xaa], ChannelId::Lossy, 100, vec![7,3,0xaa])]
    #[case::fast(vec![1, 0,0,1,0], ChannelId::Fast, 256, vec![])]
    #[case::slow(vec![2, 0xff,0xff,0xff,0xff, 9], ChannelId::Slow, -1, vec![9])]
    fn test_parse_channel_packet(
        #[case] buffer: Vec<u8>,
        #[case] expected_channel: ChannelId,
        #[case] expected_start: i32,
        #[case] expected_payload: Vec<u8>,
    ) {
        let packet = parse_channel_packet(&buffer).unwrap();
        assert_eq!(packet.channel_id, expected_channel);
        assert_eq!(packet.start, SeqNr::from_raw(expected_start));
        assert_eq!(packet.payload.as_ref(), expected_payload.as_slice());
    }

    #[rstest]
    #[case::confirmation(3)]
    #[case::init(4)]
    #[case::keep_alive(5)]
    #[case::disconnect(6)]
    #[case::unknown(200)]
    fn test_parse_channel_packet_rejects_control_ids(#[case] leading: u8) {
        let buffer = [leading, 0, 0, 0, 0, 1, 2, 3];
        assert_eq!(
            parse_channel_packet(&buffer),
            Err(ProtocolError::NotASequencedChannel(leading))
        );
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::only_channel(vec![1])]
    #[case::partial_start(vec![1, 0, 0, 0])]
    fn test_parse_channel_packet_rejects_short_buffers(#[case] buffer: Vec<u8>) {
        assert_eq!(
            parse_channel_packet(&buffer),
            Err(ProtocolError::TruncatedDatagram {
                len: buffer.len(),
                min: SEQUENCED_HEADER_LEN,
            })
        );
    }

    #[test]
    fn test_ser_sequenced_header_round_trip() {
        let mut buf = BytesMut::new();
        ser_sequenced_header(&mut buf, ChannelId::Fast, SeqNr::from_raw(-2));
        buf.extend_from_slice(&[0xde, 0xad]);

        assert_eq!(buf.as_ref(), &[1, 0xff, 0xff, 0xff, 0xfe, 0xde, 0xad]);

        let packet = parse_channel_packet(&buf).unwrap();
        assert_eq!(packet.channel_id, ChannelId::Fast);
        assert_eq!(packet.start, SeqNr::from_raw(-2));
        assert_eq!(packet.payload.as_ref(), &[0xde, 0xad]);
    }
}
