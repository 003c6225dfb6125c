use bytes::{Buf, BufMut};

use crate::packet::{ChannelId, ControlId};
use crate::seq_nr::SeqNr;

/// The long INIT: announces a connection id and the initial sequence of each
/// reliable channel. Sent by both sides; the client keeps re-sending it until
/// the server's arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitMessage {
    pub connection_id: i64,
    /// initial sequences in channel-id order: lossy, fast, slow
    pub initial_seqs: [SeqNr; 3],
}

impl InitMessage {
    /// payload length after the leading control byte
    pub const BODY_LEN: usize = 8 + 3 * 4;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(ControlId::Init.into());
        buf.put_i64(self.connection_id);
        for seq in self.initial_seqs {
            buf.put_i32(seq.to_raw());
        }
    }

    pub fn deser_body(buf: &mut impl Buf) -> anyhow::Result<InitMessage> {
        let connection_id = buf.try_get_i64()?;
        let mut initial_seqs = [SeqNr::from_raw(0); 3];
        for seq in &mut initial_seqs {
            *seq = SeqNr::from_raw(buf.try_get_i32()?);
        }
        Ok(InitMessage {
            connection_id,
            initial_seqs,
        })
    }
}

/// The short INIT: echoes the peer's connection id to complete the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitAck {
    pub remote_connection_id: i64,
}

impl InitAck {
    /// payload length after the leading control byte
    pub const BODY_LEN: usize = 8;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(ControlId::Init.into());
        buf.put_i64(self.remote_connection_id);
    }

    pub fn deser_body(buf: &mut impl Buf) -> anyhow::Result<InitAck> {
        Ok(InitAck {
            remote_connection_id: buf.try_get_i64()?,
        })
    }
}

/// One acknowledgment inside a CONFIRMATION datagram: names the channel and
/// sequence start of a received sequenced packet. The delay field is the
/// receiver's half-RTT estimate at flush time; this implementation emits it
/// but ignores it on reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationEntry {
    pub channel_id: ChannelId,
    pub delay_half_rtt: u16,
    pub start: SeqNr,
}

impl ConfirmationEntry {
    pub const SERIALIZED_LEN: usize = 1 + 2 + 4;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.channel_id.into());
        buf.put_u16(self.delay_half_rtt);
        buf.put_i32(self.start.to_raw());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConfirmationEntry> {
        let raw_channel = buf.try_get_u8()?;
        let channel_id = ChannelId::try_from(raw_channel)
            .map_err(|_| anyhow::anyhow!("confirmation names non-sequenced channel {}", raw_channel))?;
        let delay_half_rtt = buf.try_get_u16()?;
        let start = SeqNr::from_raw(buf.try_get_i32()?);
        Ok(ConfirmationEntry {
            channel_id,
            delay_half_rtt,
            start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::zeros(InitMessage { connection_id: 0, initial_seqs: [SeqNr::from_raw(0); 3] },
        vec![4, 0,0,0,0,0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0])]
    #[case::distinct_seqs(InitMessage { connection_id: 0x0102_0304_0506_0708, initial_seqs: [SeqNr::from_raw(1), SeqNr::from_raw(256), SeqNr::from_raw(-1)] },
        vec![4, 1,2,3,4,5,6,7,8, 0,0,0,1, 0,0,1,0, 0xff,0xff,0xff,0xff])]
    fn test_init_ser(#[case] msg: InitMessage, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), 1 + InitMessage::BODY_LEN);

        let mut body: &[u8] = &buf[1..];
        let deser = InitMessage::deser_body(&mut body).unwrap();
        assert!(body.is_empty());
        assert_eq!(deser, msg);
    }

    #[test]
    fn test_init_deser_truncated() {
        let mut body: &[u8] = &[0, 0, 0, 0, 0, 0, 0, 1, 0, 0];
        assert!(InitMessage::deser_body(&mut body).is_err());
    }

    #[test]
    fn test_init_ack_round_trip() {
        let ack = InitAck {
            remote_connection_id: -42,
        };
        let mut buf = BytesMut::new();
        ack.ser(&mut buf);
        assert_eq!(buf.len(), 1 + InitAck::BODY_LEN);
        assert_eq!(buf[0], 4);

        let mut body: &[u8] = &buf[1..];
        assert_eq!(InitAck::deser_body(&mut body).unwrap(), ack);
    }

    #[rstest]
    #[case::lossy(ConfirmationEntry { channel_id: ChannelId::Lossy, delay_half_rtt: 0, start: SeqNr::from_raw(100) },
        vec![0, 0,0, 0,0,0,100])]
    #[case::fast_with_delay(ConfirmationEntry { channel_id: ChannelId::Fast, delay_half_rtt: 0xffff, start: SeqNr::from_raw(-1) },
        vec![1, 0xff,0xff, 0xff,0xff,0xff,0xff])]
    fn test_confirmation_entry_ser(#[case] entry: ConfirmationEntry, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        entry.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), ConfirmationEntry::SERIALIZED_LEN);

        let mut body: &[u8] = &buf;
        assert_eq!(ConfirmationEntry::deser(&mut body).unwrap(), entry);
    }

    #[test]
    fn test_confirmation_entry_rejects_control_channel() {
        let mut body: &[u8] = &[3, 0, 0, 0, 0, 0, 1];
        assert!(ConfirmationEntry::deser(&mut body).is_err());
    }
}
