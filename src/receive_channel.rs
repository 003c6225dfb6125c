use std::cmp::min;
use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::error::ProtocolError;
use crate::packet::ChannelId;
use crate::seq_nr::SeqNr;
use crate::wire::{decode_len_varint, MAX_LEN_VARINT};

/// Outcome of admitting one sequenced packet: the start to confirm back to the
/// server (always the observed start, so duplicates suppress the server's
/// retransmit) and any messages completed by this packet.
#[derive(Debug, PartialEq, Eq)]
pub struct PacketIngest {
    pub ack_start: SeqNr,
    pub messages: Vec<(u8, Bytes)>,
    /// set when frame decoding hit an unrecoverable header; the corrupt
    /// buffered bytes were dropped and decoding resumes at the next packet
    /// boundary. Messages decoded before the corruption are still in
    /// `messages`.
    pub decode_error: Option<ProtocolError>,
}

/// A fragment of the contiguous reassembled stream that message decoding has
/// not consumed yet. `offset` marks how far into `buffer` consumption got.
struct Chunk {
    buffer: Bytes,
    offset: usize,
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    protocol_id: u8,
    size: usize,
}

/// The receive side of one reliable channel.
///
/// Packets are admitted keyed by their sequence start, stitched into a
/// contiguous byte stream once the gap before them closes, and drained through
/// a stateful length-prefixed frame parser. The sequence origin is dictated by
/// the server's INIT.
pub struct ReceiveChannel {
    channel_id: ChannelId,

    /// the next contiguous sequence number awaited
    expected: SeqNr,
    /// admitted packets that are not contiguous yet
    pending: FxHashMap<SeqNr, Bytes>,

    /// contiguous stream not yet consumed by frame decoding
    chunks: VecDeque<Chunk>,
    /// unread bytes across `chunks`
    buffered_length: usize,
    /// frame header decoded in a previous drain whose body is still incomplete
    partial_header: Option<FrameHeader>,
}

impl ReceiveChannel {
    pub fn new(channel_id: ChannelId, initial_sequence: SeqNr) -> ReceiveChannel {
        ReceiveChannel {
            channel_id,
            expected: initial_sequence,
            pending: FxHashMap::default(),
            chunks: VecDeque::new(),
            buffered_length: 0,
            partial_header: None,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn expected(&self) -> SeqNr {
        self.expected
    }

    pub fn buffered_length(&self) -> usize {
        self.buffered_length
    }

    /// Admit one packet.
    ///
    /// Packets strictly in the past and duplicates of buffered future packets
    /// are confirmed but not re-decoded. Everything else is queued and, once
    /// contiguous, appended to the stream and drained for complete messages.
    pub fn handle_packet(&mut self, start: SeqNr, payload: Bytes) -> PacketIngest {
        if start.precedes(self.expected) {
            trace!(
                "channel {:?}: packet at {} is below expected {} - confirming only",
                self.channel_id,
                start,
                self.expected
            );
            return PacketIngest {
                ack_start: start,
                messages: Vec::new(),
                decode_error: None,
            };
        }
        if self.pending.contains_key(&start) {
            trace!(
                "channel {:?}: packet at {} is already buffered - confirming only",
                self.channel_id,
                start
            );
            return PacketIngest {
                ack_start: start,
                messages: Vec::new(),
                decode_error: None,
            };
        }

        self.pending.insert(start, payload);

        let mut progressed = false;
        while let Some(bytes) = self.pending.remove(&self.expected) {
            self.expected = self.expected.plus(bytes.len());
            self.buffered_length += bytes.len();
            if !bytes.is_empty() {
                self.chunks.push_back(Chunk {
                    buffer: bytes,
                    offset: 0,
                });
            }
            progressed = true;
        }

        let (messages, decode_error) = if progressed {
            self.drain_messages()
        } else {
            (Vec::new(), None)
        };

        PacketIngest {
            ack_start: start,
            messages,
            decode_error,
        }
    }

    /// Decode as many complete `[protocol id][varint size][body]` frames from
    /// the buffered stream as possible. A header or body that is only
    /// partially buffered stops the drain until more packets arrive.
    ///
    /// A header that can never decode poisons everything buffered behind it,
    /// so the buffered stream is dropped and the error reported alongside the
    /// frames decoded before it; later packets decode from their own boundary.
    fn drain_messages(&mut self) -> (Vec<(u8, Bytes)>, Option<ProtocolError>) {
        let mut messages = Vec::new();

        loop {
            if self.partial_header.is_none() {
                let mut peeked = [0u8; 1 + MAX_LEN_VARINT];
                let available = self.peek(&mut peeked);
                if available < 2 {
                    break;
                }

                let protocol_id = peeked[0];
                match decode_len_varint(&peeked[1..available]) {
                    Ok(Some((size, varint_len))) => {
                        self.discard(1 + varint_len);
                        self.partial_header = Some(FrameHeader {
                            protocol_id,
                            size: size as usize,
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(
                            "channel {:?}: discarding {} corrupt buffered bytes",
                            self.channel_id, self.buffered_length
                        );
                        self.chunks.clear();
                        self.buffered_length = 0;
                        return (messages, Some(e));
                    }
                }
            }

            let header = self.partial_header.expect("checked or just set");
            if self.buffered_length < header.size {
                trace!(
                    "channel {:?}: {} of {} body bytes buffered for protocol {} - waiting",
                    self.channel_id,
                    self.buffered_length,
                    header.size,
                    header.protocol_id
                );
                break;
            }

            let body = self.consume(header.size);
            self.partial_header = None;
            debug!(
                "channel {:?}: decoded protocol {} message with {} byte body",
                self.channel_id,
                header.protocol_id,
                body.len()
            );
            messages.push((header.protocol_id, body));
        }

        (messages, None)
    }

    /// Copy up to `out.len()` buffered bytes without consuming; returns the
    /// number of bytes copied.
    fn peek(&self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        for chunk in &self.chunks {
            let src = &chunk.buffer[chunk.offset..];
            let n = min(src.len(), out.len() - copied);
            out[copied..copied + n].copy_from_slice(&src[..n]);
            copied += n;
            if copied == out.len() {
                break;
            }
        }
        copied
    }

    fn discard(&mut self, mut n: usize) {
        debug_assert!(n <= self.buffered_length);
        self.buffered_length -= n;
        while n > 0 {
            let chunk = self.chunks.front_mut().expect("buffered_length covers n");
            let available = chunk.buffer.len() - chunk.offset;
            if n < available {
                chunk.offset += n;
                return;
            }
            n -= available;
            self.chunks.pop_front();
        }
    }

    /// Consume `n` bytes into one contiguous payload. If the frame lies within
    /// a single fragment this is a zero-copy slice.
    fn consume(&mut self, n: usize) -> Bytes {
        debug_assert!(n <= self.buffered_length);

        if let Some(chunk) = self.chunks.front_mut() {
            if chunk.buffer.len() - chunk.offset >= n {
                let body = chunk.buffer.slice(chunk.offset..chunk.offset + n);
                chunk.offset += n;
                if chunk.offset == chunk.buffer.len() {
                    self.chunks.pop_front();
                }
                self.buffered_length -= n;
                return body;
            }
        }

        let mut body = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let chunk = self.chunks.front_mut().expect("buffered_length covers n");
            let available = chunk.buffer.len() - chunk.offset;
            let take = min(available, remaining);
            body.put_slice(&chunk.buffer[chunk.offset..chunk.offset + take]);
            chunk.offset += take;
            remaining -= take;
            if chunk.offset == chunk.buffer.len() {
                self.chunks.pop_front();
            }
        }
        self.buffered_length -= n;
        body.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_at(initial: i32) -> ReceiveChannel {
        ReceiveChannel::new(ChannelId::Slow, SeqNr::from_raw(initial))
    }

    fn ingest(channel: &mut ReceiveChannel, start: i32, payload: &[u8]) -> PacketIngest {
        channel.handle_packet(SeqNr::from_raw(start), Bytes::copy_from_slice(payload))
    }

    #[test]
    fn test_single_packet_single_message() {
        let mut channel = channel_at(0);
        let result = ingest(&mut channel, 0, &[0x07, 0x03, 0xaa, 0xbb, 0xcc]);

        assert_eq!(result.ack_start, SeqNr::from_raw(0));
        assert_eq!(result.messages, vec![(7, Bytes::from_static(&[0xaa, 0xbb, 0xcc]))]);
        assert_eq!(channel.expected(), SeqNr::from_raw(5));
        assert_eq!(channel.buffered_length(), 0);
    }

    #[test]
    fn test_two_messages_in_one_packet() {
        let mut channel = channel_at(10);
        let result = ingest(&mut channel, 10, &[1, 2, 0xaa, 0xbb, 2, 1, 0xcc]);

        assert_eq!(
            result.messages,
            vec![
                (1, Bytes::from_static(&[0xaa, 0xbb])),
                (2, Bytes::from_static(&[0xcc])),
            ]
        );
        assert_eq!(channel.expected(), SeqNr::from_raw(17));
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut channel = channel_at(0);

        // future packet: buffered, confirmed, nothing decoded
        let result = ingest(&mut channel, 10, &[0xdd, 0xee]);
        assert_eq!(result.ack_start, SeqNr::from_raw(10));
        assert!(result.messages.is_empty());
        assert_eq!(channel.expected(), SeqNr::from_raw(0));

        // start of the stream: contiguous up to 4, message body still short
        let result = ingest(&mut channel, 0, &[0x07, 0x06, 0xaa, 0xbb]);
        assert!(result.messages.is_empty());
        assert_eq!(channel.expected(), SeqNr::from_raw(4));

        // the gap up to 8 closes, the 6-byte message completes; the packet at
        // 10 stays buffered awaiting the bytes in between
        let result = ingest(&mut channel, 4, &[0xcc, 0xdd, 0x00, 0x00]);
        assert_eq!(
            result.messages,
            vec![(7, Bytes::from_static(&[0xaa, 0xbb, 0xcc, 0xdd, 0x00, 0x00]))]
        );
        assert_eq!(channel.expected(), SeqNr::from_raw(8));
        assert_eq!(channel.buffered_length(), 0);
        assert_eq!(channel.pending.len(), 1);
    }

    #[test]
    fn test_message_spanning_three_packets() {
        let mut channel = channel_at(100);

        let result = ingest(&mut channel, 100, &[9, 6, 0x01, 0x02]);
        assert!(result.messages.is_empty());

        let result = ingest(&mut channel, 104, &[0x03, 0x04]);
        assert!(result.messages.is_empty());
        assert_eq!(channel.buffered_length(), 4);

        let result = ingest(&mut channel, 106, &[0x05, 0x06]);
        assert_eq!(
            result.messages,
            vec![(9, Bytes::from_static(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]))]
        );
        assert_eq!(channel.buffered_length(), 0);
    }

    #[test]
    fn test_header_spanning_packets() {
        let mut channel = channel_at(0);

        // only the protocol id is buffered: no varint byte to look at yet
        let result = ingest(&mut channel, 0, &[0x05]);
        assert!(result.messages.is_empty());
        assert_eq!(channel.buffered_length(), 1);

        // a two-byte varint split across the boundary
        let result = ingest(&mut channel, 1, &[0x82]);
        assert!(result.messages.is_empty());

        let result = ingest(&mut channel, 2, &[0x02]);
        assert!(result.messages.is_empty());
        // header consumed (protocol 5, size 258), waiting for the body
        assert_eq!(channel.buffered_length(), 0);

        let body: Vec<u8> = (0..258).map(|i| i as u8).collect();
        let result = ingest(&mut channel, 3, &body);
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].0, 5);
        assert_eq!(result.messages[0].1.as_ref(), body.as_slice());
    }

    #[test]
    fn test_duplicate_of_past_packet() {
        let mut channel = channel_at(0);
        let payload = [0x07, 0x02, 0xaa, 0xbb];
        let first = ingest(&mut channel, 0, &payload);
        assert_eq!(first.messages.len(), 1);

        // replay: confirmed again, nothing re-decoded
        let replay = ingest(&mut channel, 0, &payload);
        assert_eq!(replay.ack_start, SeqNr::from_raw(0));
        assert!(replay.messages.is_empty());
        assert_eq!(channel.expected(), SeqNr::from_raw(4));
    }

    #[test]
    fn test_duplicate_of_buffered_future_packet() {
        let mut channel = channel_at(0);
        ingest(&mut channel, 8, &[0xaa]);

        let replay = ingest(&mut channel, 8, &[0xaa]);
        assert_eq!(replay.ack_start, SeqNr::from_raw(8));
        assert!(replay.messages.is_empty());
        assert_eq!(channel.pending.len(), 1);
    }

    #[test]
    fn test_arrival_order_does_not_matter() {
        // the same three packets in every order must yield the same messages
        let packets: Vec<(i32, Vec<u8>)> = vec![
            (0, vec![1, 4, 0x10, 0x20]),
            (4, vec![0x30, 0x40, 2, 2]),
            (8, vec![0x50, 0x60]),
        ];
        let expected = vec![
            (1, Bytes::from_static(&[0x10, 0x20, 0x30, 0x40])),
            (2, Bytes::from_static(&[0x50, 0x60])),
        ];

        let orders: Vec<[usize; 3]> = vec![
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let mut channel = channel_at(0);
            let mut messages = Vec::new();
            for idx in order {
                let (start, payload) = &packets[idx];
                messages.extend(ingest(&mut channel, *start, payload).messages);
            }
            assert_eq!(messages, expected, "order {:?}", order);
            assert_eq!(channel.expected(), SeqNr::from_raw(10));
            assert_eq!(channel.buffered_length(), 0);
        }
    }

    #[test]
    fn test_varint_too_large_drops_buffered_bytes() {
        let mut channel = channel_at(0);
        let result = ingest(&mut channel, 0, &[0x01, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00]);

        assert_eq!(result.ack_start, SeqNr::from_raw(0));
        assert!(result.messages.is_empty());
        assert_eq!(result.decode_error, Some(ProtocolError::VarintTooLarge));
        assert_eq!(channel.buffered_length(), 0);
        assert_eq!(channel.expected(), SeqNr::from_raw(7));
    }

    #[test]
    fn test_messages_before_corrupt_header_survive() {
        let mut channel = channel_at(0);

        // one complete frame, then a length varint that never terminates
        let result = ingest(
            &mut channel,
            0,
            &[0x07, 0x02, 0xaa, 0xbb, 0x01, 0xff, 0xff, 0xff, 0xff, 0xff],
        );
        assert_eq!(result.messages, vec![(7, Bytes::from_static(&[0xaa, 0xbb]))]);
        assert_eq!(result.decode_error, Some(ProtocolError::VarintTooLarge));
        assert_eq!(channel.buffered_length(), 0);

        // the channel is not wedged: the next packet decodes from its own boundary
        let result = ingest(&mut channel, 10, &[0x02, 0x01, 0xcc]);
        assert_eq!(result.decode_error, None);
        assert_eq!(result.messages, vec![(2, Bytes::from_static(&[0xcc]))]);
        assert_eq!(channel.expected(), SeqNr::from_raw(13));
    }

    #[test]
    fn test_wraparound_reassembly() {
        let initial = i32::MAX - 1;
        let mut channel = channel_at(initial);

        let result = ingest(&mut channel, initial, &[3, 4, 0x0a, 0x0b]);
        assert!(result.messages.is_empty());

        let result = channel.handle_packet(
            SeqNr::from_raw(initial).plus(4),
            Bytes::from_static(&[0x0c, 0x0d]),
        );
        assert_eq!(
            result.messages,
            vec![(3, Bytes::from_static(&[0x0a, 0x0b, 0x0c, 0x0d]))]
        );
        assert_eq!(channel.expected(), SeqNr::from_raw(initial).plus(6));
    }

    #[test]
    fn test_empty_body_message() {
        let mut channel = channel_at(0);
        let result = ingest(&mut channel, 0, &[0x09, 0x00]);
        assert_eq!(result.messages, vec![(9, Bytes::new())]);
        assert_eq!(channel.buffered_length(), 0);
    }
}
