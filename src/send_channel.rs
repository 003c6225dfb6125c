use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::VarIntSupportMut;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::config::{MAX_PACKET_PAYLOAD, RESEND_TIMEOUT_MS};
use crate::error::ProtocolError;
use crate::packet::ChannelId;
use crate::seq_nr::SeqNr;

/// A datagram-ready packet for one channel, as handed to the tick loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPacket {
    pub start: SeqNr,
    pub payload: Bytes,
    pub resend: bool,
}

struct InFlightPacket {
    start: SeqNr,
    payload: Bytes,
    sent_at: u64,
    retries: u32,
}

/// The send side of one reliable channel.
///
/// Application messages are framed at queue time but get their sequence start
/// only at emission, so repeated queues never interleave with retransmissions
/// of earlier frames. Confirmations may arrive out of order and duplicated;
/// `fully_confirmed` only ever advances over contiguously confirmed bytes.
pub struct SendChannel {
    channel_id: ChannelId,
    initial_sequence: SeqNr,

    /// sequence start of the next fresh packet
    next_index: SeqNr,
    /// all bytes with sequence below this are confirmed
    fully_confirmed: SeqNr,

    /// frames waiting to be sent for the first time
    pending_messages: VecDeque<Bytes>,
    /// sent but unconfirmed packets, in emission order
    in_flight: VecDeque<InFlightPacket>,
    /// confirmations received ahead of `fully_confirmed`; a length of 0 marks
    /// an ack whose packet length is not known (duplicate or stale)
    acked: FxHashMap<SeqNr, usize>,
}

impl SendChannel {
    pub fn new(channel_id: ChannelId, initial_sequence: SeqNr) -> SendChannel {
        SendChannel {
            channel_id,
            initial_sequence,
            next_index: initial_sequence,
            fully_confirmed: initial_sequence,
            pending_messages: VecDeque::new(),
            in_flight: VecDeque::new(),
            acked: FxHashMap::default(),
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn initial_sequence(&self) -> SeqNr {
        self.initial_sequence
    }

    pub fn fully_confirmed(&self) -> SeqNr {
        self.fully_confirmed
    }

    pub fn next_index(&self) -> SeqNr {
        self.next_index
    }

    /// Frame a message as `[protocol id][varint body size][body]` and append it
    /// to the send queue. Queue depth is unbounded; bounding it is the
    /// caller's business.
    pub fn queue(&mut self, protocol_id: u8, body: &[u8]) -> Result<(), ProtocolError> {
        if body.len() >= MAX_PACKET_PAYLOAD {
            return Err(ProtocolError::MessageTooLarge {
                len: body.len(),
                max: MAX_PACKET_PAYLOAD,
            });
        }

        let mut frame = BytesMut::with_capacity(1 + 5 + body.len());
        frame.put_u8(protocol_id);
        frame.put_u32_varint(body.len() as u32);
        frame.put_slice(body);

        // the frame must fit a single packet: a packet carries exactly one message
        if frame.len() > MAX_PACKET_PAYLOAD {
            return Err(ProtocolError::MessageTooLarge {
                len: frame.len(),
                max: MAX_PACKET_PAYLOAD,
            });
        }

        trace!(
            "channel {:?}: queueing protocol {} message with {} byte body",
            self.channel_id,
            protocol_id,
            body.len()
        );
        self.pending_messages.push_back(frame.freeze());
        Ok(())
    }

    /// cheap idle check for the tick loop
    pub fn has_work(&self) -> bool {
        !self.pending_messages.is_empty() || !self.in_flight.is_empty()
    }

    /// The single emission point, called once per channel per tick.
    ///
    /// Retransmission strictly precedes new emission so that a stalled peer
    /// cannot starve recovery. The linear scan is fine: `in_flight` is bounded
    /// by bandwidth x RTT / MTU in steady state.
    pub fn get_packet(&mut self, now: u64) -> Option<OutgoingPacket> {
        for packet in self.in_flight.iter_mut() {
            if now.saturating_sub(packet.sent_at) >= RESEND_TIMEOUT_MS {
                packet.sent_at = now;
                packet.retries += 1;
                debug!(
                    "channel {:?}: resending packet at {} ({} bytes, attempt {})",
                    self.channel_id,
                    packet.start,
                    packet.payload.len(),
                    packet.retries
                );
                return Some(OutgoingPacket {
                    start: packet.start,
                    payload: packet.payload.clone(),
                    resend: true,
                });
            }
        }

        let frame = self.pending_messages.pop_front()?;
        let start = self.next_index;
        self.next_index = start.plus(frame.len());
        self.in_flight.push_back(InFlightPacket {
            start,
            payload: frame.clone(),
            sent_at: now,
            retries: 0,
        });

        trace!(
            "channel {:?}: emitting fresh packet at {} ({} bytes)",
            self.channel_id,
            start,
            frame.len()
        );
        Some(OutgoingPacket {
            start,
            payload: frame,
            resend: false,
        })
    }

    /// Process one confirmation entry for this channel.
    ///
    /// An ack without a matching in-flight record is remembered with length 0;
    /// a later ack carrying the real in-flight record upgrades it. The frontier
    /// stops on length-0 entries rather than guessing, so a lost in-flight
    /// record can never collapse `fully_confirmed`.
    pub fn handle_ack(&mut self, start: SeqNr) {
        if let Some(idx) = self.in_flight.iter().position(|p| p.start == start) {
            let packet = self.in_flight.remove(idx).expect("index from position");
            self.acked.insert(start, packet.payload.len());
        } else {
            trace!(
                "channel {:?}: ack for {} without in-flight record",
                self.channel_id,
                start
            );
            self.acked.entry(start).or_insert(0);
        }

        while let Some(&len) = self.acked.get(&self.fully_confirmed) {
            if len == 0 {
                // length unknown: keep the entry so an upgrade can land later
                break;
            }
            self.acked.remove(&self.fully_confirmed);
            self.fully_confirmed = self.fully_confirmed.plus(len);
        }
    }
}
