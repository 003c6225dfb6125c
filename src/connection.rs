use std::cmp::min;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

use crate::config::{
    ClientConfig, CONFIRMATION_BATCH_SIZE, INIT_RESEND_INTERVAL_MS, KEEP_ALIVE_INTERVAL_MS,
    KEEP_ALIVE_TIMEOUT_MS, MTU, TICK_INTERVAL_MS,
};
use crate::control_messages::{ConfirmationEntry, InitAck, InitMessage};
use crate::error::ProtocolError;
use crate::event::{ConnectionEvent, DisconnectReason, EventSink};
use crate::packet::{parse_channel_packet, ser_sequenced_header, ChannelId, ControlId};
use crate::receive_channel::ReceiveChannel;
use crate::send_channel::{OutgoingPacket, SendChannel};
use crate::send_socket::SendSocket;
use crate::seq_nr::SeqNr;

/// Transport-level lifecycle. Distinct from the application-level
/// handshake-complete flag, which only ever flips once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionPhase {
    AwaitingServer,
    Connected,
    Closing,
    Closed,
}

/// A received sequenced packet awaiting its spot in a CONFIRMATION batch.
struct PendingConfirmation {
    channel_id: ChannelId,
    start: SeqNr,
    enqueued_at: u64,
}

/// Wall-clock milliseconds. The protocol's timing windows are coarse enough to
/// tolerate the small jumps of a non-monotonic clock.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Connection id: wall-clock millis shifted left by 20 bits, OR-ed with 20
/// random bits, reinterpreted as signed 64-bit.
fn make_connection_id(now: u64) -> i64 {
    let random_bits = rand::thread_rng().gen_range(0u64..(1 << 20));
    ((now << 20) | random_bits) as i64
}

/// Half of the time a confirmation sat in the batch queue, saturated to u16 -
/// the server reads this as a coarse half-RTT correction.
fn confirmation_delay(now: u64, enqueued_at: u64) -> u16 {
    min(0xffff, now.saturating_sub(enqueued_at) / 2) as u16
}

struct ConnectionInner {
    config: ClientConfig,
    connection_id: i64,
    remote_connection_id: Option<i64>,
    phase: ConnectionPhase,
    handshake_complete: bool,

    send_socket: Arc<dyn SendSocket>,
    event_sink: Arc<dyn EventSink>,

    send_channels: [SendChannel; 3],
    /// created only once the server's INIT dictates the sequence origins
    receive_channels: Option<[ReceiveChannel; 3]>,

    pending_confirmations: VecDeque<PendingConfirmation>,

    last_inbound: u64,
    last_keepalive_sent: u64,
    last_init_sent: Option<u64>,

    disconnect_sent: bool,
    disconnect_emitted: bool,
}

impl ConnectionInner {
    fn new(
        config: ClientConfig,
        send_socket: Arc<dyn SendSocket>,
        event_sink: Arc<dyn EventSink>,
        now: u64,
    ) -> ConnectionInner {
        let send_channels =
            ChannelId::ALL.map(|id| SendChannel::new(id, SeqNr::random_initial()));

        ConnectionInner {
            config,
            connection_id: make_connection_id(now),
            remote_connection_id: None,
            phase: ConnectionPhase::AwaitingServer,
            handshake_complete: false,
            send_socket,
            event_sink,
            send_channels,
            receive_channels: None,
            pending_confirmations: VecDeque::new(),
            last_inbound: now,
            last_keepalive_sent: now,
            last_init_sent: None,
            disconnect_sent: false,
            disconnect_emitted: false,
        }
    }

    async fn send_init(&mut self, now: u64) {
        let init = InitMessage {
            connection_id: self.connection_id,
            initial_seqs: [
                self.send_channels[0].initial_sequence(),
                self.send_channels[1].initial_sequence(),
                self.send_channels[2].initial_sequence(),
            ],
        };

        let mut buf = BytesMut::with_capacity(1 + InitMessage::BODY_LEN);
        init.ser(&mut buf);

        debug!("sending INIT with connection id {}", self.connection_id);
        self.send_socket
            .send_datagram(self.config.server_addr, &buf)
            .await;
        self.last_init_sent = Some(now);
    }

    async fn send_control_byte(&self, control: ControlId) {
        let buf = [u8::from(control)];
        self.send_socket
            .send_datagram(self.config.server_addr, &buf)
            .await;
    }

    /// One pass of the fixed-period tick: INIT resend while awaiting the
    /// server, timeout detection, keep-alive, confirmation flush, then at most
    /// one data packet per channel.
    async fn on_tick(&mut self, now: u64) {
        if matches!(self.phase, ConnectionPhase::Closing | ConnectionPhase::Closed) {
            return;
        }

        if self.phase == ConnectionPhase::AwaitingServer {
            let init_due = self
                .last_init_sent
                .map(|at| now.saturating_sub(at) >= INIT_RESEND_INTERVAL_MS)
                .unwrap_or(true);
            if init_due {
                self.send_init(now).await;
            }
        }

        if self.phase == ConnectionPhase::Connected
            && now.saturating_sub(self.last_inbound) >= KEEP_ALIVE_TIMEOUT_MS
        {
            warn!(
                "no traffic from {:?} for {} ms - dropping the connection",
                self.config.server_addr, KEEP_ALIVE_TIMEOUT_MS
            );
            self.emit_disconnect(DisconnectReason::Timeout).await;
            self.shutdown(false).await;
            return;
        }

        if now.saturating_sub(self.last_keepalive_sent) >= KEEP_ALIVE_INTERVAL_MS {
            self.send_control_byte(ControlId::KeepAlive).await;
            self.last_keepalive_sent = now;
        }

        self.flush_confirmations(now).await;

        for idx in 0..self.send_channels.len() {
            if !self.send_channels[idx].has_work() {
                continue;
            }
            if let Some(packet) = self.send_channels[idx].get_packet(now) {
                let channel_id = self.send_channels[idx].channel_id();
                self.send_sequenced(channel_id, &packet).await;
            }
        }
    }

    async fn send_sequenced(&self, channel_id: ChannelId, packet: &OutgoingPacket) {
        let mut buf = BytesMut::with_capacity(MTU);
        ser_sequenced_header(&mut buf, channel_id, packet.start);
        buf.put_slice(&packet.payload);
        self.send_socket
            .send_datagram(self.config.server_addr, &buf)
            .await;
    }

    /// Move up to one batch of pending confirmations into a single datagram.
    async fn flush_confirmations(&mut self, now: u64) {
        if self.pending_confirmations.is_empty() {
            return;
        }

        let mut buf = BytesMut::with_capacity(
            1 + CONFIRMATION_BATCH_SIZE * ConfirmationEntry::SERIALIZED_LEN,
        );
        buf.put_u8(ControlId::Confirmation.into());

        for _ in 0..CONFIRMATION_BATCH_SIZE {
            let Some(pending) = self.pending_confirmations.pop_front() else {
                break;
            };
            ConfirmationEntry {
                channel_id: pending.channel_id,
                delay_half_rtt: confirmation_delay(now, pending.enqueued_at),
                start: pending.start,
            }
            .ser(&mut buf);
        }

        trace!(
            "flushing {} confirmations, {} still pending",
            (buf.len() - 1) / ConfirmationEntry::SERIALIZED_LEN,
            self.pending_confirmations.len()
        );
        self.send_socket
            .send_datagram(self.config.server_addr, &buf)
            .await;
    }

    /// Inbound dispatch by leading byte. Every datagram, whatever its content,
    /// counts as a sign of life from the server.
    async fn on_datagram(&mut self, now: u64, datagram: &[u8]) {
        if matches!(self.phase, ConnectionPhase::Closing | ConnectionPhase::Closed) {
            return;
        }
        self.last_inbound = now;

        let Some(&leading) = datagram.first() else {
            debug!("empty datagram from server - ignoring");
            return;
        };

        match ControlId::try_from(leading) {
            Ok(ControlId::Init) => self.on_init(&datagram[1..]).await,
            Ok(ControlId::Confirmation) => self.on_confirmation(&datagram[1..]),
            Ok(ControlId::KeepAlive) => trace!("keep-alive from server"),
            Ok(ControlId::Disconnect) => {
                info!("server closed the connection");
                self.emit_disconnect(DisconnectReason::Server).await;
                self.shutdown(false).await;
            }
            Err(_) => self.on_sequenced(now, datagram).await,
        }
    }

    async fn on_init(&mut self, body: &[u8]) {
        if self.phase != ConnectionPhase::AwaitingServer {
            trace!("INIT while {:?} - ignoring", self.phase);
            return;
        }

        if body.len() < InitMessage::BODY_LEN {
            // the server echoing our own connection id back
            debug!(
                "short INIT ({} byte body) - still awaiting the full INIT",
                body.len()
            );
            return;
        }

        let mut buf = body;
        let init = match InitMessage::deser_body(&mut buf) {
            Ok(init) => init,
            Err(e) => {
                warn!("unparseable INIT from server: {:#} - dropping", e);
                return;
            }
        };

        debug!(
            "INIT from server: connection id {}, initial sequences {} / {} / {}",
            init.connection_id, init.initial_seqs[0], init.initial_seqs[1], init.initial_seqs[2]
        );
        self.remote_connection_id = Some(init.connection_id);
        self.receive_channels = Some([
            ReceiveChannel::new(ChannelId::Lossy, init.initial_seqs[0]),
            ReceiveChannel::new(ChannelId::Fast, init.initial_seqs[1]),
            ReceiveChannel::new(ChannelId::Slow, init.initial_seqs[2]),
        ]);

        let mut buf = BytesMut::with_capacity(1 + InitAck::BODY_LEN);
        InitAck {
            remote_connection_id: init.connection_id,
        }
        .ser(&mut buf);
        self.send_socket
            .send_datagram(self.config.server_addr, &buf)
            .await;

        let handshake_payload = self.config.handshake_payload.clone();
        if let Err(e) = self.send_channels[ChannelId::Fast as usize]
            .queue(self.config.handshake_protocol_id, &handshake_payload)
        {
            warn!("handshake payload rejected: {}", e);
        }

        self.phase = ConnectionPhase::Connected;
        self.handshake_complete = true;
        self.event_sink.on_event(ConnectionEvent::Connected).await;
    }

    fn on_confirmation(&mut self, mut body: &[u8]) {
        while body.has_remaining() {
            match ConfirmationEntry::deser(&mut body) {
                Ok(entry) => {
                    // the delay field is informational only - no RTT adaptation
                    self.send_channels[entry.channel_id as usize].handle_ack(entry.start);
                }
                Err(e) => {
                    warn!(
                        "malformed confirmation entry from server: {:#} - dropping the rest",
                        e
                    );
                    return;
                }
            }
        }
    }

    async fn on_sequenced(&mut self, now: u64, datagram: &[u8]) {
        let packet = match parse_channel_packet(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("undecodable datagram from server: {} - dropping", e);
                return;
            }
        };

        let Some(receive_channels) = self.receive_channels.as_mut() else {
            // sequence origins are unknown until the server's INIT arrives
            trace!("sequenced packet before the INIT exchange completed - dropping");
            return;
        };

        let channel_id = packet.channel_id;
        let ingest = receive_channels[channel_id as usize].handle_packet(packet.start, packet.payload);

        // confirm even a packet whose stream turned out corrupt, so the server
        // does not keep retransmitting it
        self.pending_confirmations.push_back(PendingConfirmation {
            channel_id,
            start: ingest.ack_start,
            enqueued_at: now,
        });

        if let Some(e) = ingest.decode_error {
            warn!(
                "channel {:?}: frame decoding failed at packet {}: {} - corrupt stream bytes dropped",
                channel_id, packet.start, e
            );
        }

        for (protocol_id, payload) in ingest.messages {
            self.event_sink
                .on_event(ConnectionEvent::Protocol {
                    channel_id,
                    protocol_id,
                    payload,
                })
                .await;
        }
    }

    async fn emit_disconnect(&mut self, reason: DisconnectReason) {
        if self.disconnect_emitted {
            return;
        }
        self.disconnect_emitted = true;
        self.event_sink
            .on_event(ConnectionEvent::Disconnect { reason })
            .await;
    }

    /// Idempotent teardown. Sends a DISCONNECT at most once, and only when the
    /// peer should be notified (not after a timeout or a peer-initiated close).
    async fn shutdown(&mut self, notify: bool) {
        if matches!(self.phase, ConnectionPhase::Closing | ConnectionPhase::Closed) {
            return;
        }
        self.phase = ConnectionPhase::Closing;

        if notify && !self.disconnect_sent {
            self.disconnect_sent = true;
            self.send_control_byte(ControlId::Disconnect).await;
        }

        self.phase = ConnectionPhase::Closed;
        info!("connection to {:?} closed", self.config.server_addr);
    }

    fn queue_outgoing(
        &mut self,
        channel_id: ChannelId,
        protocol_id: u8,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        self.send_channels[channel_id as usize].queue(protocol_id, payload)
    }
}

/// A client connection to the game server: one UDP flow, three reliable
/// channels, and the spawned receive and tick loops that drive them.
///
/// All state lives behind a single lock held for the duration of any entry
/// point, so ticks, inbound datagrams and application sends never interleave
/// mid-mutation.
pub struct Connection {
    inner: Arc<RwLock<ConnectionInner>>,
    socket: Arc<UdpSocket>,
    recv_handle: JoinHandle<()>,
    tick_handle: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.recv_handle.abort();
        self.tick_handle.abort();
    }
}

impl Connection {
    /// Bind an ephemeral local port, send the first INIT and start the
    /// receive and tick loops.
    pub async fn start(
        config: ClientConfig,
        event_sink: Arc<dyn EventSink>,
    ) -> anyhow::Result<Connection> {
        let bind_addr = if config.server_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!(
            "bound client socket to {:?} for server {:?}",
            socket.local_addr()?,
            config.server_addr
        );

        let now = now_millis();
        let mut inner = ConnectionInner::new(config, socket.clone(), event_sink, now);
        inner.send_init(now).await;
        let inner = Arc::new(RwLock::new(inner));

        let recv_handle = tokio::spawn(Self::recv_loop(socket.clone(), inner.clone()));
        let tick_handle = tokio::spawn(Self::tick_loop(inner.clone()));

        Ok(Connection {
            inner,
            socket,
            recv_handle,
            tick_handle,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn handshake_complete(&self) -> bool {
        self.inner.read().await.handshake_complete
    }

    /// Schedule a message on one of the reliable channels. The message goes
    /// out with the next tick; oversize messages are rejected here.
    pub async fn queue_outgoing(
        &self,
        channel_id: ChannelId,
        protocol_id: u8,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        self.inner
            .write()
            .await
            .queue_outgoing(channel_id, protocol_id, payload)
    }

    /// Graceful (`notify = true`) or silent close. Idempotent; the spawned
    /// loops stop and the socket is released with the connection.
    pub async fn close(&self, notify: bool) {
        self.inner.write().await.shutdown(notify).await;
        self.recv_handle.abort();
        self.tick_handle.abort();
    }

    async fn recv_loop(socket: Arc<UdpSocket>, inner: Arc<RwLock<ConnectionInner>>) {
        let mut buf = vec![0u8; MTU + 64];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let mut inner = inner.write().await;
            if from != inner.config.server_addr {
                debug!("dropping datagram from unexpected peer {:?}", from);
                continue;
            }
            inner.on_datagram(now_millis(), &buf[..len]).await;
        }
    }

    async fn tick_loop(inner: Arc<RwLock<ConnectionInner>>) {
        let mut ticker = interval(Duration::from_millis(TICK_INTERVAL_MS));
        loop {
            ticker.tick().await;

            let mut inner = inner.write().await;
            if inner.phase == ConnectionPhase::Closed {
                return;
            }
            inner.on_tick(now_millis()).await;
        }
    }
}
