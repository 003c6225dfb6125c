use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;

use crate::packet::ChannelId;

/// Why the connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// the server sent a DISCONNECT datagram
    Server,
    /// no inbound traffic for the keep-alive timeout
    Timeout,
}

/// Everything the connection reports to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// the INIT exchange completed
    Connected,
    /// a message was decoded from one of the reliable channels
    Protocol {
        channel_id: ChannelId,
        protocol_id: u8,
        payload: Bytes,
    },
    /// fired at most once per connection
    Disconnect { reason: DisconnectReason },
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn on_event(&self, event: ConnectionEvent);
}
