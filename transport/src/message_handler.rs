use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use crate::buffers::packet_buffer::PacketBuffer;
use crate::error::DisconnectReason;
use crate::header::Header;

/// The application's side of the transport. Callbacks run on the task that calls
///  `EndPoint::tick`, one at a time.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Called once per deliverable packet, in send order per peer for ordered traffic. The
    ///  buffer's cursor is at the start of the payload; it returns to the pool afterwards.
    async fn on_message(&self, from: SocketAddr, header: Header, message_kind: u8, payload: &mut PacketBuffer);

    async fn on_connected(&self, peer: SocketAddr);

    async fn on_disconnected(&self, peer: SocketAddr, reason: DisconnectReason);
}
