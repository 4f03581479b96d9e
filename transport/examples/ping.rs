use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use rudp::buffers::packet_buffer::PacketBuffer;
use rudp::{DeliveryMode, DisconnectReason, EndPoint, Header, MessageHandler, RudpConfig};
use tracing::{info, Level};

struct LoggingHandler {
    name: &'static str,
}

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn on_message(&self, from: SocketAddr, header: Header, message_kind: u8, payload: &mut PacketBuffer) {
        info!("{}: message kind {} from {:?} ({:?}): {}", self.name, message_kind, from, header.delivery_mode, String::from_utf8_lossy(payload.unread()));
    }

    async fn on_connected(&self, peer: SocketAddr) {
        info!("{}: connected to {:?}", self.name, peer);
    }

    async fn on_disconnected(&self, peer: SocketAddr, reason: DisconnectReason) {
        info!("{}: disconnected from {:?}: {:?}", self.name, peer, reason);
    }
}

/// two end points on localhost, connecting with an encrypted handshake and exchanging a few
///  messages
#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .try_init()
        .ok();

    let mut config = RudpConfig::default_ipv4();
    config.self_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let server = EndPoint::bind(config, Arc::new(LoggingHandler { name: "server" })).await?;

    let mut config = RudpConfig::default_ipv4();
    config.self_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let client = EndPoint::bind(config, Arc::new(LoggingHandler { name: "client" })).await?;

    let server_addr = server.local_addr()?;
    client.connect(server_addr).await?;
    while !client.is_connected(server_addr).await {
        client.tick().await;
        server.tick().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for (i, delivery_mode) in [DeliveryMode::Unreliable, DeliveryMode::Reliable, DeliveryMode::ReliableOrdered, DeliveryMode::ReliableEncryptedOrdered].into_iter().enumerate() {
        let text = format!("ping #{}", i);
        client.send(server_addr, Header::with_delivery_mode(delivery_mode), 1, text.as_bytes()).await?;
    }

    for _ in 0..20 {
        client.tick().await;
        server.tick().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    client.disconnect(server_addr).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    server.tick().await;
    Ok(())
}
