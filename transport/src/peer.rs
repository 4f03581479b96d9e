use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};
use crate::buffers::buffer_pool::BufferPool;
use crate::config::RudpConfig;
use crate::encryption::SessionKey;
use crate::error::{DisconnectReason, TransportError};
use crate::handshake::HandshakeKeyPair;
use crate::receive_window::ReceiveWindow;
use crate::send_window::SendWindow;
use crate::socket::DatagramSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// this side called `connect`
    Initiator,
    /// the peer sent the connect request
    Acceptor,
}

/// The initiator's side of a handshake that is still in progress
pub struct PendingHandshake {
    pub key_pair: Option<HandshakeKeyPair>,
    /// empty if no encryption is requested
    pub public_key_der: Vec<u8>,
    pub started: Instant,
    pub last_request: Instant,
}

pub enum ConnectionState {
    Connecting(PendingHandshake),
    Connected,
}

pub struct PeerState {
    pub connection: ConnectionState,
    pub send_window: SendWindow,
    pub receive_window: ReceiveWindow,
    pub session_key: Option<SessionKey>,
    /// set by the resend task when it hits a condition that requires tearing down the peer
    pub fatal: Option<DisconnectReason>,
}

impl PeerState {
    pub fn is_connected(&self) -> bool {
        matches!(self.connection, ConnectionState::Connected)
    }
}

/// A remote endpoint with its connection state and windows. The state is shared with a
///  background task that resends unacknowledged packets; dropping the peer stops that task.
pub struct Peer {
    addr: SocketAddr,
    role: PeerRole,
    /// the id of the connect request that created this peer
    connection_id: u64,
    state: Arc<Mutex<PeerState>>,
    resend_task: JoinHandle<()>,
}

impl Peer {
    /// NB: This spawns the resend task, so it must be called in the context of a tokio runtime
    pub fn new(
        addr: SocketAddr,
        role: PeerRole,
        connection_id: u64,
        connection: ConnectionState,
        session_key: Option<SessionKey>,
        config: &RudpConfig,
        buffer_pool: Arc<BufferPool>,
        socket: Arc<dyn DatagramSocket>,
    ) -> Peer {
        let state = Arc::new(Mutex::new(PeerState {
            connection,
            send_window: SendWindow::new(config.send_window_size, buffer_pool.clone()),
            receive_window: ReceiveWindow::new(config.receive_window_size, buffer_pool),
            session_key,
            fatal: None,
        }));

        let resend_task = tokio::spawn(resend_loop(
            addr,
            state.clone(),
            socket,
            config.resend_interval,
            config.resend_timeout,
        ));

        debug!("created peer {:?} as {:?}", addr, role);
        Peer {
            addr,
            role,
            connection_id,
            state,
            resend_task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn state(&self) -> &Mutex<PeerState> {
        &self.state
    }

    /// Stops the resend task and returns all buffers held by the windows to the pool
    pub async fn shut_down(&self) {
        self.resend_task.abort();

        let mut state = self.state.lock().await;
        state.send_window.clear();
        state.receive_window.clear();
        state.session_key = None;
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.resend_task.abort();
    }
}

async fn resend_loop(
    addr: SocketAddr,
    state: Arc<Mutex<PeerState>>,
    socket: Arc<dyn DatagramSocket>,
    resend_interval: Duration,
    resend_timeout: Duration,
) {
    let mut interval = time::interval(resend_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let mut state = state.lock().await;
        if state.fatal.is_some() {
            break;
        }

        let due = state.send_window.due_for_resend(Instant::now(), resend_timeout);
        if due.is_empty() {
            continue;
        }
        trace!("resending {} packets to {:?}", due.len(), addr);

        for sequence in due {
            let Some(packet) = state.send_window.packet(sequence) else {
                continue;
            };

            if let Err(e) = socket.send_to(addr, packet.as_ref()).await {
                if TransportError::is_unreachable(&e) {
                    error!("peer {:?} is unreachable, stopping resends: {}", addr, e);
                    state.fatal = Some(DisconnectReason::SocketUnreachable);
                    return;
                }
                warn!("error resending packet {} to {:?}: {}", sequence, addr, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use mockall::predicate::eq;
    use crate::sequence::SequenceNumber;
    use crate::socket::MockDatagramSocket;

    fn test_config() -> RudpConfig {
        let mut config = RudpConfig::default_ipv4();
        config.send_window_size = 8;
        config.receive_window_size = 8;
        config
    }

    fn register(state: &mut PeerState, pool: &BufferPool, data: &[u8]) {
        let mut buf = pool.get();
        buf.write_bytes(data).unwrap();
        let sequence = state.send_window.prepare_send().unwrap();
        state.send_window.register_sent(sequence, buf, Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_task() {
        let peer_addr = SocketAddr::from(([1, 2, 3, 4], 9));
        let pool = Arc::new(BufferPool::new(100, 0, 10));

        let mut socket = MockDatagramSocket::new();
        socket.expect_send_to()
            .with(eq(peer_addr), eq(vec![1u8, 2, 3]))
            .times(1)
            .returning(|_, _| Ok(()));

        let peer = Peer::new(peer_addr, PeerRole::Acceptor, 1, ConnectionState::Connected, None, &test_config(), pool.clone(), Arc::new(socket));
        register(&mut *peer.state().lock().await, &pool, &[1, 2, 3]);

        // first resend after the timeout, no second one after the ack
        time::sleep(Duration::from_millis(110)).await;
        assert!(peer.state().lock().await.send_window.on_ack(SequenceNumber::ZERO));
        time::sleep(Duration::from_secs(1)).await;

        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_is_fatal() {
        let peer_addr = SocketAddr::from(([1, 2, 3, 4], 9));
        let pool = Arc::new(BufferPool::new(100, 0, 10));

        let mut socket = MockDatagramSocket::new();
        socket.expect_send_to()
            .times(1)
            .returning(|_, _| Err(io::Error::from(io::ErrorKind::ConnectionRefused)));

        let peer = Peer::new(peer_addr, PeerRole::Initiator, 1, ConnectionState::Connected, None, &test_config(), pool.clone(), Arc::new(socket));
        register(&mut *peer.state().lock().await, &pool, &[1]);
        register(&mut *peer.state().lock().await, &pool, &[2]);

        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(peer.state().lock().await.fatal, Some(DisconnectReason::SocketUnreachable));

        peer.shut_down().await;
        assert_eq!(pool.outstanding(), 0);
    }
}
