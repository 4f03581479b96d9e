use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::packet_buffer::PacketBuffer;
use crate::config::RudpConfig;
use crate::encryption::SessionKey;
use crate::error::{BufferError, DisconnectReason, TransportError};
use crate::handshake::{wrap_session_key, ConnectAccept, ConnectRequest, HandshakeError, HandshakeKeyPair};
use crate::header::{DeliveryMode, Header};
use crate::message_handler::MessageHandler;
use crate::message_kind::{is_reserved, InternalKind};
use crate::peer::{ConnectionState, PendingHandshake, Peer, PeerRole};
use crate::receive_window::ReceivedPacket;
use crate::send_window::SendWindowError;
use crate::sequence::SequenceNumber;
use crate::socket::DatagramSocket;
use crate::wire::{self, PacketPrefix};

enum HandshakeStep {
    Wait,
    Retry(Vec<u8>),
    TimedOut,
}

/// EndPoint is the place where all other parts of the protocol come together: It owns a
///  datagram socket and the table of peers, dispatches incoming packets to their peer's windows
///  and the application's [MessageHandler], and has an API for application code to send messages.
///
/// Receiving is driven by the application calling [EndPoint::tick] (or [EndPoint::run]), while
///  every peer has a background task for resending unacknowledged packets.
pub struct EndPoint {
    socket: Arc<dyn DatagramSocket>,
    handler: Arc<dyn MessageHandler>,
    config: Arc<RudpConfig>,
    buffer_pool: Arc<BufferPool>,
    peers: RwLock<FxHashMap<SocketAddr, Arc<Peer>>>,
}

impl EndPoint {
    pub async fn bind(config: RudpConfig, handler: Arc<dyn MessageHandler>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let socket = UdpSocket::bind(config.self_addr).await?;
        info!("bound socket to {:?}", socket.local_addr()?);

        Self::with_socket(config, Arc::new(socket), handler)
    }

    pub fn with_socket(config: RudpConfig, socket: Arc<dyn DatagramSocket>, handler: Arc<dyn MessageHandler>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        if !config.encryption {
            warn!("initializing without encryption - encrypted delivery will not be available");
        }

        let buffer_pool = Arc::new(BufferPool::new(config.payload_size_inside_udp, config.buffer_pool_warm_up, config.buffer_pool_size));
        Ok(EndPoint {
            socket,
            handler,
            config: Arc::new(config),
            buffer_pool,
            peers: Default::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    /// the biggest payload [EndPoint::send] accepts for a given delivery mode
    pub fn max_payload_len(&self, delivery_mode: DeliveryMode) -> usize {
        wire::max_payload_len(self.config.payload_size_inside_udp, delivery_mode)
    }

    fn get_peer(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.peers.read().get(&addr).cloned()
    }

    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.peers.read().keys().cloned().collect()
    }

    /// true once the handshake with the peer is complete
    pub async fn is_connected(&self, peer: SocketAddr) -> bool {
        let Some(peer) = self.get_peer(peer) else {
            return false;
        };
        let is_connected = peer.state().lock().await.is_connected();
        is_connected
    }

    /// Starts a handshake with a remote endpoint. This returns once the first connect request
    ///  is sent; [MessageHandler::on_connected] is called when the peer accepts, or
    ///  [MessageHandler::on_disconnected] if the handshake fails or times out.
    pub async fn connect(&self, to: SocketAddr) -> Result<(), TransportError> {
        if self.get_peer(to).is_some() {
            debug!("connect to {:?}: peer exists already", to);
            return Ok(());
        }

        let (key_pair, public_key_der) = if self.config.encryption {
            let bits = self.config.rsa_key_bits;
            let key_pair = tokio::task::spawn_blocking(move || HandshakeKeyPair::generate(bits))
                .await
                .map_err(|e| TransportError::HandshakeFailure { peer: to, reason: e.to_string() })?
                .map_err(|e| handshake_failure(to, e))?;
            let public_key_der = key_pair.public_key_der()
                .map_err(|e| handshake_failure(to, e))?;
            (Some(key_pair), public_key_der)
        }
        else {
            (None, Vec::new())
        };

        let connection_id: u64 = rand::random();
        let now = Instant::now();
        let peer = Arc::new(Peer::new(
            to,
            PeerRole::Initiator,
            connection_id,
            ConnectionState::Connecting(PendingHandshake {
                key_pair,
                public_key_der: public_key_der.clone(),
                started: now,
                last_request: now,
            }),
            None,
            &self.config,
            self.buffer_pool.clone(),
            self.socket.clone(),
        ));

        {
            let mut peers = self.peers.write();
            if peers.contains_key(&to) {
                debug!("connect to {:?}: peer was registered concurrently", to);
                return Ok(());
            }
            peers.insert(to, peer);
        }

        info!("connecting to {:?}", to);
        self.send_internal(to, InternalKind::ConnectRequest, |buf| ConnectRequest::new(connection_id, public_key_der).ser(buf)).await
    }

    /// Sends a message to a connected peer. The header's delivery mode determines the guarantees,
    ///  the other header fields are passed through to the receiving application.
    ///
    /// Reliable sends fail with [TransportError::SendWindowFull] if too many packets to the peer
    ///  are unacknowledged; the caller is expected to retry later.
    pub async fn send(&self, to: SocketAddr, header: Header, message_kind: u8, payload: &[u8]) -> Result<(), TransportError> {
        if is_reserved(message_kind) {
            return Err(TransportError::ReservedMessageKind(message_kind));
        }

        let max = self.max_payload_len(header.delivery_mode);
        if payload.len() > max {
            debug!("message for {:?} has a maximum length of {} to fit a single packet, was {}", to, max, payload.len());
            return Err(TransportError::PayloadTooLarge { len: payload.len(), max });
        }

        let peer = self.get_peer(to)
            .ok_or(TransportError::NotConnected { peer: to })?;

        if !header.delivery_mode.is_reliable() {
            if !peer.state().lock().await.is_connected() {
                return Err(TransportError::NotConnected { peer: to });
            }

            let mut buf = self.buffer_pool.get();
            let sent = match wire::write_unreliable(&mut buf, header, message_kind, payload) {
                Ok(()) => Ok(self.socket.send_to(to, buf.as_ref()).await),
                Err(e) => Err(e),
            };
            self.buffer_pool.release(buf);

            return match sent? {
                Ok(()) => Ok(()),
                Err(e) => Err(self.on_send_error(to, e).await),
            };
        }

        match self.send_reliable(&peer, header, message_kind, payload).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.on_send_error(to, e).await),
            Err(e @ TransportError::SequenceExhausted { .. }) => {
                self.tear_down(to, DisconnectReason::SequenceExhausted).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Assigns a sequence number and registers the packet with the send window. The outer
    ///  result is for failures before the packet is registered, the inner one for the socket.
    async fn send_reliable(&self, peer: &Peer, header: Header, message_kind: u8, payload: &[u8]) -> Result<io::Result<()>, TransportError> {
        let to = peer.addr();
        let mut guard = peer.state().lock().await;
        let state = &mut *guard;

        if !state.is_connected() {
            return Err(TransportError::NotConnected { peer: to });
        }

        let key = if header.delivery_mode.is_encrypted() {
            Some(state.session_key.as_ref()
                .ok_or(TransportError::EncryptionNotNegotiated { peer: to })?)
        }
        else {
            None
        };

        let sequence = state.send_window.prepare_send()
            .map_err(|e| match e {
                SendWindowError::Full => TransportError::SendWindowFull { peer: to, window_size: state.send_window.window_size() },
                SendWindowError::Exhausted => TransportError::SequenceExhausted { peer: to },
            })?;

        let mut buf = self.buffer_pool.get();
        let written = match key {
            Some(key) => wire::write_encrypted(&mut buf, header, sequence, message_kind, payload, key),
            None => wire::write_reliable(&mut buf, header, sequence, message_kind, payload),
        };
        if let Err(e) = written {
            self.buffer_pool.release(buf);
            return Err(e.into());
        }

        trace!("sending packet {} to {:?}", sequence, to);
        let packet = state.send_window.register_sent(sequence, buf, Instant::now());
        Ok(self.socket.send_to(to, packet.as_ref()).await)
    }

    /// Sends a `Disconnect` message (best effort) and tears the peer down
    pub async fn disconnect(&self, peer: SocketAddr) {
        if self.get_peer(peer).is_none() {
            debug!("disconnect from {:?}: no such peer", peer);
            return;
        }

        if let Err(e) = self.send_internal(peer, InternalKind::Disconnect, |buf| buf.write_u8(DisconnectReason::Requested.to_wire())).await {
            debug!("error sending disconnect message to {:?}: {}", peer, e);
        }
        self.tear_down(peer, DisconnectReason::Requested).await;
    }

    /// Processes datagrams waiting on the socket - up to the configured maximum, without ever
    ///  blocking - and drives handshake retries and timeouts. Returns the number of datagrams
    ///  processed.
    pub async fn tick(&self) -> usize {
        let mut num_received = 0;

        while num_received < self.config.max_receives_per_tick {
            let mut buf = self.buffer_pool.get();
            let (len, from) = match self.socket.try_recv_from(buf.fill_for_receive()) {
                Ok(Some(received)) => received,
                Ok(None) => {
                    self.buffer_pool.release(buf);
                    break;
                }
                Err(e) => {
                    self.buffer_pool.release(buf);
                    error!("socket error: {}", e);
                    break;
                }
            };
            buf.truncate(len);
            num_received += 1;

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            self.on_datagram(from, buf)
                .instrument(span)
                .await;
        }

        self.maintain_peers().await;
        num_received
    }

    /// Calls [EndPoint::tick] periodically, forever
    pub async fn run(&self, tick_interval: Duration) {
        info!("starting receive loop");

        let mut interval = time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    async fn on_datagram(&self, from: SocketAddr, mut buf: PacketBuffer) {
        trace!("received packet from {:?}: {:?}", from, buf.as_ref());

        let prefix = match wire::read_prefix(&mut buf) {
            Ok(prefix) => prefix,
            Err(e) => {
                warn!("received packet with unparsable prefix from {:?}, dropping: {}", from, e);
                self.buffer_pool.release(buf);
                return;
            }
        };

        if prefix.header.delivery_mode.is_reliable() {
            self.on_reliable_packet(from, prefix, buf).await;
        }
        else {
            self.on_unreliable_packet(from, prefix.header, buf).await;
        }
    }

    async fn on_unreliable_packet(&self, from: SocketAddr, header: Header, mut buf: PacketBuffer) {
        match buf.read_u8() {
            Err(_) => {
                debug!("packet from {:?} without message kind - dropping", from);
            }
            Ok(message_kind) if is_reserved(message_kind) => {
                match InternalKind::try_from(message_kind) {
                    Ok(kind) => self.on_internal_message(from, kind, &mut buf).await,
                    Err(_) => warn!("unknown reserved message kind {:#04x} from {:?} - dropping", message_kind, from),
                }
            }
            Ok(message_kind) => {
                if self.is_connected(from).await {
                    self.handler.on_message(from, header, message_kind, &mut buf).await;
                }
                else {
                    debug!("unreliable message from unconnected peer {:?} - dropping", from);
                }
            }
        }

        self.buffer_pool.release(buf);
    }

    async fn on_internal_message(&self, from: SocketAddr, kind: InternalKind, buf: &mut PacketBuffer) {
        trace!("internal message {:?} from {:?}", kind, from);

        match kind {
            InternalKind::ConnectRequest => self.on_connect_request(from, buf).await,
            InternalKind::ConnectAccept => self.on_connect_accept(from, buf).await,
            InternalKind::Disconnect => self.on_disconnect_message(from, buf).await,
            InternalKind::Ack => self.on_ack(from, buf).await,
        }
    }

    async fn on_ack(&self, from: SocketAddr, buf: &mut PacketBuffer) {
        let sequence = match buf.read_u32() {
            Ok(raw) => SequenceNumber::from_raw(raw),
            Err(_) => {
                debug!("truncated ack from {:?} - dropping", from);
                return;
            }
        };

        match self.get_peer(from) {
            Some(peer) => {
                peer.state().lock().await
                    .send_window.on_ack(sequence);
            }
            None => debug!("ack from unknown peer {:?} - dropping", from),
        }
    }

    async fn on_disconnect_message(&self, from: SocketAddr, buf: &mut PacketBuffer) {
        let reason = buf.read_u8().unwrap_or_default();
        info!("peer {:?} disconnected (reason {})", from, reason);
        self.tear_down(from, DisconnectReason::RemoteRequested).await;
    }

    async fn on_connect_request(&self, from: SocketAddr, buf: &mut PacketBuffer) {
        let request = match ConnectRequest::deser(buf) {
            Ok(request) => request,
            Err(e) => {
                warn!("invalid connect request from {:?}: {}", from, e);
                return;
            }
        };

        if let Some(peer) = self.get_peer(from) {
            if peer.role() == PeerRole::Initiator {
                warn!("connect request from {:?} while connecting to it - ignoring", from);
                return;
            }

            if peer.connection_id() == request.connection_id {
                // the previous accept message may have been lost
                debug!("repeated connect request from {:?}", from);
                let session_key = peer.state().lock().await.session_key.clone();
                match self.wrap_for(&request, session_key.as_ref()) {
                    Ok(wrapped_key) => self.send_connect_accept(from, wrapped_key).await,
                    Err(e) => warn!("handshake with {:?} failed: {}", from, e),
                }
                return;
            }

            info!("new connection from {:?} replaces the existing one", from);
            self.tear_down(from, DisconnectReason::Reconnected).await;
        }

        let session_key = if self.config.encryption && request.wants_encryption() {
            Some(SessionKey::generate())
        }
        else {
            None
        };
        let wrapped_key = match self.wrap_for(&request, session_key.as_ref()) {
            Ok(wrapped_key) => wrapped_key,
            Err(e) => {
                warn!("handshake with {:?} failed: {}", from, e);
                return;
            }
        };

        let peer = Arc::new(Peer::new(
            from,
            PeerRole::Acceptor,
            request.connection_id,
            ConnectionState::Connected,
            session_key,
            &self.config,
            self.buffer_pool.clone(),
            self.socket.clone(),
        ));
        self.peers.write().insert(from, peer);

        info!("accepted connection from {:?}", from);
        self.handler.on_connected(from).await;
        self.send_connect_accept(from, wrapped_key).await;
    }

    fn wrap_for(&self, request: &ConnectRequest, session_key: Option<&SessionKey>) -> Result<Vec<u8>, HandshakeError> {
        match session_key {
            Some(key) if request.wants_encryption() => wrap_session_key(&request.public_key, key),
            _ => Ok(Vec::new()),
        }
    }

    async fn send_connect_accept(&self, to: SocketAddr, wrapped_key: Vec<u8>) {
        let accept = ConnectAccept { wrapped_key };
        if let Err(e) = self.send_internal(to, InternalKind::ConnectAccept, |buf| accept.ser(buf)).await {
            debug!("error sending connect accept to {:?}: {}", to, e);
        }
    }

    async fn on_connect_accept(&self, from: SocketAddr, buf: &mut PacketBuffer) {
        let Some(peer) = self.get_peer(from) else {
            debug!("connect accept from unknown peer {:?} - dropping", from);
            return;
        };

        let result = {
            let mut state = peer.state().lock().await;
            let ConnectionState::Connecting(pending) = &state.connection else {
                trace!("repeated connect accept from {:?}", from);
                return;
            };

            let session_key = ConnectAccept::deser(buf)
                .and_then(|accept| {
                    if accept.wrapped_key.is_empty() {
                        return Ok(None);
                    }
                    match &pending.key_pair {
                        Some(key_pair) => key_pair.unwrap_session_key(&accept.wrapped_key).map(Some),
                        None => Err(HandshakeError::Malformed("session key that was not requested")),
                    }
                });

            match session_key {
                Ok(session_key) => {
                    if session_key.is_none() && self.config.encryption {
                        warn!("peer {:?} did not agree to encryption", from);
                    }
                    state.session_key = session_key;
                    state.connection = ConnectionState::Connected;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                info!("connected to {:?}", from);
                self.handler.on_connected(from).await;
            }
            Err(e) => {
                warn!("handshake with {:?} failed: {}", from, e);
                self.tear_down(from, DisconnectReason::HandshakeFailure).await;
            }
        }
    }

    async fn on_reliable_packet(&self, from: SocketAddr, prefix: PacketPrefix, mut buf: PacketBuffer) {
        let (Some(sequence), Some(peer)) = (prefix.sequence, self.get_peer(from)) else {
            debug!("reliable packet from unknown peer {:?} - dropping", from);
            self.buffer_pool.release(buf);
            return;
        };

        let outcome = {
            let mut guard = peer.state().lock().await;
            let state = &mut *guard;

            if !state.is_connected() {
                // not acknowledged, so the peer resends it once the handshake is complete
                debug!("reliable packet {} from {:?} before the connection is established - dropping", sequence, from);
                self.buffer_pool.release(buf);
                return;
            }

            if let Some(iv) = &prefix.iv {
                let Some(key) = &state.session_key else {
                    debug!("encrypted packet from {:?} without a negotiated key - dropping", from);
                    self.buffer_pool.release(buf);
                    return;
                };

                let start = buf.position();
                if key.decrypt_in_place(&mut buf, iv, start).is_err() {
                    warn!("{} - dropping", TransportError::Decryption { peer: from });
                    self.buffer_pool.release(buf);
                    return;
                }
            }

            let message_kind = match buf.read_u8() {
                Ok(kind) if !is_reserved(kind) => kind,
                other => {
                    warn!("reliable packet {} from {:?} with invalid message kind {:?} - dropping", sequence, from, other);
                    self.buffer_pool.release(buf);
                    return;
                }
            };

            let received = ReceivedPacket {
                header: prefix.header,
                message_kind,
                packet: buf,
            };
            state.receive_window.on_packet(sequence, received, prefix.header.delivery_mode.is_ordered())
        };

        let immediate = match outcome {
            Ok((classification, immediate)) => {
                trace!("packet {} from {:?}: {:?}", sequence, from, classification);
                immediate
            }
            Err(e) => {
                let e = TransportError::WindowCapacityExceeded { peer: from, sequence: e.sequence.to_raw(), distance: e.distance, window_size: e.window_size };
                error!("{} - dropping the connection", e);
                self.tear_down(from, DisconnectReason::WindowCapacityExceeded).await;
                return;
            }
        };

        self.send_ack(from, sequence).await;

        if let Some(received) = immediate {
            self.dispatch(from, received).await;
        }

        // the lock is not held while the handler runs, so it may send to the peer
        loop {
            let next = peer.state().lock().await
                .receive_window.next_deliverable();
            match next {
                Some(received) => self.dispatch(from, received).await,
                None => break,
            }
        }
    }

    async fn dispatch(&self, from: SocketAddr, mut received: ReceivedPacket) {
        self.handler.on_message(from, received.header, received.message_kind, &mut received.packet).await;
        self.buffer_pool.release(received.packet);
    }

    async fn send_ack(&self, to: SocketAddr, sequence: SequenceNumber) {
        let mut buf = self.buffer_pool.get();
        let sent = match wire::write_ack(&mut buf, sequence) {
            Ok(()) => self.socket.send_to(to, buf.as_ref()).await,
            Err(e) => {
                error!("error writing ack: {}", e);
                Ok(())
            }
        };
        self.buffer_pool.release(buf);

        if let Err(e) = sent {
            self.on_send_error(to, e).await;
        }
    }

    /// sends a transport-internal message in an unreliable packet
    async fn send_internal(&self, to: SocketAddr, kind: InternalKind, write_payload: impl FnOnce(&mut PacketBuffer) -> Result<(), BufferError>) -> Result<(), TransportError> {
        let mut buf = self.buffer_pool.get();
        let written = wire::write_unreliable(&mut buf, Header::with_delivery_mode(DeliveryMode::Unreliable), kind.into(), &[])
            .and_then(|_| write_payload(&mut buf));

        let sent = match written {
            Ok(()) => Ok(self.socket.send_to(to, buf.as_ref()).await),
            Err(e) => Err(e),
        };
        self.buffer_pool.release(buf);

        match sent? {
            Ok(()) => Ok(()),
            Err(e) => Err(self.on_send_error(to, e).await),
        }
    }

    /// Socket errors that show the peer is gone tear it down, others are passed on
    async fn on_send_error(&self, to: SocketAddr, e: io::Error) -> TransportError {
        if TransportError::is_unreachable(&e) {
            error!("peer {:?} is unreachable: {}", to, e);
            self.tear_down(to, DisconnectReason::SocketUnreachable).await;
            TransportError::SocketUnreachable { peer: to, source: e }
        }
        else {
            warn!("error sending packet to {:?}: {}", to, e);
            TransportError::Io(e)
        }
    }

    async fn tear_down(&self, addr: SocketAddr, reason: DisconnectReason) {
        let removed = self.peers.write().remove(&addr);
        if let Some(peer) = removed {
            info!("tearing down peer {:?}: {:?}", addr, reason);
            peer.shut_down().await;
            self.handler.on_disconnected(addr, reason).await;
        }
    }

    /// handshake retries and timeouts, and peers that hit a fatal condition in their resend task
    async fn maintain_peers(&self) {
        let now = Instant::now();
        let peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();

        for peer in peers {
            let (fatal, step) = {
                let mut state = peer.state().lock().await;
                let step = match &mut state.connection {
                    ConnectionState::Connecting(pending) => {
                        if now.saturating_duration_since(pending.started) >= self.config.handshake_timeout {
                            HandshakeStep::TimedOut
                        }
                        else if now.saturating_duration_since(pending.last_request) >= self.config.handshake_interval {
                            pending.last_request = now;
                            HandshakeStep::Retry(pending.public_key_der.clone())
                        }
                        else {
                            HandshakeStep::Wait
                        }
                    }
                    ConnectionState::Connected => HandshakeStep::Wait,
                };
                (state.fatal, step)
            };

            if let Some(reason) = fatal {
                self.tear_down(peer.addr(), reason).await;
                continue;
            }

            match step {
                HandshakeStep::Wait => {}
                HandshakeStep::Retry(public_key_der) => {
                    debug!("resending connect request to {:?}", peer.addr());
                    if let Err(e) = self.send_internal(peer.addr(), InternalKind::ConnectRequest, |buf| ConnectRequest::new(peer.connection_id(), public_key_der).ser(buf)).await {
                        debug!("error resending connect request to {:?}: {}", peer.addr(), e);
                    }
                }
                HandshakeStep::TimedOut => {
                    warn!("handshake with {:?} timed out", peer.addr());
                    self.tear_down(peer.addr(), DisconnectReason::HandshakeFailure).await;
                }
            }
        }
    }
}

fn handshake_failure(peer: SocketAddr, e: HandshakeError) -> TransportError {
    TransportError::HandshakeFailure { peer, reason: e.to_string() }
}
