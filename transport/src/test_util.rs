//! An in-memory network with configurable loss and delay, and a message handler that records
//!  everything it is called with. Time is tokio's, so tests can run with paused time.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::trace;
use crate::buffers::packet_buffer::PacketBuffer;
use crate::error::DisconnectReason;
use crate::header::Header;
use crate::message_handler::MessageHandler;
use crate::socket::DatagramSocket;

struct Datagram {
    deliver_at: Instant,
    from: SocketAddr,
    to: SocketAddr,
    data: Vec<u8>,
}

struct NetworkState {
    rng: StdRng,
    in_flight: VecDeque<Datagram>,
    num_sent: usize,
    num_dropped: usize,
}

pub struct SimulatedNetwork {
    loss_rate: f64,
    delay: Duration,
    state: Mutex<NetworkState>,
}

impl SimulatedNetwork {
    pub fn new(loss_rate: f64, delay: Duration, seed: u64) -> Arc<SimulatedNetwork> {
        Arc::new(SimulatedNetwork {
            loss_rate,
            delay,
            state: Mutex::new(NetworkState {
                rng: StdRng::seed_from_u64(seed),
                in_flight: VecDeque::new(),
                num_sent: 0,
                num_dropped: 0,
            }),
        })
    }

    pub fn socket(self: &Arc<Self>, addr: SocketAddr) -> Arc<SimulatedSocket> {
        Arc::new(SimulatedSocket {
            addr,
            network: self.clone(),
        })
    }

    /// puts a datagram on the wire that arrives immediately and is never lost
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        self.state.lock().in_flight.push_front(Datagram {
            deliver_at: Instant::now(),
            from,
            to,
            data: data.to_vec(),
        });
    }

    /// all datagrams that were sent through the network, including dropped ones
    pub fn num_sent(&self) -> usize {
        self.state.lock().num_sent
    }

    pub fn num_dropped(&self) -> usize {
        self.state.lock().num_dropped
    }

    fn send(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let mut state = self.state.lock();
        state.num_sent += 1;

        if self.loss_rate > 0.0 && state.rng.gen_bool(self.loss_rate) {
            trace!("simulated network: dropping datagram from {:?} to {:?}", from, to);
            state.num_dropped += 1;
            return;
        }

        state.in_flight.push_back(Datagram {
            deliver_at: Instant::now() + self.delay,
            from,
            to,
            data: data.to_vec(),
        });
    }

    fn receive(&self, addr: SocketAddr, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let idx = state.in_flight.iter()
            .position(|d| d.to == addr && d.deliver_at <= now)?;
        let datagram = state.in_flight.remove(idx)?;

        let len = datagram.data.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram.data[..len]);
        Some((len, datagram.from))
    }
}

pub struct SimulatedSocket {
    addr: SocketAddr,
    network: Arc<SimulatedNetwork>,
}

#[async_trait]
impl DatagramSocket for SimulatedSocket {
    async fn send_to(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<()> {
        self.network.send(self.addr, to, packet_buf);
        Ok(())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        Ok(self.network.receive(self.addr, buf))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMessage {
    pub from: SocketAddr,
    pub header: Header,
    pub message_kind: u8,
    pub payload: Vec<u8>,
}

#[derive(Default)]
pub struct RecordingHandler {
    messages: Mutex<Vec<RecordedMessage>>,
    connected: Mutex<Vec<SocketAddr>>,
    disconnected: Mutex<Vec<(SocketAddr, DisconnectReason)>>,
}

impl RecordingHandler {
    pub fn messages(&self) -> Vec<RecordedMessage> {
        self.messages.lock().clone()
    }

    pub fn num_messages(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.messages.lock().iter()
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn is_connected(&self, peer: SocketAddr) -> bool {
        self.connected.lock().contains(&peer)
    }

    /// every peer `on_connected` was called for, in order
    pub fn connected(&self) -> Vec<SocketAddr> {
        self.connected.lock().clone()
    }

    pub fn disconnected(&self) -> Vec<(SocketAddr, DisconnectReason)> {
        self.disconnected.lock().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn on_message(&self, from: SocketAddr, header: Header, message_kind: u8, payload: &mut PacketBuffer) {
        self.messages.lock().push(RecordedMessage {
            from,
            header,
            message_kind,
            payload: payload.unread().to_vec(),
        });
    }

    async fn on_connected(&self, peer: SocketAddr) {
        self.connected.lock().push(peer);
    }

    async fn on_disconnected(&self, peer: SocketAddr, reason: DisconnectReason) {
        self.disconnected.lock().push((peer, reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_delay_and_loss() {
        let a = SocketAddr::from(([1, 1, 1, 1], 1));
        let b = SocketAddr::from(([2, 2, 2, 2], 2));

        let network = SimulatedNetwork::new(0.5, Duration::from_millis(50), 1);
        let socket_a = network.socket(a);
        let socket_b = network.socket(b);

        for i in 0..100u8 {
            socket_a.send_to(b, &[i]).await.unwrap();
        }
        let mut buf = [0u8; 10];
        assert_eq!(socket_b.try_recv_from(&mut buf).unwrap(), None, "nothing arrives before the delay");

        tokio::time::advance(Duration::from_millis(50)).await;
        let mut received = Vec::new();
        while let Some((len, from)) = socket_b.try_recv_from(&mut buf).unwrap() {
            assert_eq!((len, from), (1, a));
            received.push(buf[0]);
        }

        assert_eq!(network.num_sent(), 100);
        assert_eq!(received.len() + network.num_dropped(), 100);
        assert!(!received.is_empty() && network.num_dropped() > 0);
        assert!(received.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(socket_a.try_recv_from(&mut buf).unwrap(), None);
    }
}
