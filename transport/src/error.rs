use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors of individual buffer operations. They are recoverable: the operation has no effect,
///  and the buffer is flagged as contaminated so later reads should not be trusted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer overflow: writing {requested} bytes at position {position} exceeds capacity {capacity}")]
    Overflow { position: usize, requested: usize, capacity: usize },
    #[error("buffer underrun: reading {requested} bytes at position {position} exceeds written length {bytes_written}")]
    Underrun { position: usize, requested: usize, bytes_written: usize },
    #[error("malformed 7-bit encoded int at position {position}")]
    MalformedVarint { position: usize },
}

/// The header byte decoded to a value outside the legal range of one of its fields
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("corrupted packet header {raw:#010b}: {field} out of range")]
pub struct CorruptedHeader {
    pub raw: u8,
    pub field: &'static str,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    CorruptedHeader(#[from] CorruptedHeader),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("handshake with {peer} failed: {reason}")]
    HandshakeFailure { peer: SocketAddr, reason: String },
    #[error("receive window for {peer} exceeded: sequence {sequence} is {distance} ahead of the delivery cursor, window size is {window_size}")]
    WindowCapacityExceeded { peer: SocketAddr, sequence: u32, distance: u64, window_size: u32 },
    #[error("send window for {peer} is full ({window_size} unacknowledged packets)")]
    SendWindowFull { peer: SocketAddr, window_size: u32 },
    #[error("sequence numbers for {peer} are exhausted")]
    SequenceExhausted { peer: SocketAddr },
    #[error("no connection to {peer}")]
    NotConnected { peer: SocketAddr },
    #[error("message kind {0:#04x} is reserved for the transport")]
    ReservedMessageKind(u8),
    #[error("payload of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("encryption was not negotiated with {peer}")]
    EncryptionNotNegotiated { peer: SocketAddr },
    #[error("decryption of a packet from {peer} failed")]
    Decryption { peer: SocketAddr },
    #[error("peer {peer} is unreachable: {source}")]
    SocketUnreachable { peer: SocketAddr, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Io errors from sending to a specific peer that mean the peer is gone rather than a
    ///  transient local condition
    pub fn is_unreachable(err: &io::Error) -> bool {
        matches!(err.kind(),
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
        )
    }
}

/// Why a peer was torn down - passed to the application's disconnect callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// local call to `EndPoint::disconnect`
    Requested,
    /// the peer sent a disconnect message
    RemoteRequested,
    HandshakeFailure,
    WindowCapacityExceeded,
    SequenceExhausted,
    SocketUnreachable,
    /// the peer sent a connect request for a new connection, replacing the existing one
    Reconnected,
}

impl DisconnectReason {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            DisconnectReason::Requested => 0,
            DisconnectReason::RemoteRequested => 1,
            DisconnectReason::HandshakeFailure => 2,
            DisconnectReason::WindowCapacityExceeded => 3,
            DisconnectReason::SequenceExhausted => 4,
            DisconnectReason::SocketUnreachable => 5,
            DisconnectReason::Reconnected => 6,
        }
    }
}
