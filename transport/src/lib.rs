//! A reliable transport on top of UDP, trading TCP's strict guarantees for low latency and
//!  control over delivery semantics on a per-message basis.
//!
//! ## Design
//!
//! * Peer-to-peer: every node has a single UDP socket handling all peers. A peer is identified
//!   by its socket address.
//! * The abstraction is *messages* that fit into a single packet. There is no fragmentation,
//!   so the maximum payload is determined by the configured packet size and the delivery mode
//!   (see [wire::max_payload_len]).
//! * Each message chooses its delivery mode in the packet header:
//!   * *unreliable*: fire and forget, no sequence number
//!   * *reliable*: acknowledged and resent until acknowledged, delivered without duplicates
//!      but possibly out of order
//!   * *reliable ordered*: like reliable, but delivered in the order of sending
//!   * *reliable ordered + encrypted*: like reliable ordered, with the message encrypted by
//!      a session key negotiated during the handshake
//! * The application drives receiving by calling [EndPoint::tick], and gets messages and
//!   connection events through a [MessageHandler]. Resending runs in a background task per peer.
//! * Buffers are pooled: every packet buffer taken from the pool is returned to it eventually,
//!   whether the packet is delivered, dropped, or discarded when a peer is torn down.
//!
//! ## Packet layouts
//!
//! All integers are little endian.
//!
//! ```ascii
//! unreliable:  [header:1][message kind:1][payload...]
//! reliable:    [header:1][sequence:4][message kind:1][payload...]
//! encrypted:   [header:1][IV:16][sequence:4][AES-256-CBC(message kind + payload)]
//! ```
//!
//! See [header] for the bits of the header byte. Message kinds `0xF0` and up are reserved for
//!  the transport's own messages (see [message_kind]), which travel in unreliable packets:
//!
//! ```ascii
//! CONNECT_REQUEST (0xF0): [protocol version:1][connection id:8][public key length:varint][RSA public key, PKCS#1 DER]
//! CONNECT_ACCEPT  (0xF1): [wrapped key length:varint][session key, RSA-OAEP(SHA-256) encrypted]
//! DISCONNECT      (0xF2): [reason:1]
//! ACK             (0xF3): [sequence:4]
//! ```
//!
//! ## Handshake
//!
//! The initiator generates an RSA key pair and sends its public key in a `CONNECT_REQUEST`,
//!  repeating it periodically until it is accepted or the handshake times out. The acceptor
//!  generates a random AES-256 session key, wraps it with the public key and sends it back in a
//!  `CONNECT_ACCEPT`. An empty public key requests an unencrypted connection; encrypted delivery
//!  is not available on it.
//!
//! Every connection attempt carries a random connection id. A repeated request with the same id
//!  gets the accept resent, while a request with a different id replaces the existing connection
//!  with a fresh one, so a restarted peer starts over at sequence number 0.
//!
//! ## Send and receive window
//!
//! Each peer has a single sequence number space for reliable packets, starting at 0.
//!
//! The sender keeps every reliable packet until it is acknowledged, resending it when it was
//!  not acknowledged for the resend timeout. The send window's position is determined by the
//!  oldest unacknowledged packet: sending fails with [TransportError::SendWindowFull] rather
//!  than running ahead of it by the window size or more.
//!
//! The receiver acknowledges every reliable packet, duplicates included, and buffers ordered
//!  packets until all their predecessors are delivered. A packet that is a window's size or
//!  more ahead of the delivery cursor is a protocol violation and tears the peer down.

pub mod buffers;
pub mod config;
pub mod encryption;
pub mod end_point;
pub mod error;
pub mod handshake;
pub mod header;
pub mod message_handler;
pub mod message_kind;
mod peer;
pub mod receive_window;
pub mod safe_converter;
pub mod send_window;
pub mod sequence;
pub mod socket;
pub mod wire;

#[cfg(test)]
mod test_util;

pub use config::RudpConfig;
pub use end_point::EndPoint;
pub use error::{DisconnectReason, TransportError};
pub use header::{CachingOption, DeliveryMode, Header, ProcessingOption, Target};
pub use message_handler::MessageHandler;
