//! Byte-exact packet layouts. All integers are little endian.
//!
//! ```ascii
//! unreliable:       [header:1][message kind:1][payload...]
//! reliable:         [header:1][sequence:4][message kind:1][payload...]
//! encrypted:        [header:1][IV:16][sequence:4][AES-256-CBC(message kind + payload)...]
//! ack:              [header:1 (unreliable)][message kind = ACK][sequence:4]
//! ```
//!
//! Header and sequence number of an encrypted packet are in clear text, so acknowledgement and
//!  window bookkeeping work without decryption.

use tracing::trace;
use crate::buffers::packet_buffer::PacketBuffer;
use crate::encryption::{SessionKey, IV_LEN};
use crate::error::{BufferError, TransportError};
use crate::header::{DeliveryMode, Header};
use crate::message_kind::InternalKind;
use crate::sequence::SequenceNumber;

pub const HEADER_LEN: usize = 1;
pub const SEQUENCE_LEN: usize = 4;
pub const MESSAGE_KIND_LEN: usize = 1;

const IV_OFFSET: usize = HEADER_LEN;
const ENCRYPTED_BODY_OFFSET: usize = HEADER_LEN + IV_LEN + SEQUENCE_LEN;

/// The maximum application payload that fits into a packet of the given size with the given
///  delivery mode
pub fn max_payload_len(packet_size: usize, delivery_mode: DeliveryMode) -> usize {
    match delivery_mode {
        DeliveryMode::Unreliable => packet_size.saturating_sub(HEADER_LEN + MESSAGE_KIND_LEN),
        DeliveryMode::Reliable | DeliveryMode::ReliableOrdered => packet_size.saturating_sub(HEADER_LEN + SEQUENCE_LEN + MESSAGE_KIND_LEN),
        DeliveryMode::ReliableEncryptedOrdered => {
            // the ciphertext is a whole number of blocks, with at least one byte of padding
            let num_blocks = packet_size.saturating_sub(ENCRYPTED_BODY_OFFSET) / 16;
            (num_blocks * 16).saturating_sub(MESSAGE_KIND_LEN + 1)
        }
    }
}

pub fn write_unreliable(buf: &mut PacketBuffer, header: Header, message_kind: u8, payload: &[u8]) -> Result<(), BufferError> {
    debug_assert_eq!(header.delivery_mode, DeliveryMode::Unreliable);

    buf.write_u8(header.encode())?;
    buf.write_u8(message_kind)?;
    buf.write_bytes(payload)?;
    buf.set_raw_wire(true);
    Ok(())
}

pub fn write_reliable(buf: &mut PacketBuffer, header: Header, sequence: SequenceNumber, message_kind: u8, payload: &[u8]) -> Result<(), BufferError> {
    debug_assert!(header.delivery_mode.is_reliable() && !header.delivery_mode.is_encrypted());

    buf.write_u8(header.encode())?;
    buf.write_u32(sequence.to_raw())?;
    buf.write_u8(message_kind)?;
    buf.write_bytes(payload)?;
    buf.set_raw_wire(true);
    Ok(())
}

pub fn write_encrypted(buf: &mut PacketBuffer, header: Header, sequence: SequenceNumber, message_kind: u8, payload: &[u8], key: &SessionKey) -> Result<(), BufferError> {
    debug_assert!(header.delivery_mode.is_encrypted());

    buf.write_u8(header.encode())?;
    buf.write_bytes(&[0; IV_LEN])?;
    buf.write_u32(sequence.to_raw())?;
    buf.write_u8(message_kind)?;
    buf.write_bytes(payload)?;
    key.encrypt_in_place(buf, IV_OFFSET, ENCRYPTED_BODY_OFFSET)?;
    buf.set_raw_wire(true);
    Ok(())
}

pub fn write_ack(buf: &mut PacketBuffer, sequence: SequenceNumber) -> Result<(), BufferError> {
    buf.write_u8(Header::with_delivery_mode(DeliveryMode::Unreliable).encode())?;
    buf.write_u8(InternalKind::Ack.into())?;
    buf.write_u32(sequence.to_raw())?;
    buf.set_raw_wire(true);
    Ok(())
}

/// The clear-text part of a received packet, up to (but excluding) the message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketPrefix {
    pub header: Header,
    pub sequence: Option<SequenceNumber>,
    pub iv: Option<[u8; IV_LEN]>,
}

/// Reads the clear-text prefix of a received packet, leaving the cursor at the message kind,
///  or at the start of the ciphertext for encrypted packets
pub fn read_prefix(buf: &mut PacketBuffer) -> Result<PacketPrefix, TransportError> {
    let header = Header::decode(buf.read_u8()?)?;

    let iv = if header.delivery_mode.is_encrypted() {
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(buf.read_bytes(IV_LEN)?);
        Some(iv)
    }
    else {
        None
    };

    let sequence = if header.delivery_mode.is_reliable() {
        Some(SequenceNumber::from_raw(buf.read_u32()?))
    }
    else {
        None
    };

    trace!("packet prefix: {:?}, sequence {:?}", header, sequence);
    Ok(PacketPrefix {
        header,
        sequence,
        iv,
    })
}
