//! Connection setup. The initiator sends a `ConnectRequest` with its RSA public key, the
//!  acceptor answers with a `ConnectAccept` carrying a fresh AES-256 session key, wrapped with
//!  RSA-OAEP (SHA-256) under that public key. Without encryption, the key fields are empty and
//!  the same messages just establish the connection.

use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use crate::buffers::packet_buffer::PacketBuffer;
use crate::encryption::SessionKey;
use crate::error::BufferError;
use crate::safe_converter::{PrecheckedCast, SafeCast};

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("unsupported protocol version {0}")]
    ProtocolVersion(u8),
    #[error("malformed handshake message: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("invalid public key: {0}")]
    PublicKey(#[from] rsa::pkcs1::Error),
    #[error("unwrapped session key has length {0}")]
    KeyLength(usize),
}

/// The initiator's RSA key pair. It lives only for the duration of the handshake.
pub struct HandshakeKeyPair {
    private_key: RsaPrivateKey,
}

impl HandshakeKeyPair {
    /// NB: This is expensive (hundreds of milliseconds for 2048 bit keys) and should not run on
    ///      an async worker thread
    pub fn generate(bits: usize) -> Result<HandshakeKeyPair, HandshakeError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)?;
        Ok(HandshakeKeyPair { private_key })
    }

    /// PKCS#1 DER encoding of the public key
    pub fn public_key_der(&self) -> Result<Vec<u8>, HandshakeError> {
        let der = self.private_key.to_public_key().to_pkcs1_der()?;
        Ok(der.as_bytes().to_vec())
    }

    pub fn unwrap_session_key(&self, wrapped_key: &[u8]) -> Result<SessionKey, HandshakeError> {
        let raw = self.private_key.decrypt(Oaep::new::<Sha256>(), wrapped_key)?;
        SessionKey::from_slice(&raw)
            .ok_or(HandshakeError::KeyLength(raw.len()))
    }
}

pub fn wrap_session_key(public_key_der: &[u8], session_key: &SessionKey) -> Result<Vec<u8>, HandshakeError> {
    let public_key = RsaPublicKey::from_pkcs1_der(public_key_der)?;
    Ok(public_key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), session_key.as_bytes())?)
}

/// ```ascii
/// 0: protocol version (u8)
/// 1: connection id (u64) - random per `connect` call, identical for its retries
/// 9: public key length (7-bit encoded int) - 0 if the initiator does not request encryption
/// *: public key (PKCS#1 DER)
/// ```
///
/// The connection id lets the acceptor tell a retry (the accept was lost) from a new
///  connection by a peer that restarted on the same address.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectRequest {
    pub protocol_version: u8,
    pub connection_id: u64,
    pub public_key: Vec<u8>,
}

impl ConnectRequest {
    pub fn new(connection_id: u64, public_key: Vec<u8>) -> ConnectRequest {
        ConnectRequest {
            protocol_version: PROTOCOL_VERSION,
            connection_id,
            public_key,
        }
    }

    pub fn wants_encryption(&self) -> bool {
        !self.public_key.is_empty()
    }

    pub fn ser(&self, buf: &mut PacketBuffer) -> Result<(), BufferError> {
        buf.write_u8(self.protocol_version)?;
        buf.write_u64(self.connection_id)?;
        write_len_prefixed(buf, &self.public_key)
    }

    pub fn deser(buf: &mut PacketBuffer) -> Result<ConnectRequest, HandshakeError> {
        let protocol_version = buf.read_u8()?;
        if protocol_version != PROTOCOL_VERSION {
            debug!("connect request with protocol version {}, expected {}", protocol_version, PROTOCOL_VERSION);
            return Err(HandshakeError::ProtocolVersion(protocol_version));
        }
        let connection_id = buf.read_u64()?;
        let public_key = read_len_prefixed(buf)?;
        Ok(ConnectRequest {
            protocol_version,
            connection_id,
            public_key,
        })
    }
}

/// ```ascii
/// 0: wrapped key length (7-bit encoded int) - 0 if no encryption was negotiated
/// *: session key, RSA-OAEP encrypted with the initiator's public key
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectAccept {
    pub wrapped_key: Vec<u8>,
}

impl ConnectAccept {
    pub fn ser(&self, buf: &mut PacketBuffer) -> Result<(), BufferError> {
        write_len_prefixed(buf, &self.wrapped_key)
    }

    pub fn deser(buf: &mut PacketBuffer) -> Result<ConnectAccept, HandshakeError> {
        Ok(ConnectAccept {
            wrapped_key: read_len_prefixed(buf)?,
        })
    }
}

fn write_len_prefixed(buf: &mut PacketBuffer, data: &[u8]) -> Result<(), BufferError> {
    buf.write_7bit_encoded_int(data.len().prechecked_cast())?;
    buf.write_bytes(data)
}

fn read_len_prefixed(buf: &mut PacketBuffer) -> Result<Vec<u8>, HandshakeError> {
    let len = buf.read_7bit_encoded_int()?;
    let len: u32 = len.try_into()
        .map_err(|_| HandshakeError::Malformed("negative length"))?;
    Ok(buf.read_bytes(len.safe_cast())?.to_vec())
}
