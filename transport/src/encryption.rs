use std::fmt::{Debug, Formatter};
use aes::Aes256;
use cbc::cipher::block_padding::{Pkcs7, UnpadError};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::trace;
use crate::buffers::packet_buffer::PacketBuffer;
use crate::error::BufferError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

/// The symmetric AES-256 key shared by two peers after the handshake. Packets are encrypted
///  with AES-256-CBC and PKCS#7 padding, using a fresh random IV for every packet.
///
/// NB: CBC does not authenticate, so a modified ciphertext is detected only if it happens to
///  break the padding
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl Debug for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey(..)")
    }
}

impl SessionKey {
    pub fn generate() -> SessionKey {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        SessionKey(key)
    }

    pub fn from_slice(raw: &[u8]) -> Option<SessionKey> {
        raw.try_into().ok().map(SessionKey)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// length of the ciphertext for a given plaintext length: PKCS#7 always adds at least one
    ///  byte of padding
    pub fn padded_len(plaintext_len: usize) -> usize {
        (plaintext_len / BLOCK_LEN + 1) * BLOCK_LEN
    }

    /// Encrypts the buffer's valid data from `start` to its end in place, writing a fresh random
    ///  IV to `iv_pos`. The region for the IV must already be part of the buffer's valid data.
    pub fn encrypt_in_place(&self, buf: &mut PacketBuffer, iv_pos: usize, start: usize) -> Result<(), BufferError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        self.encrypt_with_iv(buf, &iv, iv_pos, start)
    }

    fn encrypt_with_iv(&self, buf: &mut PacketBuffer, iv: &[u8; IV_LEN], iv_pos: usize, start: usize) -> Result<(), BufferError> {
        let plaintext_len = buf.bytes_written() - start;
        let padded_len = Self::padded_len(plaintext_len);
        let capacity = buf.capacity();
        if start + padded_len > capacity {
            return Err(BufferError::Overflow { position: start, requested: padded_len, capacity });
        }

        buf.as_mut()[iv_pos..iv_pos + IV_LEN].copy_from_slice(iv);

        let ciphertext_len = Aes256CbcEnc::new(&self.0.into(), iv.into())
            .encrypt_padded_mut::<Pkcs7>(buf.raw_tail_mut(start), plaintext_len)
            .map_err(|_| BufferError::Overflow { position: start, requested: padded_len, capacity })?
            .len();
        buf.truncate(start + ciphertext_len);

        trace!("encrypted {} bytes into {} bytes", plaintext_len, ciphertext_len);
        Ok(())
    }

    /// Decrypts the buffer's valid data from `start` to its end in place, truncating the buffer
    ///  to the end of the plaintext
    pub fn decrypt_in_place(&self, buf: &mut PacketBuffer, iv: &[u8; IV_LEN], start: usize) -> Result<(), UnpadError> {
        if start > buf.bytes_written() {
            return Err(UnpadError);
        }

        let plaintext_len = Aes256CbcDec::new(&self.0.into(), iv.into())
            .decrypt_padded_mut::<Pkcs7>(&mut buf.as_mut()[start..])?
            .len();
        buf.truncate(start + plaintext_len);
        Ok(())
    }
}
