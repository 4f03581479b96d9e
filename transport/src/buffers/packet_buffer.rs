//! This is the fixed-capacity buffer that every packet lives in, from the application's
//!  payload to the wire copy retained for retransmission. Buffers are reused aggressively via
//!  [BufferPool](crate::buffers::buffer_pool::BufferPool), so their capacity never changes after
//!  construction.
//!
//! Their salient points are:
//!
//! * backed by a fixed-length, pre-allocated buffer
//! * a single cursor (`position`) for both writing and reading, and a logical length
//!   (`bytes_written`) marking the end of valid data
//! * little-endian primitive codecs and a 7-bit varint codec
//! * every access is bounds-checked: violations return an error, leave the buffer unchanged
//!   and flag it as contaminated
//! * implement `Buf` and `BufMut` to fit into the `bytes` ecosystem
//!

use std::borrow::Borrow;
use std::cmp::max;
use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use tokio::time::Instant;
use tracing::debug;
use crate::error::BufferError;

/// maximum length of a 7-bit encoded 32-bit integer
pub const MAX_VARINT_LEN: usize = 5;

macro_rules! write_le_impl {
    ($writer: ident, $ty:ty, $putter: ident) => {
        pub fn $writer(&mut self, value: $ty) -> Result<(), BufferError> {
            self.ensure_writable(size_of::<$ty>())?;
            self.$putter(value);
            Ok(())
        }
    }
}

macro_rules! read_le_impl {
    ($reader: ident, $ty:ty, $getter: ident) => {
        pub fn $reader(&mut self) -> Result<$ty, BufferError> {
            self.ensure_readable(size_of::<$ty>())?;
            Ok(self.$getter())
        }
    }
}

#[derive(Eq)]
pub struct PacketBuffer {
    buf: Vec<u8>,
    position: usize,
    bytes_written: usize,
    last_write_time: Option<Instant>,
    is_raw_wire: bool,
    contaminated: bool,
}

impl PacketBuffer {
    pub fn new(capacity: usize) -> PacketBuffer {
        PacketBuffer {
            // in this particular use case, there is no real benefit in lazily initializing the
            //  buffer since buffers are reused aggressively, and we trade the overhead of
            //  initial initialization for simplicity
            buf: vec![0; capacity],
            position: 0,
            bytes_written: 0,
            last_write_time: None,
            is_raw_wire: false,
            contaminated: false,
        }
    }

    /// This is a convenience function for test code. It derives the buffer's content from a
    ///  slice, leaving the cursor at the start.
    #[cfg(test)]
    pub fn from_slice(capacity: usize, data: &[u8]) -> PacketBuffer {
        let mut result = PacketBuffer::new(capacity);
        result.write_bytes(data).expect("test data should fit");
        result.position = 0;
        result
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// the logical length of the buffer, i.e. the end of valid data
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn len(&self) -> usize {
        self.bytes_written
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_written == 0
    }

    /// number of bytes between the cursor and the end of valid data
    pub fn remaining(&self) -> usize {
        self.bytes_written - self.position
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity() - self.position
    }

    /// true iff the buffer is in the state of a freshly pooled buffer
    pub fn is_empty_state(&self) -> bool {
        self.position == 0 && self.bytes_written == 0
    }

    pub fn is_contaminated(&self) -> bool {
        self.contaminated
    }

    pub fn last_write_time(&self) -> Option<Instant> {
        self.last_write_time
    }

    pub fn set_last_write_time(&mut self, time: Instant) {
        self.last_write_time = Some(time);
    }

    /// true if the buffer contains a complete wire packet (header included) rather than just
    ///  a payload
    pub fn is_raw_wire(&self) -> bool {
        self.is_raw_wire
    }

    pub fn set_raw_wire(&mut self, is_raw_wire: bool) {
        self.is_raw_wire = is_raw_wire;
    }

    pub fn set_position(&mut self, position: usize) -> Result<(), BufferError> {
        if position > self.bytes_written {
            return Err(self.underrun(position - self.position));
        }
        self.position = position;
        Ok(())
    }

    /// back to the state of a freshly allocated buffer
    pub fn reset(&mut self) {
        self.position = 0;
        self.bytes_written = 0;
        self.last_write_time = None;
        self.is_raw_wire = false;
        self.contaminated = false;
    }

    /// make the entire underlying buffer available for a socket read, with the cursor at the
    ///  start. Follow up with `truncate()` to the number of bytes actually read.
    pub fn fill_for_receive(&mut self) -> &mut [u8] {
        self.position = 0;
        self.bytes_written = self.capacity();
        &mut self.buf[..]
    }

    pub fn truncate(&mut self, len: usize) {
        let len = len.min(self.capacity());
        self.bytes_written = len;
        self.position = self.position.min(len);
    }

    /// the unread part of the valid data, i.e. from the cursor to the logical end
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.position..self.bytes_written]
    }

    /// The full underlying array from `start` to the end of capacity. This is for in-place
    ///  transformations that may change the length (e.g. adding cipher padding) - follow up
    ///  with `truncate()`.
    pub(crate) fn raw_tail_mut(&mut self, start: usize) -> &mut [u8] {
        &mut self.buf[start..]
    }

    fn ensure_writable(&mut self, size: usize) -> Result<(), BufferError> {
        if self.position + size > self.capacity() {
            self.contaminated = true;
            let err = BufferError::Overflow { position: self.position, requested: size, capacity: self.capacity() };
            debug!("{}", err);
            return Err(err);
        }
        Ok(())
    }

    fn ensure_readable(&mut self, size: usize) -> Result<(), BufferError> {
        if self.position + size > self.bytes_written {
            return Err(self.underrun(size));
        }
        Ok(())
    }

    fn underrun(&mut self, requested: usize) -> BufferError {
        self.contaminated = true;
        let err = BufferError::Underrun { position: self.position, requested, bytes_written: self.bytes_written };
        debug!("{}", err);
        err
    }

    write_le_impl!(write_u8, u8, put_u8);
    write_le_impl!(write_i16, i16, put_i16_le);
    write_le_impl!(write_u16, u16, put_u16_le);
    write_le_impl!(write_i32, i32, put_i32_le);
    write_le_impl!(write_u32, u32, put_u32_le);
    write_le_impl!(write_i64, i64, put_i64_le);
    write_le_impl!(write_u64, u64, put_u64_le);

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), BufferError> {
        self.ensure_writable(data.len())?;
        self.put_slice(data);
        Ok(())
    }

    /// Variable-length encoding of the value's 32-bit pattern: 7 data bits per byte, the high
    ///  bit flagging continuation. Negative values always take the full 5 bytes.
    pub fn write_7bit_encoded_int(&mut self, value: i32) -> Result<(), BufferError> {
        let raw = value as u32;
        self.ensure_writable(varint_len(raw))?;
        self.put_u32_varint(raw);
        Ok(())
    }

    read_le_impl!(read_u8, u8, get_u8);
    read_le_impl!(read_i16, i16, get_i16_le);
    read_le_impl!(read_u16, u16, get_u16_le);
    read_le_impl!(read_i32, i32, get_i32_le);
    read_le_impl!(read_u32, u32, get_u32_le);
    read_le_impl!(read_i64, i64, get_i64_le);
    read_le_impl!(read_u64, u64, get_u64_le);

    pub fn read_bytes(&mut self, len: usize) -> Result<&[u8], BufferError> {
        self.ensure_readable(len)?;
        let start = self.position;
        self.position += len;
        Ok(&self.buf[start..start + len])
    }

    pub fn read_7bit_encoded_int(&mut self) -> Result<i32, BufferError> {
        let unread = self.unread();
        let available = unread.len();
        let encoded_len = unread.iter()
            .take(MAX_VARINT_LEN)
            .position(|b| b & 0x80 == 0)
            .map(|idx| idx + 1);
        let fifth_byte = unread.get(MAX_VARINT_LEN - 1).copied();

        match encoded_len {
            None if available < MAX_VARINT_LEN => return Err(self.underrun(available + 1)),
            None => return Err(self.malformed_varint()),
            // the fifth byte may only contribute the top four bits
            Some(MAX_VARINT_LEN) if fifth_byte.unwrap_or_default() > 0x0f => return Err(self.malformed_varint()),
            Some(_) => {}
        }

        let position = self.position;
        match self.try_get_u32_varint() {
            Ok(raw) => Ok(raw as i32),
            Err(_) => {
                self.position = position;
                Err(self.malformed_varint())
            }
        }
    }

    fn malformed_varint(&mut self) -> BufferError {
        self.contaminated = true;
        let err = BufferError::MalformedVarint { position: self.position };
        debug!("{}", err);
        err
    }
}

/// number of bytes the 7-bit encoding of a value takes
pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0xfff_ffff => 4,
        _ => MAX_VARINT_LEN,
    }
}

impl PartialEq for PacketBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for PacketBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for PacketBuffer {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for PacketBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.bytes_written]
    }
}
impl AsMut<[u8]> for PacketBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.bytes_written]
    }
}

/// Reading consumes from the cursor up to the logical length
impl Buf for PacketBuffer {
    fn remaining(&self) -> usize {
        self.bytes_written - self.position
    }

    fn chunk(&self) -> &[u8] {
        &self.buf[self.position..self.bytes_written]
    }

    fn advance(&mut self, cnt: usize) {
        assert!(self.position + cnt <= self.bytes_written);
        self.position += cnt;
    }
}

/// Writing happens at the cursor, extending the logical length if the cursor moves past it
unsafe impl BufMut for PacketBuffer {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.position
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.position + cnt <= self.capacity());
        self.position += cnt;
        self.bytes_written = max(self.bytes_written, self.position);
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.position..])
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_new_is_empty() {
        let buf = PacketBuffer::new(100);
        assert!(buf.is_empty_state());
        assert_eq!(buf.capacity(), 100);
        assert_eq!(buf.as_ref(), b"");
        assert!(!buf.is_raw_wire());
        assert!(buf.last_write_time().is_none());
    }

    #[test]
    fn test_write_primitives_little_endian() {
        let mut buf = PacketBuffer::new(100);
        buf.write_u8(1).unwrap();
        buf.write_i16(-2).unwrap();
        buf.write_u32(0x0403_0201).unwrap();
        buf.write_i64(5).unwrap();

        assert_eq!(buf.as_ref(), &[1, 0xfe,0xff, 1,2,3,4, 5,0,0,0,0,0,0,0]);
        assert_eq!(buf.position(), 15);
        assert_eq!(buf.bytes_written(), 15);
    }

    #[test]
    fn test_read_back() {
        let mut buf = PacketBuffer::new(100);
        buf.write_u8(9).unwrap();
        buf.write_u16(0xabcd).unwrap();
        buf.write_i32(-77).unwrap();
        buf.write_u64(u64::MAX - 3).unwrap();
        buf.write_bytes(b"tail").unwrap();

        buf.set_position(0).unwrap();
        assert_eq!(buf.read_u8(), Ok(9));
        assert_eq!(buf.read_u16(), Ok(0xabcd));
        assert_eq!(buf.read_i32(), Ok(-77));
        assert_eq!(buf.read_u64(), Ok(u64::MAX - 3));
        assert_eq!(buf.read_bytes(4), Ok(&b"tail"[..]));
        assert_eq!(buf.remaining(), 0);
        assert!(!buf.is_contaminated());
    }

    #[rstest]
    #[case::u8_full(1, &[7], 1)]
    #[case::u32_partial(3, &[], 4)]
    #[case::u64_empty(0, &[], 8)]
    #[case::slice_too_long(5, &[1,2], 4)]
    fn test_overflow_is_noop(#[case] capacity: usize, #[case] prefill: &[u8], #[case] size: usize) {
        let mut buf = PacketBuffer::new(capacity);
        buf.write_bytes(prefill).unwrap();

        let result = match size {
            1 => buf.write_u8(1),
            4 => buf.write_bytes(&[9; 4]),
            _ => buf.write_u64(1),
        };

        assert!(matches!(result, Err(BufferError::Overflow { .. })));
        assert_eq!(buf.as_ref(), prefill);
        assert_eq!(buf.position(), prefill.len());
        assert!(buf.is_contaminated());
    }

    #[test]
    fn test_underrun_yields_error_and_keeps_cursor() {
        let mut buf = PacketBuffer::from_slice(20, &[1, 2, 3]);

        assert!(matches!(buf.read_u32(), Err(BufferError::Underrun { position: 0, requested: 4, bytes_written: 3 })));
        assert_eq!(buf.position(), 0);
        assert!(buf.is_contaminated());

        // default value semantics for callers that want them
        assert_eq!(buf.read_i64().unwrap_or_default(), 0);
        assert_eq!(buf.read_u8(), Ok(1));
    }

    #[test]
    fn test_read_bytes_underrun() {
        let mut buf = PacketBuffer::from_slice(20, b"abc");
        assert!(buf.read_bytes(4).is_err());
        assert_eq!(buf.read_bytes(3), Ok(&b"abc"[..]));
    }

    #[rstest]
    #[case::zero(0, vec![0])]
    #[case::one(1, vec![1])]
    #[case::max_one_byte(127, vec![0x7f])]
    #[case::min_two_bytes(128, vec![0x80, 0x01])]
    #[case::three_hundred(300, vec![0xac, 0x02])]
    #[case::max_i32(i32::MAX, vec![0xff, 0xff, 0xff, 0xff, 0x07])]
    #[case::minus_one(-1, vec![0xff, 0xff, 0xff, 0xff, 0x0f])]
    #[case::min_i32(i32::MIN, vec![0x80, 0x80, 0x80, 0x80, 0x08])]
    fn test_varint_encoding(#[case] value: i32, #[case] expected: Vec<u8>) {
        let mut buf = PacketBuffer::new(10);
        buf.write_7bit_encoded_int(value).unwrap();
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(varint_len(value as u32), expected.len());

        buf.set_position(0).unwrap();
        assert_eq!(buf.read_7bit_encoded_int(), Ok(value));
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_varint_round_trip() {
        let mut buf = PacketBuffer::new(MAX_VARINT_LEN);
        let mut value: i64 = i32::MIN as i64;
        while value <= i32::MAX as i64 {
            buf.reset();
            buf.write_7bit_encoded_int(value as i32).unwrap();
            buf.set_position(0).unwrap();
            assert_eq!(buf.read_7bit_encoded_int(), Ok(value as i32));
            value += 65_521; // prime stride to hit all byte lengths and bit patterns
        }
    }

    #[rstest]
    #[case::six_bytes(vec![0x80, 0x80, 0x80, 0x80, 0x80, 0x01])]
    #[case::fifth_byte_too_big(vec![0xff, 0xff, 0xff, 0xff, 0x10])]
    fn test_varint_malformed(#[case] data: Vec<u8>) {
        let mut buf = PacketBuffer::from_slice(10, &data);
        assert_eq!(buf.read_7bit_encoded_int(), Err(BufferError::MalformedVarint { position: 0 }));
        assert_eq!(buf.position(), 0);
        assert!(buf.is_contaminated());
    }

    #[test]
    fn test_varint_truncated() {
        let mut buf = PacketBuffer::from_slice(10, &[0x80, 0x80]);
        assert!(matches!(buf.read_7bit_encoded_int(), Err(BufferError::Underrun { .. })));
        assert_eq!(buf.position(), 0);
    }

    #[test]
    fn test_varint_overflow_on_write() {
        let mut buf = PacketBuffer::new(4);
        assert!(matches!(buf.write_7bit_encoded_int(-1), Err(BufferError::Overflow { .. })));
        assert!(buf.is_empty_state());
    }

    #[test]
    fn test_reset() {
        let mut buf = PacketBuffer::new(20);
        buf.write_u32(5).unwrap();
        buf.set_raw_wire(true);
        buf.set_last_write_time(Instant::now());
        let _ = buf.read_u8();

        buf.reset();

        assert!(buf.is_empty_state());
        assert!(!buf.is_raw_wire());
        assert!(buf.last_write_time().is_none());
        assert!(!buf.is_contaminated());
        assert_eq!(buf.capacity(), 20);
    }

    #[test]
    fn test_fill_for_receive_and_truncate() {
        let mut buf = PacketBuffer::new(8);
        let raw = buf.fill_for_receive();
        assert_eq!(raw.len(), 8);
        raw[..3].copy_from_slice(b"xyz");

        buf.truncate(3);
        assert_eq!(buf.as_ref(), b"xyz");
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.read_u8(), Ok(b'x'));
    }

    #[test]
    fn test_set_position_beyond_written() {
        let mut buf = PacketBuffer::from_slice(10, b"ab");
        assert!(buf.set_position(3).is_err());
        assert!(buf.set_position(2).is_ok());
        assert_eq!(buf.unread(), b"");
    }

    #[test]
    fn test_overwrite_in_the_middle_keeps_length() {
        let mut buf = PacketBuffer::from_slice(10, b"hello");
        buf.set_position(1).unwrap();
        buf.write_u8(b'a').unwrap();
        assert_eq!(buf.as_ref(), b"hallo");
        assert_eq!(buf.bytes_written(), 5);
    }

    #[rstest]
    #[case::empty(PacketBuffer::from_slice(100, b""), PacketBuffer::from_slice(200, b""), true)]
    #[case::simple(PacketBuffer::from_slice(100, b"hi"), PacketBuffer::from_slice(200, b"hi"), true)]
    #[case::different(PacketBuffer::from_slice(100, b"hi"), PacketBuffer::from_slice(100, b"yo"), false)]
    #[case::prefix(PacketBuffer::from_slice(100, b"h"), PacketBuffer::from_slice(100, b"hi"), false)]
    fn test_eq(#[case] buf1: PacketBuffer, #[case] buf2: PacketBuffer, #[case] expected: bool) {
        assert_eq!(buf1.eq(&buf2), expected);
        assert_eq!(buf2.eq(&buf1), expected);
    }
}
