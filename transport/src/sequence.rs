use std::fmt::{Display, Formatter};
use crate::safe_converter::SafeCast;

/// Sequence number of a reliable packet. Each peer has a single sequence space shared by all
///  reliable delivery modes, starting at zero. There is no wrap-around: a connection that
///  exhausts the 32 bit range is torn down.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SequenceNumber(u32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    /// `None` if the sequence space is exhausted
    pub fn checked_next(&self) -> Option<SequenceNumber> {
        self.0.checked_add(1).map(SequenceNumber)
    }

    /// index of this sequence number's slot in a window of the given size
    pub fn slot(&self, window_size: u32) -> usize {
        (self.0 % window_size).safe_cast()
    }

    pub fn widen(&self) -> u64 {
        self.0.safe_cast()
    }
}
