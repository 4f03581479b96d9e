//! The one-byte packet header:
//!
//! ```ascii
//! bit 0-1: delivery mode
//!          00 unreliable
//!          01 reliable (unordered)
//!          10 reliable ordered
//!          11 reliable ordered + encrypted
//! bit 2-3: target (interpreted by the application)
//!          00 all, 01 others, 10 self only, 11 invalid
//! bit 4:   processing option (interpreted by the application)
//!          0 automatic, 1 manual
//! bit 5-6: caching option (interpreted by the application)
//!          00 none, 01 overwrite, 10 append, 11 invalid
//! bit 7:   reserved, must be 0
//! ```
//!
//! A byte that does not decode to legal values for all fields marks the whole packet as
//!  corrupted.

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::error::CorruptedHeader;

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    struct HeaderBits: u8 {
        const MASK_DELIVERY   = 0b0000_0011;
        const MASK_TARGET     = 0b0000_1100;
        const MASK_PROCESSING = 0b0001_0000;
        const MASK_CACHING    = 0b0110_0000;
        const RESERVED        = 0b1000_0000;
    }
}

const SHIFT_TARGET: u32 = 2;
const SHIFT_PROCESSING: u32 = 4;
const SHIFT_CACHING: u32 = 5;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DeliveryMode {
    Unreliable = 0,
    Reliable = 1,
    ReliableOrdered = 2,
    ReliableEncryptedOrdered = 3,
}
impl DeliveryMode {
    /// reliable packets carry a sequence number, are acknowledged and resent
    pub fn is_reliable(&self) -> bool {
        !matches!(self, DeliveryMode::Unreliable)
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self, DeliveryMode::ReliableOrdered | DeliveryMode::ReliableEncryptedOrdered)
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, DeliveryMode::ReliableEncryptedOrdered)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Target {
    All = 0,
    Others = 1,
    SelfOnly = 2,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProcessingOption {
    Automatic = 0,
    Manual = 1,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CachingOption {
    None = 0,
    Overwrite = 1,
    Append = 2,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Header {
    pub delivery_mode: DeliveryMode,
    pub target: Target,
    pub processing_option: ProcessingOption,
    pub caching_option: CachingOption,
}

impl Header {
    pub fn new(delivery_mode: DeliveryMode, target: Target, processing_option: ProcessingOption, caching_option: CachingOption) -> Header {
        Header {
            delivery_mode,
            target,
            processing_option,
            caching_option,
        }
    }

    /// header with default application-level options, for transport-internal packets and for
    ///  applications that do not use target / processing / caching
    pub fn with_delivery_mode(delivery_mode: DeliveryMode) -> Header {
        Header::new(delivery_mode, Target::All, ProcessingOption::Automatic, CachingOption::None)
    }

    pub fn encode(&self) -> u8 {
        let delivery: u8 = self.delivery_mode.into();
        let target: u8 = self.target.into();
        let processing: u8 = self.processing_option.into();
        let caching: u8 = self.caching_option.into();

        let bits = HeaderBits::from_bits_retain(delivery)
            | HeaderBits::from_bits_retain(target << SHIFT_TARGET)
            | HeaderBits::from_bits_retain(processing << SHIFT_PROCESSING)
            | HeaderBits::from_bits_retain(caching << SHIFT_CACHING);
        bits.bits()
    }

    pub fn decode(raw: u8) -> Result<Header, CorruptedHeader> {
        let bits = HeaderBits::from_bits_retain(raw);

        if bits.intersects(HeaderBits::RESERVED) {
            return Err(CorruptedHeader { raw, field: "reserved bit" });
        }

        let delivery_mode = DeliveryMode::try_from((bits & HeaderBits::MASK_DELIVERY).bits())
            .map_err(|_| CorruptedHeader { raw, field: "delivery mode" })?;
        let target = Target::try_from((bits & HeaderBits::MASK_TARGET).bits() >> SHIFT_TARGET)
            .map_err(|_| CorruptedHeader { raw, field: "target" })?;
        let processing_option = ProcessingOption::try_from((bits & HeaderBits::MASK_PROCESSING).bits() >> SHIFT_PROCESSING)
            .map_err(|_| CorruptedHeader { raw, field: "processing option" })?;
        let caching_option = CachingOption::try_from((bits & HeaderBits::MASK_CACHING).bits() >> SHIFT_CACHING)
            .map_err(|_| CorruptedHeader { raw, field: "caching option" })?;

        Ok(Header {
            delivery_mode,
            target,
            processing_option,
            caching_option,
        })
    }
}
