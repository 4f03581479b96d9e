use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Message kinds from this value upwards are reserved for the transport's own messages
pub const FIRST_RESERVED: u8 = 0xF0;

/// Message kinds the transport uses internally. They travel in unreliable packets and never
///  reach the application.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum InternalKind {
    ConnectRequest = 0xF0,
    ConnectAccept = 0xF1,
    Disconnect = 0xF2,
    Ack = 0xF3,
}

pub fn is_reserved(message_kind: u8) -> bool {
    message_kind >= FIRST_RESERVED
}
