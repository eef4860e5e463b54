//! IRRV Event Header Definitions

use crate::error::FramingError;
use crate::payload::{MessagePayload, VAuthPayload, VCtrlPayload, VFramePayload, VHeadPayload};
use crate::{HEADER_SIZE, MAGIC};

/// Event type codes carried in the header `type` field
///
/// Every event has an ACK twin whose code is the base code plus one.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Stream description, first event on every connection
    VHead = 0x1000,
    VHeadAck = 0x1001,
    /// Encoded video frame, followed by `data_size` raw bytes
    VFrame = 0x1002,
    VFrameAck = 0x1003,
    /// Encoder control command
    VCtrl = 0x1004,
    VCtrlAck = 0x1005,
    /// Authentication request (client) or result (server ack)
    VAuth = 0x1006,
    VAuthAck = 0x1007,
    /// Audio frame (unused)
    AFrame = 0x1008,
    AFrameAck = 0x1009,
    /// Video slice (unused)
    VSlice = 0x100a,
    VSliceAck = 0x100b,
    /// Asynchronous server notification
    Message = 0x100c,
    MessageAck = 0x100d,
}

impl EventType {
    /// All known event types, in code order
    pub const ALL: [EventType; 14] = [
        EventType::VHead,
        EventType::VHeadAck,
        EventType::VFrame,
        EventType::VFrameAck,
        EventType::VCtrl,
        EventType::VCtrlAck,
        EventType::VAuth,
        EventType::VAuthAck,
        EventType::AFrame,
        EventType::AFrameAck,
        EventType::VSlice,
        EventType::VSliceAck,
        EventType::Message,
        EventType::MessageAck,
    ];

    /// Look up an event type by its wire code
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_raw() == raw)
    }

    /// Wire code of this event type
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Whether this is the ACK twin of another event
    pub fn is_ack(self) -> bool {
        self.as_raw() & 1 == 1
    }

    /// Size of the fixed payload that follows the header
    pub fn payload_size(self) -> usize {
        match self {
            EventType::VHead | EventType::VHeadAck => VHeadPayload::SIZE,
            EventType::VFrame
            | EventType::VFrameAck
            | EventType::AFrame
            | EventType::AFrameAck
            | EventType::VSlice
            | EventType::VSliceAck => VFramePayload::SIZE,
            EventType::VCtrl | EventType::VCtrlAck => VCtrlPayload::SIZE,
            EventType::VAuth | EventType::VAuthAck => VAuthPayload::SIZE,
            EventType::Message | EventType::MessageAck => MessagePayload::SIZE,
        }
    }

    /// Total size (header + payload) a well-formed event declares
    pub fn event_size(self) -> usize {
        HEADER_SIZE + self.payload_size()
    }
}

impl TryFrom<u32> for EventType {
    type Error = FramingError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::from_raw(raw).ok_or(FramingError::UnknownEventType(raw))
    }
}

/// Fixed 16-byte event header
///
/// Wire layout (native byte order): `magic`, `type`, `size`, `value`, one
/// `u32` each. The magic is always [`MAGIC`] and is therefore not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    /// Declared event type
    pub event_type: EventType,
    /// Total event size in bytes (header + payload, frame data excluded)
    pub size: u32,
    /// Free-form value
    pub value: u32,
}

impl EventHeader {
    /// Encoded header size
    pub const SIZE: usize = HEADER_SIZE;

    /// Create a header whose size matches the layout of `event_type`
    pub fn new(event_type: EventType, value: u32) -> Self {
        Self {
            event_type,
            size: event_type.event_size() as u32,
            value,
        }
    }

    /// Serialize the header
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&MAGIC.to_ne_bytes());
        out[4..8].copy_from_slice(&self.event_type.as_raw().to_ne_bytes());
        out[8..12].copy_from_slice(&self.size.to_ne_bytes());
        out[12..16].copy_from_slice(&self.value.to_ne_bytes());
        out
    }

    /// Parse a header, validating magic and type
    ///
    /// The declared size is returned as-is; use [`EventHeader::validate_size`]
    /// to check it against the type's layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FramingError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let magic = read_u32(bytes, 0);
        if magic != MAGIC {
            return Err(FramingError::BadMagic {
                expected: MAGIC,
                found: magic,
            });
        }

        Ok(Self {
            event_type: EventType::try_from(read_u32(bytes, 4))?,
            size: read_u32(bytes, 8),
            value: read_u32(bytes, 12),
        })
    }

    /// Check the declared size against the layout of the declared type
    pub fn validate_size(&self) -> Result<(), FramingError> {
        let expected = self.event_type.event_size() as u32;
        if self.size != expected {
            return Err(FramingError::SizeMismatch {
                event: self.event_type,
                declared: self.size,
                expected,
            });
        }
        Ok(())
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_ne_bytes(raw)
}
