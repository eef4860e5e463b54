//! IRRV Framing Errors

use crate::event::EventType;
use thiserror::Error;

/// Errors raised while decoding the IRRV byte stream.
///
/// Every variant is fatal for the connection it occurred on: the protocol
/// has no resynchronisation marker, so the stream cannot be recovered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Header magic does not identify an IRRV event
    #[error("Bad magic: expected {expected:#010x}, got {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    /// Header type is outside the known event range
    #[error("Unknown event type {0:#06x}")]
    UnknownEventType(u32),

    /// Header size disagrees with the layout of the declared type
    #[error("Size mismatch for {event:?}: header declares {declared} bytes, expected {expected}")]
    SizeMismatch {
        event: EventType,
        declared: u32,
        expected: u32,
    },

    /// Not enough bytes to decode a complete event
    #[error("Truncated event: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// ROI chain announced an unusable region count
    #[error("Invalid ROI region count {count} (max {max})")]
    InvalidRoiCount { count: u32, max: usize },

    /// Connection ended before all chained ROI records arrived
    #[error("ROI chain truncated: expected {expected} records, received {received}")]
    TruncatedRoiChain { expected: u32, received: u32 },

    /// A non-VCTRL event interrupted an ROI chain
    #[error("Unexpected {found:?} event inside ROI chain")]
    UnexpectedEvent { found: EventType },
}
