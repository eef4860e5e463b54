//! IRRV Protocol Implementation
//!
//! Typed binary framing for the IRRV streaming protocol: a fixed 16-byte
//! event header followed by a fixed-size payload whose layout is determined
//! by the event type. VFRAME events are additionally followed by the raw
//! frame bytes announced in the payload.
//!
//! All integers use the host's native byte order. The protocol carries no
//! version field and performs no endianness negotiation, so peers must share
//! an architecture.

mod codec;
mod control;
mod error;
mod event;
mod payload;

pub use codec::{decode, decode_prefix, encode, Event, EventBody, EventDecoder};
pub use control::{AuthResult, CodecType, ControlType, MessageType, RoiRegion, StreamFormat};
pub use error::FramingError;
pub use event::{EventHeader, EventType};
pub use payload::{MessagePayload, VAuthPayload, VCtrlPayload, VFramePayload, VHeadPayload};

/// Protocol magic ('IRRV')
pub const MAGIC: u32 = 0xc9c9_d2c6;

/// Default IRRV listening port
pub const DEFAULT_PORT: u16 = 6660;

/// Size of the fixed event header in bytes
pub const HEADER_SIZE: usize = 16;

/// Length of the opaque authentication id and key tokens
pub const UUID_LEN: usize = 16;

/// Maximum number of regions carried by one ROI chain
pub const MAX_ROI_REGIONS: usize = 8;

/// Credential id used when none is configured
pub const DEFAULT_AUTH_ID: &str = "irrv_id";

/// Credential key used when none is configured
pub const DEFAULT_AUTH_KEY: &str = "irrv_key";

/// Width announced in VHEAD/VFRAME when the pipeline reports none
pub const FALLBACK_WIDTH: u32 = 720;

/// Height announced in VHEAD/VFRAME when the pipeline reports none
pub const FALLBACK_HEIGHT: u32 = 1280;
