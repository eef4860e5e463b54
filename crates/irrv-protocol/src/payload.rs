//! IRRV Event Payloads
//!
//! Fixed-size payload layouts following the event header. Every field is a
//! native-endian `u32`; booleans occupy a full word.

use crate::control::{AuthResult, ControlType, MessageType, RoiRegion, StreamFormat};
use crate::error::FramingError;
use crate::UUID_LEN;

/// Stream description sent once per connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VHeadPayload {
    pub flags: u32,
    /// Encoded frame width
    pub width: u32,
    /// Encoded frame height
    pub height: u32,
    /// Raw [`StreamFormat`] value
    pub format: u32,
    /// Whether the client must send VAUTH before streaming starts
    pub auth_required: bool,
    pub reserved: [u32; 3],
}

impl VHeadPayload {
    pub const SIZE: usize = 32;

    pub fn new(width: u32, height: u32, format: StreamFormat, auth_required: bool) -> Self {
        Self {
            flags: 0,
            width,
            height,
            format: format.as_raw(),
            auth_required,
            reserved: [0; 3],
        }
    }

    pub fn stream_format(&self) -> StreamFormat {
        StreamFormat::from_raw(self.format)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        for word in [
            self.flags,
            self.width,
            self.height,
            self.format,
            self.auth_required as u32,
        ] {
            out.extend_from_slice(&word.to_ne_bytes());
        }
        write_words(out, &self.reserved);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        let mut r = WireReader::new(bytes, Self::SIZE)?;
        Ok(Self {
            flags: r.u32(),
            width: r.u32(),
            height: r.u32(),
            format: r.u32(),
            auth_required: r.u32() != 0,
            reserved: r.words(),
        })
    }
}

/// Frame descriptor, followed on the wire by `data_size` raw bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VFramePayload {
    /// Codec id of the frame data
    pub flags: u32,
    /// Number of raw bytes following this payload
    pub data_size: u32,
    pub video_size: u32,
    pub alpha_size: u32,
    pub width: u32,
    pub height: u32,
    pub reserved: [u32; 2],
}

impl VFramePayload {
    pub const SIZE: usize = 32;

    pub fn write_to(&self, out: &mut Vec<u8>) {
        write_words(
            out,
            &[
                self.flags,
                self.data_size,
                self.video_size,
                self.alpha_size,
                self.width,
                self.height,
            ],
        );
        write_words(out, &self.reserved);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        let mut r = WireReader::new(bytes, Self::SIZE)?;
        Ok(Self {
            flags: r.u32(),
            data_size: r.u32(),
            video_size: r.u32(),
            alpha_size: r.u32(),
            width: r.u32(),
            height: r.u32(),
            reserved: r.words(),
        })
    }
}

/// Encoder control command
///
/// `ctrl_type` is kept raw so that unknown commands survive decoding and
/// can be logged by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VCtrlPayload {
    pub ctrl_type: u32,
    pub value: u32,
    /// Command-specific arguments
    pub reserved: [u32; 6],
}

impl VCtrlPayload {
    pub const SIZE: usize = 32;

    pub fn new(ctrl: ControlType, value: u32) -> Self {
        Self {
            ctrl_type: ctrl.as_raw(),
            value,
            reserved: [0; 6],
        }
    }

    /// Build a command with leading `reserved` arguments; extras are ignored
    pub fn with_args(ctrl: ControlType, value: u32, args: &[u32]) -> Self {
        let mut payload = Self::new(ctrl, value);
        for (slot, arg) in payload.reserved.iter_mut().zip(args) {
            *slot = *arg;
        }
        payload
    }

    pub fn control_type(&self) -> Option<ControlType> {
        ControlType::from_raw(self.ctrl_type)
    }

    /// Region carried by this record when it is part of an ROI chain
    pub fn roi_region(&self) -> RoiRegion {
        RoiRegion::from_record(self)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        write_words(out, &[self.ctrl_type, self.value]);
        write_words(out, &self.reserved);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        let mut r = WireReader::new(bytes, Self::SIZE)?;
        Ok(Self {
            ctrl_type: r.u32(),
            value: r.u32(),
            reserved: r.words(),
        })
    }
}

/// Authentication request (client) or result (server)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VAuthPayload {
    /// Opaque 16-byte credential id
    pub id: [u8; UUID_LEN],
    /// Opaque 16-byte credential key
    pub key: [u8; UUID_LEN],
    /// Raw [`AuthResult`], meaningful on the ack only
    pub result: u32,
    pub reserved: [u32; 6],
}

impl VAuthPayload {
    pub const SIZE: usize = 2 * UUID_LEN + 4 + 6 * 4;

    pub fn request(id: [u8; UUID_LEN], key: [u8; UUID_LEN]) -> Self {
        Self {
            id,
            key,
            ..Default::default()
        }
    }

    pub fn ack(result: AuthResult) -> Self {
        Self {
            result: result as u32,
            ..Default::default()
        }
    }

    pub fn auth_result(&self) -> AuthResult {
        AuthResult::from_raw(self.result)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.result.to_ne_bytes());
        write_words(out, &self.reserved);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        let mut r = WireReader::new(bytes, Self::SIZE)?;
        Ok(Self {
            id: r.bytes(),
            key: r.bytes(),
            result: r.u32(),
            reserved: r.words(),
        })
    }
}

/// Asynchronous server notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessagePayload {
    pub msg_type: u32,
    pub value: u32,
    pub reserved: [u32; 6],
}

impl MessagePayload {
    pub const SIZE: usize = 32;

    pub fn new(msg_type: MessageType, value: u32) -> Self {
        Self {
            msg_type: msg_type.as_raw(),
            value,
            reserved: [0; 6],
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_raw(self.msg_type)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        write_words(out, &[self.msg_type, self.value]);
        write_words(out, &self.reserved);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        let mut r = WireReader::new(bytes, Self::SIZE)?;
        Ok(Self {
            msg_type: r.u32(),
            value: r.u32(),
            reserved: r.words(),
        })
    }
}

fn write_words(out: &mut Vec<u8>, words: &[u32]) {
    for word in words {
        out.extend_from_slice(&word.to_ne_bytes());
    }
}

/// Cursor over a payload whose length was checked up front
struct WireReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(bytes: &'a [u8], size: usize) -> Result<Self, FramingError> {
        if bytes.len() < size {
            return Err(FramingError::Truncated {
                needed: size,
                available: bytes.len(),
            });
        }
        Ok(Self {
            bytes: &bytes[..size],
            pos: 0,
        })
    }

    fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_ne_bytes(self.bytes())
    }

    fn words<const N: usize>(&mut self) -> [u32; N] {
        let mut out = [0u32; N];
        for word in out.iter_mut() {
            *word = self.u32();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_len<F: Fn(&mut Vec<u8>)>(write: F) -> usize {
        let mut out = Vec::new();
        write(&mut out);
        out.len()
    }

    #[test]
    fn test_payload_sizes_match_layout() {
        assert_eq!(encoded_len(|o| VHeadPayload::default().write_to(o)), VHeadPayload::SIZE);
        assert_eq!(encoded_len(|o| VFramePayload::default().write_to(o)), VFramePayload::SIZE);
        assert_eq!(encoded_len(|o| VCtrlPayload::default().write_to(o)), VCtrlPayload::SIZE);
        assert_eq!(encoded_len(|o| VAuthPayload::default().write_to(o)), VAuthPayload::SIZE);
        assert_eq!(
            encoded_len(|o| MessagePayload::default().write_to(o)),
            MessagePayload::SIZE
        );
    }

    #[test]
    fn test_short_payload_is_truncated() {
        let err = VAuthPayload::decode(&[0u8; 48]).unwrap_err();
        assert_eq!(
            err,
            FramingError::Truncated {
                needed: 60,
                available: 48
            }
        );
    }

    #[test]
    fn test_vhead_auth_flag() {
        let head = VHeadPayload::new(576, 960, StreamFormat::H265Raw, true);
        let mut out = Vec::new();
        head.write_to(&mut out);

        let decoded = VHeadPayload::decode(&out).unwrap();
        assert!(decoded.auth_required);
        assert_eq!(decoded.stream_format(), StreamFormat::H265Raw);
    }

    #[test]
    fn test_auth_result_unknown_value_is_failure() {
        let ack = VAuthPayload {
            result: 7,
            ..Default::default()
        };
        assert_eq!(ack.auth_result(), AuthResult::Failed);
        assert_eq!(VAuthPayload::ack(AuthResult::Passed).auth_result(), AuthResult::Passed);
    }

    #[test]
    fn test_ctrl_with_args_ignores_extras() {
        let ctrl = VCtrlPayload::with_args(ControlType::MinMaxQp, 0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(ctrl.reserved, [1, 2, 3, 4, 5, 6]);
        assert_eq!(ctrl.control_type(), Some(ControlType::MinMaxQp));
    }
}
