//! IRRV Event Encoding and Stream Decoding

use crate::error::FramingError;
use crate::event::{EventHeader, EventType};
use crate::payload::{MessagePayload, VAuthPayload, VCtrlPayload, VFramePayload, VHeadPayload};
use crate::HEADER_SIZE;
use tracing::trace;

/// Typed event payload; the variant determines the header type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBody {
    VHead(VHeadPayload),
    VHeadAck(VHeadPayload),
    VFrame(VFramePayload),
    VFrameAck(VFramePayload),
    VCtrl(VCtrlPayload),
    VCtrlAck(VCtrlPayload),
    VAuth(VAuthPayload),
    VAuthAck(VAuthPayload),
    AFrame(VFramePayload),
    AFrameAck(VFramePayload),
    VSlice(VFramePayload),
    VSliceAck(VFramePayload),
    Message(MessagePayload),
    MessageAck(MessagePayload),
}

impl EventBody {
    pub fn event_type(&self) -> EventType {
        match self {
            EventBody::VHead(_) => EventType::VHead,
            EventBody::VHeadAck(_) => EventType::VHeadAck,
            EventBody::VFrame(_) => EventType::VFrame,
            EventBody::VFrameAck(_) => EventType::VFrameAck,
            EventBody::VCtrl(_) => EventType::VCtrl,
            EventBody::VCtrlAck(_) => EventType::VCtrlAck,
            EventBody::VAuth(_) => EventType::VAuth,
            EventBody::VAuthAck(_) => EventType::VAuthAck,
            EventBody::AFrame(_) => EventType::AFrame,
            EventBody::AFrameAck(_) => EventType::AFrameAck,
            EventBody::VSlice(_) => EventType::VSlice,
            EventBody::VSliceAck(_) => EventType::VSliceAck,
            EventBody::Message(_) => EventType::Message,
            EventBody::MessageAck(_) => EventType::MessageAck,
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            EventBody::VHead(p) | EventBody::VHeadAck(p) => p.write_to(out),
            EventBody::VFrame(p)
            | EventBody::VFrameAck(p)
            | EventBody::AFrame(p)
            | EventBody::AFrameAck(p)
            | EventBody::VSlice(p)
            | EventBody::VSliceAck(p) => p.write_to(out),
            EventBody::VCtrl(p) | EventBody::VCtrlAck(p) => p.write_to(out),
            EventBody::VAuth(p) | EventBody::VAuthAck(p) => p.write_to(out),
            EventBody::Message(p) | EventBody::MessageAck(p) => p.write_to(out),
        }
    }

    fn decode(event_type: EventType, bytes: &[u8]) -> Result<Self, FramingError> {
        Ok(match event_type {
            EventType::VHead => EventBody::VHead(VHeadPayload::decode(bytes)?),
            EventType::VHeadAck => EventBody::VHeadAck(VHeadPayload::decode(bytes)?),
            EventType::VFrame => EventBody::VFrame(VFramePayload::decode(bytes)?),
            EventType::VFrameAck => EventBody::VFrameAck(VFramePayload::decode(bytes)?),
            EventType::VCtrl => EventBody::VCtrl(VCtrlPayload::decode(bytes)?),
            EventType::VCtrlAck => EventBody::VCtrlAck(VCtrlPayload::decode(bytes)?),
            EventType::VAuth => EventBody::VAuth(VAuthPayload::decode(bytes)?),
            EventType::VAuthAck => EventBody::VAuthAck(VAuthPayload::decode(bytes)?),
            EventType::AFrame => EventBody::AFrame(VFramePayload::decode(bytes)?),
            EventType::AFrameAck => EventBody::AFrameAck(VFramePayload::decode(bytes)?),
            EventType::VSlice => EventBody::VSlice(VFramePayload::decode(bytes)?),
            EventType::VSliceAck => EventBody::VSliceAck(VFramePayload::decode(bytes)?),
            EventType::Message => EventBody::Message(MessagePayload::decode(bytes)?),
            EventType::MessageAck => EventBody::MessageAck(MessagePayload::decode(bytes)?),
        })
    }
}

/// One framed event (header value + typed payload)
///
/// VFRAME data bytes are not part of the event; they follow it on the wire
/// and are read separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub value: u32,
    pub body: EventBody,
}

impl Event {
    pub fn new(body: EventBody) -> Self {
        Self { value: 0, body }
    }

    pub fn with_value(value: u32, body: EventBody) -> Self {
        Self { value, body }
    }

    pub fn event_type(&self) -> EventType {
        self.body.event_type()
    }

    pub fn header(&self) -> EventHeader {
        EventHeader::new(self.event_type(), self.value)
    }

    /// Encoded size of header and payload
    pub fn encoded_len(&self) -> usize {
        self.event_type().event_size()
    }
}

/// Encode an event as header followed by payload
pub fn encode(event: &Event) -> Vec<u8> {
    let mut out = Vec::with_capacity(event.encoded_len());
    out.extend_from_slice(&event.header().encode());
    event.body.write_to(&mut out);
    out
}

/// Decode exactly one complete event from the start of `bytes`
///
/// Returns [`FramingError::Truncated`] when `bytes` holds less than one
/// complete event.
pub fn decode(bytes: &[u8]) -> Result<Event, FramingError> {
    match decode_prefix(bytes)? {
        Some((event, _)) => Ok(event),
        None => {
            let needed = EventHeader::decode(bytes)
                .map(|h| h.event_type.event_size())
                .unwrap_or(HEADER_SIZE);
            Err(FramingError::Truncated {
                needed,
                available: bytes.len(),
            })
        }
    }
}

/// Decode one event from the start of `bytes` if it is complete
///
/// Returns the event and the number of bytes it occupied, or `None` when
/// more bytes are needed. Magic, type and declared size are validated as
/// soon as the header is available.
pub fn decode_prefix(bytes: &[u8]) -> Result<Option<(Event, usize)>, FramingError> {
    if bytes.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = EventHeader::decode(bytes)?;
    header.validate_size()?;

    let total = header.event_type.event_size();
    if bytes.len() < total {
        return Ok(None);
    }

    let body = EventBody::decode(header.event_type, &bytes[HEADER_SIZE..total])?;
    Ok(Some((
        Event {
            value: header.value,
            body,
        },
        total,
    )))
}

/// Incremental decoder over a byte stream
#[derive(Debug, Default)]
pub struct EventDecoder {
    buf: Vec<u8>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete event, if any
    pub fn next_event(&mut self) -> Result<Option<Event>, FramingError> {
        match decode_prefix(&self.buf)? {
            Some((event, used)) => {
                trace!("Decoded {:?} ({} bytes)", event.event_type(), used);
                self.buf.drain(..used);
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    /// Take exactly `n` raw bytes (VFRAME data) once they are buffered
    pub fn take_bytes(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.buf.len() < n {
            return None;
        }
        Some(self.buf.drain(..n).collect())
    }

    /// Number of bytes buffered but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlType, StreamFormat};
    use crate::MAGIC;
    use proptest::prelude::*;

    fn ctrl_event(value: u32) -> Event {
        Event::new(EventBody::VCtrl(VCtrlPayload::new(ControlType::Bitrate, value)))
    }

    #[test]
    fn test_encode_vhead() {
        let event = Event::new(EventBody::VHead(VHeadPayload::new(
            576,
            960,
            StreamFormat::H264Raw,
            false,
        )));
        let bytes = encode(&event);

        assert_eq!(bytes.len(), 48);
        assert_eq!(&bytes[0..4], &MAGIC.to_ne_bytes());
        assert_eq!(&bytes[4..8], &0x1000u32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &48u32.to_ne_bytes());
        assert_eq!(decode(&bytes).unwrap(), event);
    }

    #[test]
    fn test_decode_incomplete_is_truncated() {
        let bytes = encode(&ctrl_event(1));
        assert_eq!(decode_prefix(&bytes[..20]).unwrap(), None);
        assert_eq!(
            decode(&bytes[..20]),
            Err(FramingError::Truncated {
                needed: 48,
                available: 20
            })
        );
    }

    #[test]
    fn test_declared_size_mismatch_rejected() {
        let mut bytes = encode(&ctrl_event(1));
        bytes[8..12].copy_from_slice(&76u32.to_ne_bytes());
        assert!(matches!(
            decode_prefix(&bytes),
            Err(FramingError::SizeMismatch {
                event: EventType::VCtrl,
                declared: 76,
                expected: 48
            })
        ));
    }

    #[test]
    fn test_decoder_splits_stream() {
        let mut stream = encode(&ctrl_event(1));
        stream.extend(encode(&Event::new(EventBody::VFrame(VFramePayload {
            data_size: 3,
            ..Default::default()
        }))));
        stream.extend_from_slice(&[9, 8, 7]);
        stream.extend(encode(&ctrl_event(2)));

        let mut decoder = EventDecoder::new();
        // feed one byte at a time
        let mut events = Vec::new();
        let mut frame_data = None;
        let mut pending_data = 0usize;
        for byte in stream {
            decoder.push(&[byte]);
            loop {
                if pending_data > 0 {
                    match decoder.take_bytes(pending_data) {
                        Some(data) => {
                            frame_data = Some(data);
                            pending_data = 0;
                        }
                        None => break,
                    }
                }
                match decoder.next_event().unwrap() {
                    Some(event) => {
                        if let EventBody::VFrame(frame) = event.body {
                            pending_data = frame.data_size as usize;
                        }
                        events.push(event);
                    }
                    None => break,
                }
            }
        }

        assert_eq!(events.len(), 3);
        assert_eq!(frame_data, Some(vec![9, 8, 7]));
        assert_eq!(events[2], ctrl_event(2));
        assert_eq!(decoder.buffered(), 0);
    }

    proptest! {
        #[test]
        fn prop_header_roundtrip(type_idx in 0usize..14, value in any::<u32>()) {
            let header = EventHeader::new(EventType::ALL[type_idx], value);
            let decoded = EventHeader::decode(&header.encode()).unwrap();
            prop_assert_eq!(decoded, header);
            prop_assert!(decoded.validate_size().is_ok());
        }

        #[test]
        fn prop_corrupted_magic_rejected(
            magic in any::<u32>(),
            tail in proptest::collection::vec(any::<u8>(), 0..80),
        ) {
            prop_assume!(magic != MAGIC);
            let mut bytes = magic.to_ne_bytes().to_vec();
            bytes.extend(std::iter::repeat(0u8).take(12));
            bytes.extend(tail);
            let is_bad_magic = matches!(decode_prefix(&bytes), Err(FramingError::BadMagic { .. }));
            prop_assert!(is_bad_magic);
        }

        #[test]
        fn prop_arbitrary_bytes_never_panic(
            bytes in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            let mut decoder = EventDecoder::new();
            decoder.push(&bytes);
            let _ = decoder.next_event();
        }
    }
}
