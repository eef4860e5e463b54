//! IRRV Control, Message and Codec Enumerations

use crate::payload::VCtrlPayload;
use serde::{Deserialize, Serialize};

/// Control command carried in a VCTRL payload
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlType {
    /// No-op
    None = 0,
    /// Force the next frame to be a key frame
    Keyframe = 1,
    /// Target bitrate (`value`, bits/s)
    Bitrate = 2,
    /// Constant QP (`value`)
    Qp = 3,
    /// GOP length (`value`)
    Gop = 4,
    /// Start encoding and transmitting
    Start = 5,
    /// Stop transmitting, keep encoding
    Pause = 6,
    /// Stop encoding and transmitting
    Stop = 7,
    /// Start both dump pipelines
    DumpStart = 8,
    /// Stop both dump pipelines
    DumpStop = 9,
    /// Dump `value` frames on both pipelines
    DumpFrames = 10,
    /// Change resolution (`reserved[0]` x `reserved[1]`)
    Resolution = 11,
    /// Frame rate (`value`)
    Framerate = 12,
    /// Maximum encoded frame size (`value`)
    MaxFrameSize = 13,
    /// Rolling intra refresh (type, cycle, qp delta in `reserved[0..3]`)
    RollingIntraRefresh = 14,
    /// QP range (`reserved[0]`, `reserved[1]`)
    MinMaxQp = 15,
    /// Start the input dump pipeline
    InputDumpStart = 16,
    /// Stop the input dump pipeline
    InputDumpStop = 17,
    /// Start the output dump pipeline
    OutputDumpStart = 18,
    /// Stop the output dump pipeline
    OutputDumpStop = 19,
    /// SEI insertion (type, value in `reserved[0..2]`)
    Sei = 20,
    /// Start periodic screen capture (interval `value`, quality `reserved[0]`)
    ScreenCaptureStart = 21,
    /// Stop periodic screen capture
    ScreenCaptureStop = 22,
    /// Region of interest, chained over `value` records
    RegionOfInterest = 23,
    /// Switch codec (`value` is a [`CodecType`] id)
    ChangeCodec = 24,
    /// Maximum bitrate (`value`)
    MaxBitrate = 25,
    /// Enable (1) or disable (0) frame skipping
    SkipFrame = 26,
    /// Profile and level (`reserved[0]`, `reserved[1]`)
    ProfileLevel = 27,
    /// Client-side feedback (`value`, `reserved[0]`)
    ClientFeedback = 28,
}

impl ControlType {
    /// All known control types, in code order
    pub const ALL: [ControlType; 29] = [
        ControlType::None,
        ControlType::Keyframe,
        ControlType::Bitrate,
        ControlType::Qp,
        ControlType::Gop,
        ControlType::Start,
        ControlType::Pause,
        ControlType::Stop,
        ControlType::DumpStart,
        ControlType::DumpStop,
        ControlType::DumpFrames,
        ControlType::Resolution,
        ControlType::Framerate,
        ControlType::MaxFrameSize,
        ControlType::RollingIntraRefresh,
        ControlType::MinMaxQp,
        ControlType::InputDumpStart,
        ControlType::InputDumpStop,
        ControlType::OutputDumpStart,
        ControlType::OutputDumpStop,
        ControlType::Sei,
        ControlType::ScreenCaptureStart,
        ControlType::ScreenCaptureStop,
        ControlType::RegionOfInterest,
        ControlType::ChangeCodec,
        ControlType::MaxBitrate,
        ControlType::SkipFrame,
        ControlType::ProfileLevel,
        ControlType::ClientFeedback,
    ];

    /// Look up a control type by its wire code
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Wire code of this control type
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Asynchronous notification type carried in a MESSAGE payload
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    None = 0,
    /// Stream format changed; `value` carries the new [`StreamFormat`]
    VideoFormatChange = 1,
}

impl MessageType {
    /// Look up a message type by its wire code
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(MessageType::None),
            1 => Some(MessageType::VideoFormatChange),
            _ => None,
        }
    }

    /// Wire code of this message type
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Encoder codec identifier (values match the FFmpeg codec ids)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecType {
    None = 0,
    Mjpeg = 7,
    H264 = 27,
    H265 = 173,
    Av1 = 226,
}

impl CodecType {
    /// Look up a codec by its numeric id
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(CodecType::None),
            7 => Some(CodecType::Mjpeg),
            27 => Some(CodecType::H264),
            173 => Some(CodecType::H265),
            226 => Some(CodecType::Av1),
            _ => None,
        }
    }

    /// Numeric codec id
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Stream format announced to clients for this codec
    pub fn stream_format(self) -> StreamFormat {
        match self {
            CodecType::Av1 => StreamFormat::Av1Raw,
            CodecType::Mjpeg => StreamFormat::Mjpeg,
            CodecType::H264 => StreamFormat::H264Raw,
            CodecType::H265 => StreamFormat::H265Raw,
            CodecType::None => StreamFormat::Unknown,
        }
    }

    /// File extension for raw elementary stream dumps
    pub fn file_extension(self) -> &'static str {
        match self {
            CodecType::H264 => ".264",
            CodecType::H265 => ".265",
            CodecType::Av1 => ".ivf",
            CodecType::Mjpeg => ".mjpeg",
            CodecType::None => "",
        }
    }
}

impl Default for CodecType {
    fn default() -> Self {
        CodecType::H264
    }
}

/// Stream format announced in VHEAD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamFormat {
    Unknown,
    RgbaRaw,
    H264Raw,
    H264Rtmp,
    H265Raw,
    Mjpeg,
    Av1Raw,
}

impl StreamFormat {
    /// Wire value (`Unknown` is -1 reinterpreted as unsigned)
    pub fn as_raw(self) -> u32 {
        match self {
            StreamFormat::Unknown => u32::MAX,
            StreamFormat::RgbaRaw => 0,
            StreamFormat::H264Raw => 1,
            StreamFormat::H264Rtmp => 2,
            StreamFormat::H265Raw => 3,
            StreamFormat::Mjpeg => 4,
            StreamFormat::Av1Raw => 5,
        }
    }

    /// Decode a wire value; anything unrecognised is `Unknown`
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => StreamFormat::RgbaRaw,
            1 => StreamFormat::H264Raw,
            2 => StreamFormat::H264Rtmp,
            3 => StreamFormat::H265Raw,
            4 => StreamFormat::Mjpeg,
            5 => StreamFormat::Av1Raw,
            _ => StreamFormat::Unknown,
        }
    }
}

/// Authentication outcome carried in a VAUTH ack
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthResult {
    Failed = 0,
    Passed = 1,
}

impl AuthResult {
    /// Decode a wire value; anything but PASSED counts as failure
    pub fn from_raw(raw: u32) -> Self {
        if raw == AuthResult::Passed as u32 {
            AuthResult::Passed
        } else {
            AuthResult::Failed
        }
    }
}

/// One encoder region of interest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoiRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// QP offset applied inside the region
    pub qp_offset: i32,
}

impl RoiRegion {
    /// Extract the region carried in one chained ROI record
    pub fn from_record(record: &VCtrlPayload) -> Self {
        Self {
            x: record.reserved[0],
            y: record.reserved[1],
            width: record.reserved[2],
            height: record.reserved[3],
            qp_offset: record.reserved[4] as i32,
        }
    }

    /// Build a chained ROI record; `count` is only meaningful on the first
    pub fn to_record(&self, count: u32) -> VCtrlPayload {
        VCtrlPayload::with_args(
            ControlType::RegionOfInterest,
            count,
            &[
                self.x,
                self.y,
                self.width,
                self.height,
                self.qp_offset as u32,
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_codes_are_dense() {
        for (code, ctrl) in ControlType::ALL.iter().enumerate() {
            assert_eq!(ctrl.as_raw(), code as u32);
            assert_eq!(ControlType::from_raw(code as u32), Some(*ctrl));
        }
        assert_eq!(ControlType::from_raw(29), None);
        assert_eq!(ControlType::from_raw(u32::MAX), None);
    }

    #[test]
    fn test_codec_stream_format() {
        assert_eq!(CodecType::H264.stream_format(), StreamFormat::H264Raw);
        assert_eq!(CodecType::Av1.stream_format().as_raw(), 5);
        assert_eq!(CodecType::None.stream_format().as_raw(), u32::MAX);
        assert_eq!(CodecType::from_raw(173), Some(CodecType::H265));
        assert_eq!(CodecType::from_raw(28), None);
    }

    #[test]
    fn test_roi_negative_offset_survives_record() {
        let region = RoiRegion {
            x: 16,
            y: 32,
            width: 64,
            height: 48,
            qp_offset: -6,
        };
        let record = region.to_record(1);
        assert_eq!(record.control_type(), Some(ControlType::RegionOfInterest));
        assert_eq!(RoiRegion::from_record(&record), region);
    }
}
