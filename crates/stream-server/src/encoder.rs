//! Encoder runtime capability
//!
//! The control dispatcher drives the encoder only through [`EncoderControl`].
//! Implementations must be internally thread-safe; the server serialises its
//! own calls from the event loop but the encoder may be shared with other
//! threads.

use dump_writer::DumpMode;
use irrv_protocol::{CodecType, RoiRegion};
use std::sync::{Mutex, PoisonError};

/// Stream properties announced in VHEAD and VFRAME
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub codec: CodecType,
}

/// Reconfiguration surface of the encode pipeline
pub trait EncoderControl: Send + Sync {
    fn force_keyframe(&self);
    fn set_bitrate(&self, bitrate: u32);
    fn set_max_bitrate(&self, bitrate: u32);
    fn set_qp(&self, qp: u32);
    fn set_framerate(&self, fps: u32);
    fn set_max_frame_size(&self, size: u32);
    fn set_gop_size(&self, gop: u32);
    fn set_min_max_qp(&self, min: u32, max: u32);
    fn set_rolling_intra_refresh(&self, kind: u32, cycle: u32, qp_delta: u32);
    fn set_region_of_interest(&self, regions: &[RoiRegion]);
    fn change_resolution(&self, width: u32, height: u32);
    fn change_codec(&self, codec: CodecType);
    fn change_profile_level(&self, profile: u32, level: u32);
    fn set_skip_frame(&self, enabled: bool);
    fn set_sei(&self, kind: u32, value: u32);
    fn start(&self);
    fn pause(&self);
    fn stop(&self);
    fn dump_start(&self, mode: DumpMode);
    fn dump_stop(&self, mode: DumpMode);
    /// Dump the next `frames` frames on both pipelines
    fn dump_frames(&self, frames: u32);
    fn set_screen_capture(&self, interval: u32, quality: u32, enabled: bool);
    fn set_client_feedback(&self, value: u32, extra: u32);
    /// Current stream properties
    fn stream_info(&self) -> StreamInfo;
    /// Number of clients connected across all servers changed
    fn notify_client_count(&self, count: usize);
}

/// One recorded [`EncoderControl`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
    ForceKeyframe,
    Bitrate(u32),
    MaxBitrate(u32),
    Qp(u32),
    Framerate(u32),
    MaxFrameSize(u32),
    GopSize(u32),
    MinMaxQp(u32, u32),
    RollingIntraRefresh(u32, u32, u32),
    RegionOfInterest(Vec<RoiRegion>),
    Resolution(u32, u32),
    Codec(CodecType),
    ProfileLevel(u32, u32),
    SkipFrame(bool),
    Sei(u32, u32),
    Start,
    Pause,
    Stop,
    DumpStart(DumpMode),
    DumpStop(DumpMode),
    DumpFrames(u32),
    ScreenCapture(u32, u32, bool),
    ClientFeedback(u32, u32),
    ClientCount(usize),
}

/// Encoder stand-in that records every call (no hardware required)
#[derive(Debug)]
pub struct RecordingEncoder {
    info: Mutex<StreamInfo>,
    calls: Mutex<Vec<ControlCall>>,
}

impl RecordingEncoder {
    pub fn new(width: u32, height: u32, codec: CodecType) -> Self {
        Self {
            info: Mutex::new(StreamInfo {
                width,
                height,
                codec,
            }),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// All calls so far, oldest first
    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded calls matching `pred`
    pub fn count(&self, pred: impl Fn(&ControlCall) -> bool) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| pred(c))
            .count()
    }

    fn record(&self, call: ControlCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl Default for RecordingEncoder {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_WIDTH,
            crate::config::DEFAULT_HEIGHT,
            CodecType::H264,
        )
    }
}

impl EncoderControl for RecordingEncoder {
    fn force_keyframe(&self) {
        self.record(ControlCall::ForceKeyframe);
    }

    fn set_bitrate(&self, bitrate: u32) {
        self.record(ControlCall::Bitrate(bitrate));
    }

    fn set_max_bitrate(&self, bitrate: u32) {
        self.record(ControlCall::MaxBitrate(bitrate));
    }

    fn set_qp(&self, qp: u32) {
        self.record(ControlCall::Qp(qp));
    }

    fn set_framerate(&self, fps: u32) {
        self.record(ControlCall::Framerate(fps));
    }

    fn set_max_frame_size(&self, size: u32) {
        self.record(ControlCall::MaxFrameSize(size));
    }

    fn set_gop_size(&self, gop: u32) {
        self.record(ControlCall::GopSize(gop));
    }

    fn set_min_max_qp(&self, min: u32, max: u32) {
        self.record(ControlCall::MinMaxQp(min, max));
    }

    fn set_rolling_intra_refresh(&self, kind: u32, cycle: u32, qp_delta: u32) {
        self.record(ControlCall::RollingIntraRefresh(kind, cycle, qp_delta));
    }

    fn set_region_of_interest(&self, regions: &[RoiRegion]) {
        self.record(ControlCall::RegionOfInterest(regions.to_vec()));
    }

    fn change_resolution(&self, width: u32, height: u32) {
        {
            let mut info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
            info.width = width;
            info.height = height;
        }
        self.record(ControlCall::Resolution(width, height));
    }

    fn change_codec(&self, codec: CodecType) {
        self.info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .codec = codec;
        self.record(ControlCall::Codec(codec));
    }

    fn change_profile_level(&self, profile: u32, level: u32) {
        self.record(ControlCall::ProfileLevel(profile, level));
    }

    fn set_skip_frame(&self, enabled: bool) {
        self.record(ControlCall::SkipFrame(enabled));
    }

    fn set_sei(&self, kind: u32, value: u32) {
        self.record(ControlCall::Sei(kind, value));
    }

    fn start(&self) {
        self.record(ControlCall::Start);
    }

    fn pause(&self) {
        self.record(ControlCall::Pause);
    }

    fn stop(&self) {
        self.record(ControlCall::Stop);
    }

    fn dump_start(&self, mode: DumpMode) {
        self.record(ControlCall::DumpStart(mode));
    }

    fn dump_stop(&self, mode: DumpMode) {
        self.record(ControlCall::DumpStop(mode));
    }

    fn dump_frames(&self, frames: u32) {
        self.record(ControlCall::DumpFrames(frames));
    }

    fn set_screen_capture(&self, interval: u32, quality: u32, enabled: bool) {
        self.record(ControlCall::ScreenCapture(interval, quality, enabled));
    }

    fn set_client_feedback(&self, value: u32, extra: u32) {
        self.record(ControlCall::ClientFeedback(value, extra));
    }

    fn stream_info(&self) -> StreamInfo {
        *self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_client_count(&self, count: usize) {
        self.record(ControlCall::ClientCount(count));
    }
}
