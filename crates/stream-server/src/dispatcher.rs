//! Control Dispatcher
//!
//! Maps VCTRL commands onto [`EncoderControl`] calls. One dispatcher exists
//! per client session so that a multi-record ROI chain in progress on one
//! connection cannot be interleaved with another.

use crate::encoder::EncoderControl;
use dump_writer::DumpMode;
use irrv_protocol::{CodecType, ControlType, FramingError, RoiRegion, VCtrlPayload, MAX_ROI_REGIONS};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct RoiChain {
    expected: u32,
    regions: Vec<RoiRegion>,
}

/// Per-session VCTRL dispatcher
pub struct ControlDispatcher {
    encoder: Arc<dyn EncoderControl>,
    roi: Option<RoiChain>,
}

impl ControlDispatcher {
    pub fn new(encoder: Arc<dyn EncoderControl>) -> Self {
        Self { encoder, roi: None }
    }

    /// Whether an ROI chain is waiting for more records
    pub fn is_chaining(&self) -> bool {
        self.roi.is_some()
    }

    /// Apply one VCTRL record
    ///
    /// Unknown or out-of-range commands are logged and dropped. Only an
    /// unusable ROI chain is an error, and it is fatal for the connection.
    pub fn dispatch(&mut self, ctrl: &VCtrlPayload) -> Result<(), FramingError> {
        if let Some(chain) = self.roi.as_mut() {
            // Chained records carry only region data; their type is not checked
            chain.regions.push(ctrl.roi_region());
            if chain.regions.len() as u32 == chain.expected {
                let regions = std::mem::take(&mut chain.regions);
                self.roi = None;
                info!("Applying {} ROI regions", regions.len());
                self.encoder.set_region_of_interest(&regions);
            }
            return Ok(());
        }

        let Some(ctrl_type) = ctrl.control_type() else {
            warn!("Dropping unknown control type {}", ctrl.ctrl_type);
            return Ok(());
        };

        debug!("Dispatching {:?} (value {})", ctrl_type, ctrl.value);
        let r = &ctrl.reserved;
        let enc = &self.encoder;

        match ctrl_type {
            ControlType::None => warn!("Dropping empty control command"),
            ControlType::Keyframe => enc.force_keyframe(),
            ControlType::Bitrate => enc.set_bitrate(ctrl.value),
            ControlType::MaxBitrate => enc.set_max_bitrate(ctrl.value),
            ControlType::Qp => enc.set_qp(ctrl.value),
            ControlType::Gop => enc.set_gop_size(ctrl.value),
            ControlType::Framerate => enc.set_framerate(ctrl.value),
            ControlType::MaxFrameSize => enc.set_max_frame_size(ctrl.value),
            ControlType::Start => enc.start(),
            ControlType::Pause => enc.pause(),
            ControlType::Stop => enc.stop(),
            ControlType::DumpStart => enc.dump_start(DumpMode::Both),
            ControlType::DumpStop => enc.dump_stop(DumpMode::Both),
            ControlType::DumpFrames => enc.dump_frames(ctrl.value),
            ControlType::InputDumpStart => enc.dump_start(DumpMode::Input),
            ControlType::InputDumpStop => enc.dump_stop(DumpMode::Input),
            ControlType::OutputDumpStart => enc.dump_start(DumpMode::Output),
            ControlType::OutputDumpStop => enc.dump_stop(DumpMode::Output),
            ControlType::Resolution => enc.change_resolution(r[0], r[1]),
            ControlType::RollingIntraRefresh => enc.set_rolling_intra_refresh(r[0], r[1], r[2]),
            ControlType::MinMaxQp => enc.set_min_max_qp(r[0], r[1]),
            ControlType::Sei => enc.set_sei(r[0], r[1]),
            ControlType::ProfileLevel => enc.change_profile_level(r[0], r[1]),
            ControlType::ScreenCaptureStart => enc.set_screen_capture(ctrl.value, r[0], true),
            ControlType::ScreenCaptureStop => enc.set_screen_capture(0, 0, false),
            ControlType::ClientFeedback => enc.set_client_feedback(ctrl.value, r[0]),
            ControlType::SkipFrame => match ctrl.value {
                0 => enc.set_skip_frame(false),
                1 => enc.set_skip_frame(true),
                other => warn!("Dropping skip-frame command with value {}", other),
            },
            ControlType::ChangeCodec => match CodecType::from_raw(ctrl.value) {
                Some(codec) if codec != CodecType::None => enc.change_codec(codec),
                _ => warn!("Dropping codec change to unknown codec {}", ctrl.value),
            },
            ControlType::RegionOfInterest => return self.begin_roi(ctrl),
        }

        Ok(())
    }

    fn begin_roi(&mut self, first: &VCtrlPayload) -> Result<(), FramingError> {
        let count = first.value;
        if count == 0 || count as usize > MAX_ROI_REGIONS {
            return Err(FramingError::InvalidRoiCount {
                count,
                max: MAX_ROI_REGIONS,
            });
        }

        let mut regions = Vec::with_capacity(count as usize);
        regions.push(first.roi_region());

        if count == 1 {
            info!("Applying 1 ROI region");
            self.encoder.set_region_of_interest(&regions);
        } else {
            debug!("ROI chain started, expecting {} records", count);
            self.roi = Some(RoiChain {
                expected: count,
                regions,
            });
        }
        Ok(())
    }

    /// End of input: an unfinished ROI chain is a framing error
    ///
    /// Partial chains are discarded, never applied.
    pub fn finish(&mut self) -> Result<(), FramingError> {
        match self.roi.take() {
            Some(chain) => Err(FramingError::TruncatedRoiChain {
                expected: chain.expected,
                received: chain.regions.len() as u32,
            }),
            None => Ok(()),
        }
    }
}
