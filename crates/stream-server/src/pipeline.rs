//! Synthetic Encode Pipeline
//!
//! Stands in for the hardware encoder: renders colour-bar surfaces out of a
//! [`SurfaceArena`], turns each into a fake bitstream packet sized from the
//! current bitrate, feeds both dump pipelines and hands packets to the
//! event loop. Implements [`EncoderControl`] so clients can drive it.

use crate::config::{ServerConfig, MAX_DIMENSION, MIN_DIMENSION};
use crate::encoder::{EncoderControl, StreamInfo};
use crate::server::EncodedFrame;
use crate::streamer::StreamHandle;
use dump_writer::{DumpMode, DumpRecord, RuntimeDumpWriter};
use frame_source::{
    PatternGenerator, PixelFormat, SourceConfig, SurfaceArena, SurfaceError, VideoSurface,
};
use irrv_protocol::{CodecType, MessageType, RoiRegion};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Annex-B start code prepended to every packet
const START_CODE: [u8; 4] = [0, 0, 0, 1];
/// Start code, NAL marker and sequence number
const MIN_PACKET_SIZE: usize = 16;
const CAPTURE_SURFACES: usize = 4;

/// Mutable encoder settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub codec: CodecType,
    pub framerate: u32,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    pub max_bitrate: u32,
    pub qp: u32,
    pub min_qp: u32,
    pub max_qp: u32,
    /// Frames per GOP; 0 means only the first frame is a key frame
    pub gop: u32,
    /// Packet size cap in bytes; 0 means uncapped
    pub max_frame_size: u32,
    pub profile: u32,
    pub level: u32,
    /// Emit minimal packets for non-key frames
    pub skip_frame: bool,
    /// (type, cycle, qp delta)
    pub rolling_intra_refresh: Option<(u32, u32, u32)>,
    pub roi: Vec<RoiRegion>,
    /// (type, value)
    pub sei: Option<(u32, u32)>,
    /// (interval, quality) while screen capture is on
    pub screen_capture: Option<(u32, u32)>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            width: crate::config::DEFAULT_WIDTH,
            height: crate::config::DEFAULT_HEIGHT,
            codec: CodecType::H264,
            framerate: 30,
            bitrate: 4_000_000,
            max_bitrate: 8_000_000,
            qp: 26,
            min_qp: 10,
            max_qp: 51,
            gop: 60,
            max_frame_size: 0,
            profile: 0,
            level: 0,
            skip_frame: false,
            rolling_intra_refresh: None,
            roi: Vec::new(),
            sei: None,
            screen_capture: None,
        }
    }
}

impl EncoderSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            codec: config.codec,
            framerate: config.framerate.max(1),
            ..Default::default()
        }
    }

    fn source_config(&self) -> SourceConfig {
        SourceConfig {
            width: self.width,
            height: self.height,
            fps: self.framerate.max(1),
            format: PixelFormat::Rgba,
            max_surfaces: CAPTURE_SURFACES,
        }
    }

    fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.framerate.max(1) as f64)
    }
}

/// Encoder stand-in driven by a frame timer
pub struct SyntheticPipeline {
    settings: Mutex<EncoderSettings>,
    force_keyframe: AtomicBool,
    encoding: AtomicBool,
    paused: AtomicBool,
    clients: AtomicUsize,
    dump: Arc<RuntimeDumpWriter>,
    stream: StreamHandle,
}

impl SyntheticPipeline {
    pub fn new(
        settings: EncoderSettings,
        dump: Arc<RuntimeDumpWriter>,
        stream: StreamHandle,
    ) -> Self {
        info!(
            "Synthetic pipeline {}x{} {:?} @ {} fps",
            settings.width, settings.height, settings.codec, settings.framerate
        );
        Self {
            settings: Mutex::new(settings),
            force_keyframe: AtomicBool::new(true),
            encoding: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            clients: AtomicUsize::new(0),
            dump,
            stream,
        }
    }

    fn lock_settings(&self) -> MutexGuard<'_, EncoderSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current settings
    pub fn settings(&self) -> EncoderSettings {
        self.lock_settings().clone()
    }

    /// Whether frames are currently being produced
    pub fn is_encoding(&self) -> bool {
        self.encoding.load(Ordering::Acquire) && !self.paused.load(Ordering::Acquire)
    }

    fn announce_format(&self, codec: CodecType) {
        self.stream
            .send_message(MessageType::VideoFormatChange, codec.stream_format().as_raw());
    }

    /// Produce frames until `shutdown` flips
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SurfaceError> {
        let settings = self.settings();
        let mut capture = Capture::new(&settings.source_config())?;
        let mut fps = settings.framerate.max(1);
        let mut ticker = tokio::time::interval(settings.frame_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let settings = self.settings();
            if settings.framerate.max(1) != fps {
                fps = settings.framerate.max(1);
                ticker = tokio::time::interval(settings.frame_period());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                debug!("Frame timer now {} fps", fps);
            }

            match capture.produce(&self) {
                Ok(Some(frame)) => {
                    self.stream.submit_frame(frame);
                }
                Ok(None) => {}
                Err(e) => warn!("Capture failed: {}", e),
            }
        }

        self.dump.stop(DumpMode::Both);
        info!("Synthetic pipeline stopped");
        Ok(())
    }
}

/// Capture-side state owned by the frame loop
struct Capture {
    pattern: PatternGenerator,
    surfaces: SurfaceArena<VideoSurface>,
    frames_since_key: u32,
}

impl Capture {
    fn new(source: &SourceConfig) -> Result<Self, SurfaceError> {
        Ok(Self {
            pattern: PatternGenerator::new(source.width, source.height)?,
            surfaces: SurfaceArena::new(source.max_surfaces),
            frames_since_key: 0,
        })
    }

    /// Capture and encode one frame; `None` while not encoding
    fn produce(
        &mut self,
        pipeline: &SyntheticPipeline,
    ) -> Result<Option<EncodedFrame>, SurfaceError> {
        if !pipeline.is_encoding() {
            return Ok(None);
        }

        let settings = pipeline.settings();
        if self.pattern.dimensions() != (settings.width, settings.height) {
            self.pattern.resize(settings.width, settings.height)?;
            pipeline.force_keyframe.store(true, Ordering::Release);
        }

        let handle = self.surfaces.insert(self.pattern.next_surface()?)?;
        let surface = self.surfaces.get(handle)?;

        let dumps = pipeline.dump.status();
        if dumps.input {
            pipeline.dump.submit(
                DumpMode::Input,
                DumpRecord::surface(surface.data.clone(), surface.width, surface.height),
            );
        }

        let key_frame = pipeline.force_keyframe.swap(false, Ordering::AcqRel)
            || self.frames_since_key == 0
            || (settings.gop > 0 && self.frames_since_key >= settings.gop);
        let data = encode_packet(surface, key_frame, &settings);
        self.surfaces.release(handle)?;

        self.frames_since_key = if key_frame { 1 } else { self.frames_since_key + 1 };

        if dumps.output {
            pipeline
                .dump
                .submit(DumpMode::Output, DumpRecord::packet(data.clone(), key_frame));
        }

        Ok(Some(EncodedFrame {
            data,
            key_frame,
            width: settings.width,
            height: settings.height,
            codec: settings.codec,
        }))
    }
}

fn nal_marker(codec: CodecType, key_frame: bool) -> u8 {
    match (codec, key_frame) {
        (CodecType::H264, true) => 0x65,
        (CodecType::H264, false) => 0x41,
        (CodecType::H265, true) => 0x26,
        (CodecType::H265, false) => 0x02,
        (_, true) => 0x01,
        (_, false) => 0x00,
    }
}

/// Fake bitstream packet sized from the bitrate budget
fn encode_packet(surface: &VideoSurface, key_frame: bool, settings: &EncoderSettings) -> Vec<u8> {
    let budget = (settings.bitrate / 8 / settings.framerate.max(1)) as usize;
    let mut size = if key_frame {
        budget * 2
    } else if settings.skip_frame {
        0
    } else {
        budget
    };
    if settings.max_frame_size > 0 {
        size = size.min(settings.max_frame_size as usize);
    }
    let size = size.max(MIN_PACKET_SIZE);

    let mut packet = Vec::with_capacity(size);
    packet.extend_from_slice(&START_CODE);
    packet.push(nal_marker(settings.codec, key_frame));
    packet.extend_from_slice(&surface.sequence.to_le_bytes());

    let stride = (surface.data.len() / size).max(1);
    let room = size - packet.len();
    packet.extend(surface.data.iter().step_by(stride).take(room));
    packet.resize(size, 0);
    packet
}

impl EncoderControl for SyntheticPipeline {
    fn force_keyframe(&self) {
        debug!("Key frame requested");
        self.force_keyframe.store(true, Ordering::Release);
    }

    fn set_bitrate(&self, bitrate: u32) {
        info!("Bitrate set to {}", bitrate);
        self.lock_settings().bitrate = bitrate;
    }

    fn set_max_bitrate(&self, bitrate: u32) {
        info!("Max bitrate set to {}", bitrate);
        self.lock_settings().max_bitrate = bitrate;
    }

    fn set_qp(&self, qp: u32) {
        self.lock_settings().qp = qp;
    }

    fn set_framerate(&self, fps: u32) {
        if fps == 0 {
            warn!("Ignoring zero framerate");
            return;
        }
        info!("Framerate set to {}", fps);
        self.lock_settings().framerate = fps;
    }

    fn set_max_frame_size(&self, size: u32) {
        self.lock_settings().max_frame_size = size;
    }

    fn set_gop_size(&self, gop: u32) {
        info!("GOP size set to {}", gop);
        self.lock_settings().gop = gop;
    }

    fn set_min_max_qp(&self, min: u32, max: u32) {
        if min > max {
            warn!("Ignoring QP range {}..{}", min, max);
            return;
        }
        let mut settings = self.lock_settings();
        settings.min_qp = min;
        settings.max_qp = max;
    }

    fn set_rolling_intra_refresh(&self, kind: u32, cycle: u32, qp_delta: u32) {
        self.lock_settings().rolling_intra_refresh = Some((kind, cycle, qp_delta));
    }

    fn set_region_of_interest(&self, regions: &[RoiRegion]) {
        debug!("ROI updated with {} regions", regions.len());
        self.lock_settings().roi = regions.to_vec();
    }

    fn change_resolution(&self, width: u32, height: u32) {
        let valid = MIN_DIMENSION..=MAX_DIMENSION;
        if !valid.contains(&width) || !valid.contains(&height) {
            warn!("Ignoring resolution change to {}x{}", width, height);
            return;
        }

        let codec = {
            let mut settings = self.lock_settings();
            settings.width = width;
            settings.height = height;
            settings.codec
        };
        info!("Resolution changed to {}x{}", width, height);
        self.force_keyframe.store(true, Ordering::Release);
        self.announce_format(codec);
    }

    fn change_codec(&self, codec: CodecType) {
        self.lock_settings().codec = codec;
        self.dump.change_codec(codec);
        info!("Codec changed to {:?}", codec);
        self.force_keyframe.store(true, Ordering::Release);
        self.announce_format(codec);
    }

    fn change_profile_level(&self, profile: u32, level: u32) {
        let mut settings = self.lock_settings();
        settings.profile = profile;
        settings.level = level;
    }

    fn set_skip_frame(&self, enabled: bool) {
        self.lock_settings().skip_frame = enabled;
    }

    fn set_sei(&self, kind: u32, value: u32) {
        self.lock_settings().sei = Some((kind, value));
    }

    fn start(&self) {
        info!("Encoding started");
        self.paused.store(false, Ordering::Release);
        self.force_keyframe.store(true, Ordering::Release);
        self.encoding.store(true, Ordering::Release);
    }

    fn pause(&self) {
        info!("Encoding paused");
        self.paused.store(true, Ordering::Release);
    }

    fn stop(&self) {
        info!("Encoding stopped");
        self.encoding.store(false, Ordering::Release);
        self.paused.store(false, Ordering::Release);
    }

    fn dump_start(&self, mode: DumpMode) {
        if let Err(e) = self.dump.start(mode, 0) {
            error!("Failed to start {:?} dump: {}", mode, e);
        }
    }

    fn dump_stop(&self, mode: DumpMode) {
        self.dump.stop(mode);
    }

    fn dump_frames(&self, frames: u32) {
        if let Err(e) = self.dump.start(DumpMode::Both, u64::from(frames)) {
            error!("Failed to start {} frame dump: {}", frames, e);
        }
    }

    fn set_screen_capture(&self, interval: u32, quality: u32, enabled: bool) {
        self.lock_settings().screen_capture = enabled.then_some((interval, quality));
    }

    fn set_client_feedback(&self, value: u32, extra: u32) {
        debug!("Client feedback {} ({})", value, extra);
    }

    fn stream_info(&self) -> StreamInfo {
        let settings = self.lock_settings();
        StreamInfo {
            width: settings.width,
            height: settings.height,
            codec: settings.codec,
        }
    }

    fn notify_client_count(&self, count: usize) {
        let previous = self.clients.swap(count, Ordering::AcqRel);
        debug!("Client count {} -> {}", previous, count);

        if count > previous {
            // New clients need a key frame to start decoding
            self.force_keyframe.store(true, Ordering::Release);
            if !self.encoding.load(Ordering::Acquire) {
                self.start();
            }
        } else if count == 0 && previous > 0 {
            info!("No clients left");
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ClientTracker;
    use crate::streamer::{stream_channel, StreamQueues};

    fn pipeline(
        settings: EncoderSettings,
        dir: &std::path::Path,
    ) -> (Arc<SyntheticPipeline>, StreamQueues) {
        let (handle, queues) = stream_channel(8, ClientTracker::new());
        let dump = Arc::new(RuntimeDumpWriter::new(dir, settings.codec));
        (Arc::new(SyntheticPipeline::new(settings, dump, handle)), queues)
    }

    fn small() -> EncoderSettings {
        EncoderSettings {
            width: 64,
            height: 32,
            gop: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_idle_until_started() {
        let dir = tempfile::tempdir().unwrap();
        let (p, _queues) = pipeline(small(), dir.path());
        let mut capture = Capture::new(&p.settings().source_config()).unwrap();

        assert!(capture.produce(&p).unwrap().is_none());
        p.notify_client_count(1);
        assert!(p.is_encoding());
        assert!(capture.produce(&p).unwrap().is_some());

        p.pause();
        assert!(capture.produce(&p).unwrap().is_none());
        p.start();
        assert!(capture.produce(&p).unwrap().is_some());
    }

    #[test]
    fn test_last_client_leaving_stops_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let (p, _queues) = pipeline(small(), dir.path());
        let mut capture = Capture::new(&p.settings().source_config()).unwrap();

        p.notify_client_count(1);
        p.notify_client_count(2);
        p.notify_client_count(1);
        assert!(p.is_encoding());

        p.notify_client_count(0);
        assert!(!p.is_encoding());
        assert!(capture.produce(&p).unwrap().is_none());

        // A repeated zero is not a transition
        p.start();
        p.notify_client_count(0);
        assert!(p.is_encoding());
    }

    #[test]
    fn test_key_frames_on_gop_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let (p, _queues) = pipeline(small(), dir.path());
        let mut capture = Capture::new(&p.settings().source_config()).unwrap();
        p.start();

        let keys: Vec<bool> = (0..7)
            .map(|_| capture.produce(&p).unwrap().unwrap().key_frame)
            .collect();
        assert_eq!(keys, vec![true, false, false, true, false, false, true]);

        p.force_keyframe();
        assert!(capture.produce(&p).unwrap().unwrap().key_frame);
        assert!(!capture.produce(&p).unwrap().unwrap().key_frame);
    }

    #[test]
    fn test_packet_layout_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let settings = EncoderSettings {
            bitrate: 8 * 30 * 1000,
            max_frame_size: 1500,
            ..small()
        };
        let (p, _queues) = pipeline(settings, dir.path());
        let mut capture = Capture::new(&p.settings().source_config()).unwrap();
        p.start();

        let key = capture.produce(&p).unwrap().unwrap();
        assert_eq!(&key.data[..5], &[0, 0, 0, 1, 0x65]);
        assert_eq!(key.data.len(), 1500);

        let delta = capture.produce(&p).unwrap().unwrap();
        assert_eq!(delta.data[4], 0x41);
        assert_eq!(delta.data.len(), 1000);

        p.set_skip_frame(true);
        let skipped = capture.produce(&p).unwrap().unwrap();
        assert_eq!(skipped.data.len(), MIN_PACKET_SIZE);
    }

    #[test]
    fn test_codec_change_announces_format() {
        let dir = tempfile::tempdir().unwrap();
        let (p, mut queues) = pipeline(small(), dir.path());

        p.change_codec(CodecType::H265);
        assert_eq!(p.stream_info().codec, CodecType::H265);
        assert_eq!(
            queues.messages.try_recv().unwrap(),
            (MessageType::VideoFormatChange, CodecType::H265.stream_format().as_raw())
        );

        p.change_resolution(8, 8);
        assert!(queues.messages.try_recv().is_err());
        p.change_resolution(128, 64);
        assert_eq!((p.stream_info().width, p.stream_info().height), (128, 64));
        assert!(queues.messages.try_recv().is_ok());
    }

    #[test]
    fn test_resolution_change_resizes_capture() {
        let dir = tempfile::tempdir().unwrap();
        let (p, _queues) = pipeline(small(), dir.path());
        let mut capture = Capture::new(&p.settings().source_config()).unwrap();
        p.start();
        capture.produce(&p).unwrap();
        capture.produce(&p).unwrap();

        p.change_resolution(128, 64);
        let frame = capture.produce(&p).unwrap().unwrap();
        assert!(frame.key_frame);
        assert_eq!((frame.width, frame.height), (128, 64));
        assert_eq!(capture.pattern.dimensions(), (128, 64));
    }

    #[test]
    fn test_dump_frames_writes_limited_input() {
        let dir = tempfile::tempdir().unwrap();
        let (p, _queues) = pipeline(small(), dir.path());
        let mut capture = Capture::new(&p.settings().source_config()).unwrap();
        p.start();

        p.dump_frames(2);
        for _ in 0..3 {
            capture.produce(&p).unwrap();
        }
        p.dump_stop(DumpMode::Both);

        let input = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|path| path.extension().is_some_and(|ext| ext == "rgba"))
            .unwrap();
        assert_eq!(std::fs::metadata(input).unwrap().len(), 2 * 64 * 32 * 4);
    }

    #[tokio::test]
    async fn test_run_submits_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (p, mut queues) = pipeline(small(), dir.path());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        p.start();

        let task = tokio::spawn(Arc::clone(&p).run(shutdown_rx));
        let frame = queues.frames.recv().await.unwrap();
        assert!(frame.key_frame);
        assert_eq!(frame.codec, CodecType::H264);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
