//! Frame Source Library
//!
//! Capture side of the encode pipeline:
//! - `SurfaceArena`: single-owner surface storage addressed by generational
//!   handles, so a released surface can never be reached through a stale handle
//! - `PatternGenerator`: synthetic RGBA capture frames (colour bars)

pub mod pattern;
pub mod surface;

pub use pattern::PatternGenerator;
pub use surface::{SurfaceArena, SurfaceHandle, VideoSurface};

use thiserror::Error;

/// Surface error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("Stale surface handle (index {index}, generation {generation})")]
    StaleHandle { index: usize, generation: u32 },

    #[error("Invalid surface dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Surface arena full ({0} surfaces)")]
    ArenaFull(usize),
}

/// Pixel layout of a capture surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit RGBA, 4 bytes per pixel
    Rgba,
    /// 4:2:0 luma plane followed by interleaved chroma
    Nv12,
}

impl PixelFormat {
    /// Bytes needed for a `width` x `height` frame
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgba => pixels * 4,
            PixelFormat::Nv12 => pixels + pixels / 2,
        }
    }
}

/// Capture source configuration
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Capture width
    pub width: u32,
    /// Capture height
    pub height: u32,
    /// Target FPS
    pub fps: u32,
    /// Surface pixel layout
    pub format: PixelFormat,
    /// Maximum surfaces alive at once
    pub max_surfaces: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            width: 576,
            height: 960,
            fps: 30,
            format: PixelFormat::Rgba,
            max_surfaces: 4,
        }
    }
}

impl SourceConfig {
    /// Small landscape source used by tests and smoke runs
    pub fn preview() -> Self {
        Self {
            width: 64,
            height: 32,
            fps: 60,
            format: PixelFormat::Rgba,
            max_surfaces: 2,
        }
    }
}
