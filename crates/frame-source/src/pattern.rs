//! Synthetic colour-bar frame generator

use crate::{PixelFormat, SurfaceError, VideoSurface};
use tracing::debug;

/// SMPTE-style bar colours (RGBA)
const BARS: [[u8; 4]; 8] = [
    [235, 235, 235, 255],
    [235, 235, 16, 255],
    [16, 235, 235, 255],
    [16, 235, 16, 255],
    [235, 16, 235, 255],
    [235, 16, 16, 255],
    [16, 16, 235, 255],
    [16, 16, 16, 255],
];

/// Renders moving colour bars into RGBA surfaces
#[derive(Debug, Clone)]
pub struct PatternGenerator {
    width: u32,
    height: u32,
    sequence: u64,
}

impl PatternGenerator {
    pub fn new(width: u32, height: u32) -> Result<Self, SurfaceError> {
        if width == 0 || height == 0 {
            return Err(SurfaceError::InvalidDimensions { width, height });
        }
        Ok(Self {
            width,
            height,
            sequence: 0,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Change the output size; the sequence keeps counting
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), SurfaceError> {
        if width == 0 || height == 0 {
            return Err(SurfaceError::InvalidDimensions { width, height });
        }
        debug!("Pattern resized to {}x{}", width, height);
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Render the next frame into `surface`, reallocating it if the size changed
    pub fn render_into(&mut self, surface: &mut VideoSurface) {
        if surface.width != self.width
            || surface.height != self.height
            || surface.format != PixelFormat::Rgba
        {
            surface.width = self.width;
            surface.height = self.height;
            surface.format = PixelFormat::Rgba;
            surface
                .data
                .resize(PixelFormat::Rgba.frame_size(self.width, self.height), 0);
        }

        let width = self.width as usize;
        let bar_width = (width / BARS.len()).max(1);
        let shift = self.sequence as usize;

        for row in surface.data.chunks_exact_mut(width * 4) {
            for (x, pixel) in row.chunks_exact_mut(4).enumerate() {
                let bar = ((x + shift) / bar_width) % BARS.len();
                pixel.copy_from_slice(&BARS[bar]);
            }
        }

        surface.sequence = self.sequence;
        self.sequence += 1;
    }

    /// Render the next frame into a fresh surface
    pub fn next_surface(&mut self) -> Result<VideoSurface, SurfaceError> {
        let mut surface = VideoSurface::new(self.width, self.height, PixelFormat::Rgba)?;
        self.render_into(&mut surface);
        Ok(surface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_frame_starts_with_white_bar() {
        let mut pattern = PatternGenerator::new(16, 2).unwrap();
        let surface = pattern.next_surface().unwrap();

        assert_eq!(surface.data.len(), 16 * 2 * 4);
        assert_eq!(&surface.data[0..4], &BARS[0]);
        assert_eq!(&surface.data[60..64], &BARS[7]);
        assert_eq!(surface.sequence, 0);
    }

    #[test]
    fn test_sequence_advances_and_bars_move() {
        let mut pattern = PatternGenerator::new(16, 1).unwrap();
        let first = pattern.next_surface().unwrap();
        let second = pattern.next_surface().unwrap();

        assert_eq!(second.sequence, 1);
        assert_ne!(first.data, second.data);
    }

    #[test]
    fn test_render_into_follows_resize() {
        let mut pattern = PatternGenerator::new(8, 8).unwrap();
        let mut surface = pattern.next_surface().unwrap();
        pattern.resize(4, 2).unwrap();
        pattern.render_into(&mut surface);

        assert_eq!((surface.width, surface.height), (4, 2));
        assert_eq!(surface.data.len(), 32);
    }

    proptest! {
        #[test]
        fn prop_frame_size_matches_dimensions(w in 1u32..64, h in 1u32..64) {
            let mut pattern = PatternGenerator::new(w, h).unwrap();
            let surface = pattern.next_surface().unwrap();
            prop_assert_eq!(surface.data.len(), (w * h * 4) as usize);
        }
    }
}
