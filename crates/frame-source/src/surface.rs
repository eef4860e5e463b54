//! Capture surfaces and their arena

use crate::{PixelFormat, SurfaceError};

/// One captured frame
#[derive(Debug, Clone)]
pub struct VideoSurface {
    /// Pixel data laid out per `format`
    pub data: Vec<u8>,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Pixel layout
    pub format: PixelFormat,
    /// Frame sequence number
    pub sequence: u64,
}

impl VideoSurface {
    /// Allocate a zeroed surface
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self, SurfaceError> {
        if width == 0 || height == 0 {
            return Err(SurfaceError::InvalidDimensions { width, height });
        }
        Ok(Self {
            data: vec![0; format.frame_size(width, height)],
            width,
            height,
            format,
            sequence: 0,
        })
    }
}

/// Handle to an arena slot, invalidated when the slot is released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle {
    index: usize,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity arena with generational handles
///
/// The arena is the single owner of every surface. Releasing a slot bumps
/// its generation, so handles held elsewhere become stale instead of
/// dangling.
pub struct SurfaceArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    capacity: usize,
    len: usize,
}

impl<T> SurfaceArena<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            capacity,
            len: 0,
        }
    }

    /// Store a value and return its handle
    pub fn insert(&mut self, value: T) -> Result<SurfaceHandle, SurfaceError> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                self.slots.len() - 1
            }
            None => return Err(SurfaceError::ArenaFull(self.capacity)),
        };

        let slot = &mut self.slots[index];
        slot.value = Some(value);
        self.len += 1;
        Ok(SurfaceHandle {
            index,
            generation: slot.generation,
        })
    }

    pub fn get(&self, handle: SurfaceHandle) -> Result<&T, SurfaceError> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
            .ok_or(SurfaceError::StaleHandle {
                index: handle.index,
                generation: handle.generation,
            })
    }

    pub fn get_mut(&mut self, handle: SurfaceHandle) -> Result<&mut T, SurfaceError> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
            .ok_or(SurfaceError::StaleHandle {
                index: handle.index,
                generation: handle.generation,
            })
    }

    /// Remove a value, invalidating every copy of its handle
    pub fn release(&mut self, handle: SurfaceHandle) -> Result<T, SurfaceError> {
        let stale = SurfaceError::StaleHandle {
            index: handle.index,
            generation: handle.generation,
        };
        let slot = match self.slots.get_mut(handle.index) {
            Some(slot) if slot.generation == handle.generation => slot,
            _ => return Err(stale),
        };
        let value = slot.value.take().ok_or(stale)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_invalidates_handle() {
        let mut arena = SurfaceArena::new(2);
        let a = arena.insert("a").unwrap();
        assert_eq!(arena.release(a), Ok("a"));

        let b = arena.insert("b").unwrap();
        assert_eq!(arena.get(b), Ok(&"b"));
        assert!(matches!(arena.get(a), Err(SurfaceError::StaleHandle { .. })));
        assert!(arena.release(a).is_err());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_capacity_bound() {
        let mut arena = SurfaceArena::new(1);
        arena.insert(1u8).unwrap();
        assert_eq!(arena.insert(2u8), Err(SurfaceError::ArenaFull(1)));
    }

    #[test]
    fn test_get_mut() {
        let mut arena = SurfaceArena::new(1);
        let handle = arena
            .insert(VideoSurface::new(2, 2, PixelFormat::Rgba).unwrap())
            .unwrap();
        arena.get_mut(handle).unwrap().sequence = 7;
        assert_eq!(arena.get(handle).unwrap().sequence, 7);
        assert_eq!(arena.get(handle).unwrap().data.len(), 16);
    }

    #[test]
    fn test_zero_sized_surface_rejected() {
        assert_eq!(
            VideoSurface::new(0, 10, PixelFormat::Nv12).unwrap_err(),
            SurfaceError::InvalidDimensions {
                width: 0,
                height: 10
            }
        );
    }
}
