//! Large-page backing: frames from the shared page pool
//!
//! The frame map holds the pool frame bound to each committed granule.
//! Commit keeps every frame the pool handed out, so a short commit still
//! leaves a usable committed prefix.

use super::pool::{PageFrame, SharedPagePool};
use crate::granule_map::GranuleMap;
use crate::logging::Diagnostics;
use std::sync::Arc;

pub struct LargePagesBacking {
    pool: Arc<SharedPagePool>,
    frames: GranuleMap<Option<PageFrame>>,
    granule_size: usize,
    diagnostics: Diagnostics,
}

impl LargePagesBacking {
    pub fn new(pool: Arc<SharedPagePool>, max_capacity: usize, diagnostics: Diagnostics) -> Self {
        let granule_size = pool.granule_size();
        Self {
            frames: GranuleMap::new(max_capacity, granule_size),
            pool,
            granule_size,
            diagnostics,
        }
    }

    fn frames_in(&self, offset: usize, size: usize) -> Vec<PageFrame> {
        (0..size / self.granule_size)
            .map(|i| {
                let granule = offset + i * self.granule_size;
                match self.frames.get_acquire(granule) {
                    Some(frame) => frame,
                    None => self
                        .diagnostics
                        .fatal(&format!("Granule at offset {:#x} is not committed", granule)),
                }
            })
            .collect()
    }

    pub fn is_committed(&self, offset: usize) -> bool {
        self.frames.get_acquire(offset).is_some()
    }

    pub fn commit(&self, offset: usize, length: usize) -> usize {
        let count = length / self.granule_size;
        for i in 0..count {
            let granule = offset + i * self.granule_size;
            if self.is_committed(granule) {
                self.diagnostics
                    .fatal(&format!("Granule at offset {:#x} already committed", granule));
            }
        }

        let frames = self.pool.allocate_frames(count);
        for (i, frame) in frames.iter().enumerate() {
            self.frames
                .release_put(offset + i * self.granule_size, Some(*frame));
        }

        frames.len() * self.granule_size
    }

    pub fn uncommit(&self, offset: usize, length: usize) -> usize {
        let frames = self.frames_in(offset, length);
        self.frames.put_range(offset, length, None);
        self.pool.free_frames(&frames);
        length
    }

    pub fn map(&self, addr: usize, size: usize, offset: usize) {
        let frames = self.frames_in(offset, size);
        self.pool.map_frames(addr, &frames);
    }

    pub fn unmap(&self, addr: usize, size: usize) {
        self.pool.unmap_frames(addr, size / self.granule_size);
    }

    /// Return every bound frame to the pool, returning the bytes released
    pub fn release_all(&self) -> usize {
        let frames: Vec<PageFrame> = self
            .frames
            .iter()
            .filter_map(|(offset, frame)| {
                let frame = frame?;
                self.frames.put(offset, None);
                Some(frame)
            })
            .collect();

        self.pool.free_frames(&frames);
        frames.len() * self.granule_size
    }
}
