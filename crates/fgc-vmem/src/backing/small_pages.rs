//! Small-page backing: one backing object per granule
//!
//! The handle map is the ownership table. A granule is committed exactly
//! when its slot holds a handle; commit publishes the handle only after the
//! pages exist, and uncommit clears the slot before closing the handle.

use crate::granule_map::GranuleMap;
use crate::logging::Diagnostics;
use crate::mapper::{Mapper, PhysicalHandle};
use std::sync::Arc;

pub struct SmallPagesBacking {
    mapper: Arc<Mapper>,
    handles: GranuleMap<Option<PhysicalHandle>>,
    granule_size: usize,
    diagnostics: Diagnostics,
}

impl SmallPagesBacking {
    pub fn new(mapper: Arc<Mapper>, max_capacity: usize, diagnostics: Diagnostics) -> Self {
        let granule_size = mapper.granule_size();
        Self {
            handles: GranuleMap::new(max_capacity, granule_size),
            mapper,
            granule_size,
            diagnostics,
        }
    }

    fn handle(&self, offset: usize) -> PhysicalHandle {
        match self.handles.get_acquire(offset) {
            Some(handle) => handle,
            None => self
                .diagnostics
                .fatal(&format!("Granule at offset {:#x} is not committed", offset)),
        }
    }

    pub fn is_committed(&self, offset: usize) -> bool {
        self.handles.get_acquire(offset).is_some()
    }

    /// Commit granule by granule, stopping at the first refusal
    pub fn commit(&self, offset: usize, length: usize) -> usize {
        let mut committed = 0;

        while committed < length {
            let granule = offset + committed;
            if self.is_committed(granule) {
                self.diagnostics
                    .fatal(&format!("Granule at offset {:#x} already committed", granule));
            }

            match self.mapper.create_and_commit_physical_backing(self.granule_size) {
                Some(handle) => self.handles.release_put(granule, Some(handle)),
                None => break,
            }
            committed += self.granule_size;
        }

        committed
    }

    pub fn uncommit(&self, offset: usize, length: usize) -> usize {
        let mut current = offset;
        while current < offset + length {
            let handle = self.handle(current);
            self.handles.release_put(current, None);
            self.mapper.close_physical_backing(handle);
            current += self.granule_size;
        }

        length
    }

    /// Map each granule's backing object over its granule placeholder
    pub fn map(&self, addr: usize, size: usize, offset: usize) {
        let mut i = 0;
        while i < size {
            let handle = self.handle(offset + i);
            self.mapper.map_view(handle, 0, addr + i, self.granule_size);
            i += self.granule_size;
        }
    }

    pub fn unmap(&self, addr: usize, size: usize) {
        let mut i = 0;
        while i < size {
            self.mapper.unmap_view(addr + i, self.granule_size);
            i += self.granule_size;
        }
    }

    /// Close every live handle, returning the bytes released
    pub fn release_all(&self) -> usize {
        let mut released = 0;
        for (offset, handle) in self.handles.iter() {
            if let Some(handle) = handle {
                self.handles.release_put(offset, None);
                self.mapper.close_physical_backing(handle);
                released += self.granule_size;
            }
        }
        released
    }
}
