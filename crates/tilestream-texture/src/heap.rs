//! Heap region allocator
//!
//! Every page owns a fixed slot in a single backing store. Slots are laid
//! out once, in page order, when the page table is built; the store is
//! created with exactly the summed capacity and never resized. Mapping and
//! unmapping bind a page's region to its slot; the allocator tracks which
//! pages are bound and rejects double maps and stray unmaps.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptor::{MipInfo, Page, PageTable, VirtualTextureDescriptor};
use crate::device::{BackingDevice, BackingStoreId, MappingBatch, TileMapping, TileRangeFlags};
use crate::{TextureError, TextureResult};

/// Slot layout of a page table, in tile units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapLayout {
    capacity_tiles: u32,
    range_offsets: Vec<u32>,
}

impl HeapLayout {
    /// Total tiles the backing store must hold
    pub fn capacity_tiles(&self) -> u32 {
        self.capacity_tiles
    }

    /// First tile of each heap range (one per standard mip, one for packed mips)
    pub fn range_offsets(&self) -> &[u32] {
        &self.range_offsets
    }
}

/// Walk the pages in creation order and give each one a slot sized for its tiles
pub(crate) fn assign_slots(pages: &mut [Page], mips: &[MipInfo]) -> HeapLayout {
    let range_count = mips
        .iter()
        .map(|mip| mip.heap_range_index + 1)
        .max()
        .unwrap_or(0) as usize;
    let mut range_offsets = vec![0; range_count];

    let mut offset = 0u32;
    for (index, page) in pages.iter_mut().enumerate() {
        if let Some(mip) = mips.iter().find(|mip| mip.pages.start == index) {
            range_offsets[mip.heap_range_index as usize] = offset;
        }
        page.assign_heap_slot(offset);
        offset += page.tile_count();
    }

    HeapLayout {
        capacity_tiles: offset,
        range_offsets,
    }
}

/// Owner of the backing store and of every page's mapping state
pub struct HeapRegionAllocator {
    device: Arc<dyn BackingDevice>,
    store: BackingStoreId,
    capacity_tiles: u32,
    range_offsets: Vec<u32>,
    /// Per-page mapping state, serialized across callers
    mapped: Mutex<Vec<bool>>,
}

impl HeapRegionAllocator {
    /// Create the backing store sized for the descriptor's heap layout
    pub fn new(
        device: Arc<dyn BackingDevice>,
        descriptor: &VirtualTextureDescriptor,
    ) -> TextureResult<Self> {
        let capacity_tiles = descriptor.heap_layout().capacity_tiles();
        let store = device.create_backing_store(capacity_tiles)?;

        log::debug!(
            "Heap for {} pages: {} tiles in {} ranges",
            descriptor.page_table().len(),
            capacity_tiles,
            descriptor.heap_layout().range_offsets().len()
        );

        Ok(Self {
            device,
            store,
            capacity_tiles,
            range_offsets: descriptor.heap_layout().range_offsets().to_vec(),
            mapped: Mutex::new(vec![false; descriptor.page_table().len()]),
        })
    }

    /// Backing store handle
    pub fn store(&self) -> BackingStoreId {
        self.store
    }

    pub fn capacity_tiles(&self) -> u32 {
        self.capacity_tiles
    }

    /// First tile of each heap range
    pub fn heap_range_offsets(&self) -> &[u32] {
        &self.range_offsets
    }

    /// Slot assigned to a page
    pub fn slot_of(&self, table: &PageTable, page: usize) -> Option<u32> {
        table.page(page).map(Page::heap_slot)
    }

    pub fn is_mapped(&self, page: usize) -> bool {
        self.mapped.lock().get(page).copied().unwrap_or(false)
    }

    /// Number of pages currently mapped
    pub fn mapped_count(&self) -> usize {
        self.mapped.lock().iter().filter(|m| **m).count()
    }

    /// Bind each page's region to its slot in one batched update.
    ///
    /// The whole batch is validated first; nothing is mapped if any page is
    /// out of range or already mapped.
    pub fn map(&self, table: &PageTable, pages: &[usize]) -> TextureResult<()> {
        self.update(table, pages, true)
    }

    /// Unbind each page's region in one batched update
    pub fn unmap(&self, table: &PageTable, pages: &[usize]) -> TextureResult<()> {
        self.update(table, pages, false)
    }

    fn update(&self, table: &PageTable, pages: &[usize], map: bool) -> TextureResult<()> {
        if pages.is_empty() {
            return Ok(());
        }

        let mut mapped = self.mapped.lock();
        let mut batch = MappingBatch::new();

        for (i, &index) in pages.iter().enumerate() {
            let page = table.page(index).ok_or(TextureError::SlotOutOfRange {
                page: index,
                page_count: table.len(),
            })?;

            // A page repeated within the batch counts as a second request
            let already = mapped[index] || pages[..i].contains(&index);
            if map && already {
                return Err(TextureError::AlreadyMapped { page: index });
            }
            if !map && (!mapped[index] || pages[..i].contains(&index)) {
                return Err(TextureError::NotMapped { page: index });
            }

            if page.heap_slot() + page.tile_count() > self.capacity_tiles {
                return Err(TextureError::SlotOutOfRange {
                    page: index,
                    page_count: table.len(),
                });
            }

            batch.push(TileMapping {
                coordinate: page.coordinate(),
                region: page.region(),
                heap_slot: page.heap_slot(),
                tile_count: page.tile_count(),
                flags: if map {
                    TileRangeFlags::empty()
                } else {
                    TileRangeFlags::NULL
                },
            });
        }

        if map {
            self.device.map_slots(self.store, &batch)?;
        } else {
            self.device.unmap_slots(self.store, &batch)?;
        }

        for &index in pages {
            mapped[index] = map;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ResourceTiling, SoftwareDevice};
    use crate::format::PixelFormat;

    fn setup(width: u32) -> (Arc<SoftwareDevice>, VirtualTextureDescriptor, HeapRegionAllocator) {
        let device = Arc::new(SoftwareDevice::new());
        let tiling = ResourceTiling::standard(width, width, PixelFormat::Rgba8Unorm);
        let desc =
            VirtualTextureDescriptor::new(width, width, PixelFormat::Rgba8Unorm, &tiling).unwrap();
        let heap = HeapRegionAllocator::new(device.clone(), &desc).unwrap();
        (device, desc, heap)
    }

    #[test]
    fn test_slots_are_sequential() {
        let (_, desc, heap) = setup(512);
        let table = desc.page_table();

        for (i, page) in table.pages().iter().enumerate() {
            assert_eq!(page.heap_slot(), i as u32);
        }
        // 16 + 4 + 1 standard pages, one packed tile
        assert_eq!(heap.capacity_tiles(), 22);
        assert_eq!(desc.heap_layout().range_offsets(), &[0, 16, 20, 21]);
        assert_eq!(heap.heap_range_offsets(), &[0, 16, 20, 21]);
    }

    #[test]
    fn test_map_and_unmap() {
        let (device, desc, heap) = setup(512);
        let table = desc.page_table();

        heap.map(table, &[0, 5]).unwrap();
        assert!(heap.is_mapped(0));
        assert!(heap.is_mapped(5));
        assert_eq!(heap.mapped_count(), 2);

        device.submit().unwrap();
        assert!(device.is_slot_mapped(heap.store(), 5));

        heap.unmap(table, &[5]).unwrap();
        device.submit().unwrap();
        assert!(!heap.is_mapped(5));
        assert!(!device.is_slot_mapped(heap.store(), 5));
    }

    #[test]
    fn test_double_map_rejected() {
        let (_, desc, heap) = setup(512);
        let table = desc.page_table();

        heap.map(table, &[3]).unwrap();
        assert!(matches!(
            heap.map(table, &[1, 3]),
            Err(TextureError::AlreadyMapped { page: 3 })
        ));
        // Nothing in the rejected batch was applied
        assert!(!heap.is_mapped(1));
    }

    #[test]
    fn test_duplicate_within_batch_rejected() {
        let (_, desc, heap) = setup(512);
        assert!(matches!(
            heap.map(desc.page_table(), &[2, 2]),
            Err(TextureError::AlreadyMapped { page: 2 })
        ));
        assert_eq!(heap.mapped_count(), 0);
    }

    #[test]
    fn test_unmap_unmapped_rejected() {
        let (_, desc, heap) = setup(512);
        assert!(matches!(
            heap.unmap(desc.page_table(), &[4]),
            Err(TextureError::NotMapped { page: 4 })
        ));
    }

    #[test]
    fn test_out_of_range_page_rejected() {
        let (_, desc, heap) = setup(512);
        assert!(matches!(
            heap.map(desc.page_table(), &[1000]),
            Err(TextureError::SlotOutOfRange { page: 1000, .. })
        ));
    }
}
