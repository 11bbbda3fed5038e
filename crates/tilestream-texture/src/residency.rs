//! Residency manager
//!
//! Turns alive/dead page lists into committed or released backing:
//!
//! - `add_pages`: generate content, stage it, map the page's heap slot and
//!   copy the staged data into it. Pages move `Unloaded -> Staging -> Resident`.
//! - `remove_pages`: unmap the slot and hand the staging block back to the
//!   pool. Pages move back to `Unloaded`.
//!
//! Running out of staging memory or failing to generate a page is not an
//! error; the page stays `Unloaded` and is queued for retry on later frames
//! until it loads or is reported dead.
//! An index outside the page table aborts the call before anything changes.

use std::sync::Arc;

use ahash::AHashSet;
use rayon::prelude::*;
use serde::Serialize;
use tilestream_core::{CoreError, HostPageAllocator, MemoryBudget, StagingBlock};

use crate::config::StreamingConfig;
use crate::content::{ContentGenerator, ContentRequest};
use crate::descriptor::{PageKind, ResidencyState, VirtualTextureDescriptor};
use crate::device::{BackingDevice, SlotCopy};
use crate::heap::HeapRegionAllocator;
use crate::{TextureError, TextureResult};

/// Outcome of one `add_pages` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AddReport {
    pub requested: usize,
    pub added: usize,
    /// Already staging or resident, or repeated in the list
    pub skipped: usize,
    /// Left for a later frame because the staging pool was full
    pub deferred: usize,
    /// Generator failed or returned the wrong amount of data
    pub failed: usize,
}

/// Outcome of one `remove_pages` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoveReport {
    pub requested: usize,
    pub removed: usize,
    /// Already unloaded, or repeated in the list
    pub skipped: usize,
    /// Held resident as the sampling fallback
    pub pinned: usize,
}

/// Cumulative residency counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResidencyStats {
    pub pages_added: u64,
    pub pages_removed: u64,
    pub duplicates_skipped: u64,
    pub deferred: u64,
    pub generation_failures: u64,
    pub bytes_staged: u64,
}

impl ResidencyStats {
    fn record_add(&mut self, report: &AddReport) {
        self.pages_added += report.added as u64;
        self.duplicates_skipped += report.skipped as u64;
        self.deferred += report.deferred as u64;
        self.generation_failures += report.failed as u64;
    }
}

/// Owner of every page state transition
pub struct ResidencyManager {
    generator: Arc<dyn ContentGenerator>,
    device: Arc<dyn BackingDevice>,
    heap: HeapRegionAllocator,
    staging: HostPageAllocator,
    parallel: bool,
    pinned: Option<usize>,
    /// Deferred or failed pages still waiting to load
    retry: AHashSet<usize>,
    stats: ResidencyStats,
}

impl ResidencyManager {
    /// Create the heap and staging pool for a descriptor
    pub fn new(
        descriptor: &VirtualTextureDescriptor,
        config: &StreamingConfig,
        device: Arc<dyn BackingDevice>,
        generator: Arc<dyn ContentGenerator>,
    ) -> TextureResult<Self> {
        let heap = HeapRegionAllocator::new(device.clone(), descriptor)?;

        let block_size = descriptor.tile_size_in_bytes();
        let staging = HostPageAllocator::new(
            block_size,
            MemoryBudget::for_blocks(block_size, config.staging_capacity_pages),
        );

        let pinned = if config.pin_packed_mips {
            descriptor.page_table().packed_page_index()
        } else {
            None
        };

        log::info!(
            "Residency for {} pages: {} heap tiles, {} staging blocks, generator '{}'",
            descriptor.page_table().len(),
            heap.capacity_tiles(),
            staging.capacity_blocks(),
            generator.name()
        );

        Ok(Self {
            generator,
            device,
            heap,
            staging,
            parallel: config.parallel_generation,
            pinned,
            retry: AHashSet::new(),
            stats: ResidencyStats::default(),
        })
    }

    /// Cumulative counters since creation
    pub fn stats(&self) -> &ResidencyStats {
        &self.stats
    }

    /// Staging pool backing in-flight and resident page data
    pub fn staging(&self) -> &HostPageAllocator {
        &self.staging
    }

    /// Heap region allocator owning the page slots
    pub fn heap(&self) -> &HeapRegionAllocator {
        &self.heap
    }

    /// Pages that were deferred or failed and will be requested again
    pub fn pending_retries(&self) -> usize {
        self.retry.len()
    }

    /// Extend an alive list with the pages waiting for retry.
    ///
    /// Pages on `dead` leave the retry set first. Retries are appended in
    /// index order after the caller's pages and are not repeated.
    pub fn with_retries(&mut self, alive: &[u32], dead: &[u32]) -> Vec<u32> {
        for &index in dead {
            self.retry.remove(&(index as usize));
        }

        let mut merged = alive.to_vec();
        if self.retry.is_empty() {
            return merged;
        }

        let listed: AHashSet<u32> = alive.iter().copied().collect();
        let mut pending: Vec<u32> = self
            .retry
            .iter()
            .map(|&index| index as u32)
            .filter(|index| !listed.contains(index))
            .collect();
        pending.sort_unstable();
        merged.extend(pending);
        merged
    }

    /// Page kept resident as the sampling fallback
    pub fn pinned_page(&self) -> Option<usize> {
        self.pinned
    }

    /// Load the pinned fallback page if it is not resident yet
    pub fn ensure_pinned(
        &mut self,
        descriptor: &mut VirtualTextureDescriptor,
    ) -> TextureResult<Option<AddReport>> {
        let Some(index) = self.pinned else {
            return Ok(None);
        };
        let unloaded = descriptor
            .page_table()
            .page(index)
            .is_some_and(|page| page.state() == ResidencyState::Unloaded);
        if !unloaded {
            return Ok(None);
        }
        self.add_pages(descriptor, &[index as u32]).map(Some)
    }

    /// Reject a list holding any index outside the page table
    pub(crate) fn validate(
        list: &'static str,
        pages: &[u32],
        page_count: usize,
    ) -> TextureResult<()> {
        if let Some(&index) = pages.iter().find(|&&index| index as usize >= page_count) {
            log::error!(
                "{} list holds page {} but the page table has {} pages; aborting update",
                list,
                index,
                page_count
            );
            return Err(TextureError::FeedbackIndexOutOfBounds {
                list,
                index,
                page_count,
            });
        }
        Ok(())
    }

    /// Make every listed page resident.
    ///
    /// Pages are processed in list order. Map and copy commands for the whole
    /// call are recorded as one batch.
    pub fn add_pages(
        &mut self,
        descriptor: &mut VirtualTextureDescriptor,
        alive: &[u32],
    ) -> TextureResult<AddReport> {
        let mut report = AddReport {
            requested: alive.len(),
            ..AddReport::default()
        };
        Self::validate("alive", alive, descriptor.page_table().len())?;

        let mut seen = AHashSet::with_capacity(alive.len());
        let mut candidates = Vec::new();
        for &index in alive {
            let index = index as usize;
            let unloaded = descriptor
                .page_table()
                .page(index)
                .is_some_and(|page| page.state() == ResidencyState::Unloaded);
            if seen.insert(index) && unloaded {
                candidates.push(index);
            } else {
                if !unloaded {
                    self.retry.remove(&index);
                }
                report.skipped += 1;
            }
        }

        // Reserve staging before generating so a full pool costs no work
        let mut reserved: Vec<(ContentRequest, StagingBlock)> = Vec::with_capacity(candidates.len());
        for index in candidates {
            let Some(request) = ContentRequest::for_page(descriptor, index) else {
                // Indices were validated above
                log::warn!("Page {} has no content request", index);
                report.failed += 1;
                continue;
            };
            match self.staging.allocate(request.expected_len) {
                Ok(block) => reserved.push((request, block)),
                Err(CoreError::OutOfStagingMemory { .. }) => {
                    self.retry.insert(index);
                    report.deferred += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
        if report.deferred > 0 {
            log::debug!(
                "Staging pool full: {} pages deferred ({} of {} blocks in use)",
                report.deferred,
                self.staging.outstanding_blocks(),
                self.staging.capacity_blocks()
            );
        }

        let generator = &self.generator;
        let contents: Vec<TextureResult<Vec<u8>>> = if self.parallel && reserved.len() > 1 {
            reserved
                .par_iter()
                .map(|(request, _)| generator.generate(request))
                .collect()
        } else {
            reserved
                .iter()
                .map(|(request, _)| generator.generate(request))
                .collect()
        };

        let mut staged = Vec::with_capacity(reserved.len());
        let mut staged_bytes = 0u64;
        for ((request, mut block), content) in reserved.into_iter().zip(contents) {
            let data = match content {
                Ok(data) if data.len() == request.expected_len => data,
                Ok(data) => {
                    log::warn!(
                        "{}",
                        TextureError::ContentSizeMismatch {
                            page: request.page_index,
                            expected: request.expected_len,
                            actual: data.len(),
                        }
                    );
                    self.retry.insert(request.page_index);
                    report.failed += 1;
                    continue;
                }
                Err(err) => {
                    log::warn!("Page {} not loaded: {}", request.page_index, err);
                    self.retry.insert(request.page_index);
                    report.failed += 1;
                    continue;
                }
            };

            block.write(&data)?;
            staged_bytes += data.len() as u64;
            if let Some(page) = descriptor.page_table_mut().page_mut(request.page_index) {
                page.begin_staging(block);
                staged.push(request.page_index);
            }
        }

        if let Err(err) = self.heap.map(descriptor.page_table(), &staged) {
            Self::revert(descriptor, &staged);
            return Err(err);
        }

        if let Err(err) = self.record_copies(descriptor, &staged) {
            if let Err(unmap_err) = self.heap.unmap(descriptor.page_table(), &staged) {
                log::error!("Failed to unmap pages after copy failure: {}", unmap_err);
            }
            Self::revert(descriptor, &staged);
            return Err(err);
        }

        for &index in &staged {
            if let Some(page) = descriptor.page_table_mut().page_mut(index) {
                page.commit();
            }
            self.retry.remove(&index);
        }

        report.added = staged.len();
        self.stats.record_add(&report);
        self.stats.bytes_staged += staged_bytes;
        Ok(report)
    }

    fn record_copies(
        &self,
        descriptor: &VirtualTextureDescriptor,
        staged: &[usize],
    ) -> TextureResult<()> {
        let store = self.heap.store();
        let bytes_per_pixel = descriptor.format().bytes_per_pixel();
        let row_pitch = descriptor.tile_width() * bytes_per_pixel;

        for &index in staged {
            let Some(page) = descriptor.page_table().page(index) else {
                continue;
            };
            let Some(block) = page.staging() else {
                continue;
            };

            match page.kind() {
                PageKind::Standard { valid_extent, .. } => {
                    let copy = SlotCopy::Tile {
                        heap_slot: page.heap_slot(),
                        coordinate: page.coordinate(),
                        extent: *valid_extent,
                        bytes_per_pixel,
                        row_pitch,
                    };
                    self.device.copy_into_slot(store, &copy, block)?;
                }
                // Packed data is copied per sub-mip, not by pixel offset
                PageKind::Packed { .. } => {
                    for footprint in descriptor.packed_footprints() {
                        let copy = SlotCopy::PackedSubresource {
                            heap_slot: page.heap_slot(),
                            mip: footprint.mip,
                            source_offset: footprint.offset,
                            destination_offset: footprint.offset,
                            len: footprint.len,
                        };
                        self.device.copy_into_slot(store, &copy, block)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn revert(descriptor: &mut VirtualTextureDescriptor, staged: &[usize]) {
        for &index in staged {
            if let Some(page) = descriptor.page_table_mut().page_mut(index) {
                drop(page.evict());
            }
        }
    }

    /// Release every listed page's backing
    pub fn remove_pages(
        &mut self,
        descriptor: &mut VirtualTextureDescriptor,
        dead: &[u32],
    ) -> TextureResult<RemoveReport> {
        let mut report = RemoveReport {
            requested: dead.len(),
            ..RemoveReport::default()
        };
        Self::validate("dead", dead, descriptor.page_table().len())?;

        let mut seen = AHashSet::with_capacity(dead.len());
        let mut victims = Vec::new();
        for &index in dead {
            let index = index as usize;
            self.retry.remove(&index);
            if Some(index) == self.pinned {
                report.pinned += 1;
                continue;
            }
            let loaded = descriptor
                .page_table()
                .page(index)
                .is_some_and(|page| page.state() != ResidencyState::Unloaded);
            if seen.insert(index) && loaded {
                victims.push(index);
            } else {
                report.skipped += 1;
            }
        }

        self.heap.unmap(descriptor.page_table(), &victims)?;

        for &index in &victims {
            if let Some(page) = descriptor.page_table_mut().page_mut(index) {
                // Staging memory goes back to the pool here
                drop(page.evict());
            }
        }

        report.removed = victims.len();
        self.stats.pages_removed += victims.len() as u64;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::CheckerboardGenerator;
    use crate::device::SoftwareDevice;
    use crate::format::{PixelFormat, TILE_SIZE_IN_BYTES};

    fn setup_with(
        width: u32,
        config: StreamingConfig,
        generator: Arc<dyn ContentGenerator>,
    ) -> (Arc<SoftwareDevice>, VirtualTextureDescriptor, ResidencyManager) {
        let device = Arc::new(SoftwareDevice::new());
        let desc =
            VirtualTextureDescriptor::from_device(device.as_ref(), width, width, PixelFormat::Rgba8Unorm)
                .unwrap();
        let manager = ResidencyManager::new(&desc, &config, device.clone(), generator).unwrap();
        (device, desc, manager)
    }

    fn setup(width: u32) -> (Arc<SoftwareDevice>, VirtualTextureDescriptor, ResidencyManager) {
        let config = StreamingConfig {
            staging_capacity_pages: 32,
            pin_packed_mips: false,
            ..StreamingConfig::default()
        };
        setup_with(width, config, Arc::new(CheckerboardGenerator))
    }

    #[test]
    fn test_add_makes_pages_resident() {
        let (device, mut desc, mut manager) = setup(512);

        let report = manager.add_pages(&mut desc, &[0, 3]).unwrap();
        assert_eq!(report.added, 2);

        let table = desc.page_table();
        assert!(table.page(0).unwrap().is_resident());
        assert!(table.page(3).unwrap().is_resident());
        assert!(table.page(0).unwrap().staging().is_some());
        assert_eq!(table.count_in_state(ResidencyState::Staging), 0);

        device.submit().unwrap();
        assert!(device.is_slot_mapped(manager.heap().store(), 3));

        let expected = CheckerboardGenerator
            .generate(&ContentRequest::for_page(&desc, 3).unwrap())
            .unwrap();
        let stored = device
            .slot_contents(manager.heap().store(), 3, expected.len())
            .unwrap();
        assert_eq!(stored, expected);
        assert_eq!(device.fault_count(), 0);
    }

    #[test]
    fn test_duplicates_are_skipped() {
        let (_, mut desc, mut manager) = setup(512);

        let report = manager.add_pages(&mut desc, &[5, 5, 7]).unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.skipped, 1);

        let report = manager.add_pages(&mut desc, &[5]).unwrap();
        assert_eq!(report.added, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(manager.heap().mapped_count(), 2);
    }

    #[test]
    fn test_staging_blocks_follow_residency() {
        let (_, mut desc, mut manager) = setup(512);

        manager.add_pages(&mut desc, &[1, 2, 3]).unwrap();
        assert_eq!(manager.staging().outstanding_blocks(), 3);

        manager.remove_pages(&mut desc, &[2]).unwrap();
        assert_eq!(manager.staging().outstanding_blocks(), 2);
        assert!(desc.page_table().page(2).unwrap().staging().is_none());
        assert_eq!(desc.page_table().page(2).unwrap().state(), ResidencyState::Unloaded);
    }

    #[test]
    fn test_out_of_bounds_aborts_before_mutation() {
        let (_, mut desc, mut manager) = setup(512);

        let err = manager.add_pages(&mut desc, &[1, 999]).unwrap_err();
        assert!(matches!(
            err,
            TextureError::FeedbackIndexOutOfBounds { list: "alive", index: 999, .. }
        ));
        assert!(err.is_protocol_violation());
        assert_eq!(desc.page_table().page(1).unwrap().state(), ResidencyState::Unloaded);
        assert_eq!(manager.staging().outstanding_blocks(), 0);

        assert!(manager.remove_pages(&mut desc, &[22]).is_err());
    }

    #[test]
    fn test_staging_pressure_defers_pages() {
        let config = StreamingConfig {
            staging_capacity_pages: 2,
            pin_packed_mips: false,
            ..StreamingConfig::default()
        };
        let (_, mut desc, mut manager) = setup_with(512, config, Arc::new(CheckerboardGenerator));

        let report = manager.add_pages(&mut desc, &[0, 1, 2, 3]).unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.deferred, 2);
        assert_eq!(desc.page_table().page(2).unwrap().state(), ResidencyState::Unloaded);

        manager.remove_pages(&mut desc, &[0, 1]).unwrap();
        let report = manager.add_pages(&mut desc, &[2, 3]).unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(manager.stats().deferred, 2);
    }

    #[test]
    fn test_deferred_pages_queue_for_retry() {
        let config = StreamingConfig {
            staging_capacity_pages: 1,
            pin_packed_mips: false,
            ..StreamingConfig::default()
        };
        let (_, mut desc, mut manager) = setup_with(512, config, Arc::new(CheckerboardGenerator));

        let report = manager.add_pages(&mut desc, &[0, 4, 2]).unwrap();
        assert_eq!(report.deferred, 2);
        assert_eq!(manager.pending_retries(), 2);

        // Retries follow the caller's pages in index order, without repeats
        assert_eq!(manager.with_retries(&[9, 4], &[]), vec![9, 4, 2]);

        manager.remove_pages(&mut desc, &[0]).unwrap();
        let alive = manager.with_retries(&[], &[]);
        assert_eq!(alive, vec![2, 4]);
        let report = manager.add_pages(&mut desc, &alive).unwrap();
        assert_eq!(report.added, 1);
        assert!(desc.page_table().page(2).unwrap().is_resident());
        assert_eq!(manager.pending_retries(), 1);

        // A page reported dead is no longer wanted
        assert_eq!(manager.with_retries(&[], &[4]), Vec::<u32>::new());
        assert_eq!(manager.pending_retries(), 0);
    }

    #[test]
    fn test_generation_failure_leaves_page_unloaded() {
        let generator = |request: &ContentRequest| {
            if request.page_index == 4 {
                Err(TextureError::ContentGeneration {
                    page: 4,
                    reason: "source unavailable".to_string(),
                })
            } else {
                Ok(vec![1u8; request.expected_len])
            }
        };
        let config = StreamingConfig {
            pin_packed_mips: false,
            staging_capacity_pages: 8,
            ..StreamingConfig::default()
        };
        let (_, mut desc, mut manager) = setup_with(512, config, Arc::new(generator));

        let report = manager.add_pages(&mut desc, &[3, 4]).unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(desc.page_table().page(4).unwrap().state(), ResidencyState::Unloaded);
        assert!(!manager.heap().is_mapped(4));
        assert_eq!(manager.staging().outstanding_blocks(), 1);
        assert_eq!(manager.pending_retries(), 1);
    }

    #[test]
    fn test_wrong_content_size_is_a_failure() {
        let generator = |_: &ContentRequest| Ok::<_, TextureError>(vec![0u8; 10]);
        let config = StreamingConfig {
            pin_packed_mips: false,
            staging_capacity_pages: 8,
            ..StreamingConfig::default()
        };
        let (_, mut desc, mut manager) = setup_with(512, config, Arc::new(generator));

        let report = manager.add_pages(&mut desc, &[0]).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(manager.staging().outstanding_blocks(), 0);
    }

    #[test]
    fn test_remove_skips_unloaded() {
        let (_, mut desc, mut manager) = setup(512);
        let report = manager.remove_pages(&mut desc, &[6]).unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_pinned_page_survives_removal() {
        let config = StreamingConfig {
            staging_capacity_pages: 8,
            ..StreamingConfig::default()
        };
        let (_, mut desc, mut manager) = setup_with(512, config, Arc::new(CheckerboardGenerator));
        let packed = desc.page_table().packed_page_index().unwrap();
        assert_eq!(manager.pinned_page(), Some(packed));

        assert_eq!(manager.ensure_pinned(&mut desc).unwrap().unwrap().added, 1);
        assert!(manager.ensure_pinned(&mut desc).unwrap().is_none());

        let report = manager.remove_pages(&mut desc, &[packed as u32]).unwrap();
        assert_eq!(report.pinned, 1);
        assert!(desc.page_table().page(packed).unwrap().is_resident());
    }

    #[test]
    fn test_packed_copy_per_sub_mip() {
        let (device, mut desc, mut manager) = setup(512);
        let packed = desc.page_table().packed_page_index().unwrap();

        manager.add_pages(&mut desc, &[packed as u32]).unwrap();
        assert_eq!(device.pending_commands(), 1 + desc.packed_footprints().len());
        device.submit().unwrap();

        let slot = desc.page_table().page(packed).unwrap().heap_slot();
        let expected = CheckerboardGenerator
            .generate(&ContentRequest::for_page(&desc, packed).unwrap())
            .unwrap();
        assert_eq!(expected.len(), TILE_SIZE_IN_BYTES);

        let stored = device
            .slot_contents(manager.heap().store(), slot, expected.len())
            .unwrap();
        let last = desc.packed_footprints().last().unwrap();
        let used = last.offset + last.len;
        assert_eq!(&stored[..used], &expected[..used]);
    }

    #[test]
    fn test_sequential_generation_matches_parallel() {
        let config = StreamingConfig {
            staging_capacity_pages: 32,
            pin_packed_mips: false,
            parallel_generation: false,
            ..StreamingConfig::default()
        };
        let (_, mut desc, mut manager) = setup_with(512, config, Arc::new(CheckerboardGenerator));
        let (_, mut parallel_desc, mut parallel) = setup(512);

        let pages: Vec<u32> = (0..16).collect();
        manager.add_pages(&mut desc, &pages).unwrap();
        parallel.add_pages(&mut parallel_desc, &pages).unwrap();

        for &index in &pages {
            let a = desc.page_table().page(index as usize).unwrap().staging().unwrap();
            let b = parallel_desc
                .page_table()
                .page(index as usize)
                .unwrap()
                .staging()
                .unwrap();
            assert_eq!(a.read(|bytes| bytes.to_vec()), b.read(|bytes| bytes.to_vec()));
        }
        assert_eq!(manager.stats().bytes_staged, 16 * 128 * 128 * 4);
    }
}
