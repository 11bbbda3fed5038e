//! Backing-store device
//!
//! The residency engine talks to the rendering device through
//! [`BackingDevice`]: tiling queries, creation of the physical backing
//! store, batched tile mapping updates and copies out of staging memory.
//! [`SoftwareDevice`] is a host-memory implementation that queues commands
//! and executes them in submission order.

use ahash::AHashMap;
use bitflags::bitflags;
use crossbeam::channel::{Receiver, Sender, unbounded};
use glam::{UVec2, UVec3};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tilestream_core::StagingBlock;
use tilestream_core::math;

use crate::descriptor::{RegionDescriptor, TileCoordinate};
use crate::format::{PixelFormat, TILE_SIZE_IN_BYTES};
use crate::{TextureError, TextureResult};

/// Tiling of one standard mip, in tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceTiling {
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    pub depth_in_tiles: u32,
}

impl SubresourceTiling {
    pub fn from_extent(tiles: UVec3) -> Self {
        Self {
            width_in_tiles: tiles.x,
            height_in_tiles: tiles.y,
            depth_in_tiles: tiles.z,
        }
    }

    pub fn extent(&self) -> UVec3 {
        UVec3::new(self.width_in_tiles, self.height_in_tiles, self.depth_in_tiles)
    }
}

/// Tiling information reported by the device for a tiled resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTiling {
    /// Texels per tile
    pub tile_shape: UVec3,
    pub standard_mip_count: u32,
    pub packed_mip_count: u32,
    /// Tiles needed by all packed mips together
    pub packed_tile_count: u32,
    /// One entry per standard mip
    pub subresources: Vec<SubresourceTiling>,
}

impl ResourceTiling {
    /// Tiling with 64 KiB tiles: a mip is packed once either dimension is
    /// smaller than the tile shape.
    pub fn standard(width: u32, height: u32, format: PixelFormat) -> Self {
        let tile_shape = format.standard_tile_shape();
        let base = UVec3::new(width.max(1), height.max(1), 1);
        let mip_count = math::mip_count(base.x, base.y);
        let bytes_per_pixel = format.bytes_per_pixel() as usize;

        let mut subresources = Vec::new();
        let mut packed_bytes = 0usize;
        let mut packed_mip_count = 0;

        for mip in 0..mip_count {
            let extent = math::mip_extent(base, mip);
            let packed = packed_mip_count > 0 || extent.x < tile_shape.x || extent.y < tile_shape.y;
            if packed {
                packed_mip_count += 1;
                packed_bytes += (extent.x * extent.y) as usize * bytes_per_pixel;
            } else {
                subresources.push(SubresourceTiling::from_extent(math::tiles_for_extent(
                    extent, tile_shape,
                )));
            }
        }

        Self {
            tile_shape,
            standard_mip_count: subresources.len() as u32,
            packed_mip_count,
            packed_tile_count: packed_bytes.div_ceil(TILE_SIZE_IN_BYTES) as u32,
            subresources,
        }
    }
}

/// Handle to a backing store created by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackingStoreId(pub u32);

bitflags! {
    /// How a tile range is bound by a mapping update
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TileRangeFlags: u32 {
        /// Unbind the region
        const NULL = 1 << 0;
        /// Leave the region's existing binding untouched
        const SKIP = 1 << 1;
        /// Bind every tile of the region to the first heap tile
        const REUSE_SINGLE_TILE = 1 << 2;
    }
}

/// One entry of a batched mapping update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileMapping {
    pub coordinate: TileCoordinate,
    pub region: RegionDescriptor,
    /// First heap tile of the range
    pub heap_slot: u32,
    pub tile_count: u32,
    pub flags: TileRangeFlags,
}

/// Batch of mapping updates; most frames touch a handful of pages
pub type MappingBatch = SmallVec<[TileMapping; 16]>;

/// Copy from a staging block into mapped backing memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotCopy {
    /// One tile of a standard mip. Only the `extent` texels of each row are
    /// copied; rows are `row_pitch` bytes apart in staging and in the slot.
    Tile {
        heap_slot: u32,
        coordinate: TileCoordinate,
        extent: UVec2,
        bytes_per_pixel: u32,
        row_pitch: u32,
    },
    /// One packed sub-mip, addressed by subresource index
    PackedSubresource {
        heap_slot: u32,
        mip: u32,
        source_offset: usize,
        destination_offset: usize,
        len: usize,
    },
}

impl SlotCopy {
    /// Destination slot of the copy
    pub fn heap_slot(&self) -> u32 {
        match *self {
            Self::Tile { heap_slot, .. } | Self::PackedSubresource { heap_slot, .. } => heap_slot,
        }
    }
}

/// Device that owns tiled resources and their physical backing.
///
/// Methods record work; nothing is guaranteed to have executed until
/// [`BackingDevice::submit`] returns.
pub trait BackingDevice: Send + Sync {
    /// Report how a resource of the given size would be tiled
    fn resource_tiling(
        &self,
        width: u32,
        height: u32,
        mip_count: u32,
        format: PixelFormat,
    ) -> TextureResult<ResourceTiling>;

    /// Create a fixed-capacity backing store of `capacity_tiles` tiles
    fn create_backing_store(&self, capacity_tiles: u32) -> TextureResult<BackingStoreId>;

    /// Bind regions to heap ranges
    fn map_slots(&self, store: BackingStoreId, batch: &[TileMapping]) -> TextureResult<()>;

    /// Unbind regions
    fn unmap_slots(&self, store: BackingStoreId, batch: &[TileMapping]) -> TextureResult<()>;

    /// Copy staged data into a mapped slot
    fn copy_into_slot(
        &self,
        store: BackingStoreId,
        copy: &SlotCopy,
        staging: &StagingBlock,
    ) -> TextureResult<()>;

    /// Flush recorded work to the execution queue
    fn submit(&self) -> TextureResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
enum DeviceCommand {
    Map {
        store: BackingStoreId,
        batch: MappingBatch,
    },
    Copy {
        store: BackingStoreId,
        copy: SlotCopy,
        data: Vec<u8>,
    },
}

struct BackingStore {
    capacity_tiles: u32,
    memory: Vec<u8>,
    /// Bound tiles: resource tile -> heap tile
    bindings: AHashMap<TileCoordinate, u32>,
    /// Heap tiles currently bound by at least one resource tile
    bound_slots: AHashMap<u32, u32>,
}

impl BackingStore {
    fn bind(&mut self, coordinate: TileCoordinate, slot: u32) {
        if let Some(previous) = self.bindings.insert(coordinate, slot) {
            self.release_slot(previous);
        }
        *self.bound_slots.entry(slot).or_insert(0) += 1;
    }

    fn unbind(&mut self, coordinate: &TileCoordinate) {
        if let Some(slot) = self.bindings.remove(coordinate) {
            self.release_slot(slot);
        }
    }

    fn release_slot(&mut self, slot: u32) {
        if let Some(count) = self.bound_slots.get_mut(&slot) {
            *count -= 1;
            if *count == 0 {
                self.bound_slots.remove(&slot);
            }
        }
    }
}

#[derive(Default)]
struct DeviceState {
    stores: Vec<BackingStore>,
    executed: u64,
    faults: u64,
}

/// Host-memory device with an in-order command queue
pub struct SoftwareDevice {
    sender: Sender<DeviceCommand>,
    receiver: Receiver<DeviceCommand>,
    state: Mutex<DeviceState>,
    supports_tiling: bool,
}

impl SoftwareDevice {
    /// Create a device that supports tiled resources
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            state: Mutex::new(DeviceState::default()),
            supports_tiling: true,
        }
    }

    /// Create a device that rejects tiled resources
    pub fn without_tiling() -> Self {
        Self {
            supports_tiling: false,
            ..Self::new()
        }
    }

    /// Execute every queued command in submission order
    pub fn execute_pending(&self) -> usize {
        let mut state = self.state.lock();
        let mut executed = 0;

        while let Ok(command) = self.receiver.try_recv() {
            Self::execute(&mut state, command);
            executed += 1;
        }

        state.executed += executed as u64;
        executed
    }

    fn execute(state: &mut DeviceState, command: DeviceCommand) {
        match command {
            DeviceCommand::Map { store, batch } => {
                let Some(store) = state.stores.get_mut(store.0 as usize) else {
                    state.faults += 1;
                    return;
                };
                for mapping in &batch {
                    Self::apply_mapping(store, mapping);
                }
            }
            DeviceCommand::Copy { store, copy, data } => {
                let fault = match state.stores.get_mut(store.0 as usize) {
                    Some(store) => !Self::apply_copy(store, &copy, &data),
                    None => true,
                };
                if fault {
                    match copy {
                        SlotCopy::Tile { coordinate, .. } => log::error!(
                            "Tile copy for {:?} into slot {} failed",
                            coordinate,
                            copy.heap_slot()
                        ),
                        SlotCopy::PackedSubresource { mip, .. } => log::error!(
                            "Packed copy for mip {} into slot {} failed",
                            mip,
                            copy.heap_slot()
                        ),
                    }
                    state.faults += 1;
                }
            }
        }
    }

    fn region_tiles(mapping: &TileMapping) -> SmallVec<[TileCoordinate; 4]> {
        let start = mapping.coordinate;
        match mapping.region {
            RegionDescriptor::Box {
                width,
                height,
                depth,
                ..
            } => {
                let mut tiles = SmallVec::new();
                for z in 0..depth {
                    for y in 0..height {
                        for x in 0..width {
                            tiles.push(TileCoordinate::new(
                                start.x + x,
                                start.y + y,
                                start.z + z,
                                start.mip,
                            ));
                        }
                    }
                }
                tiles
            }
            // Packed tiles are addressed linearly from the region start
            RegionDescriptor::Flat { tile_count } => (0..tile_count)
                .map(|i| TileCoordinate::new(start.x + i, start.y, start.z, start.mip))
                .collect(),
        }
    }

    fn apply_mapping(store: &mut BackingStore, mapping: &TileMapping) {
        if mapping.flags.contains(TileRangeFlags::SKIP) {
            return;
        }
        for (i, tile) in Self::region_tiles(mapping).into_iter().enumerate() {
            if mapping.flags.contains(TileRangeFlags::NULL) {
                store.unbind(&tile);
                continue;
            }
            let slot = if mapping.flags.contains(TileRangeFlags::REUSE_SINGLE_TILE) {
                mapping.heap_slot
            } else {
                mapping.heap_slot + i as u32
            };
            if slot < store.capacity_tiles {
                store.bind(tile, slot);
            }
        }
    }

    fn apply_copy(store: &mut BackingStore, copy: &SlotCopy, data: &[u8]) -> bool {
        let slot = copy.heap_slot();
        if !store.bound_slots.contains_key(&slot) {
            return false;
        }

        let base = slot as usize * TILE_SIZE_IN_BYTES;
        match *copy {
            SlotCopy::Tile {
                extent,
                bytes_per_pixel,
                row_pitch,
                ..
            } => {
                let row_pitch = row_pitch as usize;
                let row_bytes = (extent.x * bytes_per_pixel) as usize;
                if row_bytes > row_pitch || row_pitch * extent.y as usize > TILE_SIZE_IN_BYTES {
                    return false;
                }
                for row in 0..extent.y as usize {
                    let start = row * row_pitch;
                    let (Some(source), Some(target)) = (
                        data.get(start..start + row_bytes),
                        store.memory.get_mut(base + start..base + start + row_bytes),
                    ) else {
                        return false;
                    };
                    target.copy_from_slice(source);
                }
                true
            }
            SlotCopy::PackedSubresource {
                source_offset,
                destination_offset,
                len,
                ..
            } => {
                let end = (source_offset + len).min(data.len());
                let bytes = &data[source_offset.min(end)..end];
                let offset = base + destination_offset;
                let end = (offset + bytes.len()).min(store.memory.len());
                if offset >= end {
                    return false;
                }
                store.memory[offset..end].copy_from_slice(&bytes[..end - offset]);
                true
            }
        }
    }

    /// Bytes of backing memory starting at `slot`
    pub fn slot_contents(&self, store: BackingStoreId, slot: u32, len: usize) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let store = state.stores.get(store.0 as usize)?;
        let start = slot as usize * TILE_SIZE_IN_BYTES;
        store.memory.get(start..start + len).map(|bytes| bytes.to_vec())
    }

    /// Whether a resource tile is currently bound
    pub fn is_tile_mapped(&self, store: BackingStoreId, coordinate: TileCoordinate) -> bool {
        let state = self.state.lock();
        state
            .stores
            .get(store.0 as usize)
            .is_some_and(|store| store.bindings.contains_key(&coordinate))
    }

    /// Whether any resource tile is bound to `slot`
    pub fn is_slot_mapped(&self, store: BackingStoreId, slot: u32) -> bool {
        let state = self.state.lock();
        state
            .stores
            .get(store.0 as usize)
            .is_some_and(|store| store.bound_slots.contains_key(&slot))
    }

    /// Number of bound resource tiles
    pub fn mapped_tile_count(&self, store: BackingStoreId) -> usize {
        let state = self.state.lock();
        state
            .stores
            .get(store.0 as usize)
            .map_or(0, |store| store.bindings.len())
    }

    /// Commands executed so far
    pub fn command_count(&self) -> u64 {
        self.state.lock().executed
    }

    /// Commands recorded but not yet executed
    pub fn pending_commands(&self) -> usize {
        self.receiver.len()
    }

    /// Copies that targeted unbound memory
    pub fn fault_count(&self) -> u64 {
        self.state.lock().faults
    }

    fn enqueue(&self, command: DeviceCommand) -> TextureResult<()> {
        self.sender
            .send(command)
            .map_err(|_| TextureError::Device("command queue closed".to_string()))
    }

    fn check_store(&self, store: BackingStoreId) -> TextureResult<()> {
        if (store.0 as usize) < self.state.lock().stores.len() {
            Ok(())
        } else {
            Err(TextureError::Device(format!("unknown backing store {}", store.0)))
        }
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingDevice for SoftwareDevice {
    fn resource_tiling(
        &self,
        width: u32,
        height: u32,
        mip_count: u32,
        format: PixelFormat,
    ) -> TextureResult<ResourceTiling> {
        if !self.supports_tiling {
            return Err(TextureError::TilingUnsupported);
        }
        let tiling = ResourceTiling::standard(width, height, format);
        if tiling.standard_mip_count + tiling.packed_mip_count != mip_count {
            return Err(TextureError::InvalidTiling(format!(
                "requested {} mips for a {}x{} resource",
                mip_count, width, height
            )));
        }
        Ok(tiling)
    }

    fn create_backing_store(&self, capacity_tiles: u32) -> TextureResult<BackingStoreId> {
        let mut state = self.state.lock();
        let id = BackingStoreId(state.stores.len() as u32);
        state.stores.push(BackingStore {
            capacity_tiles,
            memory: vec![0; capacity_tiles as usize * TILE_SIZE_IN_BYTES],
            bindings: AHashMap::new(),
            bound_slots: AHashMap::new(),
        });
        log::debug!(
            "Created backing store {} with {} tiles ({} bytes)",
            id.0,
            capacity_tiles,
            capacity_tiles as usize * TILE_SIZE_IN_BYTES
        );
        Ok(id)
    }

    fn map_slots(&self, store: BackingStoreId, batch: &[TileMapping]) -> TextureResult<()> {
        self.check_store(store)?;
        self.enqueue(DeviceCommand::Map {
            store,
            batch: batch.iter().copied().collect(),
        })
    }

    fn unmap_slots(&self, store: BackingStoreId, batch: &[TileMapping]) -> TextureResult<()> {
        self.check_store(store)?;
        self.enqueue(DeviceCommand::Map {
            store,
            batch: batch
                .iter()
                .map(|mapping| TileMapping {
                    flags: mapping.flags | TileRangeFlags::NULL,
                    ..*mapping
                })
                .collect(),
        })
    }

    fn copy_into_slot(
        &self,
        store: BackingStoreId,
        copy: &SlotCopy,
        staging: &StagingBlock,
    ) -> TextureResult<()> {
        self.check_store(store)?;
        let data = staging.read(|bytes| bytes.to_vec());
        self.enqueue(DeviceCommand::Copy {
            store,
            copy: *copy,
            data,
        })
    }

    fn submit(&self) -> TextureResult<()> {
        self.execute_pending();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilestream_core::{HostPageAllocator, MemoryBudget};

    fn mapping(x: u32, y: u32, slot: u32) -> TileMapping {
        TileMapping {
            coordinate: TileCoordinate::new(x, y, 0, 0),
            region: RegionDescriptor::SINGLE_TILE,
            heap_slot: slot,
            tile_count: 1,
            flags: TileRangeFlags::empty(),
        }
    }

    #[test]
    fn test_standard_tiling_4096() {
        let tiling = ResourceTiling::standard(4096, 4096, PixelFormat::Rgba8Unorm);
        assert_eq!(tiling.tile_shape, UVec3::new(128, 128, 1));
        assert_eq!(tiling.standard_mip_count, 6);
        assert_eq!(tiling.packed_mip_count, 7);
        assert_eq!(tiling.packed_tile_count, 1);
        assert_eq!(tiling.subresources[0].extent(), UVec3::new(32, 32, 1));
    }

    #[test]
    fn test_small_texture_is_fully_packed() {
        let tiling = ResourceTiling::standard(64, 64, PixelFormat::Rgba8Unorm);
        assert_eq!(tiling.standard_mip_count, 0);
        assert_eq!(tiling.packed_mip_count, 7);
        assert_eq!(tiling.packed_tile_count, 1);
    }

    #[test]
    fn test_tiling_unsupported() {
        let device = SoftwareDevice::without_tiling();
        assert!(matches!(
            device.resource_tiling(256, 256, 9, PixelFormat::Rgba8Unorm),
            Err(TextureError::TilingUnsupported)
        ));
    }

    #[test]
    fn test_commands_execute_on_submit() {
        let device = SoftwareDevice::new();
        let store = device.create_backing_store(4).unwrap();

        device.map_slots(store, &[mapping(0, 0, 2)]).unwrap();
        assert_eq!(device.pending_commands(), 1);
        assert!(!device.is_slot_mapped(store, 2));

        device.submit().unwrap();
        assert!(device.is_slot_mapped(store, 2));
        assert!(device.is_tile_mapped(store, TileCoordinate::new(0, 0, 0, 0)));
        assert_eq!(device.command_count(), 1);

        device.unmap_slots(store, &[mapping(0, 0, 2)]).unwrap();
        device.submit().unwrap();
        assert!(!device.is_slot_mapped(store, 2));
        assert_eq!(device.mapped_tile_count(store), 0);
    }

    #[test]
    fn test_copy_lands_in_slot() {
        let device = SoftwareDevice::new();
        let store = device.create_backing_store(2).unwrap();
        let pool = HostPageAllocator::new(16, MemoryBudget::for_blocks(16, 1));

        let mut block = pool.allocate(4).unwrap();
        block.write(&[9, 8, 7, 6]).unwrap();

        device.map_slots(store, &[mapping(1, 0, 1)]).unwrap();
        device
            .copy_into_slot(
                store,
                &SlotCopy::Tile {
                    heap_slot: 1,
                    coordinate: TileCoordinate::new(1, 0, 0, 0),
                    extent: UVec2::new(1, 1),
                    bytes_per_pixel: 4,
                    row_pitch: 4,
                },
                &block,
            )
            .unwrap();
        device.submit().unwrap();

        assert_eq!(device.slot_contents(store, 1, 4), Some(vec![9, 8, 7, 6]));
        assert_eq!(device.fault_count(), 0);
    }

    #[test]
    fn test_tile_copy_skips_texels_past_extent() {
        let device = SoftwareDevice::new();
        let store = device.create_backing_store(1).unwrap();
        let pool = HostPageAllocator::new(16, MemoryBudget::for_blocks(16, 1));

        // Two rows of two RGBA texels; only the first texel of each is valid
        let mut block = pool.allocate(16).unwrap();
        block.write(&(1..=16).collect::<Vec<u8>>()).unwrap();

        device.map_slots(store, &[mapping(0, 0, 0)]).unwrap();
        device
            .copy_into_slot(
                store,
                &SlotCopy::Tile {
                    heap_slot: 0,
                    coordinate: TileCoordinate::new(0, 0, 0, 0),
                    extent: UVec2::new(1, 2),
                    bytes_per_pixel: 4,
                    row_pitch: 8,
                },
                &block,
            )
            .unwrap();
        device.submit().unwrap();

        assert_eq!(
            device.slot_contents(store, 0, 16),
            Some(vec![1, 2, 3, 4, 0, 0, 0, 0, 9, 10, 11, 12, 0, 0, 0, 0])
        );
        assert_eq!(device.fault_count(), 0);
    }

    #[test]
    fn test_copy_into_unmapped_slot_faults() {
        let device = SoftwareDevice::new();
        let store = device.create_backing_store(1).unwrap();
        let pool = HostPageAllocator::new(16, MemoryBudget::for_blocks(16, 1));
        let block = pool.allocate(4).unwrap();

        device
            .copy_into_slot(
                store,
                &SlotCopy::PackedSubresource {
                    heap_slot: 0,
                    mip: 0,
                    source_offset: 0,
                    destination_offset: 0,
                    len: 4,
                },
                &block,
            )
            .unwrap();
        device.submit().unwrap();
        assert_eq!(device.fault_count(), 1);
    }

    #[test]
    fn test_unknown_store_rejected() {
        let device = SoftwareDevice::new();
        assert!(matches!(
            device.map_slots(BackingStoreId(3), &[mapping(0, 0, 0)]),
            Err(TextureError::Device(_))
        ));
    }

    #[test]
    fn test_flat_region_binds_consecutive_slots() {
        let device = SoftwareDevice::new();
        let store = device.create_backing_store(4).unwrap();

        device
            .map_slots(
                store,
                &[TileMapping {
                    coordinate: TileCoordinate::new(0, 0, 0, 5),
                    region: RegionDescriptor::Flat { tile_count: 2 },
                    heap_slot: 1,
                    tile_count: 2,
                    flags: TileRangeFlags::empty(),
                }],
            )
            .unwrap();
        device.submit().unwrap();

        assert!(device.is_slot_mapped(store, 1));
        assert!(device.is_slot_mapped(store, 2));
        assert!(!device.is_slot_mapped(store, 3));
    }
}
