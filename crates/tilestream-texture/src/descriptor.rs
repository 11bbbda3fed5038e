//! Virtual texture geometry and page table
//!
//! The descriptor is built once from the declared image size and the tiling
//! reported by the backing device. It owns the page table: one [`Page`] per
//! tile of each standard mip, plus a single aggregate page standing in for
//! every packed mip. Pages are never created or destroyed afterwards; only
//! their residency state and staging ownership change.

use std::ops::Range;

use glam::{UVec2, UVec3};
use tilestream_core::StagingBlock;
use tilestream_core::math;

use crate::device::{BackingDevice, ResourceTiling};
use crate::format::{PixelFormat, TILE_SIZE_IN_BYTES};
use crate::heap::{self, HeapLayout};
use crate::{TextureError, TextureResult};

/// Position of a tile in the tile grid of one mip level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoordinate {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    /// Mip level (subresource index)
    pub mip: u32,
}

impl TileCoordinate {
    pub fn new(x: u32, y: u32, z: u32, mip: u32) -> Self {
        Self { x, y, z, mip }
    }
}

/// Extent of a mapped region, in tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionDescriptor {
    /// A box of tiles starting at the page coordinate
    Box {
        width: u32,
        height: u32,
        depth: u32,
        tile_count: u32,
    },
    /// A run of tiles with no box semantics (packed mips)
    Flat { tile_count: u32 },
}

impl RegionDescriptor {
    /// Region covering exactly one tile
    pub const SINGLE_TILE: Self = Self::Box {
        width: 1,
        height: 1,
        depth: 1,
        tile_count: 1,
    };

    /// Number of tiles covered by the region
    pub fn tile_count(&self) -> u32 {
        match *self {
            Self::Box { tile_count, .. } | Self::Flat { tile_count } => tile_count,
        }
    }
}

/// Byte layout of one packed sub-mip inside the packed aggregate's data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedFootprint {
    pub mip: u32,
    pub width: u32,
    pub height: u32,
    /// Offset from the start of the aggregate's data
    pub offset: usize,
    pub len: usize,
}

/// What a page covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageKind {
    /// One tile of a standard mip
    Standard {
        /// Tile grid position
        tile: UVec2,
        /// Texels of the tile inside the mip (smaller on the last row/column)
        valid_extent: UVec2,
    },
    /// Every packed mip, paged as one unit
    Packed {
        first_mip: u32,
        sub_mip_count: u32,
        tile_count: u32,
    },
}

/// Residency of a page's data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResidencyState {
    /// No data, no mapping
    Unloaded,
    /// Data staged on the host, mapping and copy being recorded
    Staging,
    /// Mapped and copied; readable by the consumer
    Resident,
}

/// One demand-loadable unit of the virtual image
#[derive(Debug)]
pub struct Page {
    coordinate: TileCoordinate,
    kind: PageKind,
    heap_slot: u32,
    state: ResidencyState,
    staging: Option<StagingBlock>,
}

impl Page {
    fn new(coordinate: TileCoordinate, kind: PageKind) -> Self {
        Self {
            coordinate,
            kind,
            heap_slot: 0,
            state: ResidencyState::Unloaded,
            staging: None,
        }
    }

    /// Resource tile this page starts at
    pub fn coordinate(&self) -> TileCoordinate {
        self.coordinate
    }

    /// Standard tile or packed aggregate
    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    /// Mapped region for this page
    pub fn region(&self) -> RegionDescriptor {
        match self.kind {
            PageKind::Standard { .. } => RegionDescriptor::SINGLE_TILE,
            PageKind::Packed { tile_count, .. } => RegionDescriptor::Flat { tile_count },
        }
    }

    /// Number of heap tiles backing this page
    pub fn tile_count(&self) -> u32 {
        self.region().tile_count()
    }

    /// First tile of this page's slot in the backing store
    pub fn heap_slot(&self) -> u32 {
        self.heap_slot
    }

    /// Current residency state
    pub fn state(&self) -> ResidencyState {
        self.state
    }

    /// Whether this is the packed mip aggregate
    pub fn is_packed(&self) -> bool {
        matches!(self.kind, PageKind::Packed { .. })
    }

    pub fn is_resident(&self) -> bool {
        self.state == ResidencyState::Resident
    }

    /// Staging memory owned by this page, if any
    pub fn staging(&self) -> Option<&StagingBlock> {
        self.staging.as_ref()
    }

    pub(crate) fn assign_heap_slot(&mut self, slot: u32) {
        self.heap_slot = slot;
    }

    /// Unloaded -> Staging, taking ownership of the staged data
    pub(crate) fn begin_staging(&mut self, block: StagingBlock) {
        debug_assert_eq!(self.state, ResidencyState::Unloaded);
        self.staging = Some(block);
        self.state = ResidencyState::Staging;
    }

    /// Staging -> Resident
    pub(crate) fn commit(&mut self) {
        debug_assert_eq!(self.state, ResidencyState::Staging);
        self.state = ResidencyState::Resident;
    }

    /// Any state -> Unloaded, handing back the staging block
    pub(crate) fn evict(&mut self) -> Option<StagingBlock> {
        self.state = ResidencyState::Unloaded;
        self.staging.take()
    }
}

/// Per-mip metadata
#[derive(Debug, Clone)]
pub struct MipInfo {
    /// Heap range this mip draws from; shared by all packed mips
    pub heap_range_index: u32,
    pub is_packed: bool,
    /// Whole-mip mapping state (legacy whole-mip mode)
    pub is_mapped: bool,
    /// Start of the region when the mip is mapped as a unit
    pub base_coordinate: TileCoordinate,
    /// Region when the mip is mapped as a unit
    pub region: RegionDescriptor,
    /// Texel extent of the mip
    pub extent: UVec2,
    /// Tile grid size (zero for packed mips)
    pub tiles: UVec2,
    /// Page indices belonging to this mip
    pub pages: Range<usize>,
}

/// All pages and mip records of one virtual texture
#[derive(Debug)]
pub struct PageTable {
    pages: Vec<Page>,
    mips: Vec<MipInfo>,
    packed_page: Option<usize>,
}

impl PageTable {
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page(&self, index: usize) -> Option<&Page> {
        self.pages.get(index)
    }

    pub(crate) fn page_mut(&mut self, index: usize) -> Option<&mut Page> {
        self.pages.get_mut(index)
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn mips(&self) -> &[MipInfo] {
        &self.mips
    }

    pub fn mip(&self, mip: u32) -> Option<&MipInfo> {
        self.mips.get(mip as usize)
    }

    pub(crate) fn mip_mut(&mut self, mip: u32) -> Option<&mut MipInfo> {
        self.mips.get_mut(mip as usize)
    }

    /// Index of the packed aggregate page, if the texture has packed mips
    pub fn packed_page_index(&self) -> Option<usize> {
        self.packed_page
    }

    /// Page covering tile (x, y) of `mip`. Every packed mip maps to the aggregate.
    pub fn page_index_at(&self, mip: u32, x: u32, y: u32) -> Option<usize> {
        let info = self.mip(mip)?;
        if info.is_packed {
            return self.packed_page;
        }
        if x >= info.tiles.x || y >= info.tiles.y {
            return None;
        }
        Some(info.pages.start + (y * info.tiles.x + x) as usize)
    }

    /// Page indices belonging to `mip`
    pub fn pages_in_mip(&self, mip: u32) -> Range<usize> {
        self.mip(mip).map(|info| info.pages.clone()).unwrap_or(0..0)
    }

    /// Number of pages currently in `state`
    pub fn count_in_state(&self, state: ResidencyState) -> usize {
        self.pages.iter().filter(|page| page.state == state).count()
    }
}

/// Static geometry of a virtual texture plus its page table
#[derive(Debug)]
pub struct VirtualTextureDescriptor {
    virtual_width: u32,
    virtual_height: u32,
    format: PixelFormat,
    tile_shape: UVec3,
    mip_count: u32,
    packed_mip_count: u32,
    active_mip: u32,
    active_mip_changed: bool,
    page_table: PageTable,
    heap_layout: HeapLayout,
    packed_footprints: Vec<PackedFootprint>,
}

impl VirtualTextureDescriptor {
    /// Query the device for tiling information and build the descriptor
    pub fn from_device(
        device: &dyn BackingDevice,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> TextureResult<Self> {
        let mip_count = math::mip_count(width, height);
        if mip_count == 0 {
            return Err(TextureError::InvalidDimensions { width, height });
        }
        let tiling = device.resource_tiling(width, height, mip_count, format)?;
        Self::new(width, height, format, &tiling)
    }

    /// Build the descriptor from an already-reported tiling
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        tiling: &ResourceTiling,
    ) -> TextureResult<Self> {
        let mip_count = math::mip_count(width, height);
        if mip_count == 0 {
            return Err(TextureError::InvalidDimensions { width, height });
        }

        let tile_shape = tiling.tile_shape;
        if tile_shape.cmpeq(UVec3::ZERO).any() {
            return Err(TextureError::InvalidTiling(format!(
                "tile shape {} has a zero dimension",
                tile_shape
            )));
        }
        if tiling.standard_mip_count + tiling.packed_mip_count != mip_count {
            return Err(TextureError::InvalidTiling(format!(
                "{} standard + {} packed mips does not match {} mips",
                tiling.standard_mip_count, tiling.packed_mip_count, mip_count
            )));
        }
        if tiling.packed_mip_count > 0 && tiling.packed_tile_count == 0 {
            return Err(TextureError::ZeroPackedTiles {
                packed_mip_count: tiling.packed_mip_count,
            });
        }
        if (tiling.subresources.len() as u32) < tiling.standard_mip_count {
            return Err(TextureError::InvalidTiling(format!(
                "{} subresource tilings reported for {} standard mips",
                tiling.subresources.len(),
                tiling.standard_mip_count
            )));
        }

        let base = UVec3::new(width, height, 1);
        let standard = tiling.standard_mip_count;
        let bytes_per_pixel = format.bytes_per_pixel() as usize;

        let mut pages = Vec::new();
        let mut mips = Vec::with_capacity(mip_count as usize);

        for mip in 0..standard {
            let extent = math::mip_extent(base, mip);
            let tiles = math::tiles_for_extent(extent, tile_shape);
            let reported = &tiling.subresources[mip as usize];
            if reported.extent() != tiles {
                return Err(TextureError::InvalidTiling(format!(
                    "mip {} reported {} tiles, expected {}",
                    mip,
                    reported.extent(),
                    tiles
                )));
            }

            let last = math::last_tile_extent(extent, tile_shape);
            let first_page = pages.len();

            for y in 0..tiles.y {
                for x in 0..tiles.x {
                    let valid_extent = UVec2::new(
                        if x == tiles.x - 1 { last.x } else { tile_shape.x },
                        if y == tiles.y - 1 { last.y } else { tile_shape.y },
                    );
                    pages.push(Page::new(
                        TileCoordinate::new(x, y, 0, mip),
                        PageKind::Standard {
                            tile: UVec2::new(x, y),
                            valid_extent,
                        },
                    ));
                }
            }

            mips.push(MipInfo {
                heap_range_index: mip,
                is_packed: false,
                is_mapped: false,
                base_coordinate: TileCoordinate::new(0, 0, 0, mip),
                region: RegionDescriptor::Box {
                    width: tiles.x,
                    height: tiles.y,
                    depth: tiles.z,
                    tile_count: tiles.x * tiles.y * tiles.z,
                },
                extent: extent.truncate(),
                tiles: tiles.truncate(),
                pages: first_page..pages.len(),
            });
        }

        let mut packed_page = None;
        let mut packed_footprints = Vec::new();

        if tiling.packed_mip_count > 0 {
            let mut offset = 0;
            for mip in standard..mip_count {
                let extent = math::mip_extent(base, mip);
                let len = (extent.x * extent.y) as usize * bytes_per_pixel;
                packed_footprints.push(PackedFootprint {
                    mip,
                    width: extent.x,
                    height: extent.y,
                    offset,
                    len,
                });
                offset += len;
            }

            let capacity = tiling.packed_tile_count as usize * TILE_SIZE_IN_BYTES;
            if offset > capacity {
                return Err(TextureError::InvalidTiling(format!(
                    "packed mips need {} bytes but {} tiles hold {}",
                    offset, tiling.packed_tile_count, capacity
                )));
            }

            let index = pages.len();
            pages.push(Page::new(
                TileCoordinate::new(0, 0, 0, standard),
                PageKind::Packed {
                    first_mip: standard,
                    sub_mip_count: tiling.packed_mip_count,
                    tile_count: tiling.packed_tile_count,
                },
            ));
            packed_page = Some(index);

            for mip in standard..mip_count {
                let extent = math::mip_extent(base, mip);
                mips.push(MipInfo {
                    heap_range_index: standard,
                    is_packed: true,
                    is_mapped: false,
                    base_coordinate: TileCoordinate::new(0, 0, 0, standard),
                    region: RegionDescriptor::Flat {
                        tile_count: tiling.packed_tile_count,
                    },
                    extent: extent.truncate(),
                    tiles: UVec2::ZERO,
                    pages: index..index + 1,
                });
            }
        }

        let heap_layout = heap::assign_slots(&mut pages, &mips);

        log::debug!(
            "Virtual texture {}x{} {:?}: {} mips ({} packed), {} pages, {} heap tiles",
            width,
            height,
            format,
            mip_count,
            tiling.packed_mip_count,
            pages.len(),
            heap_layout.capacity_tiles()
        );

        Ok(Self {
            virtual_width: width,
            virtual_height: height,
            format,
            tile_shape,
            mip_count,
            packed_mip_count: tiling.packed_mip_count,
            // Least detailed mip first
            active_mip: mip_count - 1,
            active_mip_changed: true,
            page_table: PageTable {
                pages,
                mips,
                packed_page,
            },
            heap_layout,
            packed_footprints,
        })
    }

    pub fn virtual_width(&self) -> u32 {
        self.virtual_width
    }

    pub fn virtual_height(&self) -> u32 {
        self.virtual_height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn tile_width(&self) -> u32 {
        self.tile_shape.x
    }

    pub fn tile_height(&self) -> u32 {
        self.tile_shape.y
    }

    pub fn tile_shape(&self) -> UVec3 {
        self.tile_shape
    }

    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }

    pub fn packed_mip_count(&self) -> u32 {
        self.packed_mip_count
    }

    pub fn standard_mip_count(&self) -> u32 {
        self.mip_count - self.packed_mip_count
    }

    /// Forced coarse mip of the legacy whole-mip mode
    pub fn active_mip(&self) -> u32 {
        self.active_mip
    }

    /// Whether the active mip moved since the last whole-mip update
    pub fn active_mip_changed(&self) -> bool {
        self.active_mip_changed
    }

    pub(crate) fn clear_active_mip_changed(&mut self) {
        self.active_mip_changed = false;
    }

    /// Step the active mip one level coarser, clamped at the last mip.
    ///
    /// Returns whether the level changed.
    pub fn level_up(&mut self) -> bool {
        if self.active_mip + 1 < self.mip_count {
            self.active_mip += 1;
            self.active_mip_changed = true;
            true
        } else {
            false
        }
    }

    /// Step the active mip one level finer, clamped at mip 0
    pub fn level_down(&mut self) -> bool {
        if self.active_mip > 0 {
            self.active_mip -= 1;
            self.active_mip_changed = true;
            true
        } else {
            false
        }
    }

    /// Page table built for this texture
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub(crate) fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    /// Heap slot layout computed at construction
    pub fn heap_layout(&self) -> &HeapLayout {
        &self.heap_layout
    }

    /// Byte layout of the packed sub-mips inside the aggregate page's data
    pub fn packed_footprints(&self) -> &[PackedFootprint] {
        &self.packed_footprints
    }

    /// Bytes of pixel data for one standard tile
    pub fn tile_size_in_bytes(&self) -> usize {
        (self.tile_shape.x * self.tile_shape.y * self.tile_shape.z) as usize
            * self.format.bytes_per_pixel() as usize
    }

    /// Bytes of content the generator must produce for a page
    pub fn page_content_len(&self, page: &Page) -> usize {
        match page.kind() {
            PageKind::Standard { .. } => self.tile_size_in_bytes(),
            PageKind::Packed { tile_count, .. } => *tile_count as usize * TILE_SIZE_IN_BYTES,
        }
    }
}
