//! Consumer-side view of the virtual texture
//!
//! The renderer needs a handful of constants per draw plus a way to turn a
//! virtual coordinate into a resident page. Pages that are not resident
//! resolve to the nearest coarser resident page, ending at the packed
//! aggregate.

use glam::{UVec2, Vec2};
use serde::Serialize;

use crate::descriptor::VirtualTextureDescriptor;

/// Per-draw constants read by the sampling shader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShaderConstants {
    pub mip_count: u32,
    /// Forced mip of the legacy whole-mip mode
    pub active_mip: u32,
    pub virtual_width: u32,
    pub virtual_height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
}

impl ShaderConstants {
    pub fn from_descriptor(descriptor: &VirtualTextureDescriptor) -> Self {
        Self {
            mip_count: descriptor.mip_count(),
            active_mip: descriptor.active_mip(),
            virtual_width: descriptor.virtual_width(),
            virtual_height: descriptor.virtual_height(),
            tile_width: descriptor.tile_width(),
            tile_height: descriptor.tile_height(),
        }
    }
}

/// Resident page found for a virtual coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub page: usize,
    /// Mip the page belongs to
    pub mip: u32,
    pub heap_slot: u32,
    /// Texel position inside `mip`
    pub texel: UVec2,
    /// Whether a coarser mip stood in for the requested one
    pub fallback: bool,
}

/// Read-only lookup from virtual coordinates to resident pages
pub struct IndirectionTable<'a> {
    descriptor: &'a VirtualTextureDescriptor,
}

impl<'a> IndirectionTable<'a> {
    pub fn new(descriptor: &'a VirtualTextureDescriptor) -> Self {
        Self { descriptor }
    }

    /// Resolve normalized `uv` at `mip`.
    ///
    /// Coordinates are clamped to the image. Returns `None` only when no
    /// page on the path to the coarsest mip is resident.
    pub fn resolve(&self, uv: Vec2, mip: u32) -> Option<Resolution> {
        let mip_count = self.descriptor.mip_count();
        if mip_count == 0 {
            return None;
        }
        let requested = mip.min(mip_count - 1);
        let uv = uv.clamp(Vec2::ZERO, Vec2::ONE);
        let table = self.descriptor.page_table();
        let tile_size = UVec2::new(self.descriptor.tile_width(), self.descriptor.tile_height());

        for level in requested..mip_count {
            let info = table.mip(level)?;
            let max_texel = info.extent.saturating_sub(UVec2::ONE);
            let texel = (uv * info.extent.as_vec2()).as_uvec2().min(max_texel);

            let index = if info.is_packed {
                table.packed_page_index()
            } else {
                let tile = texel / tile_size;
                table.page_index_at(level, tile.x, tile.y)
            };

            let Some(index) = index else {
                continue;
            };
            let Some(page) = table.page(index) else {
                continue;
            };
            if page.is_resident() {
                return Some(Resolution {
                    page: index,
                    mip: level,
                    heap_slot: page.heap_slot(),
                    texel,
                    fallback: level != requested,
                });
            }
        }
        None
    }

    /// Resolve at the descriptor's active mip
    pub fn resolve_active(&self, uv: Vec2) -> Option<Resolution> {
        self.resolve(uv, self.descriptor.active_mip())
    }
}
