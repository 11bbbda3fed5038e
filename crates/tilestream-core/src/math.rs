//! Math utilities
//!
//! Re-exports from glam and the integer helpers used to tile a mip chain.

pub use glam::{UVec2, UVec3};

/// Number of mip levels for an image, halving until both dimensions reach 1.
///
/// Returns 0 for a degenerate (zero-sized) image.
pub fn mip_count(width: u32, height: u32) -> u32 {
    if width == 0 || height == 0 {
        return 0;
    }
    32 - width.max(height).leading_zeros()
}

/// Extent of a given mip level, never smaller than one texel per axis
pub fn mip_extent(base: UVec3, mip: u32) -> UVec3 {
    if mip >= 32 {
        return UVec3::ONE;
    }
    UVec3::new(base.x >> mip, base.y >> mip, base.z >> mip).max(UVec3::ONE)
}

/// Integer division rounding up
#[inline]
pub fn div_round_up(value: u32, multiple: u32) -> u32 {
    value.div_ceil(multiple)
}

/// Number of tiles needed to cover `extent` with tiles of `granularity` texels
pub fn tiles_for_extent(extent: UVec3, granularity: UVec3) -> UVec3 {
    UVec3::new(
        div_round_up(extent.x, granularity.x),
        div_round_up(extent.y, granularity.y),
        div_round_up(extent.z, granularity.z),
    )
}

/// Texel extent of the last tile along each axis.
///
/// A full tile when the extent is an exact multiple of the granularity.
pub fn last_tile_extent(extent: UVec3, granularity: UVec3) -> UVec3 {
    let rem = |e: u32, g: u32| if e % g != 0 { e % g } else { g };
    UVec3::new(
        rem(extent.x, granularity.x),
        rem(extent.y, granularity.y),
        rem(extent.z, granularity.z),
    )
}
