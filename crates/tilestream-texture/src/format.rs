//! Pixel formats and tile granularity

use serde::{Deserialize, Serialize};
use tilestream_core::math::UVec3;

/// Size of one tile of backing memory in bytes (64 KiB)
pub const TILE_SIZE_IN_BYTES: usize = 64 * 1024;

/// Texel formats a virtual texture can be created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    R8Unorm,
    Rg8Unorm,
    #[default]
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
}

impl PixelFormat {
    /// Bytes per texel
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rg8Unorm => 2,
            Self::Rgba8Unorm => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }

    /// Texel dimensions of one 64 KiB tile for this format
    pub fn standard_tile_shape(&self) -> UVec3 {
        match self.bytes_per_pixel() {
            1 => UVec3::new(256, 256, 1),
            2 => UVec3::new(256, 128, 1),
            4 => UVec3::new(128, 128, 1),
            8 => UVec3::new(128, 64, 1),
            _ => UVec3::new(64, 64, 1),
        }
    }
}
