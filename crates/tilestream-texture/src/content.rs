//! Page content generation
//!
//! The residency manager asks a [`ContentGenerator`] for the pixel data of
//! every page it stages. Generators are pure functions of the request and
//! may be called from the rayon pool.

use glam::{UVec2, UVec3};
use tilestream_core::math;

use crate::descriptor::{PackedFootprint, PageKind, TileCoordinate, VirtualTextureDescriptor};
use crate::{TextureError, TextureResult};

/// Everything a generator needs to produce one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRequest {
    pub page_index: usize,
    pub coordinate: TileCoordinate,
    pub kind: PageKind,
    pub tile_width: u32,
    pub tile_height: u32,
    pub bytes_per_pixel: u32,
    pub virtual_width: u32,
    pub virtual_height: u32,
    /// Exact number of bytes the generator must return
    pub expected_len: usize,
    /// Sub-mip layout of the packed aggregate (empty for standard pages)
    pub footprints: Vec<PackedFootprint>,
}

impl ContentRequest {
    /// Build the request for page `index` of a descriptor
    pub fn for_page(descriptor: &VirtualTextureDescriptor, index: usize) -> Option<Self> {
        let page = descriptor.page_table().page(index)?;
        let footprints = if page.is_packed() {
            descriptor.packed_footprints().to_vec()
        } else {
            Vec::new()
        };

        Some(Self {
            page_index: index,
            coordinate: page.coordinate(),
            kind: page.kind().clone(),
            tile_width: descriptor.tile_width(),
            tile_height: descriptor.tile_height(),
            bytes_per_pixel: descriptor.format().bytes_per_pixel(),
            virtual_width: descriptor.virtual_width(),
            virtual_height: descriptor.virtual_height(),
            expected_len: descriptor.page_content_len(page),
            footprints,
        })
    }

    /// Texel extent of the mip this request's coordinate lives in
    pub fn mip_extent(&self) -> UVec2 {
        math::mip_extent(
            UVec3::new(self.virtual_width, self.virtual_height, 1),
            self.coordinate.mip,
        )
        .truncate()
    }
}

/// Source of page pixel data
pub trait ContentGenerator: Send + Sync {
    /// Produce exactly `request.expected_len` bytes for the requested page
    fn generate(&self, request: &ContentRequest) -> TextureResult<Vec<u8>>;

    /// Get the generator name for debugging
    fn name(&self) -> &str {
        "content"
    }
}

impl<F> ContentGenerator for F
where
    F: Fn(&ContentRequest) -> TextureResult<Vec<u8>> + Send + Sync,
{
    fn generate(&self, request: &ContentRequest) -> TextureResult<Vec<u8>> {
        self(request)
    }
}

const RED: [u8; 4] = [0xff, 0x00, 0x00, 0xff];
const WHITE: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

/// Procedural red/white checkerboard whose cells are an eighth of each mip.
///
/// Texels wider than four bytes repeat the RGBA8 pattern.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckerboardGenerator;

impl CheckerboardGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Color of texel (x, y) in a mip of the given extent
    pub fn texel(extent: UVec2, x: u32, y: u32) -> [u8; 4] {
        let cell_width = (extent.x >> 3).max(1);
        let cell_height = (extent.y >> 3).max(1);
        if (x / cell_width) % 2 == (y / cell_height) % 2 {
            RED
        } else {
            WHITE
        }
    }

    fn write_texel(out: &mut [u8], color: [u8; 4]) {
        for (byte, value) in out.iter_mut().zip(color.iter().cycle()) {
            *byte = *value;
        }
    }

    fn fill_tile(request: &ContentRequest, tile: UVec2, valid_extent: UVec2, out: &mut [u8]) {
        let extent = request.mip_extent();
        let bpp = request.bytes_per_pixel as usize;
        let row_pitch = request.tile_width as usize * bpp;
        let origin = tile * UVec2::new(request.tile_width, request.tile_height);

        for y in 0..valid_extent.y {
            let row = y as usize * row_pitch;
            for x in 0..valid_extent.x {
                let start = row + x as usize * bpp;
                let color = Self::texel(extent, origin.x + x, origin.y + y);
                Self::write_texel(&mut out[start..start + bpp], color);
            }
        }
    }

    fn fill_packed(request: &ContentRequest, out: &mut [u8]) -> TextureResult<()> {
        let bpp = request.bytes_per_pixel as usize;
        for footprint in &request.footprints {
            let end = footprint.offset + footprint.len;
            let Some(bytes) = out.get_mut(footprint.offset..end) else {
                return Err(TextureError::ContentGeneration {
                    page: request.page_index,
                    reason: format!(
                        "packed mip {} ends at byte {} past {}",
                        footprint.mip, end, request.expected_len
                    ),
                });
            };

            let extent = UVec2::new(footprint.width, footprint.height);
            for (i, texel) in bytes.chunks_exact_mut(bpp).enumerate() {
                let x = i as u32 % footprint.width;
                let y = i as u32 / footprint.width;
                Self::write_texel(texel, Self::texel(extent, x, y));
            }
        }
        Ok(())
    }
}

impl ContentGenerator for CheckerboardGenerator {
    fn generate(&self, request: &ContentRequest) -> TextureResult<Vec<u8>> {
        let mut data = vec![0; request.expected_len];
        match request.kind {
            PageKind::Standard { tile, valid_extent } => {
                let needed = (request.tile_width * request.tile_height) as usize
                    * request.bytes_per_pixel as usize;
                if needed > data.len() {
                    return Err(TextureError::ContentGeneration {
                        page: request.page_index,
                        reason: format!("tile needs {} bytes, {} expected", needed, data.len()),
                    });
                }
                Self::fill_tile(request, tile, valid_extent, &mut data);
            }
            PageKind::Packed { .. } => Self::fill_packed(request, &mut data)?,
        }
        Ok(data)
    }

    fn name(&self) -> &str {
        "checkerboard"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ResourceTiling;
    use crate::format::{PixelFormat, TILE_SIZE_IN_BYTES};

    fn descriptor(width: u32, height: u32) -> VirtualTextureDescriptor {
        let tiling = ResourceTiling::standard(width, height, PixelFormat::Rgba8Unorm);
        VirtualTextureDescriptor::new(width, height, PixelFormat::Rgba8Unorm, &tiling).unwrap()
    }

    #[test]
    fn test_checkerboard_cells() {
        let extent = UVec2::new(1024, 1024);
        // 128-texel cells
        assert_eq!(CheckerboardGenerator::texel(extent, 0, 0), RED);
        assert_eq!(CheckerboardGenerator::texel(extent, 127, 0), RED);
        assert_eq!(CheckerboardGenerator::texel(extent, 128, 0), WHITE);
        assert_eq!(CheckerboardGenerator::texel(extent, 128, 128), RED);
    }

    #[test]
    fn test_tiny_mip_uses_single_texel_cells() {
        let extent = UVec2::new(2, 2);
        assert_eq!(CheckerboardGenerator::texel(extent, 0, 0), RED);
        assert_eq!(CheckerboardGenerator::texel(extent, 1, 0), WHITE);
    }

    #[test]
    fn test_standard_tile_has_expected_size() {
        let desc = descriptor(1024, 1024);
        let index = desc.page_table().page_index_at(0, 1, 0).unwrap();
        let request = ContentRequest::for_page(&desc, index).unwrap();
        let data = CheckerboardGenerator.generate(&request).unwrap();

        assert_eq!(data.len(), 128 * 128 * 4);
        // Tile (1, 0) starts at texel 128, the second cell column
        assert_eq!(&data[..4], &WHITE);
    }

    #[test]
    fn test_edge_tile_only_fills_valid_region() {
        let desc = descriptor(300, 260);
        let index = desc.page_table().page_index_at(0, 2, 0).unwrap();
        let request = ContentRequest::for_page(&desc, index).unwrap();
        let data = CheckerboardGenerator.generate(&request).unwrap();

        let row_pitch = 128 * 4;
        // Texel 43 is inside the 44-wide valid region, texel 44 is padding
        assert_ne!(&data[43 * 4..44 * 4], &[0, 0, 0, 0]);
        assert_eq!(&data[44 * 4..45 * 4], &[0, 0, 0, 0]);
        assert_eq!(&data[row_pitch + 44 * 4..row_pitch + 45 * 4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_packed_content_fills_whole_tiles() {
        let desc = descriptor(4096, 4096);
        let index = desc.page_table().packed_page_index().unwrap();
        let request = ContentRequest::for_page(&desc, index).unwrap();
        assert_eq!(request.footprints.len(), 7);

        let data = CheckerboardGenerator.generate(&request).unwrap();
        assert_eq!(data.len(), TILE_SIZE_IN_BYTES);

        // 64x64 packed mip starts red; padding after the last footprint stays zero
        assert_eq!(&data[..4], &RED);
        let last = request.footprints.last().unwrap();
        assert_eq!(data[last.offset + last.len], 0);
    }

    #[test]
    fn test_closure_generator() {
        let desc = descriptor(512, 512);
        let request = ContentRequest::for_page(&desc, 0).unwrap();
        let generator =
            |request: &ContentRequest| Ok::<_, TextureError>(vec![7u8; request.expected_len]);

        let data = generator.generate(&request).unwrap();
        assert_eq!(data.len(), request.expected_len);
        assert_eq!(generator.name(), "content");
    }
}
