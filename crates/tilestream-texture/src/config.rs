//! Streaming configuration

use serde::{Deserialize, Serialize};

use crate::format::PixelFormat;

/// Shortest and longest supported feedback readback latency, in frames
pub const MIN_FEEDBACK_LATENCY: u32 = 1;
pub const MAX_FEEDBACK_LATENCY: u32 = 3;

/// How the set of resident pages is chosen each frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LodMode {
    /// Pages follow visibility feedback individually
    #[default]
    DemandPaging,
    /// Legacy mode: the whole active mip is resident, swapped on level change
    WholeMip,
}

/// Virtual texture streaming configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Texel format of the virtual image
    pub format: PixelFormat,
    /// Frames between submitting a visibility pass and reading it back
    pub feedback_latency: u32,
    /// Staging pool size, in pages
    pub staging_capacity_pages: usize,
    /// Residency policy
    pub lod_mode: LodMode,
    /// Keep the packed-mip aggregate resident as the sampling fallback
    pub pin_packed_mips: bool,
    /// Generate page content on the rayon pool
    pub parallel_generation: bool,
}

impl StreamingConfig {
    /// Feedback latency clamped to the supported range
    pub fn effective_latency(&self) -> u32 {
        self.feedback_latency
            .clamp(MIN_FEEDBACK_LATENCY, MAX_FEEDBACK_LATENCY)
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            format: PixelFormat::Rgba8Unorm,
            feedback_latency: 2,
            staging_capacity_pages: 512,
            lod_mode: LodMode::DemandPaging,
            pin_packed_mips: true,
            parallel_generation: true,
        }
    }
}
