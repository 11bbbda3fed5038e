//! # Tilestream Texture
//!
//! Virtual texture page residency engine.
//!
//! ## Features
//! - Page table derived from the image geometry and device tiling
//! - Fixed heap slots per page with batched map/unmap
//! - Latency-tolerant visibility feedback (alive/dead page lists)
//! - Staged, optionally parallel page content generation
//! - Packed low-resolution mips paged as a single pinned fallback
//! - Legacy whole-mip mode driven by an active mip level

pub mod config;
pub mod content;
pub mod descriptor;
pub mod device;
pub mod feedback;
pub mod format;
pub mod heap;
pub mod indirection;
pub mod residency;

pub use config::{LodMode, StreamingConfig};
pub use content::{CheckerboardGenerator, ContentGenerator, ContentRequest};
pub use descriptor::{Page, PageKind, PageTable, ResidencyState, VirtualTextureDescriptor};
pub use device::{BackingDevice, SoftwareDevice};
pub use feedback::{DiffVisibilityJob, VisibilityBuffer, VisibilityFeedback, VisibilityJob};
pub use format::PixelFormat;
pub use indirection::{IndirectionTable, Resolution, ShaderConstants};
pub use residency::{AddReport, RemoveReport, ResidencyManager, ResidencyStats};

use std::sync::Arc;

use glam::Vec2;
use serde::Serialize;
use thiserror::Error;
use tilestream_core::CoreError;

/// Texture streaming errors
#[derive(Error, Debug)]
pub enum TextureError {
    #[error("Device does not support tiled resources")]
    TilingUnsupported,

    #[error("Device reported {packed_mip_count} packed mips but zero packed tiles")]
    ZeroPackedTiles { packed_mip_count: u32 },

    #[error("Invalid virtual texture size {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Invalid tiling: {0}")]
    InvalidTiling(String),

    #[error("Page {index} in {list} list is outside the page table ({page_count} pages)")]
    FeedbackIndexOutOfBounds {
        list: &'static str,
        index: u32,
        page_count: usize,
    },

    #[error("Feedback reports {count} {list} pages, list holds {capacity}")]
    FeedbackCountOverflow {
        list: &'static str,
        count: u32,
        capacity: usize,
    },

    #[error("Page {page} is already mapped")]
    AlreadyMapped { page: usize },

    #[error("Page {page} is not mapped")]
    NotMapped { page: usize },

    #[error("Page {page} has no heap slot ({page_count} pages)")]
    SlotOutOfRange { page: usize, page_count: usize },

    #[error("Content generation failed for page {page}: {reason}")]
    ContentGeneration { page: usize, reason: String },

    #[error("Content for page {page} is {actual} bytes, expected {expected}")]
    ContentSizeMismatch {
        page: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Staging error: {0}")]
    Staging(#[from] CoreError),
}

impl TextureError {
    /// Whether the error means the feedback channel or page bookkeeping is
    /// inconsistent. The frame's residency update is abandoned.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::FeedbackIndexOutOfBounds { .. }
                | Self::FeedbackCountOverflow { .. }
                | Self::AlreadyMapped { .. }
                | Self::NotMapped { .. }
                | Self::SlotOutOfRange { .. }
        )
    }

    /// Whether the page can simply be retried on a later frame
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ContentGeneration { .. } | Self::ContentSizeMismatch { .. } => true,
            Self::Staging(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Result type for texture streaming operations
pub type TextureResult<T> = Result<T, TextureError>;

/// What one `update` did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameReport {
    pub frame: u64,
    /// Frame whose visibility pass was consumed, if one completed
    pub feedback_frame: Option<u64>,
    pub alive: usize,
    pub dead: usize,
    /// Earlier deferred or failed pages requested again
    pub retried: usize,
    pub added: usize,
    pub removed: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub failed: usize,
}

impl FrameReport {
    fn record_add(&mut self, report: &AddReport) {
        self.added += report.added;
        self.skipped += report.skipped;
        self.deferred += report.deferred;
        self.failed += report.failed;
    }

    fn record_remove(&mut self, report: &RemoveReport) {
        self.removed += report.removed;
        self.skipped += report.skipped;
    }
}

/// A streamed virtual texture
pub struct VirtualTexture {
    descriptor: VirtualTextureDescriptor,
    config: StreamingConfig,
    device: Arc<dyn BackingDevice>,
    visibility: Arc<VisibilityBuffer>,
    feedback: VisibilityFeedback,
    residency: ResidencyManager,
    frame_number: u64,
}

impl VirtualTexture {
    /// Create a virtual texture driven by the built-in visibility diff
    pub fn new(
        width: u32,
        height: u32,
        config: StreamingConfig,
        device: Arc<dyn BackingDevice>,
        generator: Arc<dyn ContentGenerator>,
    ) -> TextureResult<Self> {
        Self::build(width, height, config, device, generator, |visibility| {
            Box::new(DiffVisibilityJob::new(visibility))
        })
    }

    /// Create a virtual texture with a custom visibility job
    pub fn with_job(
        width: u32,
        height: u32,
        config: StreamingConfig,
        device: Arc<dyn BackingDevice>,
        generator: Arc<dyn ContentGenerator>,
        job: Box<dyn VisibilityJob>,
    ) -> TextureResult<Self> {
        Self::build(width, height, config, device, generator, |_| job)
    }

    fn build(
        width: u32,
        height: u32,
        config: StreamingConfig,
        device: Arc<dyn BackingDevice>,
        generator: Arc<dyn ContentGenerator>,
        job: impl FnOnce(Arc<VisibilityBuffer>) -> Box<dyn VisibilityJob>,
    ) -> TextureResult<Self> {
        let descriptor =
            VirtualTextureDescriptor::from_device(device.as_ref(), width, height, config.format)?;
        let residency = ResidencyManager::new(&descriptor, &config, device.clone(), generator)?;

        let page_count = descriptor.page_table().len();
        let visibility = Arc::new(VisibilityBuffer::new(page_count));
        let feedback =
            VisibilityFeedback::new(job(visibility.clone()), page_count, config.effective_latency());

        log::info!(
            "Virtual texture {}x{}: {} pages, {:?}, feedback latency {} frames",
            width,
            height,
            page_count,
            config.lod_mode,
            feedback.latency()
        );

        Ok(Self {
            descriptor,
            config,
            device,
            visibility,
            feedback,
            residency,
            frame_number: 0,
        })
    }

    /// Run one frame of residency updates.
    ///
    /// Adds are recorded before removes. A protocol violation abandons the
    /// frame's feedback before any listed page changes state. Work recorded
    /// earlier in the frame is still submitted and the frame still counts.
    pub fn update(&mut self) -> TextureResult<FrameReport> {
        let _span = tracing::debug_span!("pages_update", frame = self.frame_number).entered();

        let mut report = FrameReport {
            frame: self.frame_number,
            ..FrameReport::default()
        };

        let result = self.record_frame(&mut report);
        let submitted = self.device.submit();
        self.frame_number += 1;

        if let Err(err) = result {
            log::warn!("Frame {} abandoned: {}", report.frame, err);
            return Err(err);
        }
        submitted?;

        if report.added + report.removed > 0 {
            log::debug!(
                "Frame {}: +{} -{} pages ({} deferred, {} failed)",
                report.frame,
                report.added,
                report.removed,
                report.deferred,
                report.failed
            );
        }
        Ok(report)
    }

    fn record_frame(&mut self, report: &mut FrameReport) -> TextureResult<()> {
        if let Some(pinned) = self.residency.ensure_pinned(&mut self.descriptor)? {
            report.record_add(&pinned);
        }

        match self.config.lod_mode {
            LodMode::DemandPaging => self.update_demand_paging(report),
            LodMode::WholeMip => self.update_whole_mip(report),
        }
    }

    fn update_demand_paging(&mut self, report: &mut FrameReport) -> TextureResult<()> {
        self.feedback.submit(self.descriptor.page_table());
        let lists = self.feedback.drain()?;

        let (alive, dead) = match &lists {
            Some(lists) => {
                let page_count = self.descriptor.page_table().len();
                ResidencyManager::validate("alive", &lists.alive, page_count)?;
                ResidencyManager::validate("dead", &lists.dead, page_count)?;

                report.feedback_frame = Some(lists.frame);
                report.alive = lists.alive.len();
                report.dead = lists.dead.len();
                (lists.alive.as_slice(), lists.dead.as_slice())
            }
            None => (&[][..], &[][..]),
        };

        // Visible pages that missed out earlier are not reported alive again
        let alive = self.residency.with_retries(alive, dead);
        report.retried = alive.len() - report.alive;

        let added = self.residency.add_pages(&mut self.descriptor, &alive)?;
        report.record_add(&added);
        let removed = self.residency.remove_pages(&mut self.descriptor, dead)?;
        report.record_remove(&removed);
        Ok(())
    }

    fn update_whole_mip(&mut self, report: &mut FrameReport) -> TextureResult<()> {
        if !self.descriptor.active_mip_changed() {
            return Ok(());
        }

        let table = self.descriptor.page_table();
        let wanted = table.pages_in_mip(self.descriptor.active_mip());
        let alive: Vec<u32> = wanted.clone().map(|index| index as u32).collect();
        let dead: Vec<u32> = table
            .pages()
            .iter()
            .enumerate()
            .filter(|(index, page)| {
                !wanted.contains(index) && page.state() != ResidencyState::Unloaded
            })
            .map(|(index, _)| index as u32)
            .collect();

        report.alive = alive.len();
        report.dead = dead.len();

        let added = self.residency.add_pages(&mut self.descriptor, &alive)?;
        report.record_add(&added);
        let removed = self.residency.remove_pages(&mut self.descriptor, &dead)?;
        report.record_remove(&removed);

        self.refresh_mapped_mips();

        // Keep retrying until the whole mip made it in
        if added.deferred == 0 && added.failed == 0 {
            self.descriptor.clear_active_mip_changed();
        }
        Ok(())
    }

    fn refresh_mapped_mips(&mut self) {
        let table = self.descriptor.page_table_mut();
        for mip in 0..table.mips().len() as u32 {
            let pages = table.pages_in_mip(mip);
            let mapped = !pages.is_empty()
                && table.pages()[pages].iter().all(|page| page.is_resident());
            if let Some(info) = table.mip_mut(mip) {
                info.is_mapped = mapped;
            }
        }
    }

    /// Move the active mip one level coarser (whole-mip mode)
    pub fn level_up(&mut self) -> bool {
        let changed = self.descriptor.level_up();
        if changed {
            log::debug!("Active mip -> {}", self.descriptor.active_mip());
        }
        changed
    }

    /// Move the active mip one level finer (whole-mip mode)
    pub fn level_down(&mut self) -> bool {
        let changed = self.descriptor.level_down();
        if changed {
            log::debug!("Active mip -> {}", self.descriptor.active_mip());
        }
        changed
    }

    /// Geometry and page table of the texture
    pub fn descriptor(&self) -> &VirtualTextureDescriptor {
        &self.descriptor
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Get the current frame number
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Constants a sampling shader needs for the current state
    pub fn shader_constants(&self) -> ShaderConstants {
        ShaderConstants::from_descriptor(&self.descriptor)
    }

    /// Buffer the consumer marks sampled pages into
    pub fn visibility_buffer(&self) -> &Arc<VisibilityBuffer> {
        &self.visibility
    }

    /// Resolve a normalized coordinate at `mip` to a resident page
    pub fn resolve(&self, uv: Vec2, mip: u32) -> Option<Resolution> {
        IndirectionTable::new(&self.descriptor).resolve(uv, mip)
    }

    /// Residency manager owning the heap and staging pool
    pub fn residency(&self) -> &ResidencyManager {
        &self.residency
    }

    pub fn feedback(&self) -> &VisibilityFeedback {
        &self.feedback
    }
}
