//! Visibility feedback
//!
//! Once per frame a visibility job runs over the whole page table and
//! appends page indices to two lists: pages that became visible ("alive")
//! and pages that stopped being visible ("dead"). Results land in a ring of
//! readback slots and are only handed to the host `latency` frames later,
//! once the slot is known to be fully written.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::descriptor::PageTable;
use crate::{TextureError, TextureResult};

/// Per-page visibility marks written by the consumer while sampling.
///
/// Shared between the consumer and the visibility job; marks are atomic so
/// concurrent draws may write them.
#[derive(Debug)]
pub struct VisibilityBuffer {
    words: Vec<AtomicU32>,
    len: usize,
}

impl VisibilityBuffer {
    pub fn new(page_count: usize) -> Self {
        Self {
            words: (0..page_count.div_ceil(32)).map(|_| AtomicU32::new(0)).collect(),
            len: page_count,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark a page as sampled this frame. Out-of-range pages are ignored.
    pub fn mark(&self, page: usize) {
        if page < self.len {
            self.words[page / 32].fetch_or(1 << (page % 32), Ordering::Relaxed);
        }
    }

    pub fn is_marked(&self, page: usize) -> bool {
        page < self.len && self.words[page / 32].load(Ordering::Relaxed) & (1 << (page % 32)) != 0
    }

    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
    }
}

/// Device-side output of one visibility dispatch.
///
/// Counters behave like atomically incremented GPU counters: they always
/// advance, but entries past the list capacity are dropped.
pub struct FeedbackWriter<'a> {
    alive: &'a mut [u32],
    dead: &'a mut [u32],
    alive_count: &'a mut u32,
    dead_count: &'a mut u32,
}

impl FeedbackWriter<'_> {
    pub fn push_alive(&mut self, page: u32) {
        if let Some(slot) = self.alive.get_mut(*self.alive_count as usize) {
            *slot = page;
        }
        *self.alive_count += 1;
    }

    pub fn push_dead(&mut self, page: u32) {
        if let Some(slot) = self.dead.get_mut(*self.dead_count as usize) {
            *slot = page;
        }
        *self.dead_count += 1;
    }
}

/// Job computing which pages became newly needed or unneeded
pub trait VisibilityJob: Send {
    /// Append this frame's transitions to `out`
    fn dispatch(&mut self, table: &PageTable, out: &mut FeedbackWriter<'_>);

    /// Get the job name for debugging
    fn name(&self) -> &str {
        "visibility"
    }
}

/// Compares this frame's marks with the previous frame's.
///
/// After dispatching, the current marks become the previous frame's and the
/// buffer is cleared for the next frame.
pub struct DiffVisibilityJob {
    current: std::sync::Arc<VisibilityBuffer>,
    previous: Vec<bool>,
}

impl DiffVisibilityJob {
    pub fn new(current: std::sync::Arc<VisibilityBuffer>) -> Self {
        let previous = vec![false; current.len()];
        Self { current, previous }
    }
}

impl VisibilityJob for DiffVisibilityJob {
    fn dispatch(&mut self, table: &PageTable, out: &mut FeedbackWriter<'_>) {
        let count = table.len().min(self.previous.len());
        for page in 0..count {
            let now = self.current.is_marked(page);
            let before = self.previous[page];
            if now && !before {
                out.push_alive(page as u32);
            } else if !now && before {
                out.push_dead(page as u32);
            }
            self.previous[page] = now;
        }
        self.current.clear();
    }

    fn name(&self) -> &str {
        "diff_visibility"
    }
}

/// Lists read back from one completed visibility pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackLists {
    /// Frame the pass was submitted on
    pub frame: u64,
    pub alive: Vec<u32>,
    pub dead: Vec<u32>,
}

#[derive(Debug, Clone)]
struct ReadbackSlot {
    submitted_frame: Option<u64>,
    consumed: bool,
    alive_count: u32,
    dead_count: u32,
    alive: Vec<u32>,
    dead: Vec<u32>,
}

impl ReadbackSlot {
    fn new(capacity: usize) -> Self {
        Self {
            submitted_frame: None,
            consumed: false,
            alive_count: 0,
            dead_count: 0,
            alive: vec![0; capacity],
            dead: vec![0; capacity],
        }
    }
}

/// Latency-bearing channel from the visibility job to the host
pub struct VisibilityFeedback {
    job: Box<dyn VisibilityJob>,
    slots: Vec<ReadbackSlot>,
    latency: u32,
    frame: u64,
    capacity: usize,
}

impl VisibilityFeedback {
    /// Create a channel for `page_count` pages with `latency` frames of delay
    pub fn new(job: Box<dyn VisibilityJob>, page_count: usize, latency: u32) -> Self {
        let latency = latency.max(1);
        Self {
            job,
            slots: (0..=latency).map(|_| ReadbackSlot::new(page_count)).collect(),
            latency,
            frame: 0,
            capacity: page_count,
        }
    }

    pub fn latency(&self) -> u32 {
        self.latency
    }

    /// Frames submitted so far
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn job_name(&self) -> &str {
        self.job.name()
    }

    /// Run this frame's visibility pass into the next readback slot.
    ///
    /// Returns the frame index the pass was submitted as.
    pub fn submit(&mut self, table: &PageTable) -> u64 {
        let frame = self.frame;
        let index = (frame % self.slots.len() as u64) as usize;
        let slot = &mut self.slots[index];

        // Counters start from zero every pass
        slot.alive_count = 0;
        slot.dead_count = 0;
        slot.consumed = false;

        let mut writer = FeedbackWriter {
            alive: &mut slot.alive,
            dead: &mut slot.dead,
            alive_count: &mut slot.alive_count,
            dead_count: &mut slot.dead_count,
        };
        self.job.dispatch(table, &mut writer);

        slot.submitted_frame = Some(frame);
        self.frame += 1;
        frame
    }

    /// Read the pass submitted `latency` frames ago, if it is complete and
    /// has not been read yet.
    ///
    /// Counts that exceed the list capacity mean the channel is corrupt.
    pub fn drain(&mut self) -> TextureResult<Option<FeedbackLists>> {
        let Some(newest) = self.frame.checked_sub(1) else {
            return Ok(None);
        };
        let Some(target) = newest.checked_sub(self.latency as u64) else {
            return Ok(None);
        };

        let index = (target % self.slots.len() as u64) as usize;
        let slot = &mut self.slots[index];
        if slot.submitted_frame != Some(target) || slot.consumed {
            return Ok(None);
        }
        slot.consumed = true;

        for (list, count) in [("alive", slot.alive_count), ("dead", slot.dead_count)] {
            if count as usize > self.capacity {
                log::error!(
                    "Visibility feedback for frame {} reports {} {} pages, capacity {}",
                    target,
                    count,
                    list,
                    self.capacity
                );
                return Err(TextureError::FeedbackCountOverflow {
                    list,
                    count,
                    capacity: self.capacity,
                });
            }
        }

        Ok(Some(FeedbackLists {
            frame: target,
            alive: slot.alive[..slot.alive_count as usize].to_vec(),
            dead: slot.dead[..slot.dead_count as usize].to_vec(),
        }))
    }
}
