//! Memory Management
//!
//! Host-side staging memory for page uploads:
//! - Memory tracking statistics
//! - Budget configuration with a warning threshold
//! - Host page allocator: a bounded pool of fixed-size blocks
//! - Single-owner staging blocks released on drop

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::{CoreError, CoreResult};

/// Memory budget configuration for a staging pool
#[derive(Debug, Clone)]
pub struct MemoryBudget {
    /// Maximum bytes for this pool
    pub max_bytes: usize,
    /// Warning threshold (fraction of max)
    pub warning_threshold: f32,
}

impl MemoryBudget {
    /// Budget sized for a number of fixed-size blocks
    pub fn for_blocks(block_size: usize, blocks: usize) -> Self {
        Self {
            max_bytes: block_size * blocks,
            ..Self::default()
        }
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            max_bytes: 32 * 1024 * 1024, // 32 MB default
            warning_threshold: 0.9,
        }
    }
}

/// Memory tracking statistics
#[derive(Debug, Default)]
pub struct MemoryStats {
    /// Total bytes allocated
    pub allocated: AtomicUsize,
    /// Peak bytes allocated
    pub peak: AtomicUsize,
    /// Number of allocations
    pub allocation_count: AtomicUsize,
}

impl MemoryStats {
    /// Create new memory stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation
    pub fn record_alloc(&self, size: usize) {
        let new_size = self.allocated.fetch_add(size, Ordering::Relaxed) + size;
        self.allocation_count.fetch_add(1, Ordering::Relaxed);

        // Update peak if needed
        let mut peak = self.peak.load(Ordering::Relaxed);
        while new_size > peak {
            match self.peak.compare_exchange_weak(
                peak,
                new_size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => peak = current,
            }
        }
    }

    /// Record a deallocation
    pub fn record_dealloc(&self, size: usize) {
        self.allocated.fetch_sub(size, Ordering::Relaxed);
    }

    /// Get current allocated bytes
    pub fn current(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Get peak allocated bytes
    pub fn peak_usage(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Get total allocation count
    pub fn count(&self) -> usize {
        self.allocation_count.load(Ordering::Relaxed)
    }

    /// Reset statistics
    pub fn reset(&self) {
        self.allocated.store(0, Ordering::Relaxed);
        self.peak.store(0, Ordering::Relaxed);
        self.allocation_count.store(0, Ordering::Relaxed);
    }
}

/// Identifies one live allocation: the first block index plus the
/// generation that block had when it was handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StagingHandle {
    index: u32,
    generation: u32,
}

impl StagingHandle {
    /// Index of the first block in the arena
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the first block at allocation time
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct PoolState {
    arena: Vec<u8>,
    occupied: Vec<bool>,
    generations: Vec<u32>,
    /// Run length of each live allocation, keyed by its first block
    run_lengths: Vec<usize>,
    outstanding: usize,
    over_threshold: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    block_size: usize,
    capacity_blocks: usize,
    budget: MemoryBudget,
    stats: MemoryStats,
}

impl PoolShared {
    fn free(&self, handle: StagingHandle) -> CoreResult<()> {
        let mut state = self.state.lock();
        let index = handle.index as usize;

        if index >= self.capacity_blocks
            || !state.occupied[index]
            || state.run_lengths[index] == 0
            || state.generations[index] != handle.generation
        {
            return Err(CoreError::StaleHandle {
                index: handle.index,
                generation: handle.generation,
            });
        }

        let run = state.run_lengths[index];
        for slot in &mut state.occupied[index..index + run] {
            *slot = false;
        }
        state.run_lengths[index] = 0;
        state.generations[index] = state.generations[index].wrapping_add(1);
        state.outstanding -= run;

        let utilization = state.outstanding as f32 / self.capacity_blocks as f32;
        if utilization < self.budget.warning_threshold {
            state.over_threshold = false;
        }

        self.stats.record_dealloc(run * self.block_size);
        Ok(())
    }
}

/// Bounded pool allocator over a host staging arena.
///
/// Hands out [`StagingBlock`]s made of one or more contiguous fixed-size
/// blocks. Capacity never grows: when the pool is exhausted, `allocate`
/// fails with [`CoreError::OutOfStagingMemory`] and the caller is expected
/// to retry on a later frame.
#[derive(Clone)]
pub struct HostPageAllocator {
    shared: Arc<PoolShared>,
}

impl HostPageAllocator {
    /// Create a pool of `block_size`-byte blocks bounded by `budget`.
    ///
    /// The pool always holds at least one block.
    pub fn new(block_size: usize, budget: MemoryBudget) -> Self {
        let block_size = block_size.max(1);
        let capacity_blocks = (budget.max_bytes / block_size).max(1);

        log::debug!(
            "Staging pool: {} blocks of {} bytes ({} bytes total)",
            capacity_blocks,
            block_size,
            capacity_blocks * block_size
        );

        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    arena: vec![0; capacity_blocks * block_size],
                    occupied: vec![false; capacity_blocks],
                    generations: vec![0; capacity_blocks],
                    run_lengths: vec![0; capacity_blocks],
                    outstanding: 0,
                    over_threshold: false,
                }),
                block_size,
                capacity_blocks,
                budget,
                stats: MemoryStats::new(),
            }),
        }
    }

    /// Allocate a block able to hold `byte_size` bytes
    pub fn allocate(&self, byte_size: usize) -> CoreResult<StagingBlock> {
        if byte_size == 0 {
            return Err(CoreError::ZeroSizedAllocation);
        }

        let shared = &self.shared;
        let run = byte_size.div_ceil(shared.block_size);
        let mut state = shared.state.lock();
        let available = shared.capacity_blocks - state.outstanding;

        if run > available {
            return Err(CoreError::OutOfStagingMemory {
                requested: byte_size,
                available: available * shared.block_size,
            });
        }

        // First fit over contiguous free blocks
        let mut start = None;
        let mut len = 0;
        for (i, occupied) in state.occupied.iter().enumerate() {
            if *occupied {
                len = 0;
                continue;
            }
            len += 1;
            if len == run {
                start = Some(i + 1 - run);
                break;
            }
        }

        let Some(start) = start else {
            return Err(CoreError::OutOfStagingMemory {
                requested: byte_size,
                available: available * shared.block_size,
            });
        };

        for slot in &mut state.occupied[start..start + run] {
            *slot = true;
        }
        state.run_lengths[start] = run;
        state.outstanding += run;

        let utilization = state.outstanding as f32 / shared.capacity_blocks as f32;
        if utilization >= shared.budget.warning_threshold && !state.over_threshold {
            state.over_threshold = true;
            log::warn!(
                "Staging pool at {:.0}% ({} of {} blocks)",
                utilization * 100.0,
                state.outstanding,
                shared.capacity_blocks
            );
        }

        let handle = StagingHandle {
            index: start as u32,
            generation: state.generations[start],
        };
        drop(state);

        shared.stats.record_alloc(run * shared.block_size);

        Ok(StagingBlock {
            pool: Arc::clone(shared),
            handle,
            len: byte_size,
            released: false,
        })
    }

    /// Return a block to the pool.
    ///
    /// Dropping the block has the same effect; this form reports errors.
    pub fn release(&self, mut block: StagingBlock) -> CoreResult<()> {
        if !Arc::ptr_eq(&self.shared, &block.pool) {
            return Err(CoreError::StaleHandle {
                index: block.handle.index,
                generation: block.handle.generation,
            });
        }
        block.released = true;
        self.shared.free(block.handle)
    }

    /// Size in bytes of one block
    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    /// Total number of blocks in the pool
    pub fn capacity_blocks(&self) -> usize {
        self.shared.capacity_blocks
    }

    /// Blocks currently handed out
    pub fn outstanding_blocks(&self) -> usize {
        self.shared.state.lock().outstanding
    }

    /// Blocks currently free
    pub fn available_blocks(&self) -> usize {
        self.capacity_blocks() - self.outstanding_blocks()
    }

    /// Get memory statistics
    pub fn stats(&self) -> &MemoryStats {
        &self.shared.stats
    }
}

impl fmt::Debug for HostPageAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPageAllocator")
            .field("block_size", &self.block_size())
            .field("capacity_blocks", &self.capacity_blocks())
            .field("outstanding_blocks", &self.outstanding_blocks())
            .finish()
    }
}

/// Exclusively owned staging memory.
///
/// Not `Clone`: exactly one owner may reference the underlying blocks, and
/// they go back to the pool when the owner drops it.
pub struct StagingBlock {
    pool: Arc<PoolShared>,
    handle: StagingHandle,
    len: usize,
    released: bool,
}

impl StagingBlock {
    /// Handle identifying this allocation
    pub fn handle(&self) -> StagingHandle {
        self.handle
    }

    /// Requested size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the block holds zero bytes (never true for a live block)
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the start of the block
    pub fn write(&mut self, data: &[u8]) -> CoreResult<()> {
        if data.len() > self.len {
            return Err(CoreError::BlockOverflow {
                len: data.len(),
                capacity: self.len,
            });
        }
        let start = self.handle.index as usize * self.pool.block_size;
        let mut state = self.pool.state.lock();
        state.arena[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Borrow the block's bytes for the duration of `f`
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let start = self.handle.index as usize * self.pool.block_size;
        let state = self.pool.state.lock();
        f(&state.arena[start..start + self.len])
    }
}

impl fmt::Debug for StagingBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingBlock")
            .field("handle", &self.handle)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for StagingBlock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.pool.free(self.handle) {
            log::error!("Failed to return staging block: {}", err);
        }
    }
}
