//! # Tilestream Core
//!
//! Core runtime library for tilestream.
//!
//! This crate provides the pieces of the page streaming engine that do not
//! depend on any particular backing device:
//! - **Memory**: bounded host staging pool with single-owner blocks
//! - **Math**: mip chain and tile grid arithmetic

pub mod math;
pub mod memory;

pub use memory::{HostPageAllocator, MemoryBudget, MemoryStats, StagingBlock, StagingHandle};

use thiserror::Error;

/// Core errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Out of staging memory: requested {requested} bytes, {available} available")]
    OutOfStagingMemory { requested: usize, available: usize },

    #[error("Zero-sized staging allocation")]
    ZeroSizedAllocation,

    #[error("Write of {len} bytes overflows a {capacity}-byte staging block")]
    BlockOverflow { len: usize, capacity: usize },

    #[error("Stale staging handle (block {index}, generation {generation})")]
    StaleHandle { index: u32, generation: u32 },
}

impl CoreError {
    /// Whether the condition is transient backpressure that clears on its own
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::OutOfStagingMemory { .. })
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err = CoreError::OutOfStagingMemory {
            requested: 10,
            available: 0,
        };
        assert!(err.is_transient());
        assert!(!CoreError::ZeroSizedAllocation.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::OutOfStagingMemory {
            requested: 65536,
            available: 0,
        };
        assert_eq!(
            err.to_string(),
            "Out of staging memory: requested 65536 bytes, 0 available"
        );
    }
}
