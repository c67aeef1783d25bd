//! Log-sequenced arena with generational bulk reclamation.
//!
//! Allocations carry a caller-supplied monotonically non-decreasing id and
//! are appended in insertion order; [`Lsregion::gc`] walks from the oldest
//! entry and stops at the first id above the threshold, which is only
//! correct because insertion order follows id order. An id regression is
//! therefore surfaced as a fault instead of silently breaking reclamation.

use std::collections::VecDeque;
use std::ptr::NonNull;

use serde::Serialize;

use crate::block::{Block, BlockHeader, EmbeddedHeader};
use crate::fault::{default_handler, Fault, HandlerRef};

#[repr(C)]
struct LsregionAllocation {
    common: BlockHeader,
    size: usize,
    /// Sequence id; non-decreasing across the membership list.
    id: i64,
}

// SAFETY: repr(C), BlockHeader first, alignment of usize/i64 <= 8.
unsafe impl EmbeddedHeader for LsregionAllocation {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LsregionStats {
    pub used: usize,
    pub count: usize,
}

/// Arena reclaimed in bulk by sequence-id threshold.
pub struct Lsregion {
    allocations: VecDeque<NonNull<LsregionAllocation>>,
    used: usize,
    last_id: i64,
    handler: HandlerRef,
}

impl Lsregion {
    pub fn new() -> Self {
        Self::with_handler(default_handler())
    }

    pub fn with_handler(handler: HandlerRef) -> Self {
        Self {
            allocations: VecDeque::new(),
            used: 0,
            last_id: i64::MIN,
            handler,
        }
    }

    /// Allocates `size` bytes aligned to `alignment` tagged with sequence
    /// id `id`. Ids must not decrease between calls.
    pub fn aligned_alloc(&mut self, size: usize, alignment: usize, id: i64) -> NonNull<u8> {
        if id < self.last_id {
            self.handler.on_fault(Fault::IdRegression {
                last: self.last_id,
                id,
            });
        } else {
            self.last_id = id;
        }
        let mut block = Block::<LsregionAllocation>::alloc(size, alignment);
        let header = block.header_mut();
        header.size = size;
        header.id = id;
        self.allocations.push_back(block.header_ptr());
        self.used += size;
        block.poison();
        block.payload()
    }

    /// Byte-aligned allocation.
    pub fn alloc(&mut self, size: usize, id: i64) -> NonNull<u8> {
        self.aligned_alloc(size, 1, id)
    }

    /// Frees every allocation whose id is `<= min_id`, oldest first.
    pub fn gc(&mut self, min_id: i64) {
        while let Some(&oldest) = self.allocations.front() {
            // SAFETY: membership holds only live records.
            let block = unsafe { Block::from_header(oldest) };
            if block.header().id > min_id {
                break;
            }
            let size = block.header().size;
            if self.used < size {
                self.handler.on_fault(Fault::Invariant("lsregion used underflow"));
            }
            self.used = self.used.saturating_sub(size);
            self.allocations.pop_front();
            block.free(&*self.handler);
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of live allocations.
    pub fn count(&self) -> usize {
        self.allocations.len()
    }

    pub fn stats(&self) -> LsregionStats {
        LsregionStats {
            used: self.used,
            count: self.allocations.len(),
        }
    }
}

impl Default for Lsregion {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Lsregion {
    fn drop(&mut self) {
        self.gc(i64::MAX);
    }
}
