//! Fixed-object-size pool.
//!
//! Every object is one isolated guarded block. The object alignment matches
//! the production pool: the largest power-of-two divisor of the object
//! size, capped at [`MEMPOOL_MAX_ALIGNMENT`]; on top of that the block
//! layout keeps objects off the doubled alignment boundary so unaligned
//! access checks stay meaningful. Slab-level statistics are reported as
//! zero because no slabs exist under this strategy.

use std::ptr::NonNull;

use serde::Serialize;

use crate::block::{Block, BlockHeader, EmbeddedHeader};
use crate::fault::{default_handler, HandlerRef};
use crate::util::largest_pow2_dividing;

/// Upper bound on the derived object alignment.
pub const MEMPOOL_MAX_ALIGNMENT: usize = 4096;

#[repr(C)]
struct MempoolObject {
    common: BlockHeader,
    /// Position in the pool's membership vector, kept current so a free is
    /// a constant-time swap-remove.
    index: usize,
}

// SAFETY: repr(C), BlockHeader first, alignment of usize <= 8.
unsafe impl EmbeddedHeader for MempoolObject {}

/// Pool statistics. `slabsize`/`slabcount` are always zero here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MempoolStats {
    pub objsize: u32,
    pub objcount: usize,
    pub used: usize,
    pub total: usize,
    pub slabsize: usize,
    pub slabcount: usize,
}

/// Fixed-size object pool.
pub struct Mempool {
    objsize: u32,
    alignment: usize,
    objects: Vec<NonNull<MempoolObject>>,
    handler: HandlerRef,
}

impl Mempool {
    /// Creates a pool of `objsize`-byte objects with the default
    /// abort-on-fault handler. `objsize` must be nonzero.
    pub fn new(objsize: u32) -> Self {
        Self::with_handler(objsize, default_handler())
    }

    pub fn with_handler(objsize: u32, handler: HandlerRef) -> Self {
        assert!(objsize > 0);
        let mut alignment = largest_pow2_dividing(objsize as usize);
        if alignment > MEMPOOL_MAX_ALIGNMENT {
            alignment = MEMPOOL_MAX_ALIGNMENT;
        }
        Self {
            objsize,
            alignment,
            objects: Vec::new(),
            handler,
        }
    }

    /// Allocates one object. Aborts the process on heap exhaustion.
    pub fn alloc(&mut self) -> NonNull<u8> {
        let mut block = Block::<MempoolObject>::alloc(self.objsize as usize, self.alignment);
        block.header_mut().index = self.objects.len();
        self.objects.push(block.header_ptr());
        block.poison();
        block.payload()
    }

    /// Frees one object previously returned by [`Self::alloc`].
    ///
    /// # Safety
    /// `ptr` must have been returned by this pool's `alloc` and not freed
    /// since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        // SAFETY: ptr is a live payload of this pool per the contract.
        let block = unsafe { Block::<MempoolObject>::from_payload(ptr) };
        let index = block.header().index;
        debug_assert_eq!(self.objects[index], block.header_ptr());
        self.objects.swap_remove(index);
        if index < self.objects.len() {
            let moved = self.objects[index];
            // SAFETY: moved points at a live object of this pool.
            unsafe { Block::from_header(moved) }.header_mut().index = index;
        }
        block.free(&*self.handler);
    }

    /// Number of live objects.
    pub fn count(&self) -> usize {
        self.objects.len()
    }

    /// Bytes handed out to live objects.
    pub fn used(&self) -> usize {
        self.objsize as usize * self.objects.len()
    }

    pub fn objsize(&self) -> u32 {
        self.objsize
    }

    pub fn stats(&self) -> MempoolStats {
        MempoolStats {
            objsize: self.objsize,
            objcount: self.count(),
            used: self.used(),
            total: self.used(),
            slabsize: 0,
            slabcount: 0,
        }
    }
}

impl Drop for Mempool {
    /// Force-frees every still-live object.
    fn drop(&mut self) {
        for &object in &self.objects {
            // SAFETY: the membership list only holds live objects.
            unsafe { Block::from_header(object) }.free(&*self.handler);
        }
        self.objects.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::CapturingHandler;

    #[test]
    fn test_objcount_tracks_allocs_and_frees() {
        let mut pool = Mempool::new(24);
        let ptrs: Vec<_> = (0..10).map(|_| pool.alloc()).collect();
        assert_eq!(pool.count(), 10);
        assert_eq!(pool.used(), 240);
        for ptr in ptrs.into_iter().take(4) {
            unsafe { pool.free(ptr) };
        }
        assert_eq!(pool.count(), 6);
        assert_eq!(pool.used(), 144);
    }

    #[test]
    fn test_alignment_is_largest_pow2_divisor() {
        let mut pool = Mempool::new(48);
        for _ in 0..16 {
            let addr = pool.alloc().as_ptr() as usize;
            assert_eq!(addr % 16, 0);
            assert_ne!(addr % 32, 0);
        }
    }

    #[test]
    fn test_alignment_caps_at_max() {
        let mut pool = Mempool::new(8192);
        let addr = pool.alloc().as_ptr() as usize;
        assert_eq!(addr % MEMPOOL_MAX_ALIGNMENT, 0);
        assert_ne!(addr % (2 * MEMPOOL_MAX_ALIGNMENT), 0);
    }

    #[test]
    fn test_free_out_of_order() {
        let mut pool = Mempool::new(16);
        let a = pool.alloc();
        let b = pool.alloc();
        let c = pool.alloc();
        unsafe {
            pool.free(b);
            pool.free(a);
            pool.free(c);
        }
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn test_destroy_with_live_objects() {
        let handler = CapturingHandler::new();
        let mut pool = Mempool::with_handler(32, handler.clone());
        for _ in 0..5 {
            pool.alloc();
        }
        drop(pool);
        assert!(handler.is_empty());
    }

    #[test]
    fn test_stats_report_zero_slabs() {
        let mut pool = Mempool::new(100);
        pool.alloc();
        pool.alloc();
        let stats = pool.stats();
        assert_eq!(stats.objsize, 100);
        assert_eq!(stats.objcount, 2);
        assert_eq!(stats.used, 200);
        assert_eq!(stats.total, 200);
        assert_eq!(stats.slabsize, 0);
        assert_eq!(stats.slabcount, 0);
    }

    #[test]
    fn test_payload_writes_survive() {
        let mut pool = Mempool::new(64);
        let ptr = pool.alloc();
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xcd, 64);
            assert_eq!(ptr.as_ptr().add(63).read(), 0xcd);
            pool.free(ptr);
        }
    }
}
