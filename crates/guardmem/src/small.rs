//! Quota-gated general-purpose allocator.
//!
//! Size classing is deliberately absent: every object is one isolated
//! guarded block, so sizing knobs of the production allocator are accepted
//! for interface compatibility and ignored. What remains observable is the
//! quota discipline, the size-checked free and per-instance ownership.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::block::{Block, BlockHeader, EmbeddedHeader};
use crate::fault::{default_handler, Fault, HandlerRef};
use crate::quota::Quota;

/// Payload alignment of every object.
pub const SMALL_ALIGNMENT: usize = std::mem::size_of::<usize>();

/// Source of per-instance owner tags, used to catch frees routed to the
/// wrong allocator instance.
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

#[repr(C)]
struct SmallObject {
    common: BlockHeader,
    /// Size the object was allocated with; free must repeat it.
    size: usize,
    /// Tag of the instance that allocated the object.
    owner_id: u64,
    /// Position in the membership vector, kept current for swap-remove.
    index: usize,
}

// SAFETY: repr(C), BlockHeader first, alignment of usize/u64 <= 8.
unsafe impl EmbeddedHeader for SmallObject {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SmallStats {
    pub used: usize,
    pub objcount: usize,
}

/// General-purpose allocator drawing from a shared byte quota.
pub struct SmallAlloc {
    quota: Arc<Quota>,
    objects: Vec<NonNull<SmallObject>>,
    used: usize,
    id: u64,
    handler: HandlerRef,
}

impl SmallAlloc {
    /// Creates an allocator over `quota`. The sizing parameters shape size
    /// classes in the production allocator and have no effect here; the
    /// factor actually in use is returned alongside.
    pub fn new(
        quota: Arc<Quota>,
        objsize_min: u32,
        granularity: usize,
        alloc_factor: f32,
    ) -> (Self, f32) {
        Self::with_handler(quota, objsize_min, granularity, alloc_factor, default_handler())
    }

    pub fn with_handler(
        quota: Arc<Quota>,
        _objsize_min: u32,
        _granularity: usize,
        alloc_factor: f32,
        handler: HandlerRef,
    ) -> (Self, f32) {
        let alloc = Self {
            quota,
            objects: Vec::new(),
            used: 0,
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            handler,
        };
        (alloc, alloc_factor)
    }

    /// Allocates `size` bytes, or `None` if the quota domain has no room.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.quota.lease(size).ok()?;
        let mut block = Block::<SmallObject>::alloc(size, SMALL_ALIGNMENT);
        let header = block.header_mut();
        header.size = size;
        header.owner_id = self.id;
        header.index = self.objects.len();
        self.objects.push(block.header_ptr());
        self.used += size;
        block.poison();
        Some(block.payload())
    }

    /// Frees an object, repeating the size it was allocated with. A size
    /// mismatch is a fault; the stored size wins for the accounting. A free
    /// routed to another instance is a fault and leaves the object with its
    /// real owner.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`Self::alloc`] of some instance
    /// and not freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: ptr is a live object payload per the contract.
        let block = unsafe { Block::<SmallObject>::from_payload(ptr) };
        let header = block.header();
        if header.owner_id != self.id {
            self.handler.on_fault(Fault::ForeignFree {
                owner: header.owner_id,
                freeing: self.id,
            });
            return;
        }
        if header.size != size {
            self.handler.on_fault(Fault::FreeSizeMismatch {
                stored: header.size,
                given: size,
            });
        }
        let stored = header.size;
        let index = header.index;
        self.quota.end_lease(stored);
        debug_assert_eq!(self.objects[index], block.header_ptr());
        self.objects.swap_remove(index);
        if index < self.objects.len() {
            let moved = self.objects[index];
            // SAFETY: moved points at a live object of this instance.
            unsafe { Block::from_header(moved) }.header_mut().index = index;
        }
        self.used -= stored;
        block.free(&*self.handler);
    }

    /// Bytes held by live objects.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of live objects.
    pub fn count(&self) -> usize {
        self.objects.len()
    }

    pub fn quota(&self) -> &Arc<Quota> {
        &self.quota
    }

    pub fn stats(&self) -> SmallStats {
        SmallStats {
            used: self.used,
            objcount: self.objects.len(),
        }
    }
}

impl Drop for SmallAlloc {
    /// Returns every outstanding lease to the quota and frees the objects.
    fn drop(&mut self) {
        for &object in &self.objects {
            // SAFETY: the membership list only holds live objects.
            let block = unsafe { Block::from_header(object) };
            self.quota.end_lease(block.header().size);
            block.free(&*self.handler);
        }
        self.objects.clear();
    }
}
