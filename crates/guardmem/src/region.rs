//! Stack allocator with two-phase reserve/alloc and rollback by truncation.
//!
//! Each reservation or allocation is one isolated guarded block; the
//! membership stack keeps the most recent record last. Reservations are
//! floored to one memory page so code paths stay comparable to the
//! production arena. Truncation only ever cuts whole records: carving into
//! the middle of a committed allocation is an invariant violation.

use std::ptr::NonNull;

use serde::Serialize;

use crate::block::{Block, BlockHeader, EmbeddedHeader};
use crate::fault::{default_handler, Fault, HandlerRef};
use crate::guard;
use crate::util::page_size;

#[repr(C)]
struct RegionAllocation {
    common: BlockHeader,
    /// Bytes the block was allocated for (page-floored for reservations).
    size: usize,
    /// Bytes actually consumed by committed allocations, 0 while reserved.
    used: usize,
    alignment: usize,
}

// SAFETY: repr(C), BlockHeader first, alignment of usize <= 8.
unsafe impl EmbeddedHeader for RegionAllocation {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegionStats {
    /// Committed bytes.
    pub used: usize,
    /// Bytes held in blocks, including reserved and padding-free totals.
    pub total: usize,
}

/// Hook invoked with the delta size of an event.
pub type RegionCallback = Box<dyn FnMut(usize)>;

/// Stack allocator with reservation and truncate-to-mark rollback.
pub struct Region {
    allocations: Vec<NonNull<RegionAllocation>>,
    used: usize,
    total: usize,
    /// Nonzero while a reservation is pending.
    reserved: usize,
    handler: HandlerRef,
    on_alloc: Option<RegionCallback>,
    on_truncate: Option<RegionCallback>,
}

impl Region {
    pub fn new() -> Self {
        Self::with_handler(default_handler())
    }

    pub fn with_handler(handler: HandlerRef) -> Self {
        Self {
            allocations: Vec::new(),
            used: 0,
            total: 0,
            reserved: 0,
            handler,
            on_alloc: None,
            on_truncate: None,
        }
    }

    /// Registers a hook fired on every committed allocation with its size.
    pub fn set_on_alloc(&mut self, cb: RegionCallback) {
        self.on_alloc = Some(cb);
    }

    /// Registers a hook fired on every truncate with the cut size.
    pub fn set_on_truncate(&mut self, cb: RegionCallback) {
        self.on_truncate = Some(cb);
    }

    /// Allocate a new block whether for allocation or reservation.
    fn prepare_buf(&mut self, size: usize, alignment: usize, used: usize) -> NonNull<u8> {
        let mut block = Block::<RegionAllocation>::alloc(size, alignment);
        let header = block.header_mut();
        header.size = size;
        header.used = used;
        header.alignment = alignment;
        self.allocations.push(block.header_ptr());
        self.total += size;
        block.poison();
        block.payload()
    }

    /// Reserves at least `size` bytes (floored to one page) aligned to
    /// `alignment` without committing them. A reservation may already be
    /// written through the returned pointer; it is committed by the next
    /// [`Self::aligned_alloc`]. Reserving twice is a fault.
    pub fn aligned_reserve(&mut self, size: usize, alignment: usize) -> NonNull<u8> {
        if self.reserved != 0 {
            self.handler.on_fault(Fault::DoubleReservation);
        }
        let size = size.max(page_size());
        let ptr = self.prepare_buf(size, alignment, 0);
        self.reserved = size;
        ptr
    }

    /// Allocate in case of a prior reservation: consume `size` bytes from
    /// the reserved block and give the unused remainder back to the guard.
    fn alloc_reserved(&mut self, size: usize, alignment: usize) -> NonNull<u8> {
        if size > self.reserved {
            self.handler.on_fault(Fault::ReservationOverrun {
                requested: size,
                reserved: self.reserved,
            });
        }
        let top = *self.allocations.last().expect("pending reservation block");
        // SAFETY: top is the live reservation record.
        let mut block = unsafe { Block::from_header(top) };
        let header = block.header_mut();
        if header.alignment != alignment {
            self.handler.on_fault(Fault::AlignmentMismatch {
                reserved: header.alignment,
                requested: alignment,
            });
        }
        header.used += size;
        let block_size = header.size;
        self.used += size;
        self.reserved = 0;

        let payload = block.payload();
        // SAFETY: the remainder of the reserved block is dead again.
        unsafe {
            guard::poison_region(
                payload.as_ptr().add(size),
                block_size.saturating_sub(size),
            )
        };
        if let Some(cb) = self.on_alloc.as_mut() {
            cb(size);
        }
        payload
    }

    /// Commits `size` bytes aligned to `alignment`. Consumes a pending
    /// reservation if one exists (its alignment must match), otherwise
    /// reserves-and-commits in one step sized exactly to `size`.
    pub fn aligned_alloc(&mut self, size: usize, alignment: usize) -> NonNull<u8> {
        if self.reserved != 0 {
            return self.alloc_reserved(size, alignment);
        }
        let ptr = self.prepare_buf(size, alignment, size);
        self.used += size;
        if let Some(cb) = self.on_alloc.as_mut() {
            cb(size);
        }
        ptr
    }

    /// Byte-aligned reservation.
    pub fn reserve(&mut self, size: usize) -> NonNull<u8> {
        self.aligned_reserve(size, 1)
    }

    /// Byte-aligned allocation.
    pub fn alloc(&mut self, size: usize) -> NonNull<u8> {
        self.aligned_alloc(size, 1)
    }

    /// Rolls the region back to a prior usage mark, releasing every record
    /// committed after it. The mark is a value previously observed via
    /// [`Self::used`]. Cutting into the middle of a record is a fault.
    pub fn truncate(&mut self, used: usize) {
        if used > self.used {
            self.handler.on_fault(Fault::Invariant("truncate target exceeds used"));
            return;
        }
        let cut_size = self.used - used;
        let mut cut = cut_size;
        while let Some(&top) = self.allocations.last() {
            // SAFETY: membership holds only live records.
            let block = unsafe { Block::from_header(top) };
            let record_used = block.header().used;
            // The first check lets pure reservations (used == 0) be dropped
            // even when nothing is being cut.
            if cut == 0 && record_used != 0 {
                break;
            }
            if record_used > cut {
                self.handler.on_fault(Fault::TruncateMidBlock {
                    record_used,
                    cut,
                });
                break;
            }
            cut -= record_used;
            self.total -= block.header().size;
            self.allocations.pop();
            block.free(&*self.handler);
        }
        self.used = used;
        self.reserved = 0;
        if let Some(cb) = self.on_truncate.as_mut() {
            cb(cut_size);
        }
    }

    /// Releases everything.
    pub fn reset(&mut self) {
        self.truncate(0);
    }

    /// Copies the most recent `size` committed bytes into one fresh
    /// contiguous allocation and returns it. The source records stay live.
    pub fn join(&mut self, size: usize) -> NonNull<u8> {
        if size > self.used {
            self.handler.on_fault(Fault::Invariant("join size exceeds used"));
        }
        if self.reserved != 0 {
            self.handler.on_fault(Fault::Invariant("join with pending reservation"));
        }
        let newest = self.allocations.len();
        let ret = self.alloc(size);
        let mut offset = size;
        let mut index = newest;
        while offset > 0 {
            index -= 1;
            // SAFETY: records below the join block are live.
            let block = unsafe { Block::from_header(self.allocations[index]) };
            let copy_size = block.header().used.min(offset);
            // SAFETY: both ranges are live payload bytes of distinct blocks.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    block.payload().as_ptr(),
                    ret.as_ptr().add(offset - copy_size),
                    copy_size,
                );
            }
            offset -= copy_size;
        }
        ret
    }

    /// Committed bytes; doubles as the truncate savepoint.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes held in blocks, including uncommitted reservations.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Pending reservation size, 0 if none.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn stats(&self) -> RegionStats {
        RegionStats {
            used: self.used,
            total: self.total,
        }
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        for &record in &self.allocations {
            // SAFETY: membership holds only live records.
            unsafe { Block::from_header(record) }.free(&*self.handler);
        }
        self.allocations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::CapturingHandler;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_alloc_updates_used() {
        let mut region = Region::new();
        region.aligned_alloc(100, 4);
        region.aligned_alloc(50, 4);
        assert_eq!(region.used(), 150);
        assert!(region.total() >= 150);
    }

    #[test]
    fn test_reserve_then_alloc_returns_same_pointer() {
        let mut region = Region::new();
        let reserved = region.aligned_reserve(300, 8);
        assert_eq!(region.used(), 0);
        assert_eq!(region.reserved(), page_size());
        let committed = region.aligned_alloc(200, 8);
        assert_eq!(reserved, committed);
        assert_eq!(region.used(), 200);
        assert_eq!(region.reserved(), 0);
    }

    #[test]
    fn test_reserve_floors_to_page() {
        let mut region = Region::new();
        region.reserve(1);
        assert_eq!(region.reserved(), page_size());
    }

    #[test]
    fn test_alloc_reserved_poisons_remainder() {
        let mut region = Region::new();
        let ptr = region.aligned_reserve(64, 1);
        let reserved = region.reserved();
        region.aligned_alloc(10, 1);
        unsafe {
            assert!(guard::region_is_poisoned(
                ptr.as_ptr().add(10),
                reserved - 10
            ));
        }
    }

    #[test]
    fn test_double_reserve_is_fault() {
        let handler = CapturingHandler::new();
        let mut region = Region::with_handler(handler.clone());
        region.reserve(10);
        region.reserve(10);
        assert_eq!(handler.take(), vec![Fault::DoubleReservation]);
    }

    #[test]
    fn test_truncate_to_savepoint() {
        let mut region = Region::new();
        region.alloc(100);
        let svp = region.used();
        let second = region.alloc(70);
        unsafe { std::ptr::write_bytes(second.as_ptr(), 1, 70) };
        region.truncate(svp);
        assert_eq!(region.used(), svp);
        // The savepoint block survives and can still be extended past.
        region.alloc(30);
        assert_eq!(region.used(), svp + 30);
    }

    #[test]
    fn test_truncate_drops_pending_reservation() {
        let mut region = Region::new();
        region.alloc(10);
        region.reserve(100);
        region.truncate(10);
        assert_eq!(region.reserved(), 0);
        assert_eq!(region.used(), 10);
    }

    #[test]
    fn test_truncate_mid_block_is_fault() {
        let handler = CapturingHandler::new();
        let mut region = Region::with_handler(handler.clone());
        region.alloc(100);
        region.truncate(50);
        assert_eq!(
            handler.take(),
            vec![Fault::TruncateMidBlock {
                record_used: 100,
                cut: 50
            }]
        );
    }

    #[test]
    fn test_join_reconstructs_tail() {
        let mut region = Region::new();
        let a = region.alloc(3);
        let b = region.alloc(3);
        unsafe {
            std::ptr::copy_nonoverlapping(b"abc".as_ptr(), a.as_ptr(), 3);
            std::ptr::copy_nonoverlapping(b"def".as_ptr(), b.as_ptr(), 3);
        }
        let joined = region.join(6);
        let view = unsafe { std::slice::from_raw_parts(joined.as_ptr(), 6) };
        assert_eq!(view, b"abcdef");
        // Join itself committed 6 more bytes.
        assert_eq!(region.used(), 12);
    }

    #[test]
    fn test_callbacks_carry_deltas() {
        let allocs = Rc::new(RefCell::new(Vec::new()));
        let cuts = Rc::new(RefCell::new(Vec::new()));
        let mut region = Region::new();
        let a = Rc::clone(&allocs);
        region.set_on_alloc(Box::new(move |size| a.borrow_mut().push(size)));
        let c = Rc::clone(&cuts);
        region.set_on_truncate(Box::new(move |size| c.borrow_mut().push(size)));

        region.alloc(40);
        region.reserve(100);
        region.alloc(25);
        region.truncate(40);
        assert_eq!(*allocs.borrow(), vec![40, 25]);
        assert_eq!(*cuts.borrow(), vec![25]);
    }

    #[test]
    fn test_reset_releases_everything() {
        let mut region = Region::new();
        for _ in 0..8 {
            region.alloc(128);
        }
        region.reset();
        assert_eq!(region.used(), 0);
        assert_eq!(region.total(), 0);
    }
}
