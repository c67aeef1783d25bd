//! Scatter/gather output buffer with savepoint rollback.
//!
//! The buffer exposes its contents as a fixed list of iovec-style slots so
//! writers can hand the whole thing to vectored I/O without the slot list
//! ever reallocating. The first [`OBUF_CHECKED_COUNT`] slots are checked:
//! each holds exactly one guarded block, so out-of-bound writes on early
//! allocations are caught with single-allocation granularity. Once the
//! checked slots run out, allocations fall back to exponentially growing
//! plain heap blocks shared by many allocations, which bounds the slot
//! count at [`OBUF_IOV_MAX`].
//!
//! Checked payloads are aligned to 1 byte, so they always land on odd
//! addresses and unaligned-access assumptions in writer code surface early.

use std::ptr::NonNull;

use serde::Serialize;

use crate::block::{heap_alloc, heap_free, Block, BlockHeader, EmbeddedHeader};
use crate::fault::{default_handler, Fault, HandlerRef};
use crate::guard;
use crate::util::page_size;

/// Slot list length. The list is null-terminated, so the largest usable
/// slot index is `OBUF_IOV_MAX - 1`.
pub const OBUF_IOV_MAX: usize = 1024;

/// Number of exponentially growing slots at the end of the slot list.
pub const OBUF_GEOMETRIC_COUNT: usize = 32;

/// Number of checked slots at the beginning of the slot list, each backed
/// by its own guarded block.
pub const OBUF_CHECKED_COUNT: usize = OBUF_IOV_MAX + 1 - OBUF_GEOMETRIC_COUNT;

/// Checked allocations are deliberately unaligned.
const OBUF_ALIGNMENT: usize = 1;

/// Stub header: checked blocks carry no extra state, the block layout alone
/// provides the guards and the odd payload address.
#[repr(C)]
struct ObufAllocation {
    common: BlockHeader,
}

// SAFETY: repr(C), BlockHeader is the only field.
unsafe impl EmbeddedHeader for ObufAllocation {}

/// One gather slot: a base pointer and the bytes used so far.
#[derive(Debug, Clone, Copy)]
pub struct ObufSlot {
    ptr: *mut u8,
    len: usize,
}

impl ObufSlot {
    const NULL: Self = Self {
        ptr: std::ptr::null_mut(),
        len: 0,
    };

    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Savepoint: a position the buffer can roll back to.
///
/// The zero value denotes the empty buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObufSvp {
    pos: usize,
    iov_len: usize,
    used: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObufStats {
    pub used: usize,
    pub iovcnt: usize,
}

/// Output buffer over a null-terminated slot list.
pub struct Obuf {
    /// Slot list, allocated once and never reallocated.
    slots: Vec<ObufSlot>,
    /// First capacity of the geometric slots; doubles per slot and is
    /// raised further if a single allocation does not fit.
    start_capacity: usize,
    /// Capacities of the geometric slots. Off by one against the slot list
    /// because that list is null-terminated.
    capacity: [usize; OBUF_GEOMETRIC_COUNT - 1],
    /// Index of the slot holding the last allocation. `pos == 0` with a
    /// null slot 0 means the buffer is empty; the ambiguity is historical
    /// and savepoint rollback compensates for it.
    pos: usize,
    used: usize,
    /// Pending reservation size, 0 if none.
    reserved: usize,
    handler: HandlerRef,
}

impl Obuf {
    pub fn new(start_capacity: usize) -> Self {
        Self::with_handler(start_capacity, default_handler())
    }

    pub fn with_handler(start_capacity: usize, handler: HandlerRef) -> Self {
        assert!(start_capacity > 0);
        Self {
            slots: vec![ObufSlot::NULL; OBUF_IOV_MAX + 1],
            start_capacity,
            capacity: [0; OBUF_GEOMETRIC_COUNT - 1],
            pos: 0,
            used: 0,
            reserved: 0,
            handler,
        }
    }

    /// Allocate a new memory block whether for allocation or reservation.
    fn prepare_buf(&mut self, size: usize) -> NonNull<u8> {
        if self.pos >= OBUF_CHECKED_COUNT - 1 {
            let gpos = self.pos as isize - OBUF_CHECKED_COUNT as isize;
            if gpos < 0 || self.slots[self.pos].len + size > self.capacity[gpos as usize] {
                let mut capacity = self.start_capacity << ((gpos + 1) as u32);
                while capacity < size {
                    capacity <<= 1;
                }
                self.pos += 1;
                if self.pos >= OBUF_IOV_MAX {
                    self.handler.on_fault(Fault::Invariant("obuf slot list exhausted"));
                }
                let ptr = heap_alloc(capacity);
                self.slots[self.pos] = ObufSlot {
                    ptr: ptr.as_ptr(),
                    len: 0,
                };
                self.capacity[(gpos + 1) as usize] = capacity;
            }
            let slot = self.slots[self.pos];
            // SAFETY: len <= capacity of the slot's heap block.
            return unsafe { NonNull::new_unchecked(slot.ptr.add(slot.len)) };
        }

        let block = Block::<ObufAllocation>::alloc(size, OBUF_ALIGNMENT);
        // A checked slot holds exactly one block; see the `pos` field notes.
        if !self.slots[self.pos].ptr.is_null() {
            self.pos += 1;
        }
        self.slots[self.pos] = ObufSlot {
            ptr: block.payload().as_ptr(),
            len: 0,
        };
        block.poison();
        block.payload()
    }

    /// Reserves at least `size` bytes (floored to one page) of contiguous
    /// space without committing them. The reservation is committed, in
    /// full or in part, by the next [`Self::alloc`]. Reserving twice is a
    /// fault.
    pub fn reserve(&mut self, size: usize) -> NonNull<u8> {
        if self.reserved != 0 {
            self.handler.on_fault(Fault::DoubleReservation);
        }
        let size = size.max(page_size());
        let ptr = self.prepare_buf(size);
        self.reserved = size;
        ptr
    }

    /// Allocate memory in case of a prior reservation.
    fn alloc_reserved(&mut self, size: usize) -> NonNull<u8> {
        if size > self.reserved {
            self.handler.on_fault(Fault::ReservationOverrun {
                requested: size,
                reserved: self.reserved,
            });
        }
        let slot = &mut self.slots[self.pos];
        // SAFETY: the slot's block covers at least `reserved` bytes past len.
        let ptr = unsafe { NonNull::new_unchecked(slot.ptr.add(slot.len)) };
        slot.len += size;
        self.used += size;
        if self.pos < OBUF_CHECKED_COUNT {
            // SAFETY: the reserved remainder of a checked block is dead.
            unsafe {
                guard::poison_region(ptr.as_ptr().add(size), self.reserved.saturating_sub(size))
            };
        }
        self.reserved = 0;
        ptr
    }

    /// Commits `size` bytes. Consumes a pending reservation if one exists,
    /// otherwise allocates fresh space.
    pub fn alloc(&mut self, size: usize) -> NonNull<u8> {
        if self.reserved != 0 {
            return self.alloc_reserved(size);
        }
        let ptr = self.prepare_buf(size);
        self.slots[self.pos].len += size;
        self.used += size;
        ptr
    }

    /// Appends a copy of `data` and returns the number of bytes written.
    pub fn dup(&mut self, data: &[u8]) -> usize {
        let ptr = self.alloc(data.len());
        // SAFETY: alloc returned data.len() writable bytes.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len()) };
        data.len()
    }

    /// Captures the current position for a later rollback.
    pub fn create_svp(&self) -> ObufSvp {
        ObufSvp {
            pos: self.pos,
            iov_len: self.slots[self.pos].len,
            used: self.used,
        }
    }

    /// Address of the first byte written after `svp` was taken. Null for
    /// the zero savepoint of an empty buffer.
    pub fn svp_to_ptr(&self, svp: &ObufSvp) -> *mut u8 {
        let slot = self.slots[svp.pos];
        if slot.ptr.is_null() {
            return slot.ptr;
        }
        // SAFETY: iov_len of a captured savepoint stays inside the slot.
        unsafe { slot.ptr.add(svp.iov_len) }
    }

    /// Rolls the buffer back to `svp`, releasing every slot filled after
    /// it and restoring the savepoint slot's fill level.
    pub fn rollback_to_svp(&mut self, svp: &ObufSvp) {
        if svp.pos > self.pos {
            self.handler.on_fault(Fault::Invariant("obuf savepoint ahead of buffer"));
            return;
        }
        let mut start = svp.pos;
        // Freeing usually starts after the savepoint slot, except that the
        // zero savepoint of a non-empty buffer must release slot 0 too.
        if !(svp.pos == 0 && svp.iov_len == 0 && !self.slots[0].ptr.is_null()) {
            start += 1;
        }

        let checked_end = self.pos.min(OBUF_CHECKED_COUNT - 1);
        let mut i = start;
        while i <= checked_end {
            if let Some(payload) = NonNull::new(self.slots[i].ptr) {
                // SAFETY: checked slots hold live payloads of their blocks.
                unsafe { Block::<ObufAllocation>::from_payload(payload) }.free(&*self.handler);
            }
            i += 1;
        }

        let geo_start = start.max(OBUF_CHECKED_COUNT);
        let mut i = geo_start;
        while i <= self.pos {
            if let Some(ptr) = NonNull::new(self.slots[i].ptr) {
                heap_free(ptr);
            }
            self.capacity[i - OBUF_CHECKED_COUNT] = 0;
            i += 1;
        }

        let mut i = start;
        while i <= self.pos {
            self.slots[i] = ObufSlot::NULL;
            i += 1;
        }
        self.pos = svp.pos;
        self.used = svp.used;
        self.slots[self.pos].len = svp.iov_len;
        self.reserved = 0;
    }

    /// Releases everything.
    pub fn reset(&mut self) {
        self.rollback_to_svp(&ObufSvp::default());
    }

    /// Total committed bytes.
    pub fn size(&self) -> usize {
        self.used
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of filled slots, as passed to vectored I/O.
    pub fn iovcnt(&self) -> usize {
        if self.slots[self.pos].ptr.is_null() {
            self.pos
        } else {
            self.pos + 1
        }
    }

    /// The filled slots in output order.
    pub fn iovecs(&self) -> &[ObufSlot] {
        &self.slots[..self.iovcnt()]
    }

    pub fn stats(&self) -> ObufStats {
        ObufStats {
            used: self.used,
            iovcnt: self.iovcnt(),
        }
    }
}

impl Drop for Obuf {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::CapturingHandler;

    fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), byte, len) };
    }

    #[test]
    fn test_alloc_tracks_used_and_iovcnt() {
        let mut obuf = Obuf::new(64);
        assert_eq!(obuf.iovcnt(), 0);
        obuf.alloc(10);
        obuf.alloc(20);
        obuf.alloc(30);
        assert_eq!(obuf.used(), 60);
        assert_eq!(obuf.iovcnt(), 3);
        let lens: Vec<_> = obuf.iovecs().iter().map(|s| s.len()).collect();
        assert_eq!(lens, vec![10, 20, 30]);
    }

    #[test]
    fn test_checked_payloads_are_odd() {
        let mut obuf = Obuf::new(64);
        for size in [1usize, 7, 100, 4000] {
            let addr = obuf.alloc(size).as_ptr() as usize;
            assert_eq!(addr % 2, 1);
        }
    }

    #[test]
    fn test_reserve_then_alloc_returns_same_pointer() {
        let mut obuf = Obuf::new(64);
        let reserved = obuf.reserve(100);
        fill(reserved, 100, 0xab);
        let committed = obuf.alloc(100);
        assert_eq!(reserved, committed);
        assert_eq!(obuf.used(), 100);
        unsafe { assert_eq!(committed.as_ptr().read(), 0xab) };
    }

    #[test]
    fn test_double_reserve_is_fault() {
        let handler = CapturingHandler::new();
        let mut obuf = Obuf::with_handler(64, handler.clone());
        obuf.reserve(10);
        obuf.reserve(10);
        assert_eq!(handler.take(), vec![Fault::DoubleReservation]);
    }

    #[test]
    fn test_rollback_to_empty() {
        let mut obuf = Obuf::new(64);
        let svp = obuf.create_svp();
        assert_eq!(svp, ObufSvp::default());
        obuf.alloc(10);
        obuf.alloc(20);
        obuf.rollback_to_svp(&svp);
        assert_eq!(obuf.used(), 0);
        assert_eq!(obuf.iovcnt(), 0);
        // The buffer stays usable.
        obuf.alloc(5);
        assert_eq!(obuf.used(), 5);
        assert_eq!(obuf.iovcnt(), 1);
    }

    #[test]
    fn test_rollback_keeps_savepoint_slot_fill() {
        let mut obuf = Obuf::new(64);
        let first = obuf.alloc(10);
        fill(first, 10, 0x11);
        let svp = obuf.create_svp();
        obuf.alloc(20);
        obuf.alloc(30);
        assert_eq!(obuf.iovcnt(), 3);
        obuf.rollback_to_svp(&svp);
        assert_eq!(obuf.used(), 10);
        assert_eq!(obuf.iovcnt(), 1);
        assert_eq!(obuf.iovecs()[0].len(), 10);
        unsafe { assert_eq!(first.as_ptr().add(9).read(), 0x11) };
    }

    #[test]
    fn test_svp_to_ptr_points_at_next_write() {
        let mut obuf = Obuf::new(64);
        obuf.dup(b"head");
        let svp = obuf.create_svp();
        assert!(!obuf.svp_to_ptr(&svp).is_null());
        // Nothing written since the savepoint: the pointer is one past the
        // slot's current fill.
        let slot = obuf.iovecs()[0];
        assert_eq!(obuf.svp_to_ptr(&svp) as usize, slot.ptr() as usize + 4);
    }

    #[test]
    fn test_dup_copies_bytes() {
        let mut obuf = Obuf::new(64);
        assert_eq!(obuf.dup(b"hello"), 5);
        let slot = obuf.iovecs()[0];
        let view = unsafe { std::slice::from_raw_parts(slot.ptr(), slot.len()) };
        assert_eq!(view, b"hello");
    }

    #[test]
    fn test_rollback_with_pending_reservation() {
        let mut obuf = Obuf::new(64);
        obuf.alloc(10);
        let svp = obuf.create_svp();
        obuf.reserve(50);
        obuf.rollback_to_svp(&svp);
        assert_eq!(obuf.used(), 10);
        obuf.reserve(50);
        obuf.alloc(50);
        assert_eq!(obuf.used(), 60);
    }

    #[test]
    fn test_geometric_transition_bounds_slot_count() {
        let mut obuf = Obuf::new(64);
        for _ in 0..OBUF_CHECKED_COUNT {
            obuf.alloc(1);
        }
        assert_eq!(obuf.iovcnt(), OBUF_CHECKED_COUNT);

        // Further allocations share geometric slots instead of growing the
        // slot list per allocation.
        let mut prev = obuf.alloc(1);
        for _ in 1..64 {
            let next = obuf.alloc(1);
            assert_eq!(next.as_ptr() as usize, prev.as_ptr() as usize + 1);
            prev = next;
        }
        assert_eq!(obuf.iovcnt(), OBUF_CHECKED_COUNT + 1);
        // The 65th byte overflows the 64-byte slot into the next one,
        // which doubles in capacity.
        obuf.alloc(1);
        assert_eq!(obuf.iovcnt(), OBUF_CHECKED_COUNT + 2);
        assert_eq!(obuf.used(), OBUF_CHECKED_COUNT + 65);
    }

    #[test]
    fn test_oversized_geometric_alloc_fits_one_slot() {
        let mut obuf = Obuf::new(64);
        for _ in 0..OBUF_CHECKED_COUNT {
            obuf.alloc(1);
        }
        let big = obuf.alloc(10_000);
        fill(big, 10_000, 0x5a);
        assert_eq!(obuf.iovcnt(), OBUF_CHECKED_COUNT + 1);
        assert_eq!(obuf.iovecs()[OBUF_CHECKED_COUNT].len(), 10_000);
    }

    #[test]
    fn test_rollback_out_of_geometric_region() {
        let mut obuf = Obuf::new(64);
        for _ in 0..OBUF_CHECKED_COUNT {
            obuf.alloc(1);
        }
        let svp = obuf.create_svp();
        for _ in 0..200 {
            obuf.alloc(1);
        }
        assert!(obuf.iovcnt() > OBUF_CHECKED_COUNT);
        obuf.rollback_to_svp(&svp);
        assert_eq!(obuf.used(), OBUF_CHECKED_COUNT);
        assert_eq!(obuf.iovcnt(), OBUF_CHECKED_COUNT);
        // Geometric capacities were cleared; growth restarts cleanly.
        obuf.alloc(1);
        assert_eq!(obuf.iovcnt(), OBUF_CHECKED_COUNT + 1);
    }

    #[test]
    fn test_savepoint_ahead_is_fault() {
        let handler = CapturingHandler::new();
        let mut obuf = Obuf::with_handler(64, handler.clone());
        obuf.alloc(1);
        obuf.alloc(1);
        let svp = obuf.create_svp();
        obuf.rollback_to_svp(&ObufSvp::default());
        obuf.rollback_to_svp(&svp);
        assert_eq!(
            handler.take(),
            vec![Fault::Invariant("obuf savepoint ahead of buffer")]
        );
    }

    #[test]
    fn test_stats() {
        let mut obuf = Obuf::new(64);
        obuf.alloc(16);
        obuf.alloc(16);
        let stats = obuf.stats();
        assert_eq!(stats.used, 32);
        assert_eq!(stats.iovcnt, 2);
    }
}
