//! Typed block view: one heap allocation holding a header next to a payload.
//!
//! Every logical allocation of every allocator in this crate is backed by
//! one isolated heap block so that instrumentation can catch corruption with
//! single-allocation granularity. The block holds, in address order:
//!
//! ```text
//!     MMM HHHHHHH PPP ox AAAAAAAA TTTT
//! ```
//!
//! where `H` is the allocator-specific header (aligned to
//! [`HEADER_ALIGNMENT`]), `A` the payload, `M`/`P`/`T` dead margins, `o` a
//! 16-bit header-to-payload offset slot, and `x` the magic gap covering the
//! bytes before the payload that the poisoning primitive cannot reach.
//!
//! The payload is aligned to the requested alignment `A` but deliberately
//! never to `2A`, so unaligned-access bugs stay visible. The header's first
//! field records the distances to the block base and to the payload; the
//! offset slot below the magic gap lets the header be recovered from a bare
//! payload pointer. All raw pointer arithmetic of the crate lives here.

use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use crate::fault::{Fault, FaultHandler};
use crate::guard::{self, MAGIC, POISON_ALIGNMENT};
use crate::util::{align_down, align_up};

/// Alignment of the header area. Large enough for any header field type.
pub const HEADER_ALIGNMENT: usize = mem::size_of::<u64>();

/// Common first member of every allocator header.
///
/// Both offsets fit 16 bits; block layout keeps them small by construction.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    /// Distance from the header back to the block base in bytes.
    base_offset: u16,
    /// Distance from the header forward to the payload in bytes.
    payload_offset: u16,
}

/// Marker for types embeddable as block headers.
///
/// # Safety
/// Implementors must be `#[repr(C)]` with a [`BlockHeader`] as their first
/// field and an alignment not exceeding [`HEADER_ALIGNMENT`].
pub unsafe trait EmbeddedHeader: Sized {}

/// Header area size for `H`, padded so any following data stays aligned.
#[inline]
pub const fn padded_header_size<H: EmbeddedHeader>() -> usize {
    align_up(mem::size_of::<H>(), HEADER_ALIGNMENT)
}

/// Total heap block size for a payload of `payload_size` bytes aligned to
/// `alignment` under header type `H`.
///
/// The `2 * alignment - 1` slack both aligns the payload to `alignment` and
/// leaves room to step it off the `2 * alignment` boundary.
#[inline]
pub const fn block_size<H: EmbeddedHeader>(payload_size: usize, alignment: usize) -> usize {
    HEADER_ALIGNMENT
        + padded_header_size::<H>()
        + (POISON_ALIGNMENT - 1)
        + mem::size_of::<u16>()
        + (2 * alignment - 1)
        + payload_size
}

/// Fatal out-of-memory path: nothing below this layer can recover.
#[cold]
fn oom_abort(size: usize) -> ! {
    eprintln!("guardmem: failed to allocate {size} bytes");
    std::process::abort();
}

/// Fallible heap allocation of `size` raw bytes.
#[inline]
pub(crate) fn try_heap_alloc(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: malloc with any size is sound; null is handled by the caller.
    NonNull::new(unsafe { libc::malloc(size.max(1)) as *mut u8 })
}

/// Heap allocation that aborts the process on exhaustion.
#[inline]
pub(crate) fn heap_alloc(size: usize) -> NonNull<u8> {
    match try_heap_alloc(size) {
        Some(ptr) => ptr,
        None => oom_abort(size),
    }
}

/// Release a raw heap block obtained from [`heap_alloc`].
#[inline]
pub(crate) fn heap_free(ptr: NonNull<u8>) {
    // SAFETY: ptr came from libc::malloc and is freed exactly once.
    unsafe { libc::free(ptr.as_ptr() as *mut libc::c_void) };
}

/// View over one live block, reconstructed per access.
pub(crate) struct Block<H> {
    base: NonNull<u8>,
    header: NonNull<H>,
    payload: NonNull<u8>,
    _marker: PhantomData<*mut H>,
}

impl<H: EmbeddedHeader> Block<H> {
    /// Allocates a block for `payload_size` bytes aligned to `alignment`
    /// (a power of two, never attainable as `2 * alignment`).
    ///
    /// The trailing margin is poisoned and the magic gap written before
    /// returning; the leading margin stays writable until [`Self::poison`]
    /// is called, after the caller has filled its header fields. Aborts the
    /// process if the heap is exhausted.
    pub fn alloc(payload_size: usize, alignment: usize) -> Self {
        assert!(alignment.is_power_of_two());
        debug_assert!(mem::align_of::<H>() <= HEADER_ALIGNMENT);

        let size = block_size::<H>(payload_size, alignment);
        let base = heap_alloc(size);

        // Place the payload from the block end: align down, then step off
        // the doubled-alignment boundary so the payload is aligned to
        // `alignment` but never to `2 * alignment`.
        let base_addr = base.as_ptr() as usize;
        let mut payload_addr = align_down(base_addr + size - payload_size, alignment);
        if payload_addr % (2 * alignment) == 0 {
            payload_addr -= alignment;
        }
        let header_addr = base_addr + HEADER_ALIGNMENT;
        debug_assert!(payload_addr >= header_addr + padded_header_size::<H>() + 2);
        let payload_offset = payload_addr - header_addr;
        assert!(payload_offset <= u16::MAX as usize);

        let header = header_addr as *mut H;
        // SAFETY: header_addr is in bounds and HEADER_ALIGNMENT-aligned;
        // H starts with a BlockHeader per the EmbeddedHeader contract.
        unsafe {
            let common = header as *mut BlockHeader;
            (*common).base_offset = HEADER_ALIGNMENT as u16;
            (*common).payload_offset = payload_offset as u16;
        }

        let magic_begin = align_down(payload_addr, POISON_ALIGNMENT);
        // SAFETY: [magic_begin - 2, payload) lies between header end and
        // payload; the block size formula reserves room for it.
        unsafe {
            ((magic_begin - 2) as *mut u8)
                .cast::<u16>()
                .write_unaligned(payload_offset as u16);
            let gap = payload_addr - magic_begin;
            std::ptr::copy_nonoverlapping(
                MAGIC.to_ne_bytes().as_ptr(),
                magic_begin as *mut u8,
                gap,
            );
        }

        // The trailing margin ends at the block end, which is always
        // precisely coverable.
        let payload_end = payload_addr + payload_size;
        // SAFETY: [payload_end, base + size) is in bounds and dead.
        unsafe { guard::poison_region(payload_end as *mut u8, base_addr + size - payload_end) };

        Self {
            base,
            // SAFETY: derived from a non-null base.
            header: unsafe { NonNull::new_unchecked(header) },
            payload: unsafe { NonNull::new_unchecked(payload_addr as *mut u8) },
            _marker: PhantomData,
        }
    }

    /// Rebuilds the view from a header pointer.
    ///
    /// Reads the header's offset fields, which are conceptually poisoned
    /// metadata; this accessor is the crate's unchecked-read region.
    ///
    /// # Safety
    /// `header` must point to the header of a live block of type `H`.
    pub unsafe fn from_header(header: NonNull<H>) -> Self {
        // SAFETY: per contract, header starts with a valid BlockHeader.
        let common = unsafe { *(header.as_ptr() as *const BlockHeader) };
        let header_addr = header.as_ptr() as usize;
        let base = header_addr - common.base_offset as usize;
        let payload = header_addr + common.payload_offset as usize;
        Self {
            // SAFETY: offsets of a live block stay within its heap range.
            base: unsafe { NonNull::new_unchecked(base as *mut u8) },
            header,
            payload: unsafe { NonNull::new_unchecked(payload as *mut u8) },
            _marker: PhantomData,
        }
    }

    /// Rebuilds the view from a payload pointer by scanning back to the
    /// poisoning boundary and reading the offset slot stored below it.
    ///
    /// # Safety
    /// `payload` must be the payload pointer of a live block of type `H`.
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        let payload_addr = payload.as_ptr() as usize;
        let magic_begin = align_down(payload_addr, POISON_ALIGNMENT);
        // SAFETY: the offset slot sits two bytes below the magic gap.
        let payload_offset = unsafe {
            ((magic_begin - 2) as *const u8)
                .cast::<u16>()
                .read_unaligned()
        } as usize;
        let header = (payload_addr - payload_offset) as *mut H;
        // SAFETY: recovered header points into the same live block.
        unsafe { Self::from_header(NonNull::new_unchecked(header)) }
    }

    #[inline]
    pub fn payload(&self) -> NonNull<u8> {
        self.payload
    }

    /// Shared access to the allocator-specific header fields.
    #[inline]
    pub fn header(&self) -> &H {
        // SAFETY: the view is only built for live blocks; the header is
        // initialized at alloc time.
        unsafe { self.header.as_ref() }
    }

    /// Mutable access to the allocator-specific header fields.
    #[inline]
    pub fn header_mut(&mut self) -> &mut H {
        // SAFETY: as for header(); the view is uniquely borrowed.
        unsafe { self.header.as_mut() }
    }

    #[inline]
    pub fn header_ptr(&self) -> NonNull<H> {
        self.header
    }

    /// Poisons the leading margin and the padding between the header and
    /// the offset slot. Called after the caller finished writing its header
    /// fields; the header bytes themselves stay readable for the
    /// unchecked-read accessors.
    pub fn poison(&self) {
        let base_addr = self.base.as_ptr() as usize;
        let header_end = self.header.as_ptr() as usize + padded_header_size::<H>();
        let slot = align_down(self.payload.as_ptr() as usize, POISON_ALIGNMENT) - 2;
        // SAFETY: both ranges are in bounds and carry no live data.
        unsafe {
            guard::poison_region(base_addr as *mut u8, HEADER_ALIGNMENT);
            guard::poison_region(header_end as *mut u8, slot - header_end);
        }
    }

    /// Verifies the magic gap and releases the block to the heap.
    ///
    /// A magic mismatch means the caller wrote below its payload; it is
    /// reported through `handler` before the block is released.
    pub fn free(self, handler: &dyn FaultHandler) {
        let payload_addr = self.payload.as_ptr() as usize;
        let magic_begin = align_down(payload_addr, POISON_ALIGNMENT);
        let gap = payload_addr - magic_begin;
        // SAFETY: the magic gap is inside the live block.
        let intact = unsafe {
            let mut ok = true;
            let magic = MAGIC.to_ne_bytes();
            for i in 0..gap {
                if (magic_begin as *const u8).add(i).read() != magic[i] {
                    ok = false;
                    break;
                }
            }
            ok
        };
        if !intact {
            handler.on_fault(Fault::MagicOverwritten);
        }
        heap_free(self.base);
    }

    #[cfg(test)]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }
}
