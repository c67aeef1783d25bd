//! Guard poisoning primitive.
//!
//! Models the external "mark range inaccessible / query poisoned" capability
//! by filling dead byte ranges with a poison pattern and verifying the
//! pattern on query. Ranges that still carry live metadata (block headers,
//! offset slots, the magic gap) are never filled; reading them back is the
//! narrow unchecked region of the block view.
//!
//! The instrumentation cannot address-align arbitrary range starts: a range
//! is only precisely coverable when it ends on a [`POISON_ALIGNMENT`]
//! boundary or at the end of a heap block. The bytes between the last
//! coverable boundary and a payload are therefore protected by [`MAGIC`]
//! instead, checked when the block is freed.

/// Poison granularity of the instrumentation.
pub const POISON_ALIGNMENT: usize = 8;

/// Byte written over dead ranges.
pub const POISON_BYTE: u8 = 0xa5;

/// Random magic for the gap that cannot be poisoned.
pub const MAGIC: u64 = 0x9cb6_9dbf_5353_47d8;

/// Mark `len` bytes at `ptr` inaccessible.
///
/// # Safety
/// `ptr` must point to a valid writable region of at least `len` bytes that
/// holds no live data.
#[inline]
pub unsafe fn poison_region(ptr: *mut u8, len: usize) {
    // SAFETY: caller guarantees the range is valid and dead.
    unsafe { std::ptr::write_bytes(ptr, POISON_BYTE, len) };
}

/// Query whether all `len` bytes at `ptr` are still marked inaccessible.
///
/// # Safety
/// `ptr` must point to a valid readable region of at least `len` bytes.
pub unsafe fn region_is_poisoned(ptr: *const u8, len: usize) -> bool {
    for i in 0..len {
        // SAFETY: i < len, in bounds per caller contract.
        if unsafe { ptr.add(i).read() } != POISON_BYTE {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poison_and_query() {
        let mut buf = [0u8; 64];
        unsafe {
            poison_region(buf.as_mut_ptr(), 64);
            assert!(region_is_poisoned(buf.as_ptr(), 64));
        }
    }

    #[test]
    fn test_query_detects_overwrite() {
        let mut buf = [0u8; 32];
        unsafe {
            poison_region(buf.as_mut_ptr(), 32);
        }
        buf[17] = 0;
        unsafe {
            assert!(!region_is_poisoned(buf.as_ptr(), 32));
            assert!(region_is_poisoned(buf.as_ptr(), 17));
        }
    }

    #[test]
    fn test_empty_range_is_poisoned() {
        let buf = [0u8; 1];
        // A zero-length range is trivially covered.
        unsafe { assert!(region_is_poisoned(buf.as_ptr(), 0)) };
    }
}
