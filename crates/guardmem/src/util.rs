//! Alignment arithmetic and page-size discovery shared by every allocator.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Align `value` up to the next multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Align `value` down to the previous multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Check if `value` is aligned to `align`.
#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Largest power of 2 that divides `x`, i.e. its lowest set bit.
/// E.g., 128 -> 128, 96 -> 32, 48 -> 16. Returns 1 for 0.
#[inline(always)]
pub const fn largest_pow2_dividing(x: usize) -> usize {
    if x == 0 {
        return 1;
    }
    x & x.wrapping_neg()
}

/// Runtime page size, resolved from sysconf(_SC_PAGESIZE) on first use.
/// Zero means "not yet queried".
static PAGE_SIZE_CACHED: AtomicUsize = AtomicUsize::new(0);

/// Get the system page size. Falls back to 4096 if sysconf fails.
#[inline]
pub fn page_size() -> usize {
    match PAGE_SIZE_CACHED.load(Ordering::Relaxed) {
        0 => {
            // SAFETY: sysconf is always safe to call.
            let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            let ps = if ps > 0 { ps as usize } else { 4096 };
            PAGE_SIZE_CACHED.store(ps, Ordering::Relaxed);
            ps
        }
        ps => ps,
    }
}
