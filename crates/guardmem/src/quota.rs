//! Byte-lease quota shared by size-classed allocator instances.
//!
//! One [`Quota`] represents the byte budget of a quota domain. Every
//! [`SmallAlloc`](crate::small::SmallAlloc) drawing from the domain holds an
//! `Arc` to the same quota; accounting is a single compare-exchange so the
//! service itself adds no locking on top of whatever discipline the
//! embedding system already enforces around allocator usage.

use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

/// Lease denial: the quota domain has no room for the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("quota exhausted: requested {requested} bytes, {available} available")]
pub struct QuotaError {
    pub requested: usize,
    pub available: usize,
}

/// A byte budget debited on allocation and credited on free.
#[derive(Debug)]
pub struct Quota {
    total: usize,
    used: AtomicUsize,
}

impl Quota {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            used: AtomicUsize::new(0),
        }
    }

    /// Debits `size` bytes, or reports how much room was left.
    pub fn lease(&self, size: usize) -> Result<(), QuotaError> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&next| next <= self.total)
            })
            .map(|_| ())
            .map_err(|used| QuotaError {
                requested: size,
                available: self.total - used,
            })
    }

    /// Credits `size` bytes back. Callers only end leases they hold.
    pub fn end_lease(&self, size: usize) {
        let prev = self.used.fetch_sub(size, Ordering::AcqRel);
        debug_assert!(prev >= size);
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn total(&self) -> usize {
        self.total
    }
}
