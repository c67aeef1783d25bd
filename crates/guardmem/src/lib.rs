//! Guard-instrumented memory allocators for embedding in larger systems.
//!
//! Every allocator in this crate backs each logical allocation with one
//! isolated heap block wrapped in guard margins, a magic gap and a
//! recoverable header. That trades throughput for checkability: buffer
//! overruns, mis-sized frees, frees routed to the wrong instance and
//! writes below a payload are caught at single-allocation granularity,
//! while the public interfaces stay those of the production-grade
//! allocator family they instrument.
//!
//! The allocators:
//!
//! * [`Mempool`] hands out fixed-size objects.
//! * [`Region`] is a stack allocator with reserve/commit and rollback by
//!   truncation to a usage mark.
//! * [`Lsregion`] tags allocations with sequence ids and reclaims them in
//!   bulk by id threshold.
//! * [`Obuf`] gathers output into an iovec-style slot list with savepoint
//!   rollback.
//! * [`SmallAlloc`] is the general-purpose allocator, gated by a shared
//!   byte [`Quota`].
//!
//! Integrity violations are reported through a [`FaultHandler`]; the
//! default handler aborts the process, tests use [`CapturingHandler`] to
//! inspect reports.

mod block;

pub mod fault;
pub mod guard;
pub mod lsregion;
pub mod mempool;
pub mod obuf;
pub mod quota;
pub mod region;
pub mod small;
pub mod util;

pub use fault::{AbortHandler, CapturingHandler, Fault, FaultHandler, HandlerRef};
pub use lsregion::{Lsregion, LsregionStats};
pub use mempool::{Mempool, MempoolStats, MEMPOOL_MAX_ALIGNMENT};
pub use obuf::{
    Obuf, ObufSlot, ObufStats, ObufSvp, OBUF_CHECKED_COUNT, OBUF_GEOMETRIC_COUNT, OBUF_IOV_MAX,
};
pub use quota::{Quota, QuotaError};
pub use region::{Region, RegionStats};
pub use small::{SmallAlloc, SmallStats, SMALL_ALIGNMENT};
