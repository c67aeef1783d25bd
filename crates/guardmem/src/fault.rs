//! Memory-check fault taxonomy and the injectable fault handler.
//!
//! Every invariant violation an allocator can detect is described by a
//! [`Fault`] value and routed through the [`FaultHandler`] the allocator was
//! constructed with. The default handler writes the fault to stderr and
//! aborts the process; tests substitute [`CapturingHandler`] to verify that
//! a violation was detected. A capturing handler must only be used to check
//! detection -- after a fault the allocator state is not trustworthy.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// A detected memory-check violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    /// The magic bytes in the sub-aligned gap before a payload were
    /// overwritten, i.e. the caller wrote below its payload.
    #[error("guard magic overwritten before payload")]
    MagicOverwritten,
    /// The size passed to free does not match the size stored at allocation.
    #[error("free size mismatch: allocated {stored}, freeing {given}")]
    FreeSizeMismatch { stored: usize, given: usize },
    /// A payload was freed through an allocator instance that did not
    /// allocate it.
    #[error("allocation owned by instance {owner} freed through instance {freeing}")]
    ForeignFree { owner: u64, freeing: u64 },
    /// A reservation was requested while another one is still pending.
    #[error("reservation requested while another is pending")]
    DoubleReservation,
    /// An allocation consumed more bytes than the pending reservation holds.
    #[error("allocation of {requested} bytes exceeds reservation of {reserved}")]
    ReservationOverrun { requested: usize, reserved: usize },
    /// The alignment of an allocation does not match its reservation.
    #[error("alignment {requested} does not match reserved alignment {reserved}")]
    AlignmentMismatch { reserved: usize, requested: usize },
    /// A truncate target falls in the middle of a committed allocation.
    #[error("truncate cuts {cut} bytes into a record holding {record_used}")]
    TruncateMidBlock { record_used: usize, cut: usize },
    /// A sequence id smaller than an already-inserted one was supplied.
    #[error("allocation id {id} regresses below last id {last}")]
    IdRegression { last: i64, id: i64 },
    /// Any other violated internal invariant.
    #[error("memory check `{0}' failed")]
    Invariant(&'static str),
}

/// Receiver for detected faults, injected at allocator construction.
pub trait FaultHandler: Send + Sync {
    /// Called once per detected fault. Implementations that return (rather
    /// than abort) make the caller continue on a best-effort path.
    fn on_fault(&self, fault: Fault);
}

/// Default handler: reports to stderr and aborts the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortHandler;

impl FaultHandler for AbortHandler {
    fn on_fault(&self, fault: Fault) {
        eprintln!("guardmem: {fault}");
        std::process::abort();
    }
}

/// Test handler that records faults and lets the caller continue.
#[derive(Debug, Default)]
pub struct CapturingHandler {
    faults: Mutex<Vec<Fault>>,
}

impl CapturingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drains and returns every fault recorded so far.
    pub fn take(&self) -> Vec<Fault> {
        std::mem::take(&mut self.faults.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.faults.lock().is_empty()
    }
}

impl FaultHandler for CapturingHandler {
    fn on_fault(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }
}

/// Shared handle to a fault handler.
pub type HandlerRef = Arc<dyn FaultHandler>;

/// The default abort-on-fault handler.
pub fn default_handler() -> HandlerRef {
    Arc::new(AbortHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        assert_eq!(
            Fault::MagicOverwritten.to_string(),
            "guard magic overwritten before payload"
        );
        assert_eq!(
            Fault::FreeSizeMismatch {
                stored: 10,
                given: 20
            }
            .to_string(),
            "free size mismatch: allocated 10, freeing 20"
        );
        assert_eq!(
            Fault::Invariant("x > 0").to_string(),
            "memory check `x > 0' failed"
        );
    }

    #[test]
    fn test_capturing_handler_records_and_drains() {
        let handler = CapturingHandler::new();
        assert!(handler.is_empty());
        handler.on_fault(Fault::DoubleReservation);
        handler.on_fault(Fault::MagicOverwritten);
        assert!(!handler.is_empty());
        let faults = handler.take();
        assert_eq!(faults, vec![Fault::DoubleReservation, Fault::MagicOverwritten]);
        assert!(handler.is_empty());
    }
}
