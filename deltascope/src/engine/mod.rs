//! Correlation and aggregation engine shared by every probe.
//!
//! Everything reachable from a hook callback (`DeltaPipeline::on_entry`,
//! `DeltaPipeline::on_exit` and the components they call) is non-blocking and
//! allocation-free once constructed. Capacity exhaustion and lost samples are
//! reported through return values and [`ProbeStats`], never through `Err`.

mod aggregate;
mod comm;
mod correlation;
mod identity;
mod pipeline;
mod slots;
mod stacks;
mod stats;
mod stream;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

pub use aggregate::{AggregateStats, AggregateTable, Retention, ShardedAggregateTable};
pub use comm::{Comm, CommCache, CommSource, ProcfsComm};
pub use correlation::{
    CorrelationStore, DirectCorrelationStore, Finished, HashCorrelationStore, PairingKey,
    PairingScope, StartRecord,
};
pub use identity::{AttributionScope, HookContext, Identity, IdentityConfig, IdentityResolver};
pub use pipeline::{
    Attribution, Completed, DeltaPipeline, EntryContext, FAULT_RETRY_CAP, Fold, PipelineBuilder,
    ProbeFilter, ProbeSpec, ReadaheadTracker, ReadaheadUsage, StartStore, SubjectFilter,
};
pub use slots::SlotKey;
pub use stacks::{StackId, StackTable};
pub use stats::{DropCounts, ProbeStats};
pub use stream::{Emit, EventStream};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("{0} capacity must be greater than zero")]
    ZeroCapacity(&'static str),
    #[error("minimum delta {min}ns exceeds maximum delta {max}ns")]
    InvertedThresholds { min: u64, max: u64 },
    #[error("probe {probe} cannot {what}")]
    IncompatibleSpec {
        probe: &'static str,
        what: &'static str,
    },
}

pub(crate) fn require_capacity(name: &'static str, capacity: usize) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::ZeroCapacity(name));
    }
    Ok(())
}

/// Nanosecond time source for start records.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}

/// `CLOCK_MONOTONIC`, the clock behind `bpf_ktime_get_ns`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::Release);
    }

    pub fn advance(&self, delta_ns: u64) {
        self.now.fetch_add(delta_ns, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock;
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_moves_on_request() {
        let clock = Arc::new(ManualClock::new(1_000));
        assert_eq!(clock.now_ns(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_ns(), 1_500);
        clock.set(42);
        assert_eq!(clock.now_ns(), 42);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(
            require_capacity("aggregate table", 0),
            Err(EngineError::ZeroCapacity("aggregate table"))
        );
        assert!(require_capacity("aggregate table", 1).is_ok());
    }
}
