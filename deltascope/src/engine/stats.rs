use std::sync::atomic::{AtomicU64, Ordering};

use deltascope_common::{DROP_KINDS, DropKind};

/// Lost-sample counters, one per [`DropKind`].
#[derive(Debug, Default)]
pub struct ProbeStats {
    counts: [AtomicU64; DROP_KINDS],
}

impl ProbeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: DropKind) {
        self.counts[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, kind: DropKind) -> u64 {
        self.counts[kind as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DropCounts {
        let mut out = DropCounts::default();
        for kind in DropKind::ALL {
            out.0[kind as usize] = self.get(kind);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounts(pub [u64; DROP_KINDS]);

impl DropCounts {
    pub fn get(&self, kind: DropKind) -> u64 {
        self.0[kind as usize]
    }

    pub fn add(&mut self, kind: DropKind, n: u64) {
        self.0[kind as usize] = self.0[kind as usize].saturating_add(n);
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    /// Counts accrued since `earlier`, for counters that only grow.
    pub fn since(&self, earlier: &DropCounts) -> DropCounts {
        let mut out = DropCounts::default();
        for (i, slot) in out.0.iter_mut().enumerate() {
            *slot = self.0[i].saturating_sub(earlier.0[i]);
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (DropKind, u64)> + '_ {
        DropKind::ALL.into_iter().map(|kind| (kind, self.get(kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let stats = ProbeStats::new();
        stats.record(DropKind::CorrelationMiss);
        stats.record(DropKind::CorrelationMiss);
        stats.record(DropKind::StreamDropped);
        let snap = stats.snapshot();
        assert_eq!(snap.get(DropKind::CorrelationMiss), 2);
        assert_eq!(snap.get(DropKind::StreamDropped), 1);
        assert_eq!(snap.get(DropKind::StackUnknown), 0);
        assert_eq!(snap.total(), 3);
    }

    #[test]
    fn since_reports_growth() {
        let mut before = DropCounts::default();
        before.add(DropKind::StartRejected, 5);
        let mut after = before;
        after.add(DropKind::StartRejected, 2);
        after.add(DropKind::AggregateRejected, 1);
        let delta = after.since(&before);
        assert_eq!(delta.get(DropKind::StartRejected), 2);
        assert_eq!(delta.get(DropKind::AggregateRejected), 1);
        assert_eq!(delta.total(), 3);
    }
}
