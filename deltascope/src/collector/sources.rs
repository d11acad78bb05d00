use std::sync::Arc;

use anyhow::Result;
use deltascope_common::{DeltaEvent, ProbeKind};

use super::{AggregateRow, AggregateSource, DropSource, EventSource};
use crate::engine::{AggregateTable, CommCache, DropCounts, EventStream, ProbeStats, ReadaheadTracker};

/// Events of an in-process pipeline.
pub struct StreamSource {
    name: String,
    stream: EventStream<DeltaEvent>,
}

impl StreamSource {
    pub fn new(name: impl Into<String>, stream: EventStream<DeltaEvent>) -> Self {
        Self {
            name: name.into(),
            stream,
        }
    }
}

impl EventSource for StreamSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll_event(&mut self) -> Option<DeltaEvent> {
        self.stream.try_next()
    }
}

/// Aggregates of an in-process pipeline, labelled through its comm cache.
pub struct TableSource {
    kind: ProbeKind,
    table: Arc<AggregateTable>,
    names: Arc<CommCache>,
}

impl TableSource {
    pub fn new(kind: ProbeKind, table: Arc<AggregateTable>, names: Arc<CommCache>) -> Self {
        Self { kind, table, names }
    }
}

impl AggregateSource for TableSource {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn collect(&mut self, reset: bool) -> Result<Vec<AggregateRow>> {
        Ok(self
            .table
            .snapshot(reset)
            .into_iter()
            .map(|(identity, stats)| AggregateRow {
                probe: self.kind.name(),
                identity,
                comm: identity.pid().and_then(|pid| self.names.resolve_name(pid)),
                stats,
                expected: None,
            })
            .collect())
    }
}

/// Expected and accessed readahead pages per identity.
pub struct ReadaheadSource {
    tracker: Arc<ReadaheadTracker>,
}

impl ReadaheadSource {
    pub fn new(tracker: Arc<ReadaheadTracker>) -> Self {
        Self { tracker }
    }
}

impl AggregateSource for ReadaheadSource {
    fn name(&self) -> &str {
        ProbeKind::Readahead.name()
    }

    fn collect(&mut self, reset: bool) -> Result<Vec<AggregateRow>> {
        let names = self.tracker.pages().names();
        Ok(self
            .tracker
            .usage(reset)
            .into_iter()
            .map(|usage| AggregateRow {
                probe: ProbeKind::Readahead.name(),
                identity: usage.identity,
                comm: usage.identity.pid().and_then(|pid| names.resolve_name(pid)),
                stats: usage.accessed,
                expected: Some(usage.expected),
            })
            .collect())
    }
}

pub struct StatsSource {
    name: String,
    stats: Arc<ProbeStats>,
}

impl StatsSource {
    pub fn new(name: impl Into<String>, stats: Arc<ProbeStats>) -> Self {
        Self {
            name: name.into(),
            stats,
        }
    }
}

impl DropSource for StatsSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn totals(&mut self) -> Result<DropCounts> {
        Ok(self.stats.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Comm, CommSource, DeltaPipeline, HookContext, Identity, ManualClock};
    use crate::engine::{EntryContext, HashCorrelationStore, PairingKey, ProbeSpec};
    use deltascope_common::DropKind;

    struct Named;

    impl CommSource for Named {
        fn comm(&self, pid: u32) -> Option<Comm> {
            (pid == 7).then(|| Comm::new("seven"))
        }
    }

    #[test]
    fn test_table_rows_carry_labels() {
        let table = Arc::new(AggregateTable::new(8).unwrap());
        table.accumulate(Identity::BySubject { pid: 7 }, 10);
        table.accumulate(Identity::BySubject { pid: 8 }, 20);
        table.accumulate(Identity::ByAddress { addr: 1 }, 30);
        let names = Arc::new(CommCache::with_source(8, Named).unwrap());
        let mut source = TableSource::new(ProbeKind::SchedDelay, table, names);

        let mut rows = source.collect(false).unwrap();
        rows.sort_by_key(|r| r.stats.cumulative);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].comm, Some(Comm::new("seven")));
        assert_eq!(rows[1].comm, None);
        assert_eq!(rows[2].comm, None);
        assert!(rows.iter().all(|r| r.probe == "sched_delay"));
    }

    #[test]
    fn test_readahead_rows_report_expected_pages() {
        let clock = Arc::new(ManualClock::new(0));
        let pages = DeltaPipeline::builder(ProbeSpec::for_kind(ProbeKind::Readahead))
            .starts(Box::new(
                HashCorrelationStore::<PairingKey, EntryContext, _>::with_clock(64, clock.clone())
                    .unwrap(),
            ))
            .names(Arc::new(CommCache::with_source(8, Named).unwrap()))
            .build()
            .unwrap();
        let tracker = Arc::new(ReadaheadTracker::new(pages).unwrap());

        let ctx = HookContext::new(7, 7, 0);
        assert!(tracker.window_enter(&ctx));
        for page in 0..3u64 {
            assert!(tracker.page_allocated(&ctx.with_address(0x1000 * page)));
        }
        assert!(tracker.window_exit(&ctx));
        clock.advance(500);
        assert!(tracker.page_accessed(&ctx.with_address(0)).is_some());

        let mut source = ReadaheadSource::new(tracker);
        let rows = source.collect(false).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].expected, Some(3));
        assert_eq!(rows[0].stats.count, 1);
        assert_eq!(rows[0].stats.cumulative, 500);
        assert_eq!(rows[0].comm, Some(Comm::new("seven")));
    }

    #[test]
    fn test_stats_source_reads_counters() {
        let stats = Arc::new(ProbeStats::new());
        stats.record(DropKind::CorrelationMiss);
        let mut source = StatsSource::new("offcpu", Arc::clone(&stats));
        assert_eq!(source.totals().unwrap().get(DropKind::CorrelationMiss), 1);
        stats.record(DropKind::CorrelationMiss);
        assert_eq!(source.totals().unwrap().get(DropKind::CorrelationMiss), 2);
    }
}
