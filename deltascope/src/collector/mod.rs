//! Host-side loop that drains event sources and periodically renders
//! aggregate tables and drop counters.

mod kernel;
mod render;
mod sources;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use deltascope_common::DeltaEvent;
use log::{debug, info};
use serde::Serialize;

use crate::engine::{AggregateStats, Comm, DeltaPipeline, DropCounts, Identity};

pub use kernel::{KernelAggregateSource, KernelDropSource, RingBufSource};
pub use render::{JsonRender, LogRender, REPORT_TARGET, Render, format_duration};
pub use sources::{ReadaheadSource, StatsSource, StreamSource, TableSource};

/// Passes over the event sources on shutdown before giving up on stragglers.
const FINAL_DRAIN_PASSES: usize = 8;

/// A source of completed measurements.
pub trait EventSource: Send {
    fn name(&self) -> &str;

    fn poll_event(&mut self) -> Option<DeltaEvent>;
}

/// A source of aggregate rows.
pub trait AggregateSource: Send {
    fn name(&self) -> &str;

    fn collect(&mut self, reset: bool) -> Result<Vec<AggregateRow>>;
}

/// A source of lost-sample counters.
pub trait DropSource: Send {
    fn name(&self) -> &str;

    /// Counts since the source was created. They only grow.
    fn totals(&mut self) -> Result<DropCounts>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRow {
    pub probe: &'static str,
    pub identity: Identity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comm: Option<Comm>,
    #[serde(flatten)]
    pub stats: AggregateStats,
    /// Readahead pages expected to be used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub poll_interval: Duration,
    pub flush_interval: Duration,
    pub reset_on_read: bool,
    /// Events taken from one source before moving to the next.
    pub batch: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            flush_interval: Duration::from_secs(1),
            reset_on_read: false,
            batch: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorSummary {
    pub events: u64,
    pub flushes: u64,
    pub dropped: u64,
}

pub struct Collector {
    config: CollectorConfig,
    events: Vec<Box<dyn EventSource>>,
    aggregates: Vec<Box<dyn AggregateSource>>,
    drops: Vec<(Box<dyn DropSource>, DropCounts)>,
    render: Box<dyn Render>,
    summary: CollectorSummary,
}

impl Collector {
    pub fn new(config: CollectorConfig, render: Box<dyn Render>) -> Self {
        Self {
            config,
            events: Vec::new(),
            aggregates: Vec::new(),
            drops: Vec::new(),
            render,
            summary: CollectorSummary::default(),
        }
    }

    pub fn add_event_source(&mut self, source: Box<dyn EventSource>) {
        debug!("Registered event source {}", source.name());
        self.events.push(source);
    }

    pub fn add_aggregate_source(&mut self, source: Box<dyn AggregateSource>) {
        debug!("Registered aggregate source {}", source.name());
        self.aggregates.push(source);
    }

    pub fn add_drop_source(&mut self, source: Box<dyn DropSource>) {
        debug!("Registered drop source {}", source.name());
        self.drops.push((source, DropCounts::default()));
    }

    /// Registers the stream, table and counters of an in-process pipeline.
    pub fn add_pipeline(&mut self, pipeline: &DeltaPipeline) {
        let kind = pipeline.spec().kind;
        if let Some(stream) = pipeline.events() {
            self.add_event_source(Box::new(StreamSource::new(kind.name(), stream.clone())));
        }
        self.add_aggregate_source(Box::new(TableSource::new(
            kind,
            Arc::clone(pipeline.aggregates()),
            Arc::clone(pipeline.names()),
        )));
        self.add_drop_source(Box::new(StatsSource::new(
            kind.name(),
            Arc::clone(pipeline.stats()),
        )));
    }

    pub fn summary(&self) -> CollectorSummary {
        self.summary
    }

    /// One pass over every event source, at most `batch` events each.
    pub fn drain_events(&mut self) -> Result<usize> {
        let mut drained = 0;
        for source in self.events.iter_mut() {
            for _ in 0..self.config.batch {
                let Some(event) = source.poll_event() else {
                    break;
                };
                self.render.event(source.name(), &event)?;
                drained += 1;
            }
        }
        self.summary.events += drained as u64;
        Ok(drained)
    }

    /// Renders every aggregate source and any drops since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        let reset = self.config.reset_on_read;
        for source in self.aggregates.iter_mut() {
            let rows = source.collect(reset)?;
            if !rows.is_empty() {
                self.render.aggregates(source.name(), &rows)?;
            }
        }
        for (source, last) in self.drops.iter_mut() {
            let totals = source.totals()?;
            let fresh = totals.since(last);
            *last = totals;
            if fresh.total() > 0 {
                self.summary.dropped += fresh.total();
                self.render.drops(source.name(), &fresh)?;
            }
        }
        self.summary.flushes += 1;
        self.render.flush()
    }

    /// Final drain and flush.
    pub fn finish(mut self) -> Result<CollectorSummary> {
        for _ in 0..FINAL_DRAIN_PASSES {
            if self.drain_events()? == 0 {
                break;
            }
        }
        self.flush()?;
        info!(
            "Collector finished: {} events, {} flushes, {} dropped samples",
            self.summary.events, self.summary.flushes, self.summary.dropped
        );
        Ok(self.summary)
    }

    /// Runs until `shutdown` is set, then drains and flushes once more.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) -> Result<CollectorSummary> {
        let mut last_flush = Instant::now();
        while !shutdown.load(Ordering::Relaxed) {
            let drained = self.drain_events()?;
            if last_flush.elapsed() >= self.config.flush_interval {
                self.flush()?;
                last_flush = Instant::now();
            }
            if drained == 0 {
                tokio::time::sleep(self.config.poll_interval).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
        info!("Shutdown requested, draining collector");
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AggregateTable, EventStream};
    use deltascope_common::{DropKind, ProbeKind};
    use std::sync::Mutex;

    #[derive(Default, Clone)]
    struct Recorded {
        events: Arc<Mutex<Vec<(String, DeltaEvent)>>>,
        rows: Arc<Mutex<Vec<(String, AggregateRow)>>>,
        drops: Arc<Mutex<Vec<(String, DropCounts)>>>,
    }

    impl Render for Recorded {
        fn event(&mut self, source: &str, event: &DeltaEvent) -> Result<()> {
            self.events.lock().unwrap().push((source.to_string(), *event));
            Ok(())
        }

        fn aggregates(&mut self, source: &str, rows: &[AggregateRow]) -> Result<()> {
            let mut out = self.rows.lock().unwrap();
            out.extend(rows.iter().map(|r| (source.to_string(), r.clone())));
            Ok(())
        }

        fn drops(&mut self, source: &str, drops: &DropCounts) -> Result<()> {
            self.drops.lock().unwrap().push((source.to_string(), *drops));
            Ok(())
        }
    }

    struct CountingDrops(u64);

    impl DropSource for CountingDrops {
        fn name(&self) -> &str {
            "counting"
        }

        fn totals(&mut self) -> Result<DropCounts> {
            self.0 += 3;
            let mut counts = DropCounts::default();
            counts.add(DropKind::StreamDropped, self.0);
            Ok(counts)
        }
    }

    fn event(pid: u32) -> DeltaEvent {
        DeltaEvent {
            kind: ProbeKind::SchedDelay as u32,
            pid,
            delta_ns: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_drain_respects_batch() {
        let stream = EventStream::new(16).unwrap();
        for pid in 0..10 {
            stream.emit(event(pid));
        }
        let recorded = Recorded::default();
        let config = CollectorConfig {
            batch: 4,
            ..Default::default()
        };
        let mut collector = Collector::new(config, Box::new(recorded.clone()));
        collector.add_event_source(Box::new(StreamSource::new("sched_delay", stream.clone())));

        assert_eq!(collector.drain_events().unwrap(), 4);
        assert_eq!(stream.len(), 6);
        let summary = collector.finish().unwrap();
        assert_eq!(summary.events, 10);
        let pids: Vec<u32> = recorded.events.lock().unwrap().iter().map(|(_, e)| e.pid).collect();
        assert_eq!(pids, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_flush_reports_drop_growth_only() {
        let recorded = Recorded::default();
        let mut collector = Collector::new(CollectorConfig::default(), Box::new(recorded.clone()));
        collector.add_drop_source(Box::new(CountingDrops(0)));
        collector.flush().unwrap();
        collector.flush().unwrap();

        let drops = recorded.drops.lock().unwrap();
        assert_eq!(drops.len(), 2);
        assert!(drops.iter().all(|(_, d)| d.get(DropKind::StreamDropped) == 3));
        assert_eq!(collector.summary().dropped, 6);
    }

    #[test]
    fn test_reset_on_read_clears_tables() {
        let table = Arc::new(AggregateTable::new(8).unwrap());
        table.accumulate(Identity::BySubject { pid: 5 }, 100);
        let names = Arc::new(crate::engine::CommCache::new(8).unwrap());
        let recorded = Recorded::default();
        let config = CollectorConfig {
            reset_on_read: true,
            ..Default::default()
        };
        let mut collector = Collector::new(config, Box::new(recorded.clone()));
        collector.add_aggregate_source(Box::new(TableSource::new(
            ProbeKind::SchedDelay,
            Arc::clone(&table),
            names,
        )));

        collector.flush().unwrap();
        collector.flush().unwrap();
        assert_eq!(recorded.rows.lock().unwrap().len(), 1);
        assert!(table.get(Identity::BySubject { pid: 5 }).is_none_or(|s| s.is_empty()));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_drains() {
        let stream = EventStream::new(64).unwrap();
        let recorded = Recorded::default();
        let config = CollectorConfig {
            poll_interval: Duration::from_millis(5),
            flush_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let mut collector = Collector::new(config, Box::new(recorded.clone()));
        collector.add_event_source(Box::new(StreamSource::new("sched_delay", stream.clone())));

        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(collector.run(Arc::clone(&shutdown)));
        for pid in 0..5 {
            stream.emit(event(pid));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.emit(event(99));
        shutdown.store(true, Ordering::Relaxed);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.events, 6);
        assert!(summary.flushes >= 1);
        assert!(stream.is_empty());
    }
}
