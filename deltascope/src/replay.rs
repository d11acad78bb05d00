//! Drives recorded hook events through in-process pipelines.
//!
//! Input is JSON lines, one hook firing per line:
//!
//! ```text
//! {"phase":"entry","probe":"sched_delay","ts_ns":1000,"pid":42,"cpu":0,"comm":"worker"}
//! {"phase":"exit","probe":"sched_delay","ts_ns":1750,"pid":42,"cpu":0}
//! ```
//!
//! `readahead` additionally uses `window_enter` and `window_exit`; its
//! `entry` is a page allocation and its `exit` a page access. `on_cpu` takes
//! `sample` records whose `value` is the sample's weight in nanoseconds,
//! defaulting to the configured sampling period.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use deltascope_common::ProbeKind;
use log::{debug, info, warn};
use serde::Deserialize;

use crate::collector::{Collector, ReadaheadSource, StatsSource, StreamSource};
use crate::engine::{
    AggregateTable, Comm, CommCache, CommSource, Completed, DeltaPipeline, EntryContext, EventStream,
    Fold, HashCorrelationStore, HookContext, ManualClock, PairingKey, ReadaheadTracker, StackTable,
};
use crate::settings::Settings;

const DEFAULT_EVENT_CAPACITY: usize = 4096;
/// Input lines between event drains.
const DRAIN_EVERY: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Entry,
    Exit,
    WindowEnter,
    WindowExit,
    Sample,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HookRecord {
    pub phase: Phase,
    pub probe: String,
    pub ts_ns: u64,
    pub pid: u32,
    /// Defaults to `pid`.
    #[serde(default)]
    pub tid: Option<u32>,
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub comm: Option<String>,
    #[serde(default)]
    pub address: Option<u64>,
    /// Entry payload: allocation size, byte counts.
    #[serde(default)]
    pub value: u64,
    #[serde(default)]
    pub user_stack: Option<Vec<u64>>,
    #[serde(default)]
    pub kernel_stack: Option<Vec<u64>>,
}

impl HookRecord {
    fn context(&self) -> HookContext<'_> {
        let mut ctx = HookContext::new(self.pid, self.tid.unwrap_or(self.pid), self.cpu)
            .with_stacks(self.user_stack.as_deref(), self.kernel_stack.as_deref());
        if let Some(address) = self.address {
            ctx = ctx.with_address(address);
        }
        if let Some(comm) = self.comm.as_deref() {
            ctx = ctx.with_comm(Comm::new(comm));
        }
        ctx
    }
}

/// Labels come only from the recording; local pids mean nothing here.
pub struct RecordedOnly;

impl CommSource for RecordedOnly {
    fn comm(&self, _pid: u32) -> Option<Comm> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub applied: u64,
    pub completed: u64,
    pub skipped: u64,
}

pub struct Replay {
    clock: Arc<ManualClock>,
    pipelines: BTreeMap<ProbeKind, DeltaPipeline>,
    readahead: Option<Arc<ReadaheadTracker>>,
    sample_period_ns: u64,
    summary: ReplaySummary,
}

impl Replay {
    /// One pipeline per enabled probe; every probe when none is enabled.
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut kinds = settings.probes.enabled_kinds();
        if kinds.is_empty() {
            kinds = ProbeKind::ALL.to_vec();
        }

        let clock = Arc::new(ManualClock::new(0));
        let capacity = &settings.capacity;
        let names = Arc::new(CommCache::with_source(
            capacity.comms.unwrap_or(deltascope_common::MAX_COMMS as usize),
            RecordedOnly,
        )?);
        let stacks = Arc::new(StackTable::new(
            capacity.stacks.unwrap_or(deltascope_common::MAX_STACKS as usize),
        )?);
        let filter = settings.probe_filter();

        let mut pipelines = BTreeMap::new();
        let mut readahead = None;
        for kind in kinds {
            let starts = HashCorrelationStore::<PairingKey, EntryContext, _>::with_clock(
                capacity.starts.unwrap_or(deltascope_common::MAX_STARTS as usize),
                Arc::clone(&clock),
            )?;
            let spec = settings.probe_spec(kind);
            let aggregates = Arc::new(AggregateTable::with_retention(
                capacity
                    .aggregates
                    .unwrap_or(deltascope_common::MAX_AGGREGATES as usize),
                spec.fold.retention(),
            )?);
            let pipeline = DeltaPipeline::builder(spec)
                .filter(filter.clone())
                .starts(Box::new(starts))
                .stacks(Arc::clone(&stacks))
                .aggregates(aggregates)
                .names(Arc::clone(&names))
                .events(EventStream::new(
                    capacity.events.unwrap_or(DEFAULT_EVENT_CAPACITY),
                )?)
                .build()
                .with_context(|| format!("Failed to build {} pipeline", kind.name()))?;
            if kind == ProbeKind::Readahead {
                readahead = Some(Arc::new(ReadaheadTracker::new(pipeline)?));
            } else {
                pipelines.insert(kind, pipeline);
            }
        }
        info!(
            "Replay pipelines: {}",
            pipelines
                .keys()
                .map(|k| k.name())
                .chain(readahead.as_ref().map(|_| ProbeKind::Readahead.name()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            clock,
            pipelines,
            readahead,
            sample_period_ns: settings.sample_period_ns(),
            summary: ReplaySummary::default(),
        })
    }

    pub fn pipeline(&self, kind: ProbeKind) -> Option<&DeltaPipeline> {
        self.pipelines.get(&kind)
    }

    pub fn readahead(&self) -> Option<&Arc<ReadaheadTracker>> {
        self.readahead.as_ref()
    }

    pub fn summary(&self) -> ReplaySummary {
        self.summary
    }

    /// Registers every pipeline's outputs with `collector`.
    pub fn register(&self, collector: &mut Collector) {
        for pipeline in self.pipelines.values() {
            collector.add_pipeline(pipeline);
        }
        if let Some(tracker) = &self.readahead {
            let pages = tracker.pages();
            if let Some(stream) = pages.events() {
                collector.add_event_source(Box::new(StreamSource::new(
                    ProbeKind::Readahead.name(),
                    stream.clone(),
                )));
            }
            collector.add_aggregate_source(Box::new(ReadaheadSource::new(Arc::clone(tracker))));
            collector.add_drop_source(Box::new(StatsSource::new(
                ProbeKind::Readahead.name(),
                Arc::clone(pages.stats()),
            )));
        }
    }

    /// Applies one record at its timestamp. Records for probes that are not
    /// replayed are skipped.
    pub fn apply(&mut self, record: &HookRecord) -> Result<Option<Completed>> {
        let Some(kind) = ProbeKind::from_name(&record.probe) else {
            bail!("unknown probe {:?}", record.probe);
        };
        self.clock.set(record.ts_ns);
        let ctx = record.context();

        let completed = if kind == ProbeKind::Readahead {
            let Some(tracker) = &self.readahead else {
                self.summary.skipped += 1;
                return Ok(None);
            };
            match record.phase {
                Phase::WindowEnter => {
                    tracker.window_enter(&ctx);
                    None
                }
                Phase::WindowExit => {
                    tracker.window_exit(&ctx);
                    None
                }
                Phase::Entry => {
                    tracker.page_allocated(&ctx);
                    None
                }
                Phase::Exit => tracker.page_accessed(&ctx),
                Phase::Sample => bail!("phase {:?} only applies to sampled probes", record.phase),
            }
        } else {
            let Some(pipeline) = self.pipelines.get(&kind) else {
                self.summary.skipped += 1;
                return Ok(None);
            };
            match record.phase {
                Phase::Entry => {
                    pipeline.on_entry(&ctx, record.value);
                    None
                }
                Phase::Exit => pipeline.on_exit(&ctx),
                Phase::Sample if pipeline.spec().fold == Fold::Sample => {
                    let weight = match record.value {
                        0 => self.sample_period_ns,
                        value => value,
                    };
                    pipeline.on_sample(&ctx, weight);
                    None
                }
                Phase::Sample => {
                    bail!("phase {:?} only applies to sampled probes", record.phase)
                }
                Phase::WindowEnter | Phase::WindowExit => {
                    bail!("phase {:?} only applies to readahead", record.phase)
                }
            }
        };

        self.summary.applied += 1;
        if completed.is_some() {
            self.summary.completed += 1;
        }
        Ok(completed)
    }

    /// Applies every line of `reader`, draining events into `collector` as
    /// it goes so the streams do not overflow.
    pub fn feed<R: BufRead>(&mut self, reader: R, collector: &mut Collector) -> Result<()> {
        for (index, line) in reader.lines().enumerate() {
            let line = line.context("Failed to read replay input")?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let record: HookRecord = serde_json::from_str(line)
                .with_context(|| format!("Invalid hook record on line {}", index + 1))?;
            self.apply(&record)
                .with_context(|| format!("Failed to apply line {}", index + 1))?;
            if (index as u64 + 1) % DRAIN_EVERY == 0 {
                collector.drain_events()?;
            }
        }
        Ok(())
    }
}

/// Replays `path` and renders through `collector`, flushing once at the end.
pub fn replay_file(settings: &Settings, path: &Path, mut collector: Collector) -> Result<ReplaySummary> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open replay file {}", path.display()))?;
    let mut replay = Replay::new(settings)?;
    replay.register(&mut collector);
    replay.feed(std::io::BufReader::new(file), &mut collector)?;

    let summary = replay.summary();
    if summary.skipped > 0 {
        warn!("Skipped {} records for probes that are not enabled", summary.skipped);
    }
    debug!("Replay summary: {:?}", summary);
    collector.finish()?;
    info!(
        "Replayed {} records, {} completed pairs",
        summary.applied, summary.completed
    );
    Ok(summary)
}
