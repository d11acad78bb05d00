//! One probe's composition of the engine: filter, pair, attribute, fold, emit.

use std::ops::Range;
use std::sync::Arc;

use deltascope_common::{
    DeltaEvent, DropKind, MAX_AGGREGATES, MAX_COMMS, MAX_STACKS, MAX_STARTS, ProbeKind,
    SUBJECT_ALL, SUBJECT_NONE,
};

use super::aggregate::{AggregateStats, AggregateTable, Retention};
use super::comm::CommCache;
use super::correlation::{
    CorrelationStore, Finished, HashCorrelationStore, PairingKey, PairingScope,
};
use super::identity::{AttributionScope, HookContext, Identity, IdentityConfig, IdentityResolver};
use super::stacks::StackTable;
use super::stats::ProbeStats;
use super::stream::{Emit, EventStream};
use super::EngineError;

/// Which subjects a probe measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubjectFilter {
    /// Every subject except the idle task.
    #[default]
    All,
    Pid(u32),
    Nothing,
}

impl SubjectFilter {
    /// Decodes the kernel `TARGET_PID` convention.
    pub fn from_target(target: i32) -> Self {
        match target {
            t if t >= 0 => SubjectFilter::Pid(t as u32),
            SUBJECT_NONE => SubjectFilter::Nothing,
            _ => SubjectFilter::All,
        }
    }

    pub fn to_target(self) -> i32 {
        match self {
            SubjectFilter::All => SUBJECT_ALL,
            SubjectFilter::Pid(pid) => pid.min(i32::MAX as u32) as i32,
            SubjectFilter::Nothing => SUBJECT_NONE,
        }
    }

    pub fn admits(&self, pid: u32) -> bool {
        match self {
            SubjectFilter::All => pid != 0,
            SubjectFilter::Pid(target) => *target == pid,
            SubjectFilter::Nothing => false,
        }
    }
}

/// Attach-time filtering.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProbeFilter {
    pub subject: SubjectFilter,
    /// Hooks carrying an address outside this range are ignored. Hooks
    /// without an address are not affected.
    pub address: Option<Range<u64>>,
    /// Inclusive lower bound for detailed events.
    pub min_delta_ns: u64,
    /// Inclusive upper bound for detailed events; `None` is unbounded.
    pub max_delta_ns: Option<u64>,
}

impl ProbeFilter {
    pub fn validate(&self) -> Result<(), EngineError> {
        match self.max_delta_ns {
            Some(max) if self.min_delta_ns > max => Err(EngineError::InvertedThresholds {
                min: self.min_delta_ns,
                max,
            }),
            _ => Ok(()),
        }
    }

    pub fn admits_address(&self, address: Option<u64>) -> bool {
        match (&self.address, address) {
            (Some(range), Some(addr)) => range.contains(&addr),
            _ => true,
        }
    }

    /// Thresholds gate detailed events only; aggregates see every delta.
    pub fn emits(&self, delta_ns: u64) -> bool {
        delta_ns >= self.min_delta_ns && self.max_delta_ns.is_none_or(|max| delta_ns <= max)
    }
}

/// When the identity is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    /// At the entry hook, stored with the start record. Needed when the
    /// exit hook runs in another context (a task switching in, a free from
    /// another process).
    AtEntry,
    AtExit,
}

/// How a completed pair updates the aggregate table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    /// One sample of the elapsed time.
    Elapsed,
    /// Retry counter saturating at the cap; elapsed time is only streamed.
    CappedCount(u64),
    /// Entry adds the payload to the identity, exit takes it back out.
    Outstanding,
    /// No pairing: each sample adds its weight to the running task's
    /// identity.
    Sample,
}

impl Fold {
    /// Retries and outstanding bytes are running totals: a reset between an
    /// entry and its exit would leave the exit undoing a value the table no
    /// longer holds.
    pub fn retention(self) -> Retention {
        match self {
            Fold::Elapsed | Fold::Sample => Retention::Interval,
            Fold::CappedCount(_) | Fold::Outstanding => Retention::Running,
        }
    }
}

/// Saturation point of the page-fault retry counter. Guest addresses get
/// reused, so an uncapped counter only measures how long the VM has run.
pub const FAULT_RETRY_CAP: u64 = 1024;

/// Pairing and attribution choices of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSpec {
    pub kind: ProbeKind,
    pub pairing: PairingScope,
    pub attribution: Attribution,
    pub identity: IdentityConfig,
    pub fold: Fold,
    /// Whether the subject filter applies. Interrupt and idle accounting
    /// measure the CPU rather than a subject.
    pub subject_filtered: bool,
}

impl ProbeSpec {
    pub fn for_kind(kind: ProbeKind) -> Self {
        let base = ProbeSpec {
            kind,
            pairing: PairingScope::SubjectPerCpu,
            attribution: Attribution::AtExit,
            identity: IdentityConfig::SUBJECT,
            fold: Fold::Elapsed,
            subject_filtered: true,
        };
        match kind {
            // A task can migrate while inside schedule(); the thread id alone
            // cannot be in flight twice.
            ProbeKind::SchedDelay => ProbeSpec {
                pairing: PairingScope::Subject,
                ..base
            },
            ProbeKind::SoftIrq | ProbeKind::HardIrq => ProbeSpec {
                pairing: PairingScope::ResourcePerCpu,
                identity: IdentityConfig::ADDRESS,
                subject_filtered: false,
                ..base
            },
            // Every CPU runs its own idle task under pid 0.
            ProbeKind::CpuIdle => ProbeSpec {
                subject_filtered: false,
                ..base
            },
            ProbeKind::OffCpu => ProbeSpec {
                pairing: PairingScope::Subject,
                attribution: Attribution::AtEntry,
                ..base
            },
            ProbeKind::Readahead => ProbeSpec {
                pairing: PairingScope::Resource,
                attribution: Attribution::AtEntry,
                ..base
            },
            ProbeKind::KvmPageFault => ProbeSpec {
                pairing: PairingScope::Resource,
                identity: IdentityConfig::ADDRESS,
                fold: Fold::CappedCount(FAULT_RETRY_CAP),
                ..base
            },
            ProbeKind::MemAlloc => ProbeSpec {
                pairing: PairingScope::Resource,
                attribution: Attribution::AtEntry,
                fold: Fold::Outstanding,
                ..base
            },
            // The exit reason is only known at the VM exit, so it is carried
            // in the start record until the vCPU thread re-enters the guest.
            ProbeKind::KvmExit => ProbeSpec {
                pairing: PairingScope::Subject,
                attribution: Attribution::AtEntry,
                identity: IdentityConfig::ADDRESS,
                ..base
            },
            ProbeKind::OnCpu => ProbeSpec {
                attribution: Attribution::AtEntry,
                fold: Fold::Sample,
                ..base
            },
        }
    }

    /// Probes attributing to a subject at entry can add call stacks.
    pub fn supports_stacks(&self) -> bool {
        self.identity.scope == AttributionScope::Subject
            && self.attribution == Attribution::AtEntry
    }

    /// Turns stack components on or off; ignored where stacks do not apply.
    pub fn with_stacks(mut self, user: bool, kernel: bool) -> Self {
        if self.supports_stacks() {
            self.identity.user_stack = user;
            self.identity.kernel_stack = kernel;
        }
        self
    }

    fn check(&self) -> Result<(), EngineError> {
        if self.fold == Fold::Outstanding && self.attribution != Attribution::AtEntry {
            return Err(EngineError::IncompatibleSpec {
                probe: self.kind.name(),
                what: "track outstanding values without attributing at entry",
            });
        }
        Ok(())
    }
}

/// Stored with each start record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryContext {
    pub identity: Option<Identity>,
    pub payload: u64,
}

/// A matched entry/exit pair after folding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completed {
    pub kind: ProbeKind,
    pub identity: Identity,
    pub start_ns: u64,
    pub end_ns: u64,
    pub elapsed_ns: u64,
    pub payload: u64,
    /// Counter value after a `Fold::CappedCount` update.
    pub retries: Option<u64>,
    /// `None` when no stream is attached or the thresholds excluded it.
    pub emitted: Option<Emit>,
}

pub type StartStore = Box<dyn CorrelationStore<PairingKey, EntryContext>>;

pub struct PipelineBuilder {
    spec: ProbeSpec,
    filter: ProbeFilter,
    starts: Option<StartStore>,
    stacks: Option<Arc<StackTable>>,
    aggregates: Option<Arc<AggregateTable>>,
    names: Option<Arc<CommCache>>,
    events: Option<EventStream<DeltaEvent>>,
    stats: Option<Arc<ProbeStats>>,
}

impl PipelineBuilder {
    pub fn filter(mut self, filter: ProbeFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn starts(mut self, store: StartStore) -> Self {
        self.starts = Some(store);
        self
    }

    pub fn stacks(mut self, stacks: Arc<StackTable>) -> Self {
        self.stacks = Some(stacks);
        self
    }

    pub fn aggregates(mut self, table: Arc<AggregateTable>) -> Self {
        self.aggregates = Some(table);
        self
    }

    pub fn names(mut self, names: Arc<CommCache>) -> Self {
        self.names = Some(names);
        self
    }

    pub fn events(mut self, stream: EventStream<DeltaEvent>) -> Self {
        self.events = Some(stream);
        self
    }

    pub fn stats(mut self, stats: Arc<ProbeStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn build(self) -> Result<DeltaPipeline, EngineError> {
        self.spec.check()?;
        self.filter.validate()?;

        let starts = match self.starts {
            Some(store) => store,
            None => Box::new(HashCorrelationStore::<PairingKey, EntryContext>::new(
                MAX_STARTS as usize,
            )?),
        };
        let stacks = match self.stacks {
            Some(stacks) => stacks,
            None if self.spec.identity.uses_stacks() => {
                Arc::new(StackTable::new(MAX_STACKS as usize)?)
            }
            None => Arc::new(StackTable::with_depth(1, 1)?),
        };
        let retention = self.spec.fold.retention();
        let aggregates = match self.aggregates {
            Some(table) => table,
            None => Arc::new(AggregateTable::with_retention(
                MAX_AGGREGATES as usize,
                retention,
            )?),
        };
        if retention == Retention::Running && aggregates.retention() != Retention::Running {
            return Err(EngineError::IncompatibleSpec {
                probe: self.spec.kind.name(),
                what: "fold running totals into a table that resets on read",
            });
        }
        let names = match self.names {
            Some(names) => names,
            None => Arc::new(CommCache::new(MAX_COMMS as usize)?),
        };

        Ok(DeltaPipeline {
            spec: self.spec,
            filter: self.filter,
            starts,
            resolver: IdentityResolver::new(self.spec.identity, stacks),
            aggregates,
            names,
            events: self.events,
            stats: self.stats.unwrap_or_default(),
        })
    }
}

/// Entry and exit callbacks for one probe.
///
/// Both callbacks are safe to call from any number of threads at once and
/// never block; lost samples show up in [`ProbeStats`].
pub struct DeltaPipeline {
    spec: ProbeSpec,
    filter: ProbeFilter,
    starts: StartStore,
    resolver: IdentityResolver,
    aggregates: Arc<AggregateTable>,
    names: Arc<CommCache>,
    events: Option<EventStream<DeltaEvent>>,
    stats: Arc<ProbeStats>,
}

impl DeltaPipeline {
    pub fn builder(spec: ProbeSpec) -> PipelineBuilder {
        PipelineBuilder {
            spec,
            filter: ProbeFilter::default(),
            starts: None,
            stacks: None,
            aggregates: None,
            names: None,
            events: None,
            stats: None,
        }
    }

    pub fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    pub fn aggregates(&self) -> &Arc<AggregateTable> {
        &self.aggregates
    }

    pub fn names(&self) -> &Arc<CommCache> {
        &self.names
    }

    pub fn stats(&self) -> &Arc<ProbeStats> {
        &self.stats
    }

    pub fn stacks(&self) -> &Arc<StackTable> {
        self.resolver.stacks()
    }

    pub fn events(&self) -> Option<&EventStream<DeltaEvent>> {
        self.events.as_ref()
    }

    pub fn in_flight(&self) -> usize {
        self.starts.in_flight()
    }

    /// Entry hook. `payload` is kept with the start record (allocation size,
    /// byte counters). Returns whether a start record was stored.
    pub fn on_entry(&self, ctx: &HookContext<'_>, payload: u64) -> bool {
        if self.spec.fold == Fold::Sample {
            return self.on_sample(ctx, payload).is_some();
        }
        if !self.admits(ctx) {
            return false;
        }
        let identity = match self.spec.attribution {
            Attribution::AtEntry => Some(self.resolve(ctx)),
            Attribution::AtExit => None,
        };
        self.begin(ctx, EntryContext { identity, payload })
    }

    /// Entry hook whose identity was decided elsewhere.
    pub fn on_entry_as(&self, ctx: &HookContext<'_>, identity: Identity, payload: u64) -> bool {
        if !self.admits(ctx) {
            return false;
        }
        self.begin(
            ctx,
            EntryContext {
                identity: Some(identity),
                payload,
            },
        )
    }

    /// Exit hook. A miss is counted only when the exiting subject passes the
    /// filter; misses for filtered subjects are expected.
    pub fn on_exit(&self, ctx: &HookContext<'_>) -> Option<Completed> {
        if self.spec.fold == Fold::Sample {
            return None;
        }
        self.finish(ctx, true)
    }

    /// Sampling hook: one sample worth `weight_ns` of CPU time for the
    /// running task. Returns the identity it was counted against.
    pub fn on_sample(&self, ctx: &HookContext<'_>, weight_ns: u64) -> Option<Identity> {
        // The idle task runs whenever nothing else does.
        if ctx.tid == 0 || !self.admits(ctx) {
            return None;
        }
        self.observe_comm(ctx);
        let identity = self.resolve(ctx);
        if !self.aggregates.accumulate(identity, weight_ns) {
            self.stats.record(DropKind::AggregateRejected);
            return None;
        }
        Some(identity)
    }

    fn admits(&self, ctx: &HookContext<'_>) -> bool {
        (!self.spec.subject_filtered || self.filter.subject.admits(ctx.pid))
            && self.filter.admits_address(ctx.address)
    }

    fn resolve(&self, ctx: &HookContext<'_>) -> Identity {
        let identity = self.resolver.resolve(ctx);
        if identity.has_unknown_stack() {
            self.stats.record(DropKind::StackUnknown);
        }
        identity
    }

    fn observe_comm(&self, ctx: &HookContext<'_>) {
        if let Some(comm) = ctx.comm.filter(|c| !c.is_empty()) {
            if self.names.try_observe(ctx.pid, comm).is_none() {
                self.stats.record(DropKind::CommRejected);
            }
        }
    }

    fn begin(&self, ctx: &HookContext<'_>, entry: EntryContext) -> bool {
        self.observe_comm(ctx);
        let key = PairingKey::derive(self.spec.pairing, ctx);
        if !self.starts.begin(key, entry) {
            self.stats.record(DropKind::StartRejected);
            return false;
        }
        if let (Fold::Outstanding, Some(identity)) = (self.spec.fold, entry.identity) {
            if !self.aggregates.accumulate(identity, entry.payload) {
                self.stats.record(DropKind::AggregateRejected);
            }
        }
        true
    }

    fn finish(&self, ctx: &HookContext<'_>, count_miss: bool) -> Option<Completed> {
        let key = PairingKey::derive(self.spec.pairing, ctx);
        let Some(done) = self.starts.end(key) else {
            if count_miss && self.admits(ctx) {
                self.stats.record(DropKind::CorrelationMiss);
            }
            return None;
        };
        self.observe_comm(ctx);

        let identity = match done.context.identity {
            Some(identity) => identity,
            None => self.resolve(ctx),
        };
        let mut retries = None;
        let folded = match self.spec.fold {
            Fold::Elapsed | Fold::Sample => self.aggregates.accumulate(identity, done.elapsed_ns),
            Fold::CappedCount(cap) => {
                retries = self.aggregates.count_capped(identity, cap);
                retries.is_some()
            }
            // A failed retract means the entry-side accumulate was already
            // rejected and counted.
            Fold::Outstanding => {
                self.aggregates.retract(identity, done.context.payload);
                true
            }
        };
        if !folded {
            self.stats.record(DropKind::AggregateRejected);
        }

        let emitted = self.emit(ctx, &identity, &done, retries);
        Some(Completed {
            kind: self.spec.kind,
            identity,
            start_ns: done.start_ns,
            end_ns: done.end_ns,
            elapsed_ns: done.elapsed_ns,
            payload: done.context.payload,
            retries,
            emitted,
        })
    }

    fn emit(
        &self,
        ctx: &HookContext<'_>,
        identity: &Identity,
        done: &Finished<EntryContext>,
        retries: Option<u64>,
    ) -> Option<Emit> {
        let events = self.events.as_ref()?;
        if !self.filter.emits(done.elapsed_ns) {
            return None;
        }
        let addr = ctx
            .address
            .or(match identity {
                Identity::ByAddress { addr } => Some(*addr),
                _ => None,
            })
            .unwrap_or(0);
        let comm = ctx
            .comm
            .or_else(|| self.names.lookup(ctx.pid))
            .unwrap_or_default();
        let result = events.emit(DeltaEvent {
            kind: self.spec.kind as u32,
            pid: ctx.pid,
            tid: ctx.tid,
            cpu: ctx.cpu,
            start_ns: done.start_ns,
            end_ns: done.end_ns,
            delta_ns: done.elapsed_ns,
            addr,
            extra: retries.unwrap_or(done.context.payload),
            comm: *comm.as_bytes(),
        });
        if result == Emit::Dropped {
            self.stats.record(DropKind::StreamDropped);
        }
        Some(result)
    }
}

/// Pages a subject's readahead brought in, against the ones it later used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadaheadUsage {
    pub identity: Identity,
    pub expected: u64,
    /// `count` is pages accessed; `cumulative` sums allocation-to-access time.
    pub accessed: AggregateStats,
}

impl ReadaheadUsage {
    pub fn efficiency(&self) -> Option<f64> {
        (self.expected > 0).then(|| self.accessed.count as f64 / self.expected as f64)
    }
}

/// Readahead efficiency.
///
/// A subject opens a readahead window; pages allocated while it is open are
/// expected to be used and are attributed to the window's identity. A page's
/// first access completes its pair. Later accesses, and accesses to pages
/// that did not come from readahead, are not counted as misses.
pub struct ReadaheadTracker {
    windows: HashCorrelationStore<PairingKey, Identity>,
    pages: DeltaPipeline,
    expected: AggregateTable,
}

impl ReadaheadTracker {
    pub fn new(pages: DeltaPipeline) -> Result<Self, EngineError> {
        if pages.spec.kind != ProbeKind::Readahead {
            return Err(EngineError::IncompatibleSpec {
                probe: pages.spec.kind.name(),
                what: "track readahead pages",
            });
        }
        let capacity = pages.starts.capacity();
        Ok(Self {
            windows: HashCorrelationStore::new(capacity)?,
            expected: AggregateTable::new(pages.aggregates.capacity())?,
            pages,
        })
    }

    pub fn pages(&self) -> &DeltaPipeline {
        &self.pages
    }

    fn window_key(ctx: &HookContext<'_>) -> PairingKey {
        PairingKey::derive(PairingScope::Subject, ctx)
    }

    pub fn window_enter(&self, ctx: &HookContext<'_>) -> bool {
        if !self.pages.admits(ctx) {
            return false;
        }
        let identity = self.pages.resolve(ctx);
        let accepted = self.windows.begin_at(Self::window_key(ctx), identity, 0);
        if !accepted {
            self.pages.stats.record(DropKind::StartRejected);
        }
        accepted
    }

    pub fn window_exit(&self, ctx: &HookContext<'_>) -> bool {
        self.windows.end_at(Self::window_key(ctx), 0).is_some()
    }

    /// A page allocated by `ctx`'s subject, at `ctx.address`. Ignored unless
    /// the subject has a readahead window open.
    pub fn page_allocated(&self, ctx: &HookContext<'_>) -> bool {
        let Some(window) = self.windows.peek(Self::window_key(ctx)) else {
            return false;
        };
        if !self.pages.on_entry_as(ctx, window.context, 0) {
            return false;
        }
        if !self.expected.accumulate(window.context, 1) {
            self.pages.stats.record(DropKind::AggregateRejected);
        }
        true
    }

    pub fn page_accessed(&self, ctx: &HookContext<'_>) -> Option<Completed> {
        self.pages.finish(ctx, false)
    }

    pub fn usage(&self, reset: bool) -> Vec<ReadaheadUsage> {
        let mut usage: Vec<ReadaheadUsage> = self
            .expected
            .snapshot(reset)
            .into_iter()
            .map(|(identity, expected)| ReadaheadUsage {
                identity,
                expected: expected.cumulative,
                accessed: AggregateStats::default(),
            })
            .collect();
        for (identity, accessed) in self.pages.aggregates.snapshot(reset) {
            match usage.iter_mut().find(|u| u.identity == identity) {
                Some(u) => u.accessed = accessed,
                None => usage.push(ReadaheadUsage {
                    identity,
                    expected: 0,
                    accessed,
                }),
            }
        }
        usage
    }
}
