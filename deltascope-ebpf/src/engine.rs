//! Maps, attach-time globals and the pair/fold/emit helpers every program
//! goes through.
//!
//! Start records live in `STARTS` keyed by `PairKey`; a completed pair folds
//! into `AGGREGATES` and, when it passes the thresholds, is written to
//! `EVENTS`. Anything that cannot be recorded bumps a per-CPU `DROPS` slot
//! instead of failing the program.

use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::{
    EbpfContext,
    bindings::{BPF_ANY, BPF_F_USER_STACK, BPF_NOEXIST},
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_smp_processor_id, bpf_ktime_get_ns},
    macros::map,
    maps::{HashMap, PerCpuArray, RingBuf, StackTrace},
};
use deltascope_common::{
    AggKey, AggValue, DROP_KINDS, DeltaEvent, DropKind, EVENT_RING_BYTES, MAX_AGGREGATES,
    MAX_COMMS, MAX_STACKS, MAX_STARTS, NO_STACK, PairKey, ProbeKind, STACK_UNKNOWN, SUBJECT_ALL,
    SUBJECT_NONE, StartValue, TASK_COMM_LEN,
};

#[unsafe(no_mangle)]
static TARGET_PID: i32 = SUBJECT_ALL;
#[unsafe(no_mangle)]
static MIN_DELTA_NS: u64 = 0;
/// Zero means unbounded.
#[unsafe(no_mangle)]
static MAX_DELTA_NS: u64 = 0;
#[unsafe(no_mangle)]
static USER_STACKS: u8 = 0;
#[unsafe(no_mangle)]
static KERNEL_STACKS: u8 = 0;
/// Nanoseconds of CPU time one on-CPU sample stands for.
#[unsafe(no_mangle)]
static SAMPLE_PERIOD_NS: u64 = 0;

#[map]
static STARTS: HashMap<PairKey, StartValue> = HashMap::with_max_entries(MAX_STARTS, 0);

#[map]
static AGGREGATES: HashMap<AggKey, AggValue> = HashMap::with_max_entries(MAX_AGGREGATES, 0);

#[map]
static STACKS: StackTrace = StackTrace::with_max_entries(MAX_STACKS, 0);

#[map]
static COMMS: HashMap<u32, [u8; TASK_COMM_LEN]> = HashMap::with_max_entries(MAX_COMMS, 0);

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(EVENT_RING_BYTES, 0);

#[map]
static DROPS: PerCpuArray<u64> = PerCpuArray::with_max_entries(DROP_KINDS as u32, 0);

#[derive(Clone, Copy)]
pub struct Task {
    pub pid: u32,
    pub tid: u32,
}

#[inline(always)]
pub fn current_task() -> Task {
    let id = bpf_get_current_pid_tgid();
    Task {
        pid: (id >> 32) as u32,
        tid: id as u32,
    }
}

#[inline(always)]
pub fn now_ns() -> u64 {
    unsafe { bpf_ktime_get_ns() }
}

#[inline(always)]
pub fn current_cpu() -> u32 {
    unsafe { bpf_get_smp_processor_id() }
}

#[inline(always)]
pub fn current_comm() -> [u8; TASK_COMM_LEN] {
    bpf_get_current_comm().unwrap_or([0; TASK_COMM_LEN])
}

#[inline(always)]
fn flag(value: &u8) -> bool {
    unsafe { core::ptr::read_volatile(value) != 0 }
}

/// `TARGET_PID` check: a pid, every non-idle subject, or nothing.
#[inline(always)]
pub fn admits(pid: u32) -> bool {
    let target = unsafe { core::ptr::read_volatile(&TARGET_PID) };
    if target >= 0 {
        pid == target as u32
    } else if target == SUBJECT_NONE {
        false
    } else {
        pid != 0
    }
}

#[inline(always)]
pub fn sample_period_ns() -> u64 {
    unsafe { core::ptr::read_volatile(&SAMPLE_PERIOD_NS) }
}

/// Thresholds gate events only.
#[inline(always)]
fn emits(delta_ns: u64) -> bool {
    let min = unsafe { core::ptr::read_volatile(&MIN_DELTA_NS) };
    let max = unsafe { core::ptr::read_volatile(&MAX_DELTA_NS) };
    delta_ns >= min && (max == 0 || delta_ns <= max)
}

#[inline(always)]
pub fn record_drop(kind: DropKind) {
    if let Some(slot) = DROPS.get_ptr_mut(kind as u32) {
        unsafe { *slot += 1 };
    }
}

#[inline(always)]
pub fn pair_key(kind: ProbeKind, subject: u32, cpu: u32, resource: u64) -> PairKey {
    PairKey {
        kind: kind as u32,
        subject,
        cpu,
        _pad: 0,
        resource,
    }
}

/// Stores a start record, replacing one left behind for the same key.
#[inline(always)]
pub fn begin(key: &PairKey, payload: u64, agg: AggKey) -> bool {
    let start = StartValue {
        timestamp: now_ns(),
        payload,
        agg,
    };
    if STARTS.insert(key, &start, BPF_ANY as u64).is_err() {
        record_drop(DropKind::StartRejected);
        return false;
    }
    true
}

/// Takes the start record for `key`. Only the caller whose delete succeeds
/// gets it.
#[inline(always)]
pub fn end(key: &PairKey) -> Option<StartValue> {
    let start = unsafe { STARTS.get(key) }.copied()?;
    STARTS.remove(key).ok()?;
    Some(start)
}

#[inline(always)]
fn counter(field: *mut u64) -> &'static AtomicU64 {
    unsafe { AtomicU64::from_ptr(field) }
}

/// Extrema are plain stores: a racing update can lose an extreme but never
/// corrupts the sums.
#[inline(always)]
unsafe fn fold_into(value: *mut AggValue, delta: u64) {
    unsafe {
        counter(&raw mut (*value).count).fetch_add(1, Ordering::Relaxed);
        counter(&raw mut (*value).total).fetch_add(delta, Ordering::Relaxed);
        if delta < (*value).min {
            (*value).min = delta;
        }
        if delta > (*value).max {
            (*value).max = delta;
        }
    }
}

/// Adds one sample. The first sample is inserted whole with `BPF_NOEXIST`;
/// losing that race to another CPU falls back to folding into the winner.
#[inline(always)]
pub fn accumulate(key: &AggKey, delta: u64) {
    if let Some(value) = AGGREGATES.get_ptr_mut(key) {
        unsafe { fold_into(value, delta) };
        return;
    }
    if AGGREGATES
        .insert(key, &AggValue::first(delta), BPF_NOEXIST as u64)
        .is_ok()
    {
        return;
    }
    match AGGREGATES.get_ptr_mut(key) {
        Some(value) => unsafe { fold_into(value, delta) },
        None => record_drop(DropKind::AggregateRejected),
    }
}

/// Attempts a contended compare-and-swap makes before giving up.
const CAS_ATTEMPTS: u32 = 8;

/// Replaces the value with `update(value)`. `None` when every attempt lost
/// a race with another CPU.
#[inline(always)]
fn bounded_update(field: &AtomicU64, update: impl Fn(u64) -> u64) -> Option<u64> {
    let mut current = field.load(Ordering::Relaxed);
    for _ in 0..CAS_ATTEMPTS {
        let next = update(current);
        if next == current {
            return Some(current);
        }
        match field.compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return Some(next),
            Err(actual) => current = actual,
        }
    }
    None
}

/// Counter saturating at `cap`. Returns the count after the update.
#[inline(always)]
pub fn count_capped(key: &AggKey, cap: u64) -> Option<u64> {
    let value = match AGGREGATES.get_ptr_mut(key) {
        Some(value) => value,
        None => {
            let first = AggValue {
                count: 1,
                ..AggValue::default()
            };
            if AGGREGATES.insert(key, &first, BPF_NOEXIST as u64).is_ok() {
                return Some(1);
            }
            match AGGREGATES.get_ptr_mut(key) {
                Some(value) => value,
                None => {
                    record_drop(DropKind::AggregateRejected);
                    return None;
                }
            }
        }
    };
    let count = counter(unsafe { &raw mut (*value).count });
    let updated = bounded_update(count, |c| if c >= cap { c } else { c + 1 });
    if updated.is_none() {
        record_drop(DropKind::AggregateRejected);
    }
    updated
}

/// Takes `delta` back out of the total, flooring at zero. The count is kept.
#[inline(always)]
pub fn retract(key: &AggKey, delta: u64) {
    let Some(value) = AGGREGATES.get_ptr_mut(key) else {
        return;
    };
    let total = counter(unsafe { &raw mut (*value).total });
    if bounded_update(total, |t| t.saturating_sub(delta)).is_none() {
        record_drop(DropKind::AggregateRejected);
    }
}

#[inline(always)]
fn capture_stack<C: EbpfContext>(ctx: &C, flags: u64) -> i32 {
    match unsafe { STACKS.get_stackid(ctx, flags) } {
        Ok(id) => id as i32,
        Err(_) => STACK_UNKNOWN,
    }
}

/// Attribution key of the current task, with the stack components the
/// globals turn on.
#[inline(always)]
pub fn subject_key<C: EbpfContext>(ctx: &C, kind: ProbeKind, pid: u32) -> AggKey {
    let usid = if flag(&USER_STACKS) {
        capture_stack(ctx, BPF_F_USER_STACK as u64)
    } else {
        NO_STACK
    };
    let ksid = if flag(&KERNEL_STACKS) {
        capture_stack(ctx, 0)
    } else {
        NO_STACK
    };
    if usid == STACK_UNKNOWN || ksid == STACK_UNKNOWN {
        record_drop(DropKind::StackUnknown);
    }
    AggKey {
        usid,
        ksid,
        ..AggKey::subject(kind, pid)
    }
}

const EEXIST: i64 = 17;

/// First label wins; a label already present is not a loss.
#[inline(always)]
pub fn observe_comm(pid: u32, comm: &[u8; TASK_COMM_LEN]) {
    if comm[0] == 0 {
        return;
    }
    match COMMS.insert(&pid, comm, BPF_NOEXIST as u64) {
        Ok(()) => {}
        Err(e) if e == -EEXIST => {}
        Err(_) => record_drop(DropKind::CommRejected),
    }
}

pub struct Completion {
    pub kind: ProbeKind,
    pub task: Task,
    pub cpu: u32,
    pub start: StartValue,
    pub end_ns: u64,
    pub addr: u64,
    pub extra: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

impl Completion {
    #[inline(always)]
    pub fn delta_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start.timestamp)
    }

    /// Writes the event when the thresholds allow it.
    #[inline(always)]
    pub fn emit(&self) {
        let delta_ns = self.delta_ns();
        if !emits(delta_ns) {
            return;
        }
        let Some(mut entry) = EVENTS.reserve::<DeltaEvent>(0) else {
            record_drop(DropKind::StreamDropped);
            return;
        };
        entry.write(DeltaEvent {
            kind: self.kind as u32,
            pid: self.task.pid,
            tid: self.task.tid,
            cpu: self.cpu,
            start_ns: self.start.timestamp,
            end_ns: self.end_ns,
            delta_ns,
            addr: self.addr,
            extra: self.extra,
            comm: self.comm,
        });
        entry.submit(0);
    }
}
