//! Correlation stores bridge an entry hook to its matching exit hook.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering, fence};

use super::identity::HookContext;
use super::slots::{BUSY, DEAD, EMPTY, KeyCell, LIVE, SlotKey, home_slot};
use super::{Clock, EngineError, MonotonicClock, require_capacity};

/// Which parts of the hook context pair an entry with its exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairingScope {
    /// Thread id only. Right when the thread cannot be running the
    /// operation anywhere else, even if it migrates between entry and exit.
    Subject,
    /// Thread id and CPU. Required for subjects that run on several CPUs at
    /// once, such as the idle task.
    #[default]
    SubjectPerCpu,
    /// Resource address only (fault address, allocation address).
    Resource,
    /// Resource scoped to the CPU that handles it (irq line, softirq vector).
    ResourcePerCpu,
    SubjectAndResource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairingKey {
    pub subject: Option<u32>,
    pub cpu: Option<u32>,
    pub resource: Option<u64>,
}

const HAS_SUBJECT: u64 = 1 << 63;
const HAS_CPU: u64 = 1 << 62;
const HAS_RESOURCE: u64 = 1 << 61;
const CPU_MASK: u64 = (1 << 29) - 1;

impl PairingKey {
    pub fn derive(scope: PairingScope, ctx: &HookContext<'_>) -> Self {
        let resource = ctx.address.unwrap_or(0);
        let (subject, cpu, resource) = match scope {
            PairingScope::Subject => (Some(ctx.tid), None, None),
            PairingScope::SubjectPerCpu => (Some(ctx.tid), Some(ctx.cpu), None),
            PairingScope::Resource => (None, None, Some(resource)),
            PairingScope::ResourcePerCpu => (None, Some(ctx.cpu), Some(resource)),
            PairingScope::SubjectAndResource => (Some(ctx.tid), None, Some(resource)),
        };
        Self {
            subject,
            cpu,
            resource,
        }
    }
}

impl SlotKey for PairingKey {
    fn to_words(&self) -> [u64; 2] {
        let mut w0 = 0;
        if let Some(subject) = self.subject {
            w0 |= HAS_SUBJECT | subject as u64;
        }
        if let Some(cpu) = self.cpu {
            w0 |= HAS_CPU | ((cpu as u64 & CPU_MASK) << 32);
        }
        if self.resource.is_some() {
            w0 |= HAS_RESOURCE;
        }
        [w0, self.resource.unwrap_or(0)]
    }

    fn from_words(words: [u64; 2]) -> Self {
        let w0 = words[0];
        Self {
            subject: (w0 & HAS_SUBJECT != 0).then_some(w0 as u32),
            cpu: (w0 & HAS_CPU != 0).then_some(((w0 >> 32) & CPU_MASK) as u32),
            resource: (w0 & HAS_RESOURCE != 0).then_some(words[1]),
        }
    }
}

/// What `begin` stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartRecord<C> {
    pub start_ns: u64,
    pub context: C,
}

/// A consumed start record and the time elapsed since it was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finished<C> {
    pub context: C,
    pub start_ns: u64,
    pub end_ns: u64,
    pub elapsed_ns: u64,
}

impl<C> Finished<C> {
    fn from_record(record: StartRecord<C>, end_ns: u64) -> Self {
        Self {
            context: record.context,
            start_ns: record.start_ns,
            end_ns,
            elapsed_ns: end_ns.saturating_sub(record.start_ns),
        }
    }
}

/// Bridge between entry and exit hooks.
///
/// `begin` returns whether the record was stored; a rejected begin is not an
/// error, its `end` will simply miss. Neither call blocks.
pub trait CorrelationStore<K, C>: Send + Sync {
    fn begin_at(&self, key: K, context: C, now_ns: u64) -> bool;
    fn end_at(&self, key: K, now_ns: u64) -> Option<Finished<C>>;
    /// Reads a record without consuming it.
    fn peek(&self, key: K) -> Option<StartRecord<C>>;
    fn now_ns(&self) -> u64;
    fn in_flight(&self) -> usize;
    fn capacity(&self) -> usize;

    fn begin(&self, key: K, context: C) -> bool {
        self.begin_at(key, context, self.now_ns())
    }

    fn end(&self, key: K) -> Option<Finished<C>> {
        self.end_at(key, self.now_ns())
    }
}

struct RecordCell<C>(UnsafeCell<MaybeUninit<StartRecord<C>>>);

impl<C> RecordCell<C> {
    fn new() -> Self {
        Self(UnsafeCell::new(MaybeUninit::uninit()))
    }

    /// Caller holds the slot in `BUSY`.
    unsafe fn write(&self, record: StartRecord<C>) {
        unsafe { (*self.0.get()).write(record) };
    }

    /// Caller holds the slot in `BUSY` and the slot was written before it
    /// was last published.
    unsafe fn read(&self) -> StartRecord<C>
    where
        C: Copy,
    {
        unsafe { (*self.0.get()).assume_init() }
    }
}

// Records are only touched by the thread that moved the slot into BUSY.
unsafe impl<C: Send> Sync for RecordCell<C> {}

struct Slots<K, C> {
    keys: Box<[KeyCell]>,
    records: Box<[RecordCell<C>]>,
    live: AtomicUsize,
    _key: PhantomData<fn() -> K>,
}

impl<K: SlotKey, C: Copy> Slots<K, C> {
    fn new(capacity: usize) -> Self {
        Self {
            keys: (0..capacity).map(|_| KeyCell::new()).collect(),
            records: (0..capacity).map(|_| RecordCell::new()).collect(),
            live: AtomicUsize::new(0),
            _key: PhantomData,
        }
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn own(&self, idx: usize, from: u8) -> bool {
        self.keys[idx]
            .state
            .compare_exchange(from, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn publish(&self, idx: usize, state: u8) {
        self.keys[idx].state.store(state, Ordering::Release);
    }

    /// Takes a live slot holding `words`, consuming its record.
    fn take(&self, idx: usize, words: [u64; 2]) -> Option<StartRecord<C>> {
        if !self.own(idx, LIVE) {
            return None;
        }
        if !self.keys[idx].holds(words) {
            self.publish(idx, LIVE);
            return None;
        }
        let record = unsafe { self.records[idx].read() };
        self.publish(idx, DEAD);
        self.live.fetch_sub(1, Ordering::Relaxed);
        Some(record)
    }

    fn copy(&self, idx: usize, words: [u64; 2]) -> Option<StartRecord<C>> {
        if !self.own(idx, LIVE) {
            return None;
        }
        let record = self.keys[idx]
            .holds(words)
            .then(|| unsafe { self.records[idx].read() });
        self.publish(idx, LIVE);
        record
    }
}

/// Open-addressed store with tombstones.
///
/// A second `begin` for a live key overwrites the record in place. `begin`
/// is rejected only when no free or tombstoned slot is left, or when another
/// hook holds a slot on the key's path past the spin budget; the records
/// already stored keep their place and the new key's `end` misses.
///
/// At most one record per key is live once every concurrent `begin` on that
/// key has returned.
pub struct HashCorrelationStore<K, C, T = MonotonicClock> {
    slots: Slots<K, C>,
    clock: T,
}

/// Walks `begin` restarts after losing a race for a slot.
const CLAIM_ATTEMPTS: usize = 32;

enum Placement {
    Updated,
    Inserted(usize),
    Contended,
    Full,
}

impl<K: SlotKey, C: Copy> HashCorrelationStore<K, C, MonotonicClock> {
    pub fn new(capacity: usize) -> Result<Self, EngineError> {
        Self::with_clock(capacity, MonotonicClock)
    }
}

impl<K: SlotKey, C: Copy, T: Clock> HashCorrelationStore<K, C, T> {
    pub fn with_clock(capacity: usize, clock: T) -> Result<Self, EngineError> {
        require_capacity("correlation store", capacity)?;
        Ok(Self {
            slots: Slots::new(capacity),
            clock,
        })
    }

    /// Slots on the key's path in probe order. Slots never return to
    /// `EMPTY`, so no copy of the key lives past the first empty one.
    fn path(&self, words: [u64; 2]) -> impl Iterator<Item = usize> + '_ {
        let len = self.slots.len();
        let start = home_slot(words, len);
        (0..len).map(move |i| (start + i) % len)
    }

    fn find(&self, words: [u64; 2]) -> Option<usize> {
        for idx in self.path(words) {
            let cell = &self.slots.keys[idx];
            match cell.settle() {
                EMPTY => return None,
                LIVE if cell.holds(words) => return Some(idx),
                _ => {}
            }
        }
        None
    }

    fn place(&self, words: [u64; 2], record: StartRecord<C>) -> Placement {
        let mut tombstone = None;
        for idx in self.path(words) {
            let cell = &self.slots.keys[idx];
            match cell.settle() {
                BUSY => return Placement::Contended,
                LIVE if cell.holds(words) => {
                    if !self.slots.own(idx, LIVE) {
                        return Placement::Contended;
                    }
                    if !cell.holds(words) {
                        self.slots.publish(idx, LIVE);
                        return Placement::Contended;
                    }
                    unsafe { self.slots.records[idx].write(record) };
                    self.slots.publish(idx, LIVE);
                    return Placement::Updated;
                }
                DEAD => {
                    tombstone.get_or_insert(idx);
                }
                EMPTY => {
                    return match tombstone {
                        Some(dead) => self.claim(dead, DEAD, words, record),
                        None => self.claim(idx, EMPTY, words, record),
                    };
                }
                _ => {}
            }
        }
        match tombstone {
            Some(dead) => self.claim(dead, DEAD, words, record),
            None => Placement::Full,
        }
    }

    fn claim(&self, idx: usize, from: u8, words: [u64; 2], record: StartRecord<C>) -> Placement {
        if !self.slots.own(idx, from) {
            return Placement::Contended;
        }
        self.slots.keys[idx].store(words);
        unsafe { self.slots.records[idx].write(record) };
        self.slots.publish(idx, LIVE);
        self.slots.live.fetch_add(1, Ordering::Relaxed);
        Placement::Inserted(idx)
    }

    /// Two begins for one key can claim different tombstones. After
    /// publishing, each walks the whole path and the copy nearest the key's
    /// home survives. The fence guarantees at least one of the two sees the
    /// other's slot.
    fn retire_duplicates(&self, words: [u64; 2], mine: usize) {
        fence(Ordering::SeqCst);
        let mut passed_mine = false;
        for idx in self.path(words) {
            if idx == mine {
                passed_mine = true;
                continue;
            }
            let cell = &self.slots.keys[idx];
            match cell.settle() {
                EMPTY => return,
                LIVE if cell.holds(words) => {
                    let later = if passed_mine { idx } else { mine };
                    self.slots.take(later, words);
                    if later == mine {
                        return;
                    }
                }
                _ => {}
            }
        }
    }
}

impl<K, C, T> CorrelationStore<K, C> for HashCorrelationStore<K, C, T>
where
    K: SlotKey,
    C: Copy + Send,
    T: Clock,
{
    fn begin_at(&self, key: K, context: C, now_ns: u64) -> bool {
        let words = key.to_words();
        let record = StartRecord {
            start_ns: now_ns,
            context,
        };
        for _ in 0..CLAIM_ATTEMPTS {
            match self.place(words, record) {
                Placement::Updated => return true,
                Placement::Inserted(idx) => {
                    self.retire_duplicates(words, idx);
                    return true;
                }
                Placement::Full => return false,
                Placement::Contended => std::hint::spin_loop(),
            }
        }
        false
    }

    fn end_at(&self, key: K, now_ns: u64) -> Option<Finished<C>> {
        let words = key.to_words();
        let idx = self.find(words)?;
        self.slots
            .take(idx, words)
            .map(|record| Finished::from_record(record, now_ns))
    }

    fn peek(&self, key: K) -> Option<StartRecord<C>> {
        let words = key.to_words();
        let idx = self.find(words)?;
        self.slots.copy(idx, words)
    }

    fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    fn in_flight(&self) -> usize {
        self.slots.live.load(Ordering::Relaxed)
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Direct-mapped store: each key has exactly one slot.
///
/// `begin` always takes the key's slot, evicting whichever record held it,
/// so under pressure the most recent start wins and the evicted key's `end`
/// misses. `begin` is only rejected when another hook owns the slot at that
/// instant.
pub struct DirectCorrelationStore<K, C, T = MonotonicClock> {
    slots: Slots<K, C>,
    evicted: AtomicU64,
    clock: T,
}

impl<K: SlotKey, C: Copy> DirectCorrelationStore<K, C, MonotonicClock> {
    pub fn new(capacity: usize) -> Result<Self, EngineError> {
        Self::with_clock(capacity, MonotonicClock)
    }
}

impl<K: SlotKey, C: Copy, T: Clock> DirectCorrelationStore<K, C, T> {
    pub fn with_clock(capacity: usize, clock: T) -> Result<Self, EngineError> {
        require_capacity("correlation store", capacity)?;
        Ok(Self {
            slots: Slots::new(capacity),
            evicted: AtomicU64::new(0),
            clock,
        })
    }

    /// Unmatched records overwritten by a different key.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl<K, C, T> CorrelationStore<K, C> for DirectCorrelationStore<K, C, T>
where
    K: SlotKey,
    C: Copy + Send,
    T: Clock,
{
    fn begin_at(&self, key: K, context: C, now_ns: u64) -> bool {
        let words = key.to_words();
        let idx = home_slot(words, self.slots.len());
        let state = self.slots.keys[idx].state.load(Ordering::Relaxed);
        if state == BUSY || !self.slots.own(idx, state) {
            return false;
        }
        if state == LIVE {
            if !self.slots.keys[idx].holds(words) {
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.slots.live.fetch_add(1, Ordering::Relaxed);
        }
        self.slots.keys[idx].store(words);
        unsafe {
            self.slots.records[idx].write(StartRecord {
                start_ns: now_ns,
                context,
            })
        };
        self.slots.publish(idx, LIVE);
        true
    }

    fn end_at(&self, key: K, now_ns: u64) -> Option<Finished<C>> {
        let words = key.to_words();
        let idx = home_slot(words, self.slots.len());
        self.slots
            .take(idx, words)
            .map(|record| Finished::from_record(record, now_ns))
    }

    fn peek(&self, key: K) -> Option<StartRecord<C>> {
        let words = key.to_words();
        self.slots.copy(home_slot(words, self.slots.len()), words)
    }

    fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    fn in_flight(&self) -> usize {
        self.slots.live.load(Ordering::Relaxed)
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ManualClock;
    use std::sync::Arc;

    fn hash_store(capacity: usize) -> (Arc<ManualClock>, HashCorrelationStore<u64, u64, Arc<ManualClock>>) {
        let clock = Arc::new(ManualClock::new(0));
        let store = HashCorrelationStore::with_clock(capacity, clock.clone()).unwrap();
        (clock, store)
    }

    #[test]
    fn end_returns_exact_elapsed() {
        let (clock, store) = hash_store(64);
        for (key, start, end) in [(1u64, 10u64, 25u64), (2, 100, 100), (3, 7, 1_000_007)] {
            clock.set(start);
            assert!(store.begin(key, key * 10));
            clock.set(end);
            let done = store.end(key).unwrap();
            assert_eq!(done.elapsed_ns, end - start);
            assert_eq!(done.start_ns, start);
            assert_eq!(done.end_ns, end);
            assert_eq!(done.context, key * 10);
        }
        assert_eq!(store.in_flight(), 0);
    }

    #[test]
    fn end_without_begin_misses() {
        let (_, store) = hash_store(16);
        for key in [0u64, 1, 42, u64::MAX] {
            assert!(store.end(key).is_none());
        }
        let direct: DirectCorrelationStore<u64, u64> = DirectCorrelationStore::new(16).unwrap();
        assert!(direct.end(42).is_none());
    }

    #[test]
    fn end_consumes_the_record() {
        let (_, store) = hash_store(16);
        assert!(store.begin(9, 1));
        assert!(store.end(9).is_some());
        assert!(store.end(9).is_none());
    }

    #[test]
    fn second_begin_overwrites() {
        let (clock, store) = hash_store(16);
        clock.set(100);
        store.begin(5, 1);
        clock.set(200);
        store.begin(5, 2);
        clock.set(250);
        let done = store.end(5).unwrap();
        assert_eq!(done.context, 2);
        assert_eq!(done.elapsed_ns, 50);
        assert_eq!(store.in_flight(), 0);
    }

    #[test]
    fn tombstones_are_reused() {
        let (_, store) = hash_store(4);
        for round in 0..100u64 {
            assert!(store.begin(round, round));
            assert_eq!(store.end(round).map(|f| f.context), Some(round));
        }
    }

    #[test]
    fn peek_leaves_record_in_place() {
        let (_, store) = hash_store(8);
        store.begin(3, 33);
        assert_eq!(store.peek(3).map(|r| r.context), Some(33));
        assert_eq!(store.end(3).map(|f| f.context), Some(33));
        assert!(store.peek(3).is_none());
    }

    #[test]
    fn elapsed_saturates_when_clock_is_behind() {
        let (_, store) = hash_store(8);
        assert!(store.begin_at(1, 0, 500));
        assert_eq!(store.end_at(1, 400).unwrap().elapsed_ns, 0);
    }

    #[test]
    fn pairing_key_words_round_trip() {
        for key in [
            PairingKey { subject: Some(7), cpu: None, resource: None },
            PairingKey { subject: Some(0), cpu: Some(3), resource: None },
            PairingKey { subject: None, cpu: None, resource: Some(0xdead_beef) },
            PairingKey { subject: None, cpu: Some(1), resource: Some(0) },
        ] {
            assert_eq!(PairingKey::from_words(key.to_words()), key);
        }
    }

    #[test]
    fn cpu_scope_separates_idle_tasks() {
        let cpu0 = HookContext::new(0, 0, 0);
        let cpu1 = HookContext::new(0, 0, 1);
        let a = PairingKey::derive(PairingScope::SubjectPerCpu, &cpu0);
        let b = PairingKey::derive(PairingScope::SubjectPerCpu, &cpu1);
        assert_ne!(a.to_words(), b.to_words());
        assert_eq!(
            PairingKey::derive(PairingScope::Subject, &cpu0).to_words(),
            PairingKey::derive(PairingScope::Subject, &cpu1).to_words()
        );
    }

    #[test]
    fn concurrent_subjects_pair_independently() {
        let store: HashCorrelationStore<u64, u64> = HashCorrelationStore::new(1024).unwrap();
        std::thread::scope(|s| {
            for worker in 0..8u64 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..2_000u64 {
                        let key = worker << 32 | (i % 16);
                        assert!(store.begin_at(key, i, i));
                        let done = store.end_at(key, i + worker).unwrap();
                        assert_eq!(done.context, i);
                        assert_eq!(done.elapsed_ns, worker);
                    }
                });
            }
        });
        assert_eq!(store.in_flight(), 0);
    }

    #[test]
    fn fills_to_exact_capacity() {
        let (_, store) = hash_store(1024);
        for key in 0..1024u64 {
            assert!(
                store.begin(key.wrapping_mul(0x9e37_79b9), key),
                "begin {} rejected with {} records stored",
                key,
                store.in_flight()
            );
        }
        assert_eq!(store.in_flight(), 1024);
        assert!(!store.begin(u64::MAX, 0));
        for key in 0..1024u64 {
            assert_eq!(store.end(key.wrapping_mul(0x9e37_79b9)).map(|f| f.context), Some(key));
        }
        assert_eq!(store.in_flight(), 0);
    }

    #[test]
    fn full_store_takes_a_tombstone_after_an_end() {
        let (_, store) = hash_store(8);
        for key in 0..8u64 {
            assert!(store.begin(key, key));
        }
        assert!(!store.begin(100, 100));
        assert!(store.end(3).is_some());
        assert!(store.begin(100, 100));
        assert_eq!(store.end(100).map(|f| f.context), Some(100));
    }

    #[test]
    fn racing_begins_on_one_key_leave_one_record() {
        for round in 0..50u64 {
            let (_, store) = hash_store(64);
            // Tombstones on the key's path give racing begins distinct slots
            // to claim.
            for key in 0..32u64 {
                store.begin(key, 0);
            }
            for key in 0..32u64 {
                store.end(key);
            }
            let key = round;
            std::thread::scope(|s| {
                for worker in 0..8u64 {
                    let store = &store;
                    s.spawn(move || store.begin(key, worker));
                }
            });
            assert_eq!(store.in_flight(), 1, "round {}", round);
            assert!(store.end(key).is_some());
            assert!(store.end(key).is_none());
        }
    }
}
