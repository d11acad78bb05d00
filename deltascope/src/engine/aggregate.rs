//! Per-identity running statistics under concurrent update.
//!
//! Each field is updated with its own atomic instruction. A reader sees every
//! field at some point in time, but `count` and `cumulative` are read
//! separately, so a snapshot taken during writes may pair a count and a sum
//! that no single moment ever had. Averages computed from a live snapshot are
//! approximations; the totals once writers stop are exact.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::identity::Identity;
use super::slots::{Claim, SlotKey, SlotTable};
use super::{EngineError, require_capacity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AggregateStats {
    pub count: u64,
    pub cumulative: u64,
    pub min: u64,
    pub max: u64,
}

impl AggregateStats {
    pub fn average(&self) -> Option<u64> {
        self.cumulative.checked_div(self.count)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.cumulative == 0
    }

    pub fn merge(&mut self, other: &AggregateStats) {
        if other.is_empty() {
            return;
        }
        self.min = if self.is_empty() {
            other.min
        } else {
            self.min.min(other.min)
        };
        self.max = self.max.max(other.max);
        self.count = self.count.saturating_add(other.count);
        self.cumulative = self.cumulative.saturating_add(other.cumulative);
    }
}

struct Entry {
    count: AtomicU64,
    cumulative: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            cumulative: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }
}

impl Entry {
    fn seed(&self, count: u64, value: u64) {
        self.count.store(count, Ordering::Relaxed);
        self.cumulative.store(value, Ordering::Relaxed);
        self.min.store(value, Ordering::Relaxed);
        self.max.store(value, Ordering::Relaxed);
    }

    fn add(&self, delta: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.cumulative.fetch_add(delta, Ordering::Relaxed);
        self.min.fetch_min(delta, Ordering::Relaxed);
        self.max.fetch_max(delta, Ordering::Relaxed);
    }

    fn read(&self, reset: bool) -> AggregateStats {
        let (count, cumulative, min, max) = if reset {
            (
                self.count.swap(0, Ordering::Relaxed),
                self.cumulative.swap(0, Ordering::Relaxed),
                self.min.swap(u64::MAX, Ordering::Relaxed),
                self.max.swap(0, Ordering::Relaxed),
            )
        } else {
            (
                self.count.load(Ordering::Relaxed),
                self.cumulative.load(Ordering::Relaxed),
                self.min.load(Ordering::Relaxed),
                self.max.load(Ordering::Relaxed),
            )
        };
        AggregateStats {
            count,
            cumulative,
            min: if min == u64::MAX { 0 } else { min },
            max,
        }
    }
}

/// What a resetting snapshot does to a table's entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// Every field restarts from empty after a resetting read.
    #[default]
    Interval,
    /// Values are running totals later updates build on, such as
    /// outstanding bytes or retry counters. Reads never reset them.
    Running,
}

/// Fixed-capacity aggregate table.
///
/// Entries are created on first update and never removed; when the table is
/// full, updates for new keys fail and return `false`.
pub struct AggregateTable<K = Identity> {
    slots: SlotTable<K, Entry>,
    retention: Retention,
}

impl<K: SlotKey> AggregateTable<K> {
    pub fn new(capacity: usize) -> Result<Self, EngineError> {
        Self::with_retention(capacity, Retention::Interval)
    }

    pub fn with_retention(capacity: usize, retention: Retention) -> Result<Self, EngineError> {
        require_capacity("aggregate table", capacity)?;
        Ok(Self {
            slots: SlotTable::with_capacity(capacity),
            retention,
        })
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    /// Adds one sample of `delta`. The first sample for a key is written
    /// before the entry becomes visible, so concurrent callers never observe
    /// or lose a half-initialised entry.
    pub fn accumulate(&self, key: K, delta: u64) -> bool {
        match self.slots.get_or_insert_with(&key, |e| e.seed(1, delta)) {
            Some(Claim::Found(entry)) => {
                entry.add(delta);
                true
            }
            Some(Claim::Inserted(_)) => true,
            None => false,
        }
    }

    /// Bumps the sample count without touching the value fields, saturating
    /// at `cap`. Returns the count after the update.
    pub fn count_capped(&self, key: K, cap: u64) -> Option<u64> {
        let cap = cap.max(1);
        match self.slots.get_or_insert_with(&key, |e| {
            e.count.store(1, Ordering::Relaxed);
        })? {
            Claim::Inserted(_) => Some(1),
            Claim::Found(entry) => {
                let prev = entry
                    .count
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                        (c < cap).then_some(c + 1)
                    });
                Some(match prev {
                    Ok(c) => c + 1,
                    Err(c) => c,
                })
            }
        }
    }

    /// Takes `delta` back out of the cumulative value, saturating at zero,
    /// for bounded resources whose release undoes an earlier accumulate.
    /// The sample count is left as is.
    pub fn retract(&self, key: K, delta: u64) -> bool {
        let Some(entry) = self.slots.get(&key) else {
            return false;
        };
        let mut current = entry.cumulative.load(Ordering::Relaxed);
        loop {
            match entry.cumulative.compare_exchange_weak(
                current,
                current.saturating_sub(delta),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn get(&self, key: K) -> Option<AggregateStats> {
        self.slots.get(&key).map(|e| e.read(false))
    }

    /// Best-effort view of every entry. With `reset` on an interval table,
    /// each field is swapped back to its initial value as it is read; samples
    /// landing between two swaps of the same entry end up split across two
    /// snapshots. Running tables ignore `reset`.
    pub fn snapshot(&self, reset: bool) -> Vec<(K, AggregateStats)> {
        let reset = reset && self.retention == Retention::Interval;
        self.slots
            .iter()
            .map(|(key, entry)| (key, entry.read(reset)))
            .filter(|(_, stats)| !stats.is_empty())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }
}

/// One independent table per execution unit.
///
/// Writers only touch their own shard; shards are combined in
/// `merged_snapshot`, never on the write path.
pub struct ShardedAggregateTable<K = Identity> {
    shards: Box<[AggregateTable<K>]>,
}

impl<K: SlotKey + Hash> ShardedAggregateTable<K> {
    pub fn new(shards: usize, capacity_per_shard: usize) -> Result<Self, EngineError> {
        require_capacity("shard count", shards)?;
        Ok(Self {
            shards: (0..shards)
                .map(|_| AggregateTable::new(capacity_per_shard))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Shard owned by `unit`, typically a CPU index.
    pub fn shard(&self, unit: usize) -> &AggregateTable<K> {
        &self.shards[unit % self.shards.len()]
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn merged_snapshot(&self, reset: bool) -> Vec<(K, AggregateStats)> {
        let mut merged: HashMap<K, AggregateStats> = HashMap::new();
        for shard in self.shards.iter() {
            for (key, stats) in shard.snapshot(reset) {
                merged.entry(key).or_default().merge(&stats);
            }
        }
        merged.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(pid: u32) -> Identity {
        Identity::BySubject { pid }
    }

    #[test]
    fn two_samples_sum() {
        let table = AggregateTable::new(64).unwrap();
        assert!(table.accumulate(subject(1), 300));
        assert!(table.accumulate(subject(1), 200));
        let stats = table.get(subject(1)).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.cumulative, 500);
        assert_eq!((stats.min, stats.max), (200, 300));
        assert_eq!(stats.average(), Some(250));
    }

    #[test]
    fn other_identities_do_not_interfere() {
        let table = AggregateTable::new(256).unwrap();
        std::thread::scope(|s| {
            for pid in 2..10u32 {
                let table = &table;
                s.spawn(move || {
                    for _ in 0..1_000 {
                        table.accumulate(subject(pid), 3);
                    }
                });
            }
            table.accumulate(subject(1), 11);
            table.accumulate(subject(1), 31);
        });
        let stats = table.get(subject(1)).unwrap();
        assert_eq!((stats.count, stats.cumulative), (2, 42));
    }

    #[test]
    fn same_identity_sums_exactly() {
        const WORKERS: u64 = 8;
        const PER_WORKER: u64 = 10_000;
        let table = AggregateTable::new(16).unwrap();
        std::thread::scope(|s| {
            for worker in 0..WORKERS {
                let table = &table;
                s.spawn(move || {
                    for i in 0..PER_WORKER {
                        assert!(table.accumulate(subject(42), worker + i));
                    }
                });
            }
        });
        let expected: u64 = (0..WORKERS)
            .map(|w| (0..PER_WORKER).map(|i| w + i).sum::<u64>())
            .sum();
        let stats = table.get(subject(42)).unwrap();
        assert_eq!(stats.count, WORKERS * PER_WORKER);
        assert_eq!(stats.cumulative, expected);
        assert_eq!(stats.min, 0);
        assert_eq!(stats.max, WORKERS - 1 + PER_WORKER - 1);
    }

    #[test]
    fn live_snapshots_are_bounded_by_final_totals() {
        // Snapshots taken during writes may pair a count and a sum from
        // different moments, but never exceed what was finally written.
        let table = AggregateTable::new(16).unwrap();
        let snapshots = std::thread::scope(|s| {
            let writer = {
                let table = &table;
                s.spawn(move || {
                    for _ in 0..50_000 {
                        table.accumulate(subject(5), 2);
                    }
                })
            };
            let mut seen = Vec::new();
            while !writer.is_finished() {
                seen.extend(table.snapshot(false));
            }
            seen
        });
        let last = table.get(subject(5)).unwrap();
        assert_eq!((last.count, last.cumulative), (50_000, 100_000));
        for (_, stats) in snapshots {
            assert!(stats.count <= last.count);
            assert!(stats.cumulative <= last.cumulative);
        }
    }

    #[test]
    fn full_table_fails_silently() {
        let table = AggregateTable::new(2).unwrap();
        assert!(table.accumulate(subject(1), 1));
        assert!(table.accumulate(subject(2), 1));
        assert!(!table.accumulate(subject(3), 1));
        assert!(table.accumulate(subject(1), 1));
        assert_eq!(table.get(subject(3)), None);
        assert_eq!(table.get(subject(1)).unwrap().count, 2);
    }

    #[test]
    fn fills_to_exact_capacity() {
        let table = AggregateTable::new(1024).unwrap();
        for pid in 0..1024u32 {
            assert!(table.accumulate(subject(pid), 1), "pid {} rejected at {} entries", pid, table.len());
        }
        assert_eq!(table.len(), 1024);
        assert!(!table.accumulate(subject(5000), 1));
    }

    #[test]
    fn running_tables_ignore_reset() {
        let table = AggregateTable::with_retention(8, Retention::Running).unwrap();
        table.accumulate(subject(1), 4096);
        assert_eq!(table.snapshot(true)[0].1.cumulative, 4096);
        table.accumulate(subject(1), 100);
        assert!(table.retract(subject(1), 4096));
        assert_eq!(table.get(subject(1)).unwrap().cumulative, 100);
    }

    #[test]
    fn snapshot_reset_starts_a_new_interval() {
        let table = AggregateTable::new(8).unwrap();
        table.accumulate(subject(1), 10);
        table.accumulate(subject(1), 20);
        let first = table.snapshot(true);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].1.cumulative, 30);
        assert!(table.snapshot(false).is_empty());

        table.accumulate(subject(1), 5);
        let stats = table.get(subject(1)).unwrap();
        assert_eq!((stats.count, stats.cumulative, stats.min, stats.max), (1, 5, 5, 5));
    }

    #[test]
    fn count_capped_saturates() {
        let table = AggregateTable::new(8).unwrap();
        let key = Identity::ByAddress { addr: 0x7000 };
        assert_eq!(table.count_capped(key, 3), Some(1));
        assert_eq!(table.count_capped(key, 3), Some(2));
        assert_eq!(table.count_capped(key, 3), Some(3));
        assert_eq!(table.count_capped(key, 3), Some(3));
        assert_eq!(table.get(key).unwrap().cumulative, 0);
    }

    #[test]
    fn retract_saturates_at_zero() {
        let table = AggregateTable::new(8).unwrap();
        table.accumulate(subject(3), 4096);
        table.accumulate(subject(3), 64);
        assert!(table.retract(subject(3), 4096));
        assert_eq!(table.get(subject(3)).unwrap().cumulative, 64);
        assert!(table.retract(subject(3), 1_000));
        assert_eq!(table.get(subject(3)).unwrap().cumulative, 0);
        assert!(!table.retract(subject(4), 1));
    }

    #[test]
    fn shards_merge_on_read() {
        let table = ShardedAggregateTable::new(4, 32).unwrap();
        std::thread::scope(|s| {
            for cpu in 0..4usize {
                let table = &table;
                s.spawn(move || {
                    for _ in 0..100 {
                        table.shard(cpu).accumulate(subject(1), cpu as u64 + 1);
                    }
                    table.shard(cpu).accumulate(subject(100 + cpu as u32), 7);
                });
            }
        });
        let merged = table.merged_snapshot(false);
        let one = merged.iter().find(|(k, _)| *k == subject(1)).unwrap().1;
        assert_eq!(one.count, 400);
        assert_eq!(one.cumulative, 100 * (1 + 2 + 3 + 4));
        assert_eq!((one.min, one.max), (1, 4));
        assert_eq!(merged.len(), 5);
    }
}
