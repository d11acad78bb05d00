//! Fixed-capacity open-addressed slots shared by the engine tables.
//!
//! Each slot carries a one-byte state and a two-word key held in atomics, so
//! any thread may compare keys while another publishes or retires a slot.
//! Values are owned by the caller's table and written only while the slot is
//! `BUSY` (exclusively claimed) or through their own atomics.

use std::hash::Hasher;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use fnv::FnvHasher;

pub(crate) const EMPTY: u8 = 0;
pub(crate) const BUSY: u8 = 1;
pub(crate) const LIVE: u8 = 2;
pub(crate) const DEAD: u8 = 3;

/// Spins spent waiting for another writer to publish a claimed slot before
/// the operation gives up.
const PUBLISH_SPINS: u32 = 1 << 16;

/// Keys that fit in two machine words.
pub trait SlotKey: Copy + Eq {
    fn to_words(&self) -> [u64; 2];
    fn from_words(words: [u64; 2]) -> Self;
}

impl SlotKey for u32 {
    fn to_words(&self) -> [u64; 2] {
        [*self as u64, 0]
    }

    fn from_words(words: [u64; 2]) -> Self {
        words[0] as u32
    }
}

impl SlotKey for u64 {
    fn to_words(&self) -> [u64; 2] {
        [*self, 0]
    }

    fn from_words(words: [u64; 2]) -> Self {
        words[0]
    }
}

pub(crate) struct KeyCell {
    pub(crate) state: AtomicU8,
    words: [AtomicU64; 2],
}

impl KeyCell {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            words: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    /// Only called by the thread holding the slot in `BUSY`.
    pub(crate) fn store(&self, words: [u64; 2]) {
        self.words[0].store(words[0], Ordering::Relaxed);
        self.words[1].store(words[1], Ordering::Relaxed);
    }

    pub(crate) fn load(&self) -> [u64; 2] {
        [
            self.words[0].load(Ordering::Relaxed),
            self.words[1].load(Ordering::Relaxed),
        ]
    }

    pub(crate) fn holds(&self, words: [u64; 2]) -> bool {
        self.load() == words
    }

    /// Spins while another writer is publishing this slot. Returns the state
    /// it settled on, or `BUSY` if the budget ran out.
    pub(crate) fn settle(&self) -> u8 {
        let mut spins = 0;
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state != BUSY || spins == PUBLISH_SPINS {
                return state;
            }
            spins += 1;
            std::hint::spin_loop();
        }
    }
}

pub(crate) fn home_slot(words: [u64; 2], len: usize) -> usize {
    let mut hasher = FnvHasher::default();
    hasher.write_u64(words[0]);
    hasher.write_u64(words[1]);
    (hasher.finish() % len as u64) as usize
}

pub(crate) enum Claim<'a, V> {
    Found(&'a V),
    Inserted(&'a V),
}

impl<'a, V> Claim<'a, V> {
    pub(crate) fn value(&self) -> &'a V {
        match self {
            Claim::Found(v) | Claim::Inserted(v) => v,
        }
    }
}

/// Insert-only table: slots go `EMPTY -> BUSY -> LIVE` and stay there.
pub(crate) struct SlotTable<K, V> {
    keys: Box<[KeyCell]>,
    values: Box<[V]>,
    live: AtomicUsize,
    _key: PhantomData<fn() -> K>,
}

impl<K: SlotKey, V: Default> SlotTable<K, V> {
    /// `capacity` must be non-zero; callers validate it.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            keys: (0..capacity).map(|_| KeyCell::new()).collect(),
            values: (0..capacity).map(|_| V::default()).collect(),
            live: AtomicUsize::new(0),
            _key: PhantomData,
        }
    }
}

impl<K: SlotKey, V> SlotTable<K, V> {
    pub(crate) fn capacity(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub(crate) fn get(&self, key: &K) -> Option<&V> {
        let words = key.to_words();
        let len = self.keys.len();
        let start = home_slot(words, len);
        for i in 0..len {
            let idx = (start + i) % len;
            let cell = &self.keys[idx];
            match cell.settle() {
                EMPTY => return None,
                LIVE if cell.holds(words) => return Some(&self.values[idx]),
                _ => {}
            }
        }
        None
    }

    /// Finds `key` or claims a slot for it, running `init` on the value
    /// before the slot becomes visible. `None` when every slot holds another
    /// key or a concurrent publish did not finish within the spin budget.
    pub(crate) fn get_or_insert_with<F>(&self, key: &K, init: F) -> Option<Claim<'_, V>>
    where
        F: FnOnce(&V),
    {
        let words = key.to_words();
        let len = self.keys.len();
        let start = home_slot(words, len);
        let mut init = Some(init);
        for i in 0..len {
            let idx = (start + i) % len;
            let cell = &self.keys[idx];
            loop {
                match cell.settle() {
                    EMPTY => {
                        if cell
                            .state
                            .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
                            .is_ok()
                        {
                            cell.store(words);
                            if let Some(init) = init.take() {
                                init(&self.values[idx]);
                            }
                            cell.state.store(LIVE, Ordering::Release);
                            self.live.fetch_add(1, Ordering::Relaxed);
                            return Some(Claim::Inserted(&self.values[idx]));
                        }
                        // Lost the claim; re-read what the winner publishes.
                    }
                    LIVE => {
                        if cell.holds(words) {
                            return Some(Claim::Found(&self.values[idx]));
                        }
                        break;
                    }
                    _ => return None,
                }
            }
        }
        None
    }

    /// Published slots at the moment each one is visited.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.keys
            .iter()
            .zip(self.values.iter())
            .filter(|(cell, _)| cell.state.load(Ordering::Acquire) == LIVE)
            .map(|(cell, value)| (K::from_words(cell.load()), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn insert_then_find() {
        let table: SlotTable<u64, AtomicU64> = SlotTable::with_capacity(8);
        let claim = table
            .get_or_insert_with(&7, |v| v.store(70, Ordering::Relaxed))
            .unwrap();
        assert!(matches!(claim, Claim::Inserted(_)));

        let again = table.get_or_insert_with(&7, |_| panic!("init ran twice")).unwrap();
        assert!(matches!(again, Claim::Found(_)));
        assert_eq!(again.value().load(Ordering::Relaxed), 70);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn full_table_rejects_new_keys() {
        let table: SlotTable<u32, AtomicU64> = SlotTable::with_capacity(2);
        assert!(table.get_or_insert_with(&1, |_| {}).is_some());
        assert!(table.get_or_insert_with(&2, |_| {}).is_some());
        assert!(table.get_or_insert_with(&3, |_| {}).is_none());
        assert!(table.get(&1).is_some());
        assert!(table.get(&3).is_none());
    }

    #[test]
    fn iter_yields_published_keys() {
        let table: SlotTable<u32, AtomicU64> = SlotTable::with_capacity(16);
        for k in [3, 5, 9] {
            table.get_or_insert_with(&k, |_| {});
        }
        let mut keys: Vec<u32> = table.iter().map(|(k, _)| k).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![3, 5, 9]);
    }

    #[test]
    fn every_slot_is_usable_before_rejecting() {
        let table: SlotTable<u64, AtomicU64> = SlotTable::with_capacity(1024);
        for k in 0..1024u64 {
            assert!(
                table.get_or_insert_with(&(k * 7919), |_| {}).is_some(),
                "key {} rejected with {} of 1024 slots used",
                k,
                table.len()
            );
        }
        assert_eq!(table.len(), 1024);
        assert!(table.get_or_insert_with(&u64::MAX, |_| {}).is_none());
        for k in 0..1024u64 {
            assert!(table.get(&(k * 7919)).is_some());
        }
    }
}
