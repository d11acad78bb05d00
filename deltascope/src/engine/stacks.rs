use std::hash::Hasher;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use deltascope_common::MAX_STACK_DEPTH;
use fnv::FnvHasher;
use serde::Serialize;

use super::slots::{SlotKey, SlotTable};
use super::{EngineError, require_capacity};

/// Small integer standing in for a captured call stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StackId(pub u32);

impl StackId {
    /// Capture failed, or the stack table was full.
    pub const UNKNOWN: StackId = StackId(u32::MAX - 1);

    pub fn is_unknown(self) -> bool {
        self == Self::UNKNOWN
    }
}

/// Offset basis of the second digest, so the two digests are independent.
const SECOND_BASIS: u64 = 0x6c62_272e_07bb_0142;

#[derive(Clone, Copy, PartialEq, Eq)]
struct Digest([u64; 2]);

impl Digest {
    fn of(frames: &[u64]) -> Self {
        let mut forward = FnvHasher::default();
        let mut second = FnvHasher::with_key(SECOND_BASIS);
        forward.write_usize(frames.len());
        second.write_usize(frames.len());
        for (i, ip) in frames.iter().enumerate() {
            forward.write_u64(*ip);
            second.write_u64(ip.rotate_left(i as u32 % 64) ^ i as u64);
        }
        Digest([forward.finish(), second.finish()])
    }
}

impl SlotKey for Digest {
    fn to_words(&self) -> [u64; 2] {
        self.0
    }

    fn from_words(words: [u64; 2]) -> Self {
        Digest(words)
    }
}

struct Trace {
    depth: AtomicUsize,
    ips: Box<[AtomicU64]>,
}

/// Content-addressed stack table.
///
/// Equal frame sequences share an id. Ids are handed out in first-seen order
/// and stay valid for the table's lifetime.
pub struct StackTable {
    index: SlotTable<Digest, AtomicU32>,
    traces: Box<[Trace]>,
    next_id: AtomicU32,
    max_depth: usize,
}

impl StackTable {
    pub fn new(capacity: usize) -> Result<Self, EngineError> {
        Self::with_depth(capacity, MAX_STACK_DEPTH)
    }

    pub fn with_depth(capacity: usize, max_depth: usize) -> Result<Self, EngineError> {
        require_capacity("stack table", capacity)?;
        require_capacity("stack depth", max_depth)?;
        let capacity = capacity.min(StackId::UNKNOWN.0 as usize);
        Ok(Self {
            index: SlotTable::with_capacity(capacity),
            traces: (0..capacity)
                .map(|_| Trace {
                    depth: AtomicUsize::new(0),
                    ips: (0..max_depth).map(|_| AtomicU64::new(0)).collect(),
                })
                .collect(),
            next_id: AtomicU32::new(0),
            max_depth,
        })
    }

    /// Maps a frame sequence to its id. Frames past the table's depth are
    /// ignored. Empty stacks and a full table give `StackId::UNKNOWN`.
    pub fn intern(&self, frames: &[u64]) -> StackId {
        if frames.is_empty() {
            return StackId::UNKNOWN;
        }
        let frames = &frames[..frames.len().min(self.max_depth)];
        let claim = self.index.get_or_insert_with(&Digest::of(frames), |slot| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let Some(trace) = self.traces.get(id as usize) else {
                slot.store(StackId::UNKNOWN.0, Ordering::Relaxed);
                return;
            };
            for (cell, ip) in trace.ips.iter().zip(frames) {
                cell.store(*ip, Ordering::Relaxed);
            }
            trace.depth.store(frames.len(), Ordering::Release);
            slot.store(id, Ordering::Relaxed);
        });
        match claim {
            Some(claim) => StackId(claim.value().load(Ordering::Relaxed)),
            None => StackId::UNKNOWN,
        }
    }

    /// Frames of a previously interned stack.
    pub fn frames(&self, id: StackId) -> Option<Vec<u64>> {
        let trace = self.traces.get(id.0 as usize)?;
        let depth = trace.depth.load(Ordering::Acquire);
        if depth == 0 {
            return None;
        }
        Some(
            trace.ips[..depth]
                .iter()
                .map(|ip| ip.load(Ordering::Relaxed))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.traces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_stacks_share_an_id() {
        let table = StackTable::new(64).unwrap();
        let a = table.intern(&[0x1000, 0x2000, 0x3000]);
        let b = table.intern(&[0x1000, 0x2000, 0x3000]);
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
        assert_eq!(table.frames(a), Some(vec![0x1000, 0x2000, 0x3000]));
    }

    #[test]
    fn different_stacks_get_different_ids() {
        let table = StackTable::new(4096).unwrap();
        let mut seen = std::collections::HashSet::new();
        for depth in 1..8u64 {
            for base in 0..300u64 {
                let frames: Vec<u64> = (0..depth).map(|i| 0xffff_8000_0000_0000 + base * 64 + i).collect();
                assert!(seen.insert(table.intern(&frames)), "collision at depth {depth} base {base}");
            }
        }
        // Same frames in another order are another stack.
        let fwd = table.intern(&[1, 2]);
        let rev = table.intern(&[2, 1]);
        assert_ne!(fwd, rev);
    }

    #[test]
    fn ids_are_assigned_in_first_seen_order() {
        let table = StackTable::new(16).unwrap();
        assert_eq!(table.intern(&[10]), StackId(0));
        assert_eq!(table.intern(&[20]), StackId(1));
        assert_eq!(table.intern(&[10]), StackId(0));
        assert_eq!(table.intern(&[30]), StackId(2));
    }

    #[test]
    fn full_table_yields_unknown() {
        let table = StackTable::new(2).unwrap();
        assert!(!table.intern(&[1]).is_unknown());
        assert!(!table.intern(&[2]).is_unknown());
        assert!(table.intern(&[3]).is_unknown());
        assert!(table.intern(&[]).is_unknown());
        assert_eq!(table.frames(StackId::UNKNOWN), None);
    }

    #[test]
    fn every_slot_holds_a_stack() {
        let table = StackTable::new(4096).unwrap();
        for base in 0..4096u64 {
            let id = table.intern(&[0xffff_8000_0000_0000 + base * 16, base]);
            assert!(!id.is_unknown(), "stack {} unknown at {} entries", base, table.len());
        }
        assert_eq!(table.len(), 4096);
        assert!(table.intern(&[1, 2, 3]).is_unknown());
    }

    #[test]
    fn deep_stacks_are_truncated() {
        let table = StackTable::with_depth(8, 4).unwrap();
        let id = table.intern(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(table.frames(id), Some(vec![1, 2, 3, 4]));
        assert_eq!(table.intern(&[1, 2, 3, 4, 9]), id);
    }

    #[test]
    fn concurrent_interning_agrees() {
        let table = StackTable::new(256).unwrap();
        let ids: Vec<Vec<StackId>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let table = &table;
                    s.spawn(move || {
                        (0..64u64)
                            .map(|i| table.intern(&[i, i + 1]))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for other in &ids[1..] {
            assert_eq!(other, &ids[0]);
        }
        assert_eq!(table.len(), 64);
    }
}
