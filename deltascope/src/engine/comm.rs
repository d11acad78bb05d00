use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use deltascope_common::TASK_COMM_LEN;
use log::debug;
use serde::{Serialize, Serializer};

use super::slots::{Claim, SlotTable};
use super::{EngineError, require_capacity};

/// Kernel task name: up to 15 bytes, NUL padded.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Comm([u8; TASK_COMM_LEN]);

impl Comm {
    pub fn new(name: &str) -> Self {
        let mut bytes = [0u8; TASK_COMM_LEN];
        let src = name.as_bytes();
        let len = src.len().min(TASK_COMM_LEN - 1);
        bytes[..len].copy_from_slice(&src[..len]);
        Comm(bytes)
    }

    pub fn from_bytes(bytes: [u8; TASK_COMM_LEN]) -> Self {
        Comm(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TASK_COMM_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(TASK_COMM_LEN);
        match std::str::from_utf8(&self.0[..end]) {
            Ok(s) => s,
            // A truncated multi-byte character; keep the valid prefix.
            Err(e) => std::str::from_utf8(&self.0[..e.valid_up_to()]).unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }

    fn to_words(self) -> [u64; 2] {
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&self.0[..8]);
        hi.copy_from_slice(&self.0[8..]);
        [u64::from_le_bytes(lo), u64::from_le_bytes(hi)]
    }

    fn from_words(words: [u64; 2]) -> Self {
        let mut bytes = [0u8; TASK_COMM_LEN];
        bytes[..8].copy_from_slice(&words[0].to_le_bytes());
        bytes[8..].copy_from_slice(&words[1].to_le_bytes());
        Comm(bytes)
    }
}

impl fmt::Display for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Comm({:?})", self.as_str())
    }
}

impl Serialize for Comm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Where `resolve_name` looks up labels the probes never observed.
pub trait CommSource: Send + Sync {
    fn comm(&self, pid: u32) -> Option<Comm>;
}

/// Reads `/proc/<pid>/stat`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsComm;

impl CommSource for ProcfsComm {
    fn comm(&self, pid: u32) -> Option<Comm> {
        let process = procfs::process::Process::new(pid as i32).ok()?;
        match process.stat() {
            Ok(stat) => Some(Comm::new(&stat.comm)),
            Err(e) => {
                debug!("comm lookup for pid {} failed: {}", pid, e);
                None
            }
        }
    }
}

#[derive(Default)]
struct CommCell([AtomicU64; 2]);

impl CommCell {
    fn store(&self, comm: Comm) {
        let words = comm.to_words();
        self.0[0].store(words[0], Ordering::Relaxed);
        self.0[1].store(words[1], Ordering::Relaxed);
    }

    fn load(&self) -> Comm {
        Comm::from_words([
            self.0[0].load(Ordering::Relaxed),
            self.0[1].load(Ordering::Relaxed),
        ])
    }
}

/// pid to label, fixed at first sight.
///
/// There is no update path: a renamed process or a reused pid keeps the
/// label captured first until the cache is dropped.
pub struct CommCache {
    slots: SlotTable<u32, CommCell>,
    source: Box<dyn CommSource>,
}

impl CommCache {
    pub fn new(capacity: usize) -> Result<Self, EngineError> {
        Self::with_source(capacity, ProcfsComm)
    }

    pub fn with_source<S>(capacity: usize, source: S) -> Result<Self, EngineError>
    where
        S: CommSource + 'static,
    {
        require_capacity("comm cache", capacity)?;
        Ok(Self {
            slots: SlotTable::with_capacity(capacity),
            source: Box::new(source),
        })
    }

    /// Records `comm` for `pid` unless a label is already cached, and returns
    /// the cached label. With a full cache the observed label is returned
    /// without being stored.
    pub fn observe(&self, pid: u32, comm: Comm) -> Comm {
        self.try_observe(pid, comm).unwrap_or(comm)
    }

    /// Like `observe`, but `None` when the cache is full and `pid` has no
    /// label yet.
    pub fn try_observe(&self, pid: u32, comm: Comm) -> Option<Comm> {
        match self.slots.get_or_insert_with(&pid, |cell| cell.store(comm))? {
            Claim::Found(cell) => Some(cell.load()),
            Claim::Inserted(_) => Some(comm),
        }
    }

    pub fn lookup(&self, pid: u32) -> Option<Comm> {
        self.slots.get(&pid).map(CommCell::load)
    }

    /// Cached label for `pid`, asking the source on first sight. A failed
    /// source lookup is not cached, so a later call may still succeed.
    pub fn resolve_name(&self, pid: u32) -> Option<Comm> {
        if let Some(comm) = self.lookup(pid) {
            return Some(comm);
        }
        let comm = self.source.comm(pid)?;
        Some(self.observe(pid, comm))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Source whose answers can be changed between calls.
    #[derive(Clone, Default)]
    struct FakeSource(Arc<Mutex<HashMap<u32, String>>>);

    impl FakeSource {
        fn rename(&self, pid: u32, name: &str) {
            self.0.lock().unwrap().insert(pid, name.to_string());
        }
    }

    impl CommSource for FakeSource {
        fn comm(&self, pid: u32) -> Option<Comm> {
            self.0.lock().unwrap().get(&pid).map(|n| Comm::new(n))
        }
    }

    #[test]
    fn comm_truncates_to_fifteen_bytes() {
        let comm = Comm::new("a-very-long-process-name");
        assert_eq!(comm.as_str(), "a-very-long-pro");
        assert_eq!(comm.as_bytes()[15], 0);
        assert_eq!(Comm::new("").as_str(), "");
        assert!(Comm::new("").is_empty());
    }

    #[test]
    fn comm_drops_a_split_character() {
        // 14 ASCII bytes then a 2-byte character cut in half at byte 15.
        let comm = Comm::new("abcdefghijklmné");
        assert_eq!(comm.as_str(), "abcdefghijklmn");
    }

    #[test]
    fn resolve_name_is_idempotent_across_renames() {
        let source = FakeSource::default();
        source.rename(100, "nginx");
        let cache = CommCache::with_source(16, source.clone()).unwrap();

        assert_eq!(cache.resolve_name(100).unwrap().as_str(), "nginx");
        source.rename(100, "nginx-worker");
        assert_eq!(cache.resolve_name(100).unwrap().as_str(), "nginx");
        assert_eq!(cache.resolve_name(100).unwrap().as_str(), "nginx");
    }

    #[test]
    fn first_observation_wins() {
        let cache = CommCache::with_source(16, FakeSource::default()).unwrap();
        assert_eq!(cache.observe(7, Comm::new("bash")).as_str(), "bash");
        assert_eq!(cache.observe(7, Comm::new("vim")).as_str(), "bash");
        assert_eq!(cache.lookup(7).unwrap().as_str(), "bash");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_lookup_is_retried() {
        let source = FakeSource::default();
        let cache = CommCache::with_source(16, source.clone()).unwrap();
        assert!(cache.resolve_name(55).is_none());
        assert!(cache.is_empty());
        source.rename(55, "late");
        assert_eq!(cache.resolve_name(55).unwrap().as_str(), "late");
    }

    #[test]
    fn racing_first_writers_agree() {
        let cache = CommCache::with_source(64, FakeSource::default()).unwrap();
        let names = ["alpha", "beta", "gamma", "delta"];
        let seen: Vec<Comm> = std::thread::scope(|s| {
            let handles: Vec<_> = names
                .iter()
                .map(|name| {
                    let cache = &cache;
                    s.spawn(move || cache.observe(9, Comm::new(name)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let cached = cache.lookup(9).unwrap();
        assert!(names.contains(&cached.as_str()));
        // Every later observation agrees with the cached label; the racing
        // writers themselves may each have seen their own label.
        assert_eq!(cache.observe(9, Comm::new("omega")), cached);
        assert!(seen.iter().all(|c| names.contains(&c.as_str())));
    }

    #[test]
    fn procfs_resolves_this_process() {
        let comm = ProcfsComm.comm(std::process::id()).unwrap();
        assert!(!comm.is_empty());
    }
}
