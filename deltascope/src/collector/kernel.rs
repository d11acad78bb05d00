//! Sources backed by the kernel object's maps.

use std::mem::size_of;
use std::sync::Arc;

use anyhow::{Context, Result};
use aya::Ebpf;
use aya::maps::{HashMap, MapData, PerCpuArray, RingBuf};
use deltascope_common::{AggKey, AggValue, DeltaEvent, DropKind, ProbeKind, TASK_COMM_LEN};
use log::debug;

use super::{AggregateRow, AggregateSource, DropSource, EventSource};
use crate::engine::{AggregateStats, Comm, CommCache, DropCounts, Identity, ProbeSpec, Retention};

pub const EVENTS_MAP: &str = "EVENTS";
pub const AGGREGATES_MAP: &str = "AGGREGATES";
pub const COMMS_MAP: &str = "COMMS";
pub const DROPS_MAP: &str = "DROPS";

pub struct RingBufSource {
    ring: RingBuf<MapData>,
}

impl RingBufSource {
    pub fn new(bpf: &mut Ebpf) -> Result<Self> {
        let ring = RingBuf::try_from(
            bpf.take_map(EVENTS_MAP)
                .with_context(|| format!("Failed to find {} map", EVENTS_MAP))?,
        )?;
        Ok(Self { ring })
    }
}

impl EventSource for RingBufSource {
    fn name(&self) -> &str {
        EVENTS_MAP
    }

    fn poll_event(&mut self) -> Option<DeltaEvent> {
        loop {
            let item = self.ring.next()?;
            if item.len() >= size_of::<DeltaEvent>() {
                return Some(unsafe { (item.as_ptr() as *const DeltaEvent).read_unaligned() });
            }
            debug!("Skipping short ring buffer record of {} bytes", item.len());
        }
    }
}

impl From<AggValue> for AggregateStats {
    fn from(value: AggValue) -> Self {
        AggregateStats {
            count: value.count,
            cumulative: value.total,
            min: value.min,
            max: value.max,
        }
    }
}

/// Kernel entries holding running totals stay put; a deleted allocation
/// total would be recreated from zero by the next free.
fn resets_on_read(kind: ProbeKind) -> bool {
    ProbeSpec::for_kind(kind).fold.retention() == Retention::Interval
}

/// Every probe's aggregates share one kernel map, keyed by `AggKey`.
pub struct KernelAggregateSource {
    aggregates: HashMap<MapData, AggKey, AggValue>,
    comms: HashMap<MapData, u32, [u8; TASK_COMM_LEN]>,
    names: Arc<CommCache>,
}

impl KernelAggregateSource {
    pub fn new(bpf: &mut Ebpf, names: Arc<CommCache>) -> Result<Self> {
        let aggregates = HashMap::try_from(
            bpf.take_map(AGGREGATES_MAP)
                .with_context(|| format!("Failed to find {} map", AGGREGATES_MAP))?,
        )
        .with_context(|| format!("{} is not a HashMap", AGGREGATES_MAP))?;
        let comms = HashMap::try_from(
            bpf.take_map(COMMS_MAP)
                .with_context(|| format!("Failed to find {} map", COMMS_MAP))?,
        )
        .with_context(|| format!("{} is not a HashMap", COMMS_MAP))?;
        Ok(Self {
            aggregates,
            comms,
            names,
        })
    }

    /// Label captured in the kernel first, `/proc` second.
    fn comm(&self, pid: u32) -> Option<Comm> {
        if let Some(comm) = self.names.lookup(pid) {
            return Some(comm);
        }
        match self.comms.get(&pid, 0) {
            Ok(bytes) => Some(self.names.observe(pid, Comm::from_bytes(bytes))),
            Err(_) => self.names.resolve_name(pid),
        }
    }
}

impl AggregateSource for KernelAggregateSource {
    fn name(&self) -> &str {
        AGGREGATES_MAP
    }

    fn collect(&mut self, reset: bool) -> Result<Vec<AggregateRow>> {
        let mut rows = Vec::new();
        let mut drained = Vec::new();
        for entry in self.aggregates.iter() {
            // Keys the kernel inserts or deletes mid-walk can fail a lookup.
            let (key, value) = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping aggregate entry: {}", e);
                    continue;
                }
            };
            let Some(kind) = ProbeKind::from_u32(key.kind) else {
                continue;
            };
            let identity = Identity::from(key);
            rows.push(AggregateRow {
                probe: kind.name(),
                identity,
                comm: identity.pid().and_then(|pid| self.comm(pid)),
                stats: value.into(),
                expected: None,
            });
            if reset && resets_on_read(kind) {
                drained.push(key);
            }
        }
        for key in drained {
            if let Err(e) = self.aggregates.remove(&key) {
                debug!("Failed to reset aggregate entry: {}", e);
            }
        }
        rows.sort_by_key(|row| row.probe);
        Ok(rows)
    }
}

/// Per-CPU drop counters summed over every CPU.
pub struct KernelDropSource {
    drops: PerCpuArray<MapData, u64>,
}

impl KernelDropSource {
    pub fn new(bpf: &mut Ebpf) -> Result<Self> {
        let drops = PerCpuArray::try_from(
            bpf.take_map(DROPS_MAP)
                .with_context(|| format!("Failed to find {} map", DROPS_MAP))?,
        )
        .with_context(|| format!("{} is not a PerCpuArray", DROPS_MAP))?;
        Ok(Self { drops })
    }
}

impl DropSource for KernelDropSource {
    fn name(&self) -> &str {
        DROPS_MAP
    }

    fn totals(&mut self) -> Result<DropCounts> {
        let mut counts = DropCounts::default();
        for kind in DropKind::ALL {
            let per_cpu = self
                .drops
                .get(&(kind as u32), 0)
                .with_context(|| format!("Failed to read {} counter", kind.name()))?;
            counts.add(kind, per_cpu.iter().sum());
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_values_keep_field_meaning() {
        let stats = AggregateStats::from(AggValue {
            count: 3,
            total: 60,
            min: 10,
            max: 30,
        });
        assert_eq!(stats.cumulative, 60);
        assert_eq!(stats.average(), Some(20));
        assert_eq!(stats.min, 10);
    }

    #[test]
    fn test_running_totals_survive_reset() {
        assert!(resets_on_read(ProbeKind::SchedDelay));
        assert!(resets_on_read(ProbeKind::OffCpu));
        assert!(!resets_on_read(ProbeKind::MemAlloc));
        assert!(!resets_on_read(ProbeKind::KvmPageFault));
    }
}
