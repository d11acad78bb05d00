#![cfg_attr(not(test), no_std)]

//! Record and key layouts shared by the kernel programs and userspace.
//!
//! Every struct here is `repr(C)` without implicit padding so the same bytes
//! can be read out of BPF maps and ring buffers with `aya::Pod`.

pub const TASK_COMM_LEN: usize = 16;
pub const MAX_STACK_DEPTH: usize = 127;

pub const MAX_STARTS: u32 = 10240;
pub const MAX_AGGREGATES: u32 = 10240;
pub const MAX_STACKS: u32 = 16384;
pub const MAX_COMMS: u32 = 8192;
pub const EVENT_RING_BYTES: u32 = 256 * 1024;

/// Stack component disabled by configuration.
pub const NO_STACK: i32 = -1;
/// Stack capture failed or the stack table was full.
pub const STACK_UNKNOWN: i32 = -2;

/// `TARGET_PID` value that accepts every non-idle subject.
pub const SUBJECT_ALL: i32 = -1;
/// `TARGET_PID` value that accepts nothing.
pub const SUBJECT_NONE: i32 = -2;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProbeKind {
    SchedDelay = 0,
    SoftIrq = 1,
    HardIrq = 2,
    CpuIdle = 3,
    OffCpu = 4,
    Readahead = 5,
    KvmPageFault = 6,
    MemAlloc = 7,
    /// VM exit to the next VM entry on the same vCPU thread, per exit reason.
    KvmExit = 8,
    /// Periodic samples of the running task, counted per stack.
    OnCpu = 9,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 10] = [
        ProbeKind::SchedDelay,
        ProbeKind::SoftIrq,
        ProbeKind::HardIrq,
        ProbeKind::CpuIdle,
        ProbeKind::OffCpu,
        ProbeKind::Readahead,
        ProbeKind::KvmPageFault,
        ProbeKind::MemAlloc,
        ProbeKind::KvmExit,
        ProbeKind::OnCpu,
    ];

    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(ProbeKind::SchedDelay),
            1 => Some(ProbeKind::SoftIrq),
            2 => Some(ProbeKind::HardIrq),
            3 => Some(ProbeKind::CpuIdle),
            4 => Some(ProbeKind::OffCpu),
            5 => Some(ProbeKind::Readahead),
            6 => Some(ProbeKind::KvmPageFault),
            7 => Some(ProbeKind::MemAlloc),
            8 => Some(ProbeKind::KvmExit),
            9 => Some(ProbeKind::OnCpu),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }

    /// Kinds whose aggregates are keyed by `AggKey::addr` rather than pid.
    pub const fn attributes_address(self) -> bool {
        matches!(
            self,
            ProbeKind::SoftIrq | ProbeKind::HardIrq | ProbeKind::KvmPageFault | ProbeKind::KvmExit
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            ProbeKind::SchedDelay => "sched_delay",
            ProbeKind::SoftIrq => "softirq",
            ProbeKind::HardIrq => "hardirq",
            ProbeKind::CpuIdle => "cpu_idle",
            ProbeKind::OffCpu => "offcpu",
            ProbeKind::Readahead => "readahead",
            ProbeKind::KvmPageFault => "kvm_page_fault",
            ProbeKind::MemAlloc => "mem_alloc",
            ProbeKind::KvmExit => "kvm_exit",
            ProbeKind::OnCpu => "on_cpu",
        }
    }
}

/// Reasons a sample was lost. Indexes the per-CPU `DROPS` array.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropKind {
    CorrelationMiss = 0,
    StartRejected = 1,
    AggregateRejected = 2,
    StreamDropped = 3,
    StackUnknown = 4,
    /// A task label could not be stored because the label table was full.
    CommRejected = 5,
}

pub const DROP_KINDS: usize = 6;

impl DropKind {
    pub const ALL: [DropKind; DROP_KINDS] = [
        DropKind::CorrelationMiss,
        DropKind::StartRejected,
        DropKind::AggregateRejected,
        DropKind::StreamDropped,
        DropKind::StackUnknown,
        DropKind::CommRejected,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            DropKind::CorrelationMiss => "correlation_miss",
            DropKind::StartRejected => "start_rejected",
            DropKind::AggregateRejected => "aggregate_rejected",
            DropKind::StreamDropped => "stream_dropped",
            DropKind::StackUnknown => "stack_unknown",
            DropKind::CommRejected => "comm_rejected",
        }
    }
}

/// Key of an in-flight operation in the kernel `STARTS` map.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PairKey {
    pub kind: u32,
    pub subject: u32,
    pub cpu: u32,
    pub _pad: u32,
    pub resource: u64,
}

/// Attribution key of the kernel `AGGREGATES` map.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AggKey {
    pub kind: u32,
    pub pid: u32,
    pub usid: i32,
    pub ksid: i32,
    pub addr: u64,
}

impl AggKey {
    pub const fn subject(kind: ProbeKind, pid: u32) -> Self {
        Self {
            kind: kind as u32,
            pid,
            usid: NO_STACK,
            ksid: NO_STACK,
            addr: 0,
        }
    }

    pub const fn address(kind: ProbeKind, addr: u64) -> Self {
        Self {
            kind: kind as u32,
            pid: 0,
            usid: NO_STACK,
            ksid: NO_STACK,
            addr,
        }
    }
}

/// Start record: entry timestamp, one word of entry context and the
/// attribution key when it has to be captured at entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartValue {
    pub timestamp: u64,
    pub payload: u64,
    pub agg: AggKey,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggValue {
    pub count: u64,
    pub total: u64,
    pub min: u64,
    pub max: u64,
}

impl AggValue {
    pub const fn first(delta: u64) -> Self {
        Self {
            count: 1,
            total: delta,
            min: delta,
            max: delta,
        }
    }
}

/// One completed measurement as carried by the event stream.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeltaEvent {
    pub kind: u32,
    pub pid: u32,
    pub tid: u32,
    pub cpu: u32,
    pub start_ns: u64,
    pub end_ns: u64,
    pub delta_ns: u64,
    pub addr: u64,
    pub extra: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for PairKey {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for AggKey {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for StartValue {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for AggValue {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for DeltaEvent {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn layouts_have_no_padding() {
        assert_eq!(size_of::<PairKey>(), 24);
        assert_eq!(size_of::<AggKey>(), 24);
        assert_eq!(size_of::<StartValue>(), 40);
        assert_eq!(size_of::<AggValue>(), 32);
        assert_eq!(size_of::<DeltaEvent>(), 72);
    }

    #[test]
    fn probe_kind_round_trips_through_u32() {
        for kind in ProbeKind::ALL {
            assert_eq!(ProbeKind::from_u32(kind as u32), Some(kind));
        }
        assert_eq!(ProbeKind::from_u32(99), None);
    }

    #[test]
    fn probe_kind_parses_from_name() {
        for kind in ProbeKind::ALL {
            assert_eq!(ProbeKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ProbeKind::from_name("SOFTIRQ"), Some(ProbeKind::SoftIrq));
        assert_eq!(ProbeKind::from_name("nope"), None);
    }
}
