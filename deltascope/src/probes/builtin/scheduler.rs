use anyhow::Result;
use aya::Ebpf;
use deltascope_common::ProbeKind;

use crate::probes::{Probe, TracepointConfig, attach_kprobe_pair, attach_tracepoint};

/// Time spent inside `schedule()`, per task.
pub struct SchedDelayProbe;

impl Probe for SchedDelayProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::SchedDelay
    }

    fn attach(&self, bpf: &mut Ebpf) -> Result<bool> {
        attach_kprobe_pair(bpf, "schedule_entry", "schedule_exit", "schedule")
    }
}

/// Idle residency per CPU. One tracepoint carries both edges.
pub struct CpuIdleProbe;

impl Probe for CpuIdleProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::CpuIdle
    }

    fn attach(&self, bpf: &mut Ebpf) -> Result<bool> {
        attach_tracepoint(
            bpf,
            TracepointConfig {
                program_name: "cpu_idle",
                category: "power",
                name: "cpu_idle",
            },
        )
    }
}

/// Off-CPU time with the stacks the task blocked in.
pub struct OffCpuProbe;

impl Probe for OffCpuProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::OffCpu
    }

    fn attach(&self, bpf: &mut Ebpf) -> Result<bool> {
        attach_tracepoint(
            bpf,
            TracepointConfig {
                program_name: "sched_switch_offcpu",
                category: "sched",
                name: "sched_switch",
            },
        )
    }
}
