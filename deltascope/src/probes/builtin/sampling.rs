use anyhow::Result;
use aya::Ebpf;
use deltascope_common::ProbeKind;

use crate::probes::{Probe, attach_cpu_sampler};

/// Periodic on-CPU samples, counted per task and stack.
pub struct OnCpuProbe {
    pub frequency_hz: u64,
}

impl Probe for OnCpuProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::OnCpu
    }

    fn attach(&self, bpf: &mut Ebpf) -> Result<bool> {
        attach_cpu_sampler(bpf, "on_cpu_sample", self.frequency_hz)
    }
}
