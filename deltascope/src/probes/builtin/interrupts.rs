use anyhow::Result;
use aya::Ebpf;
use deltascope_common::ProbeKind;

use crate::probes::{Probe, TracepointConfig, attach_tracepoints};

/// Softirq handler time per vector.
pub struct SoftIrqProbe;

impl Probe for SoftIrqProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::SoftIrq
    }

    fn attach(&self, bpf: &mut Ebpf) -> Result<bool> {
        attach_tracepoints(
            bpf,
            &[
                TracepointConfig {
                    program_name: "softirq_entry",
                    category: "irq",
                    name: "softirq_entry",
                },
                TracepointConfig {
                    program_name: "softirq_exit",
                    category: "irq",
                    name: "softirq_exit",
                },
            ],
        )
    }
}

/// Hard interrupt handler time per irq line.
pub struct HardIrqProbe;

impl Probe for HardIrqProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::HardIrq
    }

    fn attach(&self, bpf: &mut Ebpf) -> Result<bool> {
        attach_tracepoints(
            bpf,
            &[
                TracepointConfig {
                    program_name: "irq_handler_entry",
                    category: "irq",
                    name: "irq_handler_entry",
                },
                TracepointConfig {
                    program_name: "irq_handler_exit",
                    category: "irq",
                    name: "irq_handler_exit",
                },
            ],
        )
    }
}
