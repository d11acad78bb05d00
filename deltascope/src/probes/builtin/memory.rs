use anyhow::Result;
use aya::Ebpf;
use deltascope_common::ProbeKind;

use crate::probes::{Probe, TracepointConfig, attach_tracepoints};

/// Kernel allocations that have not been freed yet, per allocating stack.
pub struct MemAllocProbe;

impl Probe for MemAllocProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::MemAlloc
    }

    fn attach(&self, bpf: &mut Ebpf) -> Result<bool> {
        attach_tracepoints(
            bpf,
            &[
                TracepointConfig {
                    program_name: "kmalloc",
                    category: "kmem",
                    name: "kmalloc",
                },
                TracepointConfig {
                    program_name: "kfree",
                    category: "kmem",
                    name: "kfree",
                },
            ],
        )
    }
}
