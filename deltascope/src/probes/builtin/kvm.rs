use anyhow::Result;
use aya::Ebpf;
use deltascope_common::ProbeKind;

use crate::probes::{Probe, TracepointConfig, attach_kprobe_pair, attach_tracepoints};

/// Guest page-fault handling latency and per-address retry counts. Needs
/// the kvm module loaded.
pub struct KvmPageFaultProbe;

impl Probe for KvmPageFaultProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::KvmPageFault
    }

    fn attach(&self, bpf: &mut Ebpf) -> Result<bool> {
        attach_kprobe_pair(
            bpf,
            "kvm_page_fault_entry",
            "kvm_page_fault_exit",
            "kvm_mmu_page_fault",
        )
    }
}

/// Host time per VM exit, from `kvm_exit` to the vCPU's next `kvm_entry`,
/// aggregated per exit reason.
pub struct KvmExitProbe;

impl Probe for KvmExitProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::KvmExit
    }

    fn attach(&self, bpf: &mut Ebpf) -> Result<bool> {
        attach_tracepoints(
            bpf,
            &[
                TracepointConfig {
                    program_name: "kvm_exit",
                    category: "kvm",
                    name: "kvm_exit",
                },
                TracepointConfig {
                    program_name: "kvm_entry",
                    category: "kvm",
                    name: "kvm_entry",
                },
            ],
        )
    }
}
