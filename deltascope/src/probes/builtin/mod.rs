pub mod interrupts;
pub mod kvm;
pub mod memory;
pub mod sampling;
pub mod scheduler;

pub use interrupts::{HardIrqProbe, SoftIrqProbe};
pub use kvm::{KvmExitProbe, KvmPageFaultProbe};
pub use memory::MemAllocProbe;
pub use sampling::OnCpuProbe;
pub use scheduler::{CpuIdleProbe, OffCpuProbe, SchedDelayProbe};

use deltascope_common::ProbeKind;

use crate::probes::Probe;
use crate::settings::Settings;

/// Kernel probe for `kind`, if the object carries programs for it.
pub fn for_kind(kind: ProbeKind, settings: &Settings) -> Option<Box<dyn Probe>> {
    let probe: Box<dyn Probe> = match kind {
        ProbeKind::SchedDelay => Box::new(SchedDelayProbe),
        ProbeKind::SoftIrq => Box::new(SoftIrqProbe),
        ProbeKind::HardIrq => Box::new(HardIrqProbe),
        ProbeKind::CpuIdle => Box::new(CpuIdleProbe),
        ProbeKind::OffCpu => Box::new(OffCpuProbe),
        ProbeKind::KvmPageFault => Box::new(KvmPageFaultProbe),
        ProbeKind::MemAlloc => Box::new(MemAllocProbe),
        ProbeKind::KvmExit => Box::new(KvmExitProbe),
        ProbeKind::OnCpu => Box::new(OnCpuProbe {
            frequency_hz: settings.sample_frequency_hz(),
        }),
        ProbeKind::Readahead => return None,
    };
    Some(probe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kernel_probe_reports_its_kind() {
        for kind in ProbeKind::ALL {
            match for_kind(kind, &Settings::default()) {
                Some(probe) => assert_eq!(probe.kind(), kind),
                None => assert_eq!(kind, ProbeKind::Readahead),
            }
        }
    }
}
