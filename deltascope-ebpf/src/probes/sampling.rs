//! On-CPU sampling. A software clock event fires on every CPU at the
//! configured frequency and each sample counts against the running task
//! and the stacks it was running in.

use aya_ebpf::{macros::perf_event, programs::PerfEventContext};
use deltascope_common::ProbeKind;

use crate::engine::{
    accumulate, admits, current_comm, current_task, observe_comm, sample_period_ns, subject_key,
};

#[perf_event]
pub fn on_cpu_sample(ctx: PerfEventContext) -> u32 {
    let task = current_task();
    // Samples that land in the idle task say nothing about work.
    if task.tid == 0 || !admits(task.pid) {
        return 0;
    }
    observe_comm(task.pid, &current_comm());
    let key = subject_key(&ctx, ProbeKind::OnCpu, task.pid);
    accumulate(&key, sample_period_ns());
    0
}
