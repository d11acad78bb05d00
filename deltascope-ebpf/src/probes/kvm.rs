//! KVM probes: guest page faults handled by the MMU, and the time each VM
//! exit spends in the host.
//!
//! `kvm_mmu_page_fault(vcpu, cr2_or_gpa, error_code, insn, insn_len)` runs
//! on the vCPU thread, so entry and return pair per thread. The fault
//! address is captured at entry and keys the retry counter.
//!
//! `kvm/kvm_exit` and the following `kvm/kvm_entry` also fire on the vCPU
//! thread. The exit reason is only known at the exit, so it travels with
//! the start record.

use aya_ebpf::{
    macros::{kprobe, kretprobe, tracepoint},
    programs::{ProbeContext, RetProbeContext, TracePointContext},
};
use aya_log_ebpf::debug;
use deltascope_common::{AggKey, DropKind, ProbeKind};

use crate::engine::{
    Completion, accumulate, admits, begin, count_capped, current_comm, current_cpu, current_task,
    end, now_ns, observe_comm, pair_key, record_drop,
};

// kvm/kvm_exit
const EXIT_REASON: usize = 8;

/// Guest addresses get reused; past this the counter only says the VM is old.
const FAULT_RETRY_CAP: u64 = 1024;

#[kprobe]
pub fn kvm_page_fault_entry(ctx: ProbeContext) -> u32 {
    match try_fault_entry(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[kretprobe]
pub fn kvm_page_fault_exit(_ctx: RetProbeContext) -> u32 {
    let task = current_task();
    let Some(start) = end(&pair_key(ProbeKind::KvmPageFault, task.tid, 0, 0)) else {
        if admits(task.pid) {
            record_drop(DropKind::CorrelationMiss);
        }
        return 0;
    };
    let Some(retries) = count_capped(&start.agg, FAULT_RETRY_CAP) else {
        return 0;
    };
    Completion {
        kind: ProbeKind::KvmPageFault,
        task,
        cpu: current_cpu(),
        start,
        end_ns: now_ns(),
        addr: start.payload,
        extra: retries,
        comm: current_comm(),
    }
    .emit();
    0
}

#[inline(always)]
fn try_fault_entry(ctx: &ProbeContext) -> Result<u32, u32> {
    let task = current_task();
    if !admits(task.pid) {
        return Ok(0);
    }
    let Some(addr) = ctx.arg::<u64>(1) else {
        debug!(ctx, "kvm_mmu_page_fault: fault address unreadable");
        return Err(1);
    };
    observe_comm(task.pid, &current_comm());
    begin(
        &pair_key(ProbeKind::KvmPageFault, task.tid, 0, 0),
        addr,
        AggKey::address(ProbeKind::KvmPageFault, addr),
    );
    Ok(0)
}

#[tracepoint]
pub fn kvm_exit(ctx: TracePointContext) -> u32 {
    match try_kvm_exit(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[inline(always)]
fn try_kvm_exit(ctx: &TracePointContext) -> Result<u32, u32> {
    let task = current_task();
    if !admits(task.pid) {
        return Ok(0);
    }
    let reason: u32 = unsafe { ctx.read_at(EXIT_REASON).map_err(|_| 1u32)? };
    observe_comm(task.pid, &current_comm());
    begin(
        &pair_key(ProbeKind::KvmExit, task.tid, 0, 0),
        reason as u64,
        AggKey::address(ProbeKind::KvmExit, reason as u64),
    );
    Ok(0)
}

#[tracepoint]
pub fn kvm_entry(_ctx: TracePointContext) -> u32 {
    let task = current_task();
    let Some(start) = end(&pair_key(ProbeKind::KvmExit, task.tid, 0, 0)) else {
        if admits(task.pid) {
            record_drop(DropKind::CorrelationMiss);
        }
        return 0;
    };
    let done = Completion {
        kind: ProbeKind::KvmExit,
        task,
        cpu: current_cpu(),
        start,
        end_ns: now_ns(),
        addr: start.payload,
        extra: 0,
        comm: current_comm(),
    };
    accumulate(&start.agg, done.delta_ns());
    done.emit();
    0
}
