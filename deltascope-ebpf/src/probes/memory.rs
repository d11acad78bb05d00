//! Outstanding kernel allocations. `kmalloc` adds the allocated bytes to
//! the allocating stack; `kfree` of the same pointer takes them back out.

use aya_ebpf::{macros::tracepoint, programs::TracePointContext};
use deltascope_common::{DropKind, ProbeKind};

use crate::engine::{
    Completion, accumulate, admits, begin, current_comm, current_cpu, current_task, end, now_ns,
    observe_comm, pair_key, record_drop, retract, subject_key,
};

// kmem/kmalloc: call_site, ptr, bytes_req, bytes_alloc
// kmem/kfree: call_site, ptr
const PTR: usize = 16;
const BYTES_ALLOC: usize = 32;

#[tracepoint]
pub fn kmalloc(ctx: TracePointContext) -> u32 {
    match try_kmalloc(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn kfree(ctx: TracePointContext) -> u32 {
    match try_kfree(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[inline(always)]
fn try_kmalloc(ctx: &TracePointContext) -> Result<u32, u32> {
    let task = current_task();
    if !admits(task.pid) {
        return Ok(0);
    }
    let ptr: u64 = unsafe { ctx.read_at(PTR).map_err(|_| 1u32)? };
    if ptr == 0 {
        return Ok(0);
    }
    let bytes: u64 = unsafe { ctx.read_at(BYTES_ALLOC).map_err(|_| 1u32)? };

    observe_comm(task.pid, &current_comm());
    let agg = subject_key(ctx, ProbeKind::MemAlloc, task.pid);
    if begin(&pair_key(ProbeKind::MemAlloc, 0, 0, ptr), bytes, agg) {
        accumulate(&agg, bytes);
    }
    Ok(0)
}

#[inline(always)]
fn try_kfree(ctx: &TracePointContext) -> Result<u32, u32> {
    let ptr: u64 = unsafe { ctx.read_at(PTR).map_err(|_| 1u32)? };
    if ptr == 0 {
        return Ok(0);
    }
    let task = current_task();
    let Some(start) = end(&pair_key(ProbeKind::MemAlloc, 0, 0, ptr)) else {
        if admits(task.pid) {
            record_drop(DropKind::CorrelationMiss);
        }
        return Ok(0);
    };
    retract(&start.agg, start.payload);
    Completion {
        kind: ProbeKind::MemAlloc,
        task,
        cpu: current_cpu(),
        start,
        end_ns: now_ns(),
        addr: ptr,
        extra: start.payload,
        comm: current_comm(),
    }
    .emit();
    Ok(0)
}
