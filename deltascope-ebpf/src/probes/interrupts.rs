//! Interrupt handler time. Interrupts nest, so pairs are kept per CPU and
//! per vector or line; the delta is attributed to the vector or line.

use aya_ebpf::{macros::tracepoint, programs::TracePointContext};
use deltascope_common::{AggKey, DropKind, ProbeKind};

use crate::engine::{
    Completion, accumulate, begin, current_comm, current_cpu, current_task, end, now_ns, pair_key,
    record_drop,
};

// irq/softirq_entry|exit: unsigned int vec
// irq/irq_handler_entry|exit: int irq
const VECTOR: usize = 8;

#[tracepoint]
pub fn softirq_entry(ctx: TracePointContext) -> u32 {
    match try_enter(&ctx, ProbeKind::SoftIrq) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn softirq_exit(ctx: TracePointContext) -> u32 {
    match try_exit(&ctx, ProbeKind::SoftIrq) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn irq_handler_entry(ctx: TracePointContext) -> u32 {
    match try_enter(&ctx, ProbeKind::HardIrq) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn irq_handler_exit(ctx: TracePointContext) -> u32 {
    match try_exit(&ctx, ProbeKind::HardIrq) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[inline(always)]
fn vector(ctx: &TracePointContext) -> Result<u64, u32> {
    let raw: u32 = unsafe { ctx.read_at(VECTOR).map_err(|_| 1u32)? };
    Ok(raw as u64)
}

#[inline(always)]
fn try_enter(ctx: &TracePointContext, kind: ProbeKind) -> Result<u32, u32> {
    let vec = vector(ctx)?;
    begin(&pair_key(kind, 0, current_cpu(), vec), 0, AggKey::default());
    Ok(0)
}

#[inline(always)]
fn try_exit(ctx: &TracePointContext, kind: ProbeKind) -> Result<u32, u32> {
    let vec = vector(ctx)?;
    let cpu = current_cpu();
    let Some(start) = end(&pair_key(kind, 0, cpu, vec)) else {
        record_drop(DropKind::CorrelationMiss);
        return Ok(0);
    };
    let done = Completion {
        kind,
        task: current_task(),
        cpu,
        start,
        end_ns: now_ns(),
        addr: vec,
        extra: 0,
        comm: current_comm(),
    };
    accumulate(&AggKey::address(kind, vec), done.delta_ns());
    done.emit();
    Ok(0)
}
