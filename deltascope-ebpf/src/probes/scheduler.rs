//! Scheduler probes: time inside `schedule()`, idle residency per CPU and
//! off-CPU time attributed to the stack a task blocked in.

use aya_ebpf::{
    macros::{kprobe, kretprobe, tracepoint},
    programs::{ProbeContext, RetProbeContext, TracePointContext},
};
use deltascope_common::{AggKey, DropKind, ProbeKind, TASK_COMM_LEN};

use crate::engine::{
    Completion, Task, accumulate, admits, begin, current_comm, current_cpu, current_task, end,
    now_ns, observe_comm, pair_key, record_drop, subject_key,
};

/// `power/cpu_idle` state meaning the CPU left idle.
const PWR_EVENT_EXIT: u32 = u32::MAX;

// sched/sched_switch
const PREV_COMM: usize = 8;
const PREV_PID: usize = 24;
const NEXT_COMM: usize = 40;
const NEXT_PID: usize = 56;

// power/cpu_idle
const IDLE_STATE: usize = 8;
const IDLE_CPU: usize = 12;

#[kprobe]
pub fn schedule_entry(_ctx: ProbeContext) -> u32 {
    let task = current_task();
    if !admits(task.pid) {
        return 0;
    }
    observe_comm(task.pid, &current_comm());
    begin(
        &pair_key(ProbeKind::SchedDelay, task.tid, 0, 0),
        0,
        AggKey::default(),
    );
    0
}

#[kretprobe]
pub fn schedule_exit(_ctx: RetProbeContext) -> u32 {
    let task = current_task();
    let Some(start) = end(&pair_key(ProbeKind::SchedDelay, task.tid, 0, 0)) else {
        if admits(task.pid) {
            record_drop(DropKind::CorrelationMiss);
        }
        return 0;
    };
    let done = Completion {
        kind: ProbeKind::SchedDelay,
        task,
        cpu: current_cpu(),
        start,
        end_ns: now_ns(),
        addr: 0,
        extra: 0,
        comm: current_comm(),
    };
    accumulate(&AggKey::subject(ProbeKind::SchedDelay, task.pid), done.delta_ns());
    done.emit();
    0
}

#[tracepoint]
pub fn cpu_idle(ctx: TracePointContext) -> u32 {
    match try_cpu_idle(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[inline(always)]
fn try_cpu_idle(ctx: &TracePointContext) -> Result<u32, u32> {
    let state: u32 = unsafe { ctx.read_at(IDLE_STATE).map_err(|_| 1u32)? };
    let cpu: u32 = unsafe { ctx.read_at(IDLE_CPU).map_err(|_| 1u32)? };
    let task = current_task();
    // Every CPU runs its own idle task under pid 0.
    let key = pair_key(ProbeKind::CpuIdle, task.tid, cpu, 0);

    if state != PWR_EVENT_EXIT {
        begin(&key, 0, AggKey::default());
        return Ok(0);
    }
    let Some(start) = end(&key) else {
        record_drop(DropKind::CorrelationMiss);
        return Ok(0);
    };
    let done = Completion {
        kind: ProbeKind::CpuIdle,
        task,
        cpu,
        start,
        end_ns: now_ns(),
        addr: 0,
        extra: 0,
        comm: current_comm(),
    };
    accumulate(&AggKey::subject(ProbeKind::CpuIdle, task.pid), done.delta_ns());
    done.emit();
    Ok(0)
}

#[tracepoint]
pub fn sched_switch_offcpu(ctx: TracePointContext) -> u32 {
    match try_sched_switch(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[inline(always)]
fn try_sched_switch(ctx: &TracePointContext) -> Result<u32, u32> {
    let prev_tid: i32 = unsafe { ctx.read_at(PREV_PID).map_err(|_| 1u32)? };
    let next_tid: i32 = unsafe { ctx.read_at(NEXT_PID).map_err(|_| 1u32)? };

    // The tracepoint runs in the outgoing task, so its stacks are the ones
    // it is blocking in.
    let prev = current_task();
    if prev_tid != 0 && admits(prev.pid) {
        let prev_comm: [u8; TASK_COMM_LEN] =
            unsafe { ctx.read_at(PREV_COMM).map_err(|_| 1u32)? };
        observe_comm(prev.pid, &prev_comm);
        let agg = subject_key(ctx, ProbeKind::OffCpu, prev.pid);
        begin(
            &pair_key(ProbeKind::OffCpu, prev_tid as u32, 0, 0),
            0,
            agg,
        );
    }

    if next_tid == 0 {
        return Ok(0);
    }
    // Tasks that blocked before attach, or were filtered out, have no start
    // record; the incoming task's process id is not known here, so those
    // are not counted as misses.
    let Some(start) = end(&pair_key(ProbeKind::OffCpu, next_tid as u32, 0, 0)) else {
        return Ok(0);
    };
    let next_comm: [u8; TASK_COMM_LEN] = unsafe { ctx.read_at(NEXT_COMM).map_err(|_| 1u32)? };
    let done = Completion {
        kind: ProbeKind::OffCpu,
        task: Task {
            pid: start.agg.pid,
            tid: next_tid as u32,
        },
        cpu: current_cpu(),
        start,
        end_ns: now_ns(),
        addr: 0,
        extra: 0,
        comm: next_comm,
    };
    accumulate(&start.agg, done.delta_ns());
    done.emit();
    Ok(0)
}
