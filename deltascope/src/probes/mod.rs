use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    programs::{
        KProbe, PerfEvent, TracePoint,
        perf_event::{PerfEventScope, PerfTypeId, SamplePolicy, perf_sw_ids},
    },
    util::online_cpus,
};
use deltascope_common::ProbeKind;
use log::{info, warn};

use crate::settings::Settings;

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub mod builtin;

/// Kernel-side half of one probe kind.
pub trait Probe {
    fn kind(&self) -> ProbeKind;

    /// Loads and attaches the kind's programs. `Ok(false)` means the hook
    /// points do not exist on this kernel and the probe was skipped.
    fn attach(&self, bpf: &mut Ebpf) -> Result<bool>;
}

pub struct TracepointConfig<'a> {
    pub program_name: &'a str,
    pub category: &'a str,
    pub name: &'a str,
}

fn tracepoint_exists(category: &str, name: &str) -> bool {
    const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

    TRACEFS_MOUNT_POINTS.iter().any(|base| {
        Path::new(base)
            .join("events")
            .join(category)
            .join(name)
            .exists()
    })
}

pub fn attach_tracepoint(bpf: &mut Ebpf, config: TracepointConfig) -> Result<bool> {
    if !tracepoint_exists(config.category, config.name) {
        warn!(
            "Tracepoint {}:{} not available; skipping {}",
            config.category, config.name, config.program_name
        );
        return Ok(false);
    }

    info!("Loading program {}", config.program_name);
    let program: &mut TracePoint = bpf
        .program_mut(config.program_name)
        .with_context(|| format!("Failed to find {} program", config.program_name))?
        .try_into()?;
    program.load()?;
    program
        .attach(config.category, config.name)
        .with_context(|| format!("Failed to attach {}", config.name))?;
    Ok(true)
}

/// Attaches every tracepoint or none: a half-attached pair only produces
/// correlation misses.
pub fn attach_tracepoints(bpf: &mut Ebpf, configs: &[TracepointConfig]) -> Result<bool> {
    if let Some(missing) = configs
        .iter()
        .find(|c| !tracepoint_exists(c.category, c.name))
    {
        warn!(
            "Tracepoint {}:{} not available; skipping {}",
            missing.category, missing.name, missing.program_name
        );
        return Ok(false);
    }
    for config in configs {
        attach_tracepoint(
            bpf,
            TracepointConfig {
                program_name: config.program_name,
                category: config.category,
                name: config.name,
            },
        )?;
    }
    Ok(true)
}

fn kernel_symbol_exists(symbol: &str) -> bool {
    match std::fs::read_to_string("/proc/kallsyms") {
        Ok(symbols) => symbols
            .lines()
            .any(|line| line.split_whitespace().nth(2) == Some(symbol)),
        // Without kallsyms let the attach itself decide.
        Err(_) => true,
    }
}

/// Entry kprobe and return kprobe on the same kernel function.
pub fn attach_kprobe_pair(
    bpf: &mut Ebpf,
    entry_name: &str,
    exit_name: &str,
    target_fn: &str,
) -> Result<bool> {
    if !kernel_symbol_exists(target_fn) {
        warn!("Kernel function {} not found; skipping {}", target_fn, entry_name);
        return Ok(false);
    }

    for program_name in [entry_name, exit_name] {
        let program: &mut KProbe = bpf
            .program_mut(program_name)
            .with_context(|| format!("Failed to find {} program", program_name))?
            .try_into()?;
        program.load()?;
        program
            .attach(target_fn, 0)
            .with_context(|| format!("Failed to attach {} to {}", program_name, target_fn))?;
    }
    info!("Attached kprobe pair: {}", target_fn);
    Ok(true)
}

/// Software CPU-clock sampling on every online CPU.
pub fn attach_cpu_sampler(bpf: &mut Ebpf, program_name: &str, frequency_hz: u64) -> Result<bool> {
    let cpus = online_cpus()
        .map_err(|(path, e)| anyhow::anyhow!("Failed to read online CPUs from {}: {}", path, e))?;

    info!("Loading program {}", program_name);
    let program: &mut PerfEvent = bpf
        .program_mut(program_name)
        .with_context(|| format!("Failed to find {} program", program_name))?
        .try_into()?;
    program.load()?;
    for cpu in &cpus {
        program
            .attach(
                PerfTypeId::Software,
                perf_sw_ids::PERF_COUNT_SW_CPU_CLOCK as u64,
                PerfEventScope::AllProcessesOneCpu { cpu: *cpu },
                SamplePolicy::Frequency(frequency_hz),
                true,
            )
            .with_context(|| format!("Failed to attach {} on CPU {}", program_name, cpu))?;
    }
    info!(
        "Sampling {} CPUs at {} Hz with {}",
        cpus.len(),
        frequency_hz,
        program_name
    );
    Ok(true)
}

/// Attaches every enabled kind, returning the ones that went live.
pub fn attach_all(bpf: &mut Ebpf, kinds: &[ProbeKind], settings: &Settings) -> Result<Vec<ProbeKind>> {
    let mut attached = Vec::new();
    for kind in kinds {
        let Some(probe) = builtin::for_kind(*kind, settings) else {
            warn!(
                "Probe {} has no kernel programs; it is available through replay only",
                kind.name()
            );
            continue;
        };
        if probe
            .attach(bpf)
            .with_context(|| format!("Failed to attach probe {}", kind.name()))?
        {
            info!("Probe {} attached", kind.name());
            attached.push(*kind);
        }
    }
    Ok(attached)
}
