pub mod collector;
pub mod engine;
pub mod probes;
pub mod replay;
pub mod settings;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use deltascope_common::{MAX_COMMS, ProbeKind};
use log::{info, warn};
use tokio::signal;

use crate::collector::{
    Collector, CollectorSummary, JsonRender, KernelAggregateSource, KernelDropSource, LogRender,
    Render, RingBufSource,
};
use crate::engine::CommCache;
use crate::probes::{attach_all, request_shutdown, shutdown_flag};
use crate::settings::{OutputFormat, Settings};

pub struct DeltaScopeEngine {
    pub settings: Settings,
    bpf: Ebpf,
}

impl DeltaScopeEngine {
    pub fn new(settings: Settings, object: &Path) -> Result<Self> {
        bump_memlock_rlimit()?;

        let globals = settings.to_kernel_globals();
        let mut loader = EbpfLoader::new();
        loader
            .set_global("TARGET_PID", &globals.target_pid, true)
            .set_global("MIN_DELTA_NS", &globals.min_delta_ns, true)
            .set_global("MAX_DELTA_NS", &globals.max_delta_ns, true)
            .set_global("USER_STACKS", &globals.user_stacks, true)
            .set_global("KERNEL_STACKS", &globals.kernel_stacks, true)
            .set_global("SAMPLE_PERIOD_NS", &globals.sample_period_ns, true);
        let mut bpf = loader
            .load_file(object)
            .with_context(|| format!("Failed to load BPF object {}", object.display()))?;
        info!("Loaded BPF object {} with {:?}", object.display(), globals);

        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }
        Ok(Self { settings, bpf })
    }

    pub async fn run(mut self) -> Result<CollectorSummary> {
        let attached = self.attach_probes()?;
        if attached.is_empty() {
            warn!("No probes attached; enable some with DELTASCOPE__PROBES__<NAME>=true");
        }

        let collector = self.build_collector()?;
        let shutdown = shutdown_flag();
        tokio::spawn(async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Exiting..."),
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
            request_shutdown();
        });

        info!("Monitoring active. Press Ctrl-C to exit.");
        collector.run(shutdown).await
    }

    fn attach_probes(&mut self) -> Result<Vec<ProbeKind>> {
        let kinds = self.settings.probes.enabled_kinds();
        attach_all(&mut self.bpf, &kinds, &self.settings)
    }

    fn build_collector(&mut self) -> Result<Collector> {
        let names = Arc::new(CommCache::new(
            self.settings
                .capacity
                .comms
                .unwrap_or(MAX_COMMS as usize),
        )?);

        let mut collector = Collector::new(self.settings.collector_config(), renderer(&self.settings));
        collector.add_event_source(Box::new(RingBufSource::new(&mut self.bpf)?));
        collector.add_aggregate_source(Box::new(KernelAggregateSource::new(&mut self.bpf, names)?));
        collector.add_drop_source(Box::new(KernelDropSource::new(&mut self.bpf)?));
        info!("Registered kernel map sources");
        Ok(collector)
    }
}

/// Output chosen by `collector.format`.
pub fn renderer(settings: &Settings) -> Box<dyn Render> {
    match settings.output_format() {
        OutputFormat::Log => Box::new(LogRender::new(settings.top())),
        OutputFormat::Json => Box::new(JsonRender::stdout()),
    }
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
