use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use deltascope_common::ProbeKind;
use log::debug;
use serde::Deserialize;

use crate::collector::CollectorConfig;
use crate::engine::{ProbeFilter, ProbeSpec, SubjectFilter};

const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_TOP: usize = 20;
/// Off the common 50/100 Hz timer ticks so samples do not lock step.
const DEFAULT_SAMPLE_HZ: u64 = 49;
const DEFAULT_BPF_OBJECT: &str = "target/bpfel-unknown-none/release/deltascope";

/// Per-probe switches. Unset means off.
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct ProbeToggles {
    pub sched_delay: Option<bool>,
    pub softirq: Option<bool>,
    pub hardirq: Option<bool>,
    pub cpu_idle: Option<bool>,
    pub offcpu: Option<bool>,
    pub readahead: Option<bool>,
    pub kvm_page_fault: Option<bool>,
    pub mem_alloc: Option<bool>,
    pub kvm_exit: Option<bool>,
    pub on_cpu: Option<bool>,
}

impl ProbeToggles {
    pub fn enabled(&self, kind: ProbeKind) -> bool {
        let toggle = match kind {
            ProbeKind::SchedDelay => self.sched_delay,
            ProbeKind::SoftIrq => self.softirq,
            ProbeKind::HardIrq => self.hardirq,
            ProbeKind::CpuIdle => self.cpu_idle,
            ProbeKind::OffCpu => self.offcpu,
            ProbeKind::Readahead => self.readahead,
            ProbeKind::KvmPageFault => self.kvm_page_fault,
            ProbeKind::MemAlloc => self.mem_alloc,
            ProbeKind::KvmExit => self.kvm_exit,
            ProbeKind::OnCpu => self.on_cpu,
        };
        toggle.unwrap_or(false)
    }

    pub fn enabled_kinds(&self) -> Vec<ProbeKind> {
        ProbeKind::ALL
            .into_iter()
            .filter(|kind| self.enabled(*kind))
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FilterSettings {
    /// Only this pid. Negative values follow the kernel convention
    /// (-1 every non-idle subject, -2 nothing).
    pub pid: Option<i32>,
    pub min_delta_us: Option<u64>,
    pub max_delta_us: Option<u64>,
    pub address_start: Option<u64>,
    pub address_end: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IdentitySettings {
    pub user_stack: Option<bool>,
    pub kernel_stack: Option<bool>,
}

/// Table sizes for in-process pipelines. The kernel maps are sized at
/// compile time.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CapacitySettings {
    pub starts: Option<usize>,
    pub aggregates: Option<usize>,
    pub stacks: Option<usize>,
    pub comms: Option<usize>,
    pub events: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SamplingSettings {
    /// On-CPU samples per second on each CPU.
    pub frequency_hz: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Log,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CollectorSettings {
    pub flush_interval_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub reset_on_read: Option<bool>,
    pub format: Option<OutputFormat>,
    /// Rows per probe in log output.
    pub top: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    #[serde(default)]
    pub probes: ProbeToggles,
    #[serde(default)]
    pub filter: FilterSettings,
    #[serde(default)]
    pub identity: IdentitySettings,
    #[serde(default)]
    pub capacity: CapacitySettings,
    #[serde(default)]
    pub collector: CollectorSettings,
    #[serde(default)]
    pub sampling: SamplingSettings,
    pub bpf_object: Option<String>,
}

/// Values written into the kernel object's globals before load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelGlobals {
    pub target_pid: i32,
    pub min_delta_ns: u64,
    /// Zero means unbounded.
    pub max_delta_ns: u64,
    pub user_stacks: u8,
    pub kernel_stacks: u8,
    pub sample_period_ns: u64,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Environment variables (`DELTASCOPE__SECTION__KEY`) override the
    /// optional YAML file.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path));
        }
        let s = builder
            .add_source(
                Environment::with_prefix("DELTASCOPE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn subject_filter(&self) -> SubjectFilter {
        self.filter
            .pid
            .map(SubjectFilter::from_target)
            .unwrap_or_default()
    }

    fn address_range(&self) -> Option<Range<u64>> {
        match (self.filter.address_start, self.filter.address_end) {
            (None, None) => None,
            (start, end) => Some(start.unwrap_or(0)..end.unwrap_or(u64::MAX)),
        }
    }

    pub fn probe_filter(&self) -> ProbeFilter {
        ProbeFilter {
            subject: self.subject_filter(),
            address: self.address_range(),
            min_delta_ns: self.filter.min_delta_us.unwrap_or(0).saturating_mul(1_000),
            max_delta_ns: self
                .filter
                .max_delta_us
                .map(|us| us.saturating_mul(1_000)),
        }
    }

    pub fn probe_spec(&self, kind: ProbeKind) -> ProbeSpec {
        ProbeSpec::for_kind(kind).with_stacks(
            self.identity.user_stack.unwrap_or(false),
            self.identity.kernel_stack.unwrap_or(false),
        )
    }

    pub fn output_format(&self) -> OutputFormat {
        self.collector.format.unwrap_or_default()
    }

    pub fn top(&self) -> usize {
        self.collector.top.unwrap_or(DEFAULT_TOP)
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            poll_interval: Duration::from_millis(
                self.collector
                    .poll_interval_ms
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            flush_interval: Duration::from_millis(
                self.collector
                    .flush_interval_ms
                    .unwrap_or(DEFAULT_FLUSH_INTERVAL_MS),
            ),
            reset_on_read: self.collector.reset_on_read.unwrap_or(false),
            ..CollectorConfig::default()
        }
    }

    pub fn sample_frequency_hz(&self) -> u64 {
        self.sampling
            .frequency_hz
            .unwrap_or(DEFAULT_SAMPLE_HZ)
            .clamp(1, 1_000_000_000)
    }

    /// CPU time one on-CPU sample stands for.
    pub fn sample_period_ns(&self) -> u64 {
        1_000_000_000 / self.sample_frequency_hz()
    }

    pub fn bpf_object_path(&self) -> PathBuf {
        PathBuf::from(self.bpf_object.as_deref().unwrap_or(DEFAULT_BPF_OBJECT))
    }

    pub fn to_kernel_globals(&self) -> KernelGlobals {
        let filter = self.probe_filter();
        KernelGlobals {
            target_pid: filter.subject.to_target(),
            min_delta_ns: filter.min_delta_ns,
            max_delta_ns: filter.max_delta_ns.unwrap_or(0),
            user_stacks: self.identity.user_stack.unwrap_or(false) as u8,
            kernel_stacks: self.identity.kernel_stack.unwrap_or(false) as u8,
            sample_period_ns: self.sample_period_ns(),
        }
    }
}
