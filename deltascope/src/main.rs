use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deltascope::collector::{Collector, REPORT_TARGET};
use deltascope::settings::{OutputFormat, Settings};
use deltascope::{DeltaScopeEngine, renderer, replay};
use log::info;

#[derive(Debug, Parser)]
#[command(name = "deltascope", version, about = "Kernel event latency and attribution")]
struct Opt {
    /// Verbose output
    #[clap(short, long, global = true)]
    verbose: bool,

    /// YAML settings, overridden by DELTASCOPE__* environment variables
    #[clap(long, global = true, env = "DELTASCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Output format, overriding collector.format
    #[clap(long, global = true, value_enum)]
    format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load the kernel programs and report until Ctrl-C
    Run {
        /// Compiled BPF object, overriding bpf_object
        #[clap(long)]
        bpf_object: Option<PathBuf>,
    },
    /// Feed recorded hook events (JSON lines) through the engine
    Replay { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    let base = if opt.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(format!("{base},{REPORT_TARGET}=info")),
    )
    .init();

    let mut settings =
        Settings::load(opt.config.as_deref()).context("Failed to load settings")?;
    if let Some(format) = opt.format {
        settings.collector.format = Some(format);
    }

    match opt.command {
        Command::Run { bpf_object } => {
            let object = bpf_object.unwrap_or_else(|| settings.bpf_object_path());
            let engine = DeltaScopeEngine::new(settings, &object)?;
            let summary = engine.run().await?;
            info!("Collected {} events", summary.events);
        }
        Command::Replay { file } => {
            let collector = Collector::new(settings.collector_config(), renderer(&settings));
            replay::replay_file(&settings, &file, collector)?;
        }
    }
    Ok(())
}
