use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const EBPF_TARGET: &str = "bpfel-unknown-none";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build and run deltascope")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the eBPF object only
    BuildEbpf {
        /// Build in release mode
        #[arg(long)]
        release: bool,
    },

    /// Build the eBPF object and the userspace binary
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Target triple for the userspace binary
        #[arg(long)]
        target: Option<String>,
    },

    /// Build everything and run the collector with sudo
    Run {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Arguments passed through to `deltascope run`
        #[arg(last = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::BuildEbpf { release } => {
            build_ebpf(release)?;
        }
        Commands::Build { release, target } => {
            build_ebpf(release)?;
            build(release, target.as_deref())?;
        }
        Commands::Run { release, args } => {
            let object = build_ebpf(release)?;
            let binary = build(release, None)?;
            run(&binary, &object, &args)?;
        }
    }

    Ok(())
}

fn project_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask has no parent directory")
}

fn profile(release: bool) -> &'static str {
    if release { "release" } else { "debug" }
}

fn build_ebpf(release: bool) -> Result<PathBuf> {
    let root = project_root()?;

    println!("🔨 Building deltascope-ebpf...");

    if which::which("bpf-linker").is_err() {
        bail!(
            "Building the eBPF object requires 'bpf-linker'.\n\
             Install with: cargo install bpf-linker"
        );
    }

    let mut cmd = Command::new("cargo");
    cmd.current_dir(root.join("deltascope-ebpf"))
        .env_remove("RUSTUP_TOOLCHAIN")
        .args(["+nightly", "build", "--target", EBPF_TARGET])
        .args(["-Z", "build-std=core"]);
    if release {
        cmd.arg("--release");
    }

    let status = cmd.status().context("Failed to run cargo build for eBPF")?;
    if !status.success() {
        bail!("eBPF build failed");
    }

    let object = root
        .join("target")
        .join(EBPF_TARGET)
        .join(profile(release))
        .join("deltascope");
    println!("✅ eBPF object: {}", object.display());

    Ok(object)
}

fn build(release: bool, target: Option<&str>) -> Result<PathBuf> {
    let root = project_root()?;

    println!("🔨 Building deltascope...");

    let mut cmd = Command::new("cargo");
    cmd.current_dir(&root).arg("build").args(["-p", "deltascope"]);
    if release {
        cmd.arg("--release");
    }
    if let Some(t) = target {
        cmd.arg("--target").arg(t);
        println!("   Target: {}", t);
    }

    let status = cmd.status().context("Failed to run cargo build")?;
    if !status.success() {
        bail!("Build failed");
    }

    let mut binary = root.join("target");
    if let Some(t) = target {
        binary.push(t);
    }
    binary.push(profile(release));
    binary.push("deltascope");
    println!("✅ Build complete: {}", binary.display());

    Ok(binary)
}

fn run(binary: &Path, object: &Path, args: &[String]) -> Result<()> {
    let status = Command::new("sudo")
        .arg("-E")
        .arg(binary)
        .arg("run")
        .arg("--bpf-object")
        .arg(object)
        .args(args)
        .status()
        .context("Failed to run deltascope")?;

    if !status.success() {
        bail!("deltascope exited with {}", status);
    }
    Ok(())
}
