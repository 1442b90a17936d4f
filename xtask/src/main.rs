//! Build helper for the eBPF programs

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::process::Command;

#[derive(Parser)]
enum Cli {
    /// Build the eBPF programs
    BuildEbpf {
        /// Build in release mode
        #[arg(long)]
        release: bool,
    },
    /// Build everything (eBPF + userspace)
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,
    },
    /// Run the node daemon
    Run {
        /// Topology file
        #[arg(short, long, default_value = "topology.json")]
        config: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli {
        Cli::BuildEbpf { release } => build_ebpf(release),
        Cli::Build { release } => {
            build_ebpf(release)?;
            build_userspace(release)
        }
        Cli::Run { config } => run(&config),
    }
}

fn build_ebpf(release: bool) -> Result<()> {
    println!("Building eBPF programs...");

    let mut args = vec![
        "+nightly",
        "build",
        "--target",
        "bpfel-unknown-none",
        "-Z",
        "build-std=core",
    ];

    if release {
        args.push("--release");
    }

    // agg-ebpf is its own workspace; build from inside it.
    let status = Command::new("cargo")
        .current_dir("agg-ebpf")
        .args(&args)
        .env("CARGO_CFG_BPF_TARGET_ARCH", std::env::consts::ARCH)
        .status()
        .context("Failed to run cargo")?;

    if !status.success() {
        bail!("eBPF build failed");
    }

    println!("eBPF build complete");
    Ok(())
}

fn build_userspace(release: bool) -> Result<()> {
    println!("Building userspace programs...");

    let mut args = vec!["build"];
    if release {
        args.push("--release");
    }

    let status = Command::new("cargo")
        .args(&args)
        .status()
        .context("Failed to run cargo")?;

    if !status.success() {
        bail!("Userspace build failed");
    }

    println!("Userspace build complete");
    Ok(())
}

fn run(config: &str) -> Result<()> {
    println!("Running node daemon with {}...", config);

    let status = Command::new("sudo")
        .args(["./target/release/aggd", "--config", config])
        .status()
        .context("Failed to run aggd")?;

    if !status.success() {
        bail!("aggd exited with error");
    }

    Ok(())
}
