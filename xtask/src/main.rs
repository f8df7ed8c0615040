use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use handoff_check::scenario::DEFAULT_VARIANTS;
use handoff_check::{
    report, run_all, run_all_parallel, Anchor, Comparison, Markers, ScenarioConfig,
    ScenarioReport, SkipReason, Variant,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use xtask::{check_file, Arch, QemuConfig, QemuRunner};

/// Boot-information handoff checks.
#[derive(Parser)]
#[command(name = "xtask")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Boot each kernel variant through the loader in QEMU and compare the
    /// boot information before and after the handoff.
    Run(RunArgs),
    /// Verify an already captured output file.
    Check(CheckArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum AnchorArg {
    LineStart,
    Anywhere,
}

impl From<AnchorArg> for Anchor {
    fn from(arg: AnchorArg) -> Self {
        match arg {
            AnchorArg::LineStart => Anchor::LineStart,
            AnchorArg::Anywhere => Anchor::Anywhere,
        }
    }
}

#[derive(clap::Args)]
struct MarkerArgs {
    /// Marker preceding the loader's record.
    #[arg(long, default_value = handoff_check::extract::INTENDED_MARKER)]
    intended_marker: String,
    /// Marker printed by the new kernel before its record.
    #[arg(long, default_value = handoff_check::extract::OBSERVED_MARKER)]
    observed_marker: String,
    #[arg(long, value_enum, default_value = "line-start")]
    anchor: AnchorArg,
}

impl MarkerArgs {
    fn markers(&self) -> Markers {
        Markers {
            intended: self.intended_marker.clone(),
            observed: self.observed_marker.clone(),
            anchor: self.anchor.into(),
        }
    }
}

#[derive(clap::Args)]
struct RunArgs {
    /// Directory holding the kernel images under test.
    #[arg(long, env = "UROOT_MULTIBOOT_TEST_KERNEL_DIR")]
    artifact_dir: Option<PathBuf>,
    /// Kernel the VM boots to run the loader.
    #[arg(long)]
    qemu_kernel: PathBuf,
    /// Initramfs carrying the loader.
    #[arg(long)]
    initramfs: PathBuf,
    /// Guest architecture; defaults to the host's.
    #[arg(long)]
    arch: Option<String>,
    /// Seconds to wait for the VM, early markers included.
    #[arg(long, default_value_t = 60)]
    timeout: u64,
    /// Kernel image names to test.
    #[arg(long = "variant")]
    variants: Vec<String>,
    /// Run every variant in its own VM at the same time.
    #[arg(long)]
    parallel: bool,
    /// Console marker that must appear before the VM exits; repeatable.
    #[arg(long = "early-marker")]
    early_markers: Vec<String>,
    #[arg(long, default_value_t = 1024)]
    memory: u32,
    /// Print JSON instead of KTAP.
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    markers: MarkerArgs,
}

#[derive(clap::Args)]
struct CheckArgs {
    file: PathBuf,
    #[command(flatten)]
    markers: MarkerArgs,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().cmd {
        Cmd::Run(args) => run(args),
        Cmd::Check(args) => check(args),
    }
}

fn run(args: RunArgs) -> Result<()> {
    let variants: Vec<Variant> = if args.variants.is_empty() {
        DEFAULT_VARIANTS.iter().map(|name| Variant::new(*name)).collect()
    } else {
        args.variants.iter().map(Variant::new).collect()
    };

    let mut config = ScenarioConfig {
        artifact_dir: args.artifact_dir.clone(),
        markers: args.markers.markers(),
        timeout: Duration::from_secs(args.timeout),
        ..ScenarioConfig::default()
    };
    if !args.early_markers.is_empty() {
        config.early_markers = args.early_markers.clone();
    }

    let arch = match &args.arch {
        Some(name) => Some(Arch::from_str(name)?),
        None => Arch::host(),
    };

    let reports: Vec<ScenarioReport> = match arch {
        None => {
            let host = std::env::consts::ARCH.to_string();
            variants
                .into_iter()
                .map(|variant| {
                    ScenarioReport::skipped(variant, SkipReason::UnsupportedArch(host.clone()))
                })
                .collect()
        }
        Some(arch) => {
            let mut qemu = QemuConfig::new(arch, args.qemu_kernel.clone(), args.initramfs.clone());
            qemu.memory_mb = args.memory;
            let runner = QemuRunner::new(qemu);
            info!(
                variants = variants.len(),
                arch = arch.label(),
                parallel = args.parallel,
                "running handoff scenarios"
            );
            if args.parallel {
                run_all_parallel(&runner, &config, &variants)
            } else {
                run_all(&runner, &config, &variants)
            }
        }
    };

    if args.json {
        println!("{}", report::json(&reports).context("failed to serialize reports")?);
    } else {
        print!("{}", report::ktap(&reports));
    }

    if !report::all_passed(&reports) {
        bail!("handoff scenarios failed");
    }
    Ok(())
}

fn check(args: CheckArgs) -> Result<()> {
    match check_file(&args.file, &args.markers.markers())? {
        Comparison::Equal => {
            println!("ok: boot information preserved across handoff");
            Ok(())
        }
        Comparison::Mismatch(mismatch) => {
            println!("{}", mismatch);
            bail!("boot information changed across the handoff");
        }
    }
}
