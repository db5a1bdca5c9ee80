#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use nvme_sgl::IoDevice;
use nvme_sim::{DeviceConfig, FaultPlan, SharedArena, SimBus};
use sgl_harness::{run_device, shapes, DeviceReport, RunOptions, RunSummary, VerifyOptions};

const MIB: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "nvme-sgl-check",
    about = "Round-trip vectored writes and reads of six scatter-gather request shapes through simulated NVMe controllers."
)]
struct Args {
    /// Number of controllers on the simulated bus
    #[arg(long, default_value_t = 1)]
    devices: usize,

    /// Namespace size in logical blocks
    #[arg(long, value_name = "BLOCKS", default_value_t = 0x20_0000)]
    namespace_blocks: u64,

    /// Logical block size in bytes (power of two, at least 512)
    #[arg(long, value_name = "BYTES", default_value_t = 512)]
    sector_size: u32,

    /// Identify MDTS: max transfer is 4 KiB << MDTS, 0 for unlimited (at most 20)
    #[arg(long, default_value_t = 5)]
    mdts: u8,

    /// I/O submission/completion queue depth
    #[arg(long, default_value_t = 64)]
    queue_size: u16,

    /// Size of the DMA arena shared by all controllers
    #[arg(long, value_name = "MIB", default_value_t = 64)]
    arena_mib: usize,

    /// How long to poll for a single completion
    #[arg(long, value_name = "MS", default_value_t = 5000)]
    completion_timeout_ms: u64,

    /// Run only these shapes (repeatable; defaults to all six)
    #[arg(long = "shape", value_name = "ID", value_parser = clap::value_parser!(u8).range(1..=6))]
    shapes: Vec<u8>,

    /// Run the shape list this many times per device
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Complete every write with a data transfer error
    #[arg(long, action = clap::ArgAction::SetTrue)]
    fail_writes: bool,

    /// Complete every read with a data transfer error
    #[arg(long, action = clap::ArgAction::SetTrue)]
    fail_reads: bool,

    /// Flip the first byte of every read
    #[arg(long, action = clap::ArgAction::SetTrue)]
    corrupt_reads: bool,

    /// Execute commands but never post their completions
    #[arg(long, action = clap::ArgAction::SetTrue)]
    drop_completions: bool,

    /// Apply fault flags to this device only (1-based; defaults to every device)
    #[arg(long, value_name = "N")]
    fault_device: Option<usize>,

    /// Make this device (1-based) refuse to attach
    #[arg(long, value_name = "N")]
    refuse_attach: Option<usize>,

    /// Write the run summary as JSON to this path
    #[arg(long, value_name = "PATH")]
    report_json: Option<PathBuf>,

    /// Suppress the text summary
    #[arg(long, action = clap::ArgAction::SetTrue)]
    quiet: bool,
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let summary = run(&args)?;
    Ok(ExitCode::from(summary.exit_code()))
}

fn run(args: &Args) -> anyhow::Result<RunSummary> {
    validate(args)?;

    let mut bus = SimBus::new(SharedArena::new(args.arena_mib * MIB));
    for index in 1..=args.devices {
        bus.add_device(device_config(args, index));
    }
    let opts = run_options(args)?;

    if !args.quiet {
        println!("attaching NVMe driver...");
    }
    let mut alloc = bus.arena();
    let mut summary = RunSummary::default();
    let mut attached = Vec::new();
    for (name, result) in bus.attach_all() {
        match result {
            Ok(mut device) => {
                tracing::info!("attached to {name}");
                summary.push(run_device(&mut device, &mut alloc, &opts));
                attached.push(device);
            }
            Err(err) => {
                tracing::error!("failed to attach {name}: {err}");
                summary.push(DeviceReport::attach_failed(name, &err));
            }
        }
    }

    if !args.quiet {
        print!("{}", summary.render_text());
        println!("Cleaning up...");
    }
    for mut device in attached {
        tracing::debug!("detaching {}", device.name());
        device.detach();
    }

    if let Some(path) = &args.report_json {
        let json = serde_json::to_string_pretty(&summary).context("serialize report")?;
        fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(summary)
}

fn validate(args: &Args) -> anyhow::Result<()> {
    if args.devices == 0 {
        bail!("--devices must be at least 1");
    }
    if args.sector_size < 512 || !args.sector_size.is_power_of_two() {
        bail!(
            "--sector-size must be a power of two of at least 512 (got {})",
            args.sector_size
        );
    }
    if args.mdts > 20 {
        bail!("--mdts must be at most 20 (got {})", args.mdts);
    }
    if !(2..=1024).contains(&args.queue_size) {
        bail!("--queue-size must be between 2 and 1024");
    }
    if args.repeat == 0 {
        bail!("--repeat must be at least 1");
    }
    for (flag, index) in [
        ("--fault-device", args.fault_device),
        ("--refuse-attach", args.refuse_attach),
    ] {
        if let Some(index) = index {
            if index == 0 || index > args.devices {
                bail!("{flag} {index} is out of range (1..={})", args.devices);
            }
        }
    }
    Ok(())
}

fn device_config(args: &Args, index: usize) -> DeviceConfig {
    let faulty = args.fault_device.map_or(true, |n| n == index);
    let faults = if faulty {
        FaultPlan {
            fail_writes: args.fail_writes,
            fail_reads: args.fail_reads,
            corrupt_reads: args.corrupt_reads,
            drop_completions: args.drop_completions,
        }
    } else {
        FaultPlan::default()
    };
    DeviceConfig {
        namespace_blocks: args.namespace_blocks,
        sector_size: args.sector_size,
        mdts: args.mdts,
        queue_size: args.queue_size,
        faults,
        refuse_attach: args.refuse_attach == Some(index),
    }
}

fn run_options(args: &Args) -> anyhow::Result<RunOptions> {
    let mut opts = RunOptions {
        verify: VerifyOptions {
            completion_timeout: Duration::from_millis(args.completion_timeout_ms),
            ..VerifyOptions::default()
        },
        repeat: args.repeat,
        ..RunOptions::default()
    };
    if !args.shapes.is_empty() {
        opts.shapes = args
            .shapes
            .iter()
            .map(|&id| {
                shapes::by_id(id)
                    .copied()
                    .with_context(|| format!("unknown shape {id}"))
            })
            .collect::<anyhow::Result<_>>()?;
    }
    Ok(opts)
}
