//! basinctl: load a RISC-V64 guest ELF into basin-vm and run it.
//!
//! Serial output streams to stdout as the guest produces it; the guest exit
//! status becomes the process exit code. Configuration comes from flags and
//! the environment (`BASIN_MEMORY_BYTES`), in the spirit of keeping the
//! host side scriptable:
//!
//!   basinctl [--steps N] [--strict] [--json] <image.elf> [-- guest args...]

use std::io::Write;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use basin_vm::{RunOutcome, Vm, VmConfig, VmState};

/// Instructions per scheduling slice; serial output is flushed between
/// slices.
const SLICE: u64 = 1 << 20;

const DEFAULT_STEP_BUDGET: u64 = 200_000_000;

#[derive(Debug, Serialize)]
struct RunSummary {
    state: VmState,
    exit_status: Option<u64>,
    instructions: u64,
    fault: Option<String>,
    serial_bytes: u64,
}

struct Options {
    image: String,
    guest_args: Vec<String>,
    steps: u64,
    strict: bool,
    json: bool,
}

fn parse_args() -> Result<Options> {
    let mut args = std::env::args().skip(1);
    let mut image = None;
    let mut guest_args = Vec::new();
    let mut steps = DEFAULT_STEP_BUDGET;
    let mut strict = false;
    let mut json = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--steps" => {
                let value = args.next().context("--steps needs a value")?;
                steps = value.parse().context("--steps must be an integer")?;
            }
            "--strict" => strict = true,
            "--json" => json = true,
            "--" => {
                guest_args.extend(args.by_ref());
                break;
            }
            _ if image.is_none() => image = Some(arg),
            other => bail!("unexpected argument {other:?}"),
        }
    }

    let image = image.context("usage: basinctl [--steps N] [--strict] [--json] <image.elf> [-- guest args...]")?;
    Ok(Options { image, guest_args, steps, strict, json })
}

fn build_config(strict: bool) -> Result<VmConfig> {
    let mut config = if strict {
        VmConfig::strict()
    } else {
        VmConfig::default()
    };
    if let Ok(value) = std::env::var("BASIN_MEMORY_BYTES") {
        config.memory_size = value
            .parse()
            .context("BASIN_MEMORY_BYTES must be an integer")?;
    }
    Ok(config)
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts = parse_args()?;
    let config = build_config(opts.strict)?;

    info!("loading {}", opts.image);
    let image = std::fs::read(&opts.image)
        .with_context(|| format!("reading {}", opts.image))?;

    let mut vm = Vm::with_config(config);
    let mut argv: Vec<&str> = vec![opts.image.as_str()];
    argv.extend(opts.guest_args.iter().map(String::as_str));
    vm.load_elf_with_args(&image, &argv)
        .with_context(|| format!("loading {}", opts.image))?;
    vm.start()?;

    let mut stdout = std::io::stdout();
    let mut serial_bytes = 0u64;
    let mut remaining = opts.steps;
    let outcome = loop {
        let slice = remaining.min(SLICE);
        let outcome = vm.run(slice)?;
        remaining -= slice;

        let chunk = vm.serial_drain();
        if !chunk.is_empty() {
            serial_bytes += chunk.len() as u64;
            stdout.write_all(&chunk)?;
            stdout.flush()?;
        }

        match outcome {
            RunOutcome::BudgetExhausted if remaining > 0 => continue,
            other => break other,
        }
    };

    let summary = RunSummary {
        state: vm.state(),
        exit_status: vm.exit_status(),
        instructions: vm.instret(),
        fault: vm.fault().map(|f| f.to_string()),
        serial_bytes,
    };
    debug!(?summary.state, summary.instructions, "run finished");

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    match outcome {
        RunOutcome::Halted { status } => {
            info!("guest halted with status {status:#x}");
            Ok(ExitCode::from((status & 0xff) as u8))
        }
        RunOutcome::BudgetExhausted => {
            info!("instruction budget exhausted after {} steps", opts.steps);
            Ok(ExitCode::from(124))
        }
        RunOutcome::Faulted(fault) => {
            bail!("VM fault at pc {:#x}: {fault}", vm.pc());
        }
    }
}
