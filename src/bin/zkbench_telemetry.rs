use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zkbench_telemetry::harness::{run_benchmark, BenchConfig, MAX_RUNS};
use zkbench_telemetry::phases::LogLayout;
use zkbench_telemetry::report::ReportCompiler;
use zkbench_telemetry::sampler::{HardwareProbe, NvidiaSmiProbe};
use zkbench_telemetry::schema::BenchmarkRun;
use zkbench_telemetry::synthetic::{SyntheticConfig, SyntheticProbe, SyntheticWorkload};
use zkbench_telemetry::{Accelerator, Curve};

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ProbeArg {
    /// Seeded fake readings.
    Synthetic,
    /// Query a real GPU through nvidia-smi.
    NvidiaSmi,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the synthetic prover end to end and compile its report.
    Simulate {
        #[arg(long, default_value = "cubic")]
        circuit: String,

        #[arg(long, value_enum, default_value_t = Curve::Bn254)]
        curve: Curve,

        #[arg(long, default_value_t = 3)]
        constraints: u64,

        /// Number of benchmark runs.
        #[arg(long, short = 'n', default_value_t = 10)]
        runs: usize,

        #[arg(long, value_enum, default_value_t = Accelerator::Cpu)]
        accelerator: Accelerator,

        /// Hardware probe used when the accelerator is a GPU.
        #[arg(long, value_enum, default_value_t = ProbeArg::Synthetic)]
        probe: ProbeArg,

        /// GPU index for the nvidia-smi probe.
        #[arg(long, default_value_t = 0)]
        device: u32,

        /// Sampling period in milliseconds.
        #[arg(long, default_value_t = 2)]
        period_ms: u64,

        /// Fraction of runs whose proof fails verification.
        #[arg(long, default_value_t = 0.0)]
        invalid_rate: f64,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Also save the raw capture so it can be recompiled later.
        #[arg(long, value_name = "FILE")]
        save_capture: Option<PathBuf>,
    },

    /// Compile the report for a previously saved capture.
    Compile {
        #[arg(value_name = "FILE")]
        capture: PathBuf,
    },

    /// Take one reading from a GPU and print it.
    Probe {
        #[arg(long, default_value_t = 0)]
        device: u32,
    },
}

#[derive(Parser, Debug)]
#[command(name = "zkbench-telemetry")]
#[command(about = "Phase timing and GPU telemetry for prover benchmarks (CSV/JSON output)")]
struct Args {
    /// Root under which `benchmark-<n>` directories are created.
    #[arg(long, default_value = "output", global = true)]
    output_dir: PathBuf,

    /// Log at debug level (RUST_LOG overrides).
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn compile_and_write(run: BenchmarkRun, args: &Args) -> Result<()> {
    info!("compiling benchmark results");
    let report = ReportCompiler::new(LogLayout::V1)
        .compile(run)
        .context("failed to compile benchmark report")?;
    let dir = report
        .write(&args.output_dir)
        .with_context(|| format!("failed to write report under {}", args.output_dir.display()))?;
    println!("{}", dir.display());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match &args.cmd {
        Command::Simulate {
            circuit,
            curve,
            constraints,
            runs,
            accelerator,
            probe,
            device,
            period_ms,
            invalid_rate,
            seed,
            save_capture,
        } => {
            if !(1..=MAX_RUNS).contains(runs) {
                bail!("--runs must be between 1 and {MAX_RUNS}, got {runs}");
            }
            if !(0.0..=1.0).contains(invalid_rate) {
                bail!("--invalid-rate must be within [0, 1], got {invalid_rate}");
            }
            let cfg = BenchConfig {
                accelerator: *accelerator,
                sampling_period: Duration::from_millis(*period_ms),
            };
            let mut workload = SyntheticWorkload::new(SyntheticConfig {
                circuit: circuit.clone(),
                curve: *curve,
                constraint_count: *constraints,
                runs: *runs,
                accelerator: *accelerator,
                seed: *seed,
                invalid_rate: *invalid_rate,
                ..Default::default()
            });
            let probe: Box<dyn HardwareProbe + Send> = match probe {
                ProbeArg::Synthetic => Box::new(SyntheticProbe::new(*seed)),
                ProbeArg::NvidiaSmi => Box::new(NvidiaSmiProbe::new(*device)),
            };

            let run = run_benchmark(&mut workload, &cfg, Some(probe))
                .context("benchmark execution failed")?;
            if let Some(path) = save_capture {
                run.save(path)
                    .with_context(|| format!("failed to save capture to {}", path.display()))?;
                info!("capture saved to {}", path.display());
            }
            compile_and_write(run, &args)?;
        }
        Command::Compile { capture } => {
            let run = BenchmarkRun::load(capture)
                .with_context(|| format!("failed to load capture {}", capture.display()))?;
            if run.is_accelerated() && run.samples.as_ref().map_or(true, Vec::is_empty) {
                warn!("capture is marked GPU-accelerated but holds no hardware samples");
            }
            compile_and_write(run, &args)?;
        }
        Command::Probe { device } => {
            let reading = NvidiaSmiProbe::new(*device)
                .read()
                .with_context(|| format!("failed to read GPU {device}"))?;
            println!("{}", serde_json::to_string_pretty(&reading)?);
        }
    }

    Ok(())
}
