//! Turns a finished [`BenchmarkRun`] into the report file set.
//!
//! Compilation happens entirely in memory first; the output directory is only
//! allocated once every table is known to be computable, so a truncated log or
//! an unusable sample window leaves nothing behind on disk.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{BenchError, Result};
use crate::phases::{LogLayout, LogPhaseReconstructor};
use crate::schema::{
    micros_between, offset_ms, BenchmarkParameters, BenchmarkRun, RunTimings,
    Sample, Span, Timestamp,
};
use crate::series::{slice_window, Metric, SeriesAggregator, WindowStats};

pub const PARAMETERS_FILE: &str = "benchmark_parameters.json";
pub const RESULTS_FILE: &str = "benchmark_results.csv";
pub const SUMMARY_FILE: &str = "benchmark_summary.csv";
pub const GPU_STATS_FILE: &str = "gpu_stats.csv";
pub const GPU_SAMPLES_FILE: &str = "gpu_samples.csv";
pub const TIMESTAMPS_FILE: &str = "timestamps.csv";

const MIB: f64 = 1024.0 * 1024.0;

const RESULTS_HEADER: [&str; 8] = [
    "Run number",
    "Witness generation",
    "Solution generation",
    "Proof generation",
    "Proof generation (full function)",
    "Proof verification",
    "Full run",
    "Valid proof",
];

const SUMMARY_HEADER: [&str; 7] = [
    "Arithmitization",
    "Setup",
    "Avg witness generation",
    "Avg solution generation",
    "Avg proof generation",
    "Avg proof generation function",
    "Avg full run",
];

const GPU_STATS_HEADER: [&str; 9] = [
    "Run number",
    "Run duration",
    "GPU util avg",
    "GPU util peak",
    "GPU mem avg",
    "GPU mem peak",
    "GPU power avg",
    "GPU power peak",
    "GPU energy",
];

const GPU_SAMPLES_HEADER: [&str; 4] = ["t", "GPU util", "GPU mem", "GPU power"];

const TIMESTAMPS_HEADER: [&str; 11] = [
    "Run number",
    "Witness gen start",
    "Witness gen end",
    "Solution gen start",
    "Solution gen end",
    "Proof gen start",
    "Proof gen end",
    "Proof gen func start",
    "Proof gen func end",
    "Proof ver start",
    "Proof ver end",
];

/// Per-run phase durations in whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRow {
    pub run: usize,
    pub witness_gen_ms: i64,
    pub solution_gen_ms: i64,
    pub proof_gen_ms: i64,
    pub prove_call_ms: i64,
    pub verify_ms: i64,
    pub full_run_ms: i64,
    pub valid: bool,
}

impl RunRow {
    fn from_timings(run: usize, t: &RunTimings) -> Self {
        Self {
            run,
            witness_gen_ms: t.witness_gen.duration_ms(),
            solution_gen_ms: t.solution_gen.duration_ms(),
            proof_gen_ms: t.proof_gen.duration_ms(),
            prove_call_ms: t.prove_call.duration_ms(),
            verify_ms: t.verify.duration_ms(),
            full_run_ms: t.full_run().duration_ms(),
            valid: t.valid,
        }
    }

    fn record(&self) -> [String; 8] {
        [
            self.run.to_string(),
            self.witness_gen_ms.to_string(),
            self.solution_gen_ms.to_string(),
            self.proof_gen_ms.to_string(),
            self.prove_call_ms.to_string(),
            self.verify_ms.to_string(),
            self.full_run_ms.to_string(),
            self.valid.to_string(),
        ]
    }
}

/// Cross-run means, floor-divided to whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub arithmetization_ms: i64,
    pub setup_ms: i64,
    pub avg_witness_gen_ms: i64,
    pub avg_solution_gen_ms: i64,
    pub avg_proof_gen_ms: i64,
    pub avg_prove_call_ms: i64,
    pub avg_full_run_ms: i64,
}

impl Summary {
    pub fn from_rows(arithmetization_ms: i64, setup_ms: i64, rows: &[RunRow]) -> Result<Self> {
        if rows.is_empty() {
            return Err(BenchError::NoRuns);
        }
        let n = rows.len() as i64;
        let mean = |f: fn(&RunRow) -> i64| rows.iter().map(f).sum::<i64>().div_euclid(n);
        Ok(Self {
            arithmetization_ms,
            setup_ms,
            avg_witness_gen_ms: mean(|r| r.witness_gen_ms),
            avg_solution_gen_ms: mean(|r| r.solution_gen_ms),
            avg_proof_gen_ms: mean(|r| r.proof_gen_ms),
            avg_prove_call_ms: mean(|r| r.prove_call_ms),
            avg_full_run_ms: mean(|r| r.full_run_ms),
        })
    }

    fn record(&self) -> [String; 7] {
        [
            self.arithmetization_ms.to_string(),
            self.setup_ms.to_string(),
            self.avg_witness_gen_ms.to_string(),
            self.avg_solution_gen_ms.to_string(),
            self.avg_proof_gen_ms.to_string(),
            self.avg_prove_call_ms.to_string(),
            self.avg_full_run_ms.to_string(),
        ]
    }
}

/// Hardware statistics over one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HardwareStats {
    pub duration_ms: i64,
    pub utilization: WindowStats,
    pub memory: WindowStats,
    pub power: WindowStats,
    /// Average power times window length, in mW·s.
    pub energy_mws: f64,
}

impl HardwareStats {
    fn over(agg: &SeriesAggregator<'_>, window: Span, label: &str) -> Result<Self> {
        let stats = |metric| {
            agg.stats(metric, window.start, window.end)
                .map_err(|source| BenchError::Series {
                    window: label.to_string(),
                    source,
                })
        };
        let power = stats(Metric::Power)?;
        let energy_mws = power.average * micros_between(window.start, window.end) as f64 / 1e6;
        Ok(Self {
            duration_ms: window.duration_ms(),
            utilization: stats(Metric::Utilization)?,
            memory: stats(Metric::Memory)?,
            power,
            energy_mws,
        })
    }

    fn record(&self, label: String) -> [String; 9] {
        [
            label,
            self.duration_ms.to_string(),
            format!("{:.2}", self.utilization.average),
            self.utilization.peak.to_string(),
            format!("{:.3}", self.memory.average / MIB),
            format!("{:.2}", self.memory.peak as f64 / MIB),
            format!("{:.3}", self.power.average),
            self.power.peak.to_string(),
            format!("{:.3}", self.energy_mws),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct HardwareReport {
    pub per_run: Vec<HardwareStats>,
    pub overall: HardwareStats,
    /// Samples strictly inside the benchmark's run window.
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone)]
pub struct CompiledReport {
    pub parameters: BenchmarkParameters,
    pub timings: Vec<RunTimings>,
    pub rows: Vec<RunRow>,
    pub summary: Summary,
    pub hardware: Option<HardwareReport>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReportCompiler {
    layout: LogLayout,
}

impl ReportCompiler {
    pub fn new(layout: LogLayout) -> Self {
        Self { layout }
    }

    pub fn compile(&self, run: BenchmarkRun) -> Result<CompiledReport> {
        if run.run_count == 0 || run.runs.is_empty() {
            return Err(BenchError::NoRuns);
        }
        if run.run_count != run.runs.len() {
            return Err(BenchError::RunCountMismatch {
                declared: run.run_count,
                recorded: run.runs.len(),
            });
        }
        let accelerated = run.is_accelerated();

        let reconstructor = LogPhaseReconstructor::new(self.layout, &run.log);
        debug!(entries = reconstructor.entries().len(), "decoded prover log");
        let timings = reconstructor.reconstruct(accelerated, &run.runs)?;

        let curve = match reconstructor.curve() {
            Some(logged) if logged != run.circuit.curve => {
                debug!(configured = %run.circuit.curve, logged, "using curve reported by the prover");
                logged.to_string()
            }
            Some(logged) => logged.to_string(),
            None => run.circuit.curve.clone(),
        };

        let parameters = BenchmarkParameters {
            circuit: run.circuit.name.clone(),
            curve,
            accelerator: run.circuit.accelerator.as_str().to_string(),
            run_count: run.run_count,
            constraint_count: run.circuit.constraint_count,
            arithmetization_ms: run.arithmetization.duration_ms(),
            setup_ms: run.setup.duration_ms(),
        };

        let rows: Vec<RunRow> = timings
            .iter()
            .enumerate()
            .map(|(i, t)| RunRow::from_timings(i, t))
            .collect();
        let summary = Summary::from_rows(parameters.arithmetization_ms, parameters.setup_ms, &rows)?;

        let hardware = if accelerated {
            let samples = run.samples.as_deref().ok_or(BenchError::MissingSamples)?;
            check_sorted(samples)?;
            Some(hardware_report(samples, &timings)?)
        } else {
            None
        };

        Ok(CompiledReport {
            parameters,
            timings,
            rows,
            summary,
            hardware,
        })
    }
}

/// Window lookups binary-search on timestamps, so a capture whose samples
/// are out of order would yield silently wrong statistics.
fn check_sorted(samples: &[Sample]) -> Result<()> {
    match samples
        .windows(2)
        .position(|w| w[0].timestamp >= w[1].timestamp)
    {
        Some(i) => Err(BenchError::UnsortedSamples { index: i + 1 }),
        None => Ok(()),
    }
}

fn hardware_report(samples: &[Sample], timings: &[RunTimings]) -> Result<HardwareReport> {
    let (Some(first), Some(last)) = (timings.first(), timings.last()) else {
        return Err(BenchError::NoRuns);
    };
    let overall_window = Span::new(first.witness_gen.start, last.verify.end);
    let window = slice_window(samples, overall_window.start, overall_window.end);
    debug!(
        total = samples.len(),
        in_window = window.len(),
        "hardware samples inside the run window"
    );
    let agg = SeriesAggregator::new(window);

    let per_run = timings
        .par_iter()
        .enumerate()
        .map(|(i, t)| HardwareStats::over(&agg, t.full_run(), &format!("run {i}")))
        .collect::<Result<Vec<_>>>()?;
    let overall = HardwareStats::over(&agg, overall_window, "all runs")?;

    Ok(HardwareReport {
        per_run,
        overall,
        samples: window.to_vec(),
    })
}

impl CompiledReport {
    /// Allocate a fresh `benchmark-<n>` directory under `root` and write every
    /// table into it.
    pub fn write(&self, root: &Path) -> Result<PathBuf> {
        let dir = allocate_output_dir(root)?;

        write_json(&dir.join(PARAMETERS_FILE), &self.parameters)?;

        write_csv(
            &dir.join(RESULTS_FILE),
            RESULTS_HEADER,
            self.rows.iter().map(RunRow::record),
        )?;
        write_csv(
            &dir.join(SUMMARY_FILE),
            SUMMARY_HEADER,
            std::iter::once(self.summary.record()),
        )?;

        if let Some(hw) = &self.hardware {
            let stats = hw
                .per_run
                .iter()
                .enumerate()
                .map(|(i, s)| s.record(i.to_string()))
                .chain(std::iter::once(hw.overall.record("all".to_string())));
            write_csv(&dir.join(GPU_STATS_FILE), GPU_STATS_HEADER, stats)?;
            write_csv(
                &dir.join(GPU_SAMPLES_FILE),
                GPU_SAMPLES_HEADER,
                sample_records(&hw.samples),
            )?;
            write_csv(
                &dir.join(TIMESTAMPS_FILE),
                TIMESTAMPS_HEADER,
                timestamp_records(&self.timings),
            )?;
        }

        info!("benchmark results written in {}", dir.display());
        Ok(dir)
    }
}

fn sample_records(samples: &[Sample]) -> impl Iterator<Item = [String; 4]> + '_ {
    let origin = samples.first().map(|s| s.timestamp);
    samples.iter().map(move |s| {
        let t = origin.map_or(0.0, |o| offset_ms(o, s.timestamp));
        [
            format!("{t:.3}"),
            s.utilization_percent.to_string(),
            format!("{:.3}", s.memory_used_bytes as f64 / MIB),
            s.power_milliwatts.to_string(),
        ]
    })
}

fn timestamp_records(timings: &[RunTimings]) -> impl Iterator<Item = [String; 11]> + '_ {
    let origin: Option<Timestamp> = timings.first().map(|t| t.witness_gen.start);
    timings.iter().enumerate().map(move |(i, t)| {
        let ms = |at: Timestamp| format!("{:.3}", origin.map_or(0.0, |o| offset_ms(o, at)));
        [
            i.to_string(),
            ms(t.witness_gen.start),
            ms(t.witness_gen.end),
            ms(t.solution_gen.start),
            ms(t.solution_gen.end),
            ms(t.proof_gen.start),
            ms(t.proof_gen.end),
            ms(t.prove_call.start),
            ms(t.prove_call.end),
            ms(t.verify.start),
            ms(t.verify.end),
        ]
    })
}

/// First `benchmark-<n>` under `root` that does not exist yet, probing from 0.
///
/// Two processes probing the same root at once can pick the same name.
pub fn allocate_output_dir(root: &Path) -> Result<PathBuf> {
    fs::create_dir_all(root)?;
    let mut n = 0usize;
    loop {
        let candidate = root.join(format!("benchmark-{n}"));
        if !candidate.exists() {
            fs::create_dir_all(&candidate)?;
            return Ok(candidate);
        }
        n += 1;
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    let mut file = fs::File::create(path)?;
    file.write_all(&buf)?;
    Ok(())
}

fn write_csv<const N: usize, I>(path: &Path, header: [&str; N], rows: I) -> Result<()>
where
    I: IntoIterator<Item = [String; N]>,
{
    let csv_err = |source| BenchError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    writer.write_record(header).map_err(csv_err)?;
    for row in rows {
        writer.write_record(&row).map_err(csv_err)?;
    }
    writer.flush()?;
    Ok(())
}
