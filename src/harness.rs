use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::error::{BenchError, Result};
use crate::sampler::{HardwareProbe, HardwareSampler, SamplerError};
use crate::schema::{BenchmarkRun, CircuitMeta, RecordedRun, Sample, Span, Timestamp};
use crate::Accelerator;

/// Upper bound on runs per benchmark.
pub const MAX_RUNS: usize = 1_000;

/// Default sampler period.
pub const DEFAULT_SAMPLING_PERIOD: Duration = Duration::from_millis(2);

/// Wall-clock time anchored to a monotonic instant.
///
/// Every timestamp taken through the same clock is non-decreasing, even if the
/// system clock is adjusted mid-benchmark.
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    wall: Timestamp,
    mono: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    pub fn now(&self) -> Timestamp {
        let elapsed = TimeDelta::from_std(self.mono.elapsed()).unwrap_or(TimeDelta::MAX);
        self.wall + elapsed
    }

    /// Run `f` and return its output with the span it occupied.
    pub fn span<T>(&self, f: impl FnOnce() -> T) -> (T, Span) {
        let start = self.now();
        let out = f();
        let end = self.now();
        (out, Span::new(start, end))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct BenchConfig {
    pub accelerator: Accelerator,
    pub sampling_period: Duration,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            accelerator: Accelerator::Cpu,
            sampling_period: DEFAULT_SAMPLING_PERIOD,
        }
    }
}

/// Accumulates caller-observed spans and validity flags, one run at a time.
#[derive(Debug, Default)]
pub struct RunRecorder {
    runs: Vec<RecordedRun>,
    pending: Pending,
}

#[derive(Debug, Default)]
struct Pending {
    witness_gen: Option<Span>,
    prove_call: Option<Span>,
    verify: Option<Span>,
}

impl RunRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn witness(&mut self, span: Span) {
        self.pending.witness_gen = Some(span);
    }

    pub fn prove(&mut self, span: Span) {
        self.pending.prove_call = Some(span);
    }

    pub fn verify(&mut self, span: Span) {
        self.pending.verify = Some(span);
    }

    /// Close the current run. Returns `None` (and keeps the partial spans) if
    /// any of the three spans is still missing.
    pub fn finish_run(&mut self, valid: bool) -> Option<&RecordedRun> {
        let Pending {
            witness_gen: Some(witness_gen),
            prove_call: Some(prove_call),
            verify: Some(verify),
        } = self.pending
        else {
            return None;
        };
        self.pending = Pending::default();
        self.runs.push(RecordedRun {
            witness_gen,
            prove_call,
            verify,
            valid,
        });
        self.runs.last()
    }

    /// Record a complete run in one go.
    pub fn record(&mut self, run: RecordedRun) {
        self.pending = Pending::default();
        self.runs.push(run);
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn runs(&self) -> &[RecordedRun] {
        &self.runs
    }

    pub fn into_runs(self) -> Vec<RecordedRun> {
        self.runs
    }
}

/// The prover under test. Everything behind this trait is opaque: the harness
/// only times the calls and collects the log the prover wrote.
pub trait Workload {
    fn circuit(&self) -> CircuitMeta;

    fn run_count(&self) -> usize;

    fn arithmetize(&mut self) -> Result<()>;

    fn setup(&mut self) -> Result<()>;

    fn generate_witness(&mut self, run: usize) -> Result<()>;

    /// Solution generation followed by proof generation, as one call.
    fn prove(&mut self, run: usize) -> Result<()>;

    /// Returns whether the proof verified.
    fn verify(&mut self, run: usize) -> bool;

    /// Drain everything the prover logged so far.
    fn take_log(&mut self) -> String;
}

/// Execute `workload` end to end, sampling hardware alongside when accelerated.
pub fn run_benchmark<W, P>(
    workload: &mut W,
    cfg: &BenchConfig,
    probe: Option<P>,
) -> Result<BenchmarkRun>
where
    W: Workload,
    P: HardwareProbe + Send + 'static,
{
    let clock = Clock::new();
    let mut circuit = workload.circuit();
    circuit.accelerator = cfg.accelerator;
    let run_count = workload.run_count();
    if run_count == 0 {
        return Err(BenchError::NoRuns);
    }

    let sampler = match (cfg.accelerator, probe) {
        (Accelerator::Gpu, Some(probe)) => {
            Some(HardwareSampler::start(probe, cfg.sampling_period, clock)?)
        }
        (Accelerator::Gpu, None) => {
            warn!("GPU acceleration requested without a hardware probe; no samples will be taken");
            None
        }
        (Accelerator::Cpu, _) => None,
    };

    let (arith, arithmetization) = clock.span(|| workload.arithmetize());
    arith?;
    info!(ms = arithmetization.duration_ms(), "arithmetization done");

    let (setup_result, setup) = clock.span(|| workload.setup());
    setup_result?;
    info!(ms = setup.duration_ms(), "setup done");

    let mut recorder = RunRecorder::new();
    for run in 0..run_count {
        info!("benchmark run {}/{}", run + 1, run_count);

        let (witness, span) = clock.span(|| workload.generate_witness(run));
        witness?;
        recorder.witness(span);

        let (proved, span) = clock.span(|| workload.prove(run));
        if let Err(err) = proved {
            warn!(run, %err, "prove call failed");
        }
        recorder.prove(span);

        let (valid, span) = clock.span(|| workload.verify(run));
        recorder.verify(span);
        if valid {
            debug!(run, "proof is valid");
        } else {
            warn!(run, "proof is invalid");
        }
        recorder.finish_run(valid);
    }

    let samples = match sampler {
        Some(sampler) => Some(collect_samples(sampler)?),
        None => None,
    };

    Ok(BenchmarkRun {
        circuit,
        arithmetization,
        setup,
        run_count,
        runs: recorder.into_runs(),
        samples,
        log: workload.take_log(),
    })
}

fn collect_samples(sampler: HardwareSampler) -> Result<Vec<Sample>> {
    match sampler.stop() {
        Ok(samples) => {
            debug!(count = samples.len(), "hardware sampler joined");
            Ok(samples)
        }
        Err(SamplerError::Probe { collected, source }) => {
            warn!(
                %source,
                kept = collected.len(),
                "hardware probe failed mid-benchmark; keeping samples taken before the failure"
            );
            Ok(collected)
        }
        Err(err) => Err(err.into()),
    }
}
