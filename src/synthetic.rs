//! Deterministic stand-in for a real prover.
//!
//! Sleeps for seeded phase durations and writes a log shaped like the prover's
//! (layout V1), so the whole pipeline can run on machines without a prover or
//! a GPU. The same seed always yields the same durations and outcomes.

use std::thread;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;

use crate::error::Result;
use crate::harness::Workload;
use crate::phases::LogLayout;
use crate::sampler::{HardwareProbe, ProbeError};
use crate::schema::{CircuitMeta, Reading};
use crate::{Accelerator, Curve};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub circuit: String,
    pub curve: Curve,
    pub constraint_count: u64,
    pub runs: usize,
    pub accelerator: Accelerator,
    pub seed: u64,
    /// Probability that a run's proof fails verification.
    pub invalid_rate: f64,
    /// Solver and prover phases are drawn from this range, in milliseconds.
    pub phase_ms: (u64, u64),
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            circuit: "cubic".to_string(),
            curve: Curve::Bn254,
            constraint_count: 3,
            runs: 10,
            accelerator: Accelerator::Cpu,
            seed: 42,
            invalid_rate: 0.0,
            phase_ms: (5, 20),
        }
    }
}

fn per_run_seed(master_seed: u64, run: usize) -> u64 {
    master_seed
        .wrapping_add(run as u64)
        .wrapping_mul(0x517cc1b727220a95)
}

/// Planned behaviour of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPlan {
    pub witness_ms: u64,
    pub solver_ms: u64,
    pub prover_ms: u64,
    pub verify_ms: u64,
    pub valid: bool,
}

impl RunPlan {
    fn draw(cfg: &SyntheticConfig, run: usize) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(per_run_seed(cfg.seed, run));
        let (lo, hi) = (cfg.phase_ms.0, cfg.phase_ms.1.max(cfg.phase_ms.0));
        Self {
            witness_ms: rng.gen_range(1..=3),
            solver_ms: rng.gen_range(lo..=hi),
            prover_ms: rng.gen_range(lo..=hi),
            verify_ms: rng.gen_range(1..=3),
            valid: !rng.gen_bool(cfg.invalid_rate.clamp(0.0, 1.0)),
        }
    }
}

pub struct SyntheticWorkload {
    cfg: SyntheticConfig,
    plans: Vec<RunPlan>,
    log: Vec<String>,
}

impl SyntheticWorkload {
    pub fn new(cfg: SyntheticConfig) -> Self {
        let plans = (0..cfg.runs).map(|run| RunPlan::draw(&cfg, run)).collect();
        Self {
            cfg,
            plans,
            log: Vec::new(),
        }
    }

    pub fn plans(&self) -> &[RunPlan] {
        &self.plans
    }

    fn accelerated(&self) -> bool {
        self.cfg.accelerator == Accelerator::Gpu
    }

    fn emit(&mut self, level: &str, message: &str, took_ms: Option<u64>) {
        let acceleration = if self.accelerated() { "icicle" } else { "none" };
        let mut entry = json!({
            "level": level,
            "time": chrono::Utc::now().to_rfc3339(),
            "message": message,
            "curve": self.cfg.curve.as_str(),
            "nbConstraints": self.cfg.constraint_count,
            "acceleration": acceleration,
            "backend": "groth16",
        });
        if let Some(took) = took_ms {
            entry["took"] = json!(took);
        }
        self.log.push(entry.to_string());
    }
}

fn sleep_ms(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}

impl Workload for SyntheticWorkload {
    fn circuit(&self) -> CircuitMeta {
        CircuitMeta {
            name: self.cfg.circuit.clone(),
            curve: self.cfg.curve.as_str().to_string(),
            constraint_count: self.cfg.constraint_count,
            accelerator: self.cfg.accelerator,
        }
    }

    fn run_count(&self) -> usize {
        self.cfg.runs
    }

    fn arithmetize(&mut self) -> Result<()> {
        self.emit("info", "parsed circuit inputs", None);
        sleep_ms(2);
        self.emit("info", "building constraint builder", None);
        Ok(())
    }

    fn setup(&mut self) -> Result<()> {
        sleep_ms(3);
        self.emit("debug", "setup done", Some(3));
        if self.accelerated() {
            self.emit("debug", "proving key copied to device", None);
        }
        debug_assert_eq!(self.log.len(), LogLayout::V1.base(self.accelerated()));
        Ok(())
    }

    fn generate_witness(&mut self, run: usize) -> Result<()> {
        sleep_ms(self.plans[run].witness_ms);
        Ok(())
    }

    fn prove(&mut self, run: usize) -> Result<()> {
        let plan = self.plans[run];
        sleep_ms(plan.solver_ms);
        self.emit("debug", "constraint system solver done", Some(plan.solver_ms));
        sleep_ms(plan.prover_ms);
        self.emit("debug", "prover done", Some(plan.prover_ms));
        Ok(())
    }

    fn verify(&mut self, run: usize) -> bool {
        let plan = self.plans[run];
        sleep_ms(plan.verify_ms);
        if plan.valid {
            self.emit("debug", "verifier done", Some(plan.verify_ms));
        }
        plan.valid
    }

    fn take_log(&mut self) -> String {
        let mut out = self.log.join("\n");
        out.push('\n');
        self.log.clear();
        out
    }
}

/// Seeded GPU readings drawn uniformly from plausible ranges.
pub struct SyntheticProbe {
    rng: ChaCha8Rng,
}

impl SyntheticProbe {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl HardwareProbe for SyntheticProbe {
    fn read(&mut self) -> std::result::Result<Reading, ProbeError> {
        Ok(Reading {
            utilization_percent: self.rng.gen_range(20..=100),
            memory_used_bytes: self.rng.gen_range(512..=4096) * MIB,
            power_milliwatts: self.rng.gen_range(60_000..=250_000),
        })
    }
}
