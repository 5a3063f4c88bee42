use std::fs;
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::Accelerator;

pub type Timestamp = DateTime<Utc>;

/// Whole milliseconds from `start` to `end`, truncated toward zero.
pub fn millis_between(start: Timestamp, end: Timestamp) -> i64 {
    (end - start).num_milliseconds()
}

/// Whole microseconds from `start` to `end`, truncated toward zero.
pub fn micros_between(start: Timestamp, end: Timestamp) -> i64 {
    let delta = end - start;
    delta
        .num_microseconds()
        .unwrap_or_else(|| delta.num_milliseconds().saturating_mul(1_000))
}

/// Milliseconds since `origin` with microsecond resolution.
pub fn offset_ms(origin: Timestamp, at: Timestamp) -> f64 {
    micros_between(origin, at) as f64 / 1_000.0
}

/// One decoded line of the prover's structured log.
///
/// Field names follow the prover's JSON keys; anything missing decodes to its
/// zero value so sparse entries still occupy their slot in the index order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogEntry {
    pub level: String,
    #[serde(rename = "time")]
    pub timestamp: String,
    pub message: String,
    pub curve: String,
    #[serde(rename = "nbConstraints")]
    pub constraint_count: u64,
    #[serde(rename = "acceleration")]
    pub acceleration_mode: String,
    pub backend: String,
    #[serde(rename = "took")]
    pub duration_millis: f64,
}

impl LogEntry {
    /// Reported duration, truncated to whole milliseconds. `None` when the
    /// value does not fit in a `TimeDelta`.
    pub fn duration(&self) -> Option<TimeDelta> {
        TimeDelta::try_milliseconds(self.duration_millis.trunc() as i64)
    }
}

/// A single raw reading from a hardware probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    pub utilization_percent: u32,
    pub memory_used_bytes: u64,
    pub power_milliwatts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub utilization_percent: u32,
    pub memory_used_bytes: u64,
    pub power_milliwatts: u32,
}

impl Sample {
    pub fn new(timestamp: Timestamp, reading: Reading) -> Self {
        Self {
            timestamp,
            utilization_percent: reading.utilization_percent,
            memory_used_bytes: reading.memory_used_bytes,
            power_milliwatts: reading.power_milliwatts,
        }
    }
}

/// A closed interval observed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Span {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> i64 {
        millis_between(self.start, self.end)
    }
}

/// What the caller sees of one run: the prove call is opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedRun {
    pub witness_gen: Span,
    pub prove_call: Span,
    pub verify: Span,
    pub valid: bool,
}

/// Full phase breakdown of one run once the log has been reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTimings {
    pub witness_gen: Span,
    pub solution_gen: Span,
    pub proof_gen: Span,
    pub prove_call: Span,
    pub verify: Span,
    pub valid: bool,
}

impl RunTimings {
    /// witness ≤ solution ≤ proof == prove call end ≤ verify.
    pub fn is_ordered(&self) -> bool {
        self.witness_gen.start <= self.witness_gen.end
            && self.witness_gen.end <= self.solution_gen.start
            && self.solution_gen.start <= self.solution_gen.end
            && self.solution_gen.end == self.proof_gen.start
            && self.proof_gen.start <= self.proof_gen.end
            && self.proof_gen.end == self.prove_call.end
            && self.prove_call.end <= self.verify.start
            && self.verify.start <= self.verify.end
    }

    /// Wall time from witness generation start to verification end.
    pub fn full_run(&self) -> Span {
        Span::new(self.witness_gen.start, self.verify.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitMeta {
    pub name: String,
    pub curve: String,
    pub constraint_count: u64,
    pub accelerator: Accelerator,
}

/// Everything captured while a benchmark executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkRun {
    pub circuit: CircuitMeta,
    pub arithmetization: Span,
    pub setup: Span,
    pub run_count: usize,
    pub runs: Vec<RecordedRun>,
    pub samples: Option<Vec<Sample>>,
    pub log: String,
}

impl BenchmarkRun {
    pub fn is_accelerated(&self) -> bool {
        self.circuit.accelerator == Accelerator::Gpu
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Contents of `benchmark_parameters.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkParameters {
    #[serde(rename = "Circuit")]
    pub circuit: String,
    #[serde(rename = "Curve")]
    pub curve: String,
    #[serde(rename = "Accelerator")]
    pub accelerator: String,
    #[serde(rename = "Number of runs")]
    pub run_count: usize,
    #[serde(rename = "Number of constraints")]
    pub constraint_count: u64,
    #[serde(rename = "Arithmatization duration")]
    pub arithmetization_ms: i64,
    #[serde(rename = "Setup duration")]
    pub setup_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_decodes_prover_keys() {
        let line = r#"{"level":"debug","time":"2024-05-01T10:00:00Z","message":"prover done","curve":"bn254","nbConstraints":3,"acceleration":"none","backend":"groth16","took":12.9}"#;
        let entry: LogEntry = serde_json::from_str(line).unwrap();
        assert_eq!(entry.message, "prover done");
        assert_eq!(entry.curve, "bn254");
        assert_eq!(entry.constraint_count, 3);
        assert_eq!(entry.acceleration_mode, "none");
        assert_eq!(entry.duration(), Some(TimeDelta::milliseconds(12)));
    }

    #[test]
    fn log_entry_duration_out_of_range_is_none() {
        let entry: LogEntry = serde_json::from_str(r#"{"took":-1e20}"#).unwrap();
        assert_eq!(entry.duration(), None);
    }

    #[test]
    fn log_entry_missing_fields_are_zero() {
        let entry: LogEntry = serde_json::from_str(r#"{"message":"compiling circuit"}"#).unwrap();
        assert_eq!(entry.duration_millis, 0.0);
        assert!(entry.curve.is_empty());
    }

    #[test]
    fn parameters_use_report_keys() {
        let params = BenchmarkParameters {
            circuit: "cubic".to_string(),
            curve: "bn254".to_string(),
            accelerator: "CPU".to_string(),
            run_count: 2,
            constraint_count: 3,
            arithmetization_ms: 5,
            setup_ms: 7,
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["Number of runs"], 2);
        assert_eq!(value["Arithmatization duration"], 5);
        assert_eq!(value["Accelerator"], "CPU");
    }

    #[test]
    fn capture_survives_save_and_load() {
        let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let span = |a: i64, b: i64| {
            Span::new(t0 + TimeDelta::milliseconds(a), t0 + TimeDelta::milliseconds(b))
        };
        let run = BenchmarkRun {
            circuit: CircuitMeta {
                name: "cubic".to_string(),
                curve: "bn254".to_string(),
                constraint_count: 3,
                accelerator: Accelerator::Gpu,
            },
            arithmetization: span(0, 4),
            setup: span(4, 9),
            run_count: 1,
            runs: vec![RecordedRun {
                witness_gen: span(10, 12),
                prove_call: span(12, 40),
                verify: span(40, 41),
                valid: true,
            }],
            samples: Some(vec![Sample::new(
                t0 + TimeDelta::microseconds(10_500),
                Reading {
                    utilization_percent: 77,
                    memory_used_bytes: 1 << 30,
                    power_milliwatts: 120_500,
                },
            )]),
            log: "{\"message\":\"prover done\",\"took\":3}\n".to_string(),
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.json");
        run.save(&path).unwrap();
        let loaded = BenchmarkRun::load(&path).unwrap();

        assert!(loaded.is_accelerated());
        assert_eq!(loaded.circuit, run.circuit);
        assert_eq!(loaded.runs, run.runs);
        assert_eq!(loaded.samples, run.samples);
        assert_eq!(loaded.log, run.log);
    }

    #[test]
    fn micros_and_millis_truncate() {
        let a = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let b = a + TimeDelta::microseconds(2_999);
        assert_eq!(millis_between(a, b), 2);
        assert_eq!(micros_between(a, b), 2_999);
        assert!((offset_ms(a, b) - 2.999).abs() < 1e-9);
    }
}
