//! Recovery of the solver and prover phases hidden inside the prove call.
//!
//! The prover only reports how long each phase took, as entries in its
//! structured log. Which entry belongs to which run depends on the
//! acceleration mode and on how many entries every earlier run produced
//! (a failed verification logs one entry fewer). That coupling is kept in
//! [`LogLayout`] so a change in the prover's log format is a one-place edit.

use chrono::TimeDelta;
use serde_json::Deserializer;
use tracing::{debug, warn};

use crate::error::{BenchError, Result};
use crate::schema::{LogEntry, RecordedRun, RunTimings, Span, Timestamp};

/// Decode a stream of JSON log entries, stopping at the first one that does
/// not parse. Trailing noise is ignored.
pub fn decode_log(log: &str) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    for entry in Deserializer::from_str(log).into_iter::<LogEntry>() {
        match entry {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                debug!(decoded = entries.len(), %err, "log decoding stopped");
                break;
            }
        }
    }
    entries
}

/// Log positions of the two phase durations for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseIndices {
    pub solution: usize,
    pub proof: usize,
}

/// Where the prover's log puts each run's phase durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLayout {
    pub version: u32,
    /// Index of the first prover entry without acceleration.
    pub plain_base: usize,
    /// Index of the first prover entry with acceleration (one extra
    /// device-setup entry precedes it).
    pub accelerated_base: usize,
    /// Entries a run contributes when its proof verifies.
    pub valid_run_entries: usize,
    /// Entries a run contributes when verification fails.
    pub invalid_run_entries: usize,
    /// Entry carrying the curve the prover actually used.
    pub curve_entry: usize,
}

impl LogLayout {
    pub const V1: LogLayout = LogLayout {
        version: 1,
        plain_base: 3,
        accelerated_base: 4,
        valid_run_entries: 3,
        invalid_run_entries: 2,
        curve_entry: 5,
    };

    pub fn base(&self, accelerated: bool) -> usize {
        if accelerated {
            self.accelerated_base
        } else {
            self.plain_base
        }
    }

    fn run_entries(&self, valid: bool) -> usize {
        if valid {
            self.valid_run_entries
        } else {
            self.invalid_run_entries
        }
    }

    /// Entry indices for every run, given each run's verification outcome.
    ///
    /// Run i's solver entry sits at `base - 1 + offset_i` and its prover entry
    /// right after, where `offset_i = 1 + sum(entries of runs 0..i)`.
    pub fn phase_indices(&self, accelerated: bool, validity: &[bool]) -> Vec<PhaseIndices> {
        let base = self.base(accelerated);
        let mut offset = 1;
        validity
            .iter()
            .map(|&valid| {
                let indices = PhaseIndices {
                    solution: base - 1 + offset,
                    proof: base + offset,
                };
                offset += self.run_entries(valid);
                indices
            })
            .collect()
    }
}

impl Default for LogLayout {
    fn default() -> Self {
        Self::V1
    }
}

/// Solver and prover durations for one run, in whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseDurations {
    pub solution_ms: i64,
    pub proof_ms: i64,
}

pub struct LogPhaseReconstructor {
    layout: LogLayout,
    entries: Vec<LogEntry>,
}

impl LogPhaseReconstructor {
    pub fn new(layout: LogLayout, log: &str) -> Self {
        Self {
            layout,
            entries: decode_log(log),
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Curve reported by the prover, if the log got that far.
    pub fn curve(&self) -> Option<&str> {
        self.entries
            .get(self.layout.curve_entry)
            .map(|e| e.curve.as_str())
            .filter(|c| !c.is_empty())
    }

    pub fn durations(&self, accelerated: bool, validity: &[bool]) -> Result<Vec<PhaseDurations>> {
        let indices = self.layout.phase_indices(accelerated, validity);
        indices
            .iter()
            .enumerate()
            .map(|(run, idx)| {
                let entry = |i: usize| {
                    self.entries.get(i).ok_or(BenchError::LogTruncated {
                        run,
                        required: i + 1,
                        available: self.entries.len(),
                    })
                };
                let millis = |i: usize| -> Result<i64> {
                    entry(i)?
                        .duration()
                        .map(|d| d.num_milliseconds())
                        .ok_or(BenchError::LogDurationOutOfRange { run, index: i })
                };
                Ok(PhaseDurations {
                    solution_ms: millis(idx.solution)?,
                    proof_ms: millis(idx.proof)?,
                })
            })
            .collect()
    }

    /// Fill in the solver and prover spans of each run, working backward from
    /// the end of its prove call.
    pub fn reconstruct(&self, accelerated: bool, runs: &[RecordedRun]) -> Result<Vec<RunTimings>> {
        let validity: Vec<bool> = runs.iter().map(|r| r.valid).collect();
        let durations = self.durations(accelerated, &validity)?;
        let indices = self.layout.phase_indices(accelerated, &validity);
        let timings = runs
            .iter()
            .zip(indices.iter().zip(&durations))
            .enumerate()
            .map(|(i, (run, (idx, d)))| derive_timings(i, run, *idx, *d))
            .collect::<Result<Vec<_>>>()?;
        for (i, t) in timings.iter().enumerate() {
            if !t.is_ordered() {
                warn!(
                    run = i,
                    "logged phase durations exceed the prove call; phase boundaries overlap witness generation"
                );
            }
        }
        Ok(timings)
    }
}

fn back_from(end: Timestamp, ms: i64) -> Option<Timestamp> {
    end.checked_sub_signed(TimeDelta::try_milliseconds(ms)?)
}

/// Place run `run`'s phases on the timeline. `indices` only name the log
/// entries in the error when a duration reaches past the representable range.
pub fn derive_timings(
    run: usize,
    recorded: &RecordedRun,
    indices: PhaseIndices,
    durations: PhaseDurations,
) -> Result<RunTimings> {
    let out_of_range = |index| BenchError::LogDurationOutOfRange { run, index };
    let proof_end = recorded.prove_call.end;
    let proof_start =
        back_from(proof_end, durations.proof_ms).ok_or_else(|| out_of_range(indices.proof))?;
    let solution_start = back_from(proof_start, durations.solution_ms)
        .ok_or_else(|| out_of_range(indices.solution))?;
    Ok(RunTimings {
        witness_gen: recorded.witness_gen,
        solution_gen: Span::new(solution_start, proof_start),
        proof_gen: Span::new(proof_start, proof_end),
        prove_call: recorded.prove_call,
        verify: recorded.verify,
        valid: recorded.valid,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::DateTime;

    /// Builds a prover log in layout V1 shape.
    pub(crate) fn layout_v1_log(accelerated: bool, runs: &[(bool, f64, f64)]) -> String {
        let mut lines = vec![
            r#"{"level":"debug","message":"parsed circuit inputs","nbPublic":1}"#.to_string(),
            r#"{"level":"info","message":"building constraint builder","nbConstraints":3}"#
                .to_string(),
            r#"{"level":"debug","message":"setup done","took":4}"#.to_string(),
        ];
        if accelerated {
            lines.push(r#"{"level":"debug","message":"proving key copied to device"}"#.to_string());
        }
        for (valid, solver, prover) in runs {
            lines.push(format!(
                r#"{{"level":"debug","curve":"bn254","backend":"groth16","message":"constraint system solver done","took":{solver}}}"#
            ));
            lines.push(format!(
                r#"{{"level":"debug","curve":"bn254","backend":"groth16","message":"prover done","took":{prover}}}"#
            ));
            if *valid {
                lines.push(
                    r#"{"level":"debug","curve":"bn254","backend":"groth16","message":"verifier done","took":1}"#
                        .to_string(),
                );
            }
        }
        lines.join("\n")
    }

    fn at(ms: i64) -> Timestamp {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + TimeDelta::milliseconds(ms)
    }

    fn recorded(base: i64, prove_ms: i64, valid: bool) -> RecordedRun {
        RecordedRun {
            witness_gen: Span::new(at(base), at(base + 5)),
            prove_call: Span::new(at(base + 6), at(base + 6 + prove_ms)),
            verify: Span::new(at(base + 6 + prove_ms), at(base + 8 + prove_ms)),
            valid,
        }
    }

    #[test]
    fn decode_stops_at_first_bad_entry() {
        let log = "{\"message\":\"a\"}\n{\"message\":\"b\"}\nnot json\n{\"message\":\"c\"}";
        let entries = decode_log(log);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].message, "b");
    }

    #[test]
    fn decode_stops_at_incomplete_entry() {
        let entries = decode_log("{\"message\":\"a\"}\n{\"message\":\"b\",\"took\":");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn decode_stops_at_type_mismatch() {
        let entries = decode_log("{\"took\":1}\n{\"took\":\"slow\"}\n{\"took\":2}");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn index_law_uniform_outcomes() {
        let layout = LogLayout::V1;
        let valid = layout.phase_indices(false, &[true, true, true]);
        assert_eq!(
            valid.iter().map(|i| (i.solution, i.proof)).collect::<Vec<_>>(),
            vec![(3, 4), (6, 7), (9, 10)]
        );
        let invalid = layout.phase_indices(true, &[false, false]);
        assert_eq!(
            invalid.iter().map(|i| (i.solution, i.proof)).collect::<Vec<_>>(),
            vec![(4, 5), (6, 7)]
        );
    }

    #[test]
    fn index_law_accumulates_mixed_outcomes() {
        let idx = LogLayout::V1.phase_indices(false, &[false, true, false, true]);
        assert_eq!(
            idx.iter().map(|i| i.solution).collect::<Vec<_>>(),
            vec![3, 5, 8, 10]
        );
    }

    #[test]
    fn reconstructs_backward_from_prove_call_end() {
        for accelerated in [false, true] {
            let outcomes = [(true, 12.7, 30.2), (false, 9.0, 25.9), (true, 11.0, 31.0)];
            let log = layout_v1_log(accelerated, &outcomes);
            let runs = vec![
                recorded(0, 50, true),
                recorded(100, 40, false),
                recorded(200, 45, true),
            ];
            let rec = LogPhaseReconstructor::new(LogLayout::V1, &log);
            let timings = rec.reconstruct(accelerated, &runs).unwrap();

            let expected = [(12, 30), (9, 25), (11, 31)];
            for ((t, run), (sol, proof)) in timings.iter().zip(&runs).zip(expected) {
                assert_eq!(t.proof_gen.end, run.prove_call.end);
                assert_eq!(t.proof_gen.start, run.prove_call.end - TimeDelta::milliseconds(proof));
                assert_eq!(t.solution_gen.end, t.proof_gen.start);
                assert_eq!(t.solution_gen.start, t.proof_gen.start - TimeDelta::milliseconds(sol));
                assert_eq!(t.valid, run.valid);
                assert!(t.is_ordered());
            }
        }
    }

    #[test]
    fn curve_comes_from_layout_entry() {
        let log = layout_v1_log(false, &[(true, 1.0, 2.0)]);
        let rec = LogPhaseReconstructor::new(LogLayout::V1, &log);
        assert_eq!(rec.curve(), Some("bn254"));

        let short = LogPhaseReconstructor::new(LogLayout::V1, "{\"message\":\"x\"}");
        assert_eq!(short.curve(), None);
    }

    #[test]
    fn short_log_is_an_error() {
        let log = layout_v1_log(false, &[(true, 1.0, 2.0)]);
        let rec = LogPhaseReconstructor::new(LogLayout::V1, &log);
        let err = rec
            .reconstruct(false, &[recorded(0, 10, true), recorded(50, 10, true)])
            .unwrap_err();
        match err {
            BenchError::LogTruncated {
                run,
                required,
                available,
            } => {
                assert_eq!(run, 1);
                assert_eq!(required, 7);
                assert_eq!(available, 6);
            }
            other => panic!("expected LogTruncated, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_duration_is_an_error() {
        let header = [
            r#"{"message":"parsed circuit inputs"}"#,
            r#"{"message":"building constraint builder"}"#,
            r#"{"message":"setup done","took":4}"#,
        ]
        .join("\n");
        for (took, index) in [("1e20", 4), ("-1e20", 4)] {
            let log = format!("{header}\n{{\"took\":1}}\n{{\"took\":{took}}}\n{{\"took\":1}}");
            let rec = LogPhaseReconstructor::new(LogLayout::V1, &log);
            assert_eq!(rec.entries().len(), 6);
            let err = rec.reconstruct(false, &[recorded(0, 10, true)]).unwrap_err();
            assert!(
                matches!(err, BenchError::LogDurationOutOfRange { run: 0, index: i } if i == index),
                "took {took}: got {err:?}"
            );
        }

        let log = format!("{header}\n{{\"took\":-1e20}}\n{{\"took\":2}}");
        let err = LogPhaseReconstructor::new(LogLayout::V1, &log)
            .reconstruct(false, &[recorded(0, 10, true)])
            .unwrap_err();
        assert!(matches!(
            err,
            BenchError::LogDurationOutOfRange { run: 0, index: 3 }
        ));
    }

    #[test]
    fn overlong_phases_are_flagged_not_clamped() {
        let log = layout_v1_log(false, &[(true, 40.0, 40.0)]);
        let rec = LogPhaseReconstructor::new(LogLayout::V1, &log);
        let timings = rec.reconstruct(false, &[recorded(0, 50, true)]).unwrap();
        assert!(!timings[0].is_ordered());
        assert_eq!(timings[0].solution_gen.start, at(6 + 50 - 80));
    }
}
