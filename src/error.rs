use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::sampler::SamplerError;
use crate::series::SeriesError;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("benchmark has no runs")]
    NoRuns,

    #[error("run count {declared} does not match {recorded} recorded runs")]
    RunCountMismatch { declared: usize, recorded: usize },

    /// The workload log ended before the entry the index law points at.
    #[error("log truncated: run {run} needs entry {required} but only {available} entries decoded")]
    LogTruncated {
        run: usize,
        required: usize,
        available: usize,
    },

    /// A phase duration parsed but cannot be placed on the timeline.
    #[error("log entry {index} for run {run} has an out-of-range duration")]
    LogDurationOutOfRange { run: usize, index: usize },

    #[error("hardware samples are not in strictly increasing time order at sample {index}")]
    UnsortedSamples { index: usize },

    #[error("acceleration is enabled but no hardware samples were captured")]
    MissingSamples,

    #[error("workload failed during {phase}: {message}")]
    Workload { phase: &'static str, message: String },

    #[error("hardware statistics for {window}: {source}")]
    Series {
        window: String,
        #[source]
        source: SeriesError,
    },

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error("failed to write {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, BenchError>;
