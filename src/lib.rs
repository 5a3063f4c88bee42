use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub mod error;
pub mod harness;
pub mod phases;
pub mod report;
pub mod sampler;
pub mod schema;
pub mod series;
pub mod synthetic;

pub use error::{BenchError, Result};

/// Where the prover runs its heavy arithmetic.
#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accelerator {
    /// Plain CPU proving; no hardware sampling.
    #[default]
    Cpu,
    /// GPU-accelerated proving; the hardware sampler runs alongside.
    Gpu,
}

impl Accelerator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Accelerator::Cpu => "CPU",
            Accelerator::Gpu => "GPU",
        }
    }
}

/// Curves the prover can be configured with.
#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum Curve {
    #[default]
    #[value(name = "bn254")]
    Bn254,
    #[value(name = "bls12_377")]
    Bls12_377,
    #[value(name = "bls12_381")]
    Bls12_381,
    #[value(name = "bw6_761")]
    Bw6_761,
}

impl Curve {
    pub fn as_str(&self) -> &'static str {
        match self {
            Curve::Bn254 => "bn254",
            Curve::Bls12_377 => "bls12_377",
            Curve::Bls12_381 => "bls12_381",
            Curve::Bw6_761 => "bw6_761",
        }
    }
}
