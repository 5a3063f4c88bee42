//! Background hardware sampler.
//!
//! A dedicated thread polls a [`HardwareProbe`] once per period until it is
//! told to stop, then hands the whole sample vector back through its join
//! handle. The stop channel and the join handle are both consumed by
//! [`HardwareSampler::stop`], so neither can be used twice.

use std::io;
use std::process::Command;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::harness::Clock;
use crate::schema::{Reading, Sample};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Status {
        command: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("unexpected probe output {0:?}")]
    Parse(String),

    #[error("{0}")]
    Device(String),
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("sampling period must be non-zero")]
    ZeroPeriod,

    #[error("failed to spawn sampler thread: {0}")]
    Spawn(#[source] io::Error),

    /// The probe failed; polling stopped at that point.
    #[error("hardware probe failed after {} samples: {source}", .collected.len())]
    Probe {
        collected: Vec<Sample>,
        #[source]
        source: ProbeError,
    },

    #[error("sampler thread panicked")]
    Panicked,
}

/// One synchronous hardware reading.
pub trait HardwareProbe {
    fn read(&mut self) -> Result<Reading, ProbeError>;
}

impl<P: HardwareProbe + ?Sized> HardwareProbe for Box<P> {
    fn read(&mut self) -> Result<Reading, ProbeError> {
        (**self).read()
    }
}

pub struct HardwareSampler {
    stop: Sender<()>,
    handle: JoinHandle<Result<Vec<Sample>, SamplerError>>,
}

impl HardwareSampler {
    pub fn start<P>(probe: P, period: Duration, clock: Clock) -> Result<Self, SamplerError>
    where
        P: HardwareProbe + Send + 'static,
    {
        if period.is_zero() {
            return Err(SamplerError::ZeroPeriod);
        }
        let (stop, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("hw-sampler".to_string())
            .spawn(move || poll(probe, period, clock, stop_rx))
            .map_err(SamplerError::Spawn)?;
        debug!(?period, "hardware sampler started");
        Ok(Self { stop, handle })
    }

    /// Signal cancellation and wait for the collected samples.
    pub fn stop(self) -> Result<Vec<Sample>, SamplerError> {
        // The thread may already have exited after a probe failure.
        let _ = self.stop.send(());
        self.handle.join().map_err(|_| SamplerError::Panicked)?
    }
}

fn poll<P: HardwareProbe>(
    mut probe: P,
    period: Duration,
    clock: Clock,
    stop: mpsc::Receiver<()>,
) -> Result<Vec<Sample>, SamplerError> {
    let mut samples = Vec::new();
    let mut next_tick = Instant::now() + period;
    loop {
        let wait = next_tick.saturating_duration_since(Instant::now());
        match stop.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let timestamp = clock.now();
        match probe.read() {
            Ok(reading) => samples.push(Sample::new(timestamp, reading)),
            Err(source) => {
                return Err(SamplerError::Probe {
                    collected: samples,
                    source,
                })
            }
        }

        // Missed ticks are dropped rather than fired back to back.
        next_tick += period;
        let now = Instant::now();
        while next_tick <= now {
            next_tick += period;
        }
    }
    Ok(samples)
}

/// Reads one GPU through `nvidia-smi`.
#[derive(Clone, Debug)]
pub struct NvidiaSmiProbe {
    pub device: u32,
}

impl NvidiaSmiProbe {
    const COMMAND: &'static str = "nvidia-smi";

    pub fn new(device: u32) -> Self {
        Self { device }
    }
}

impl HardwareProbe for NvidiaSmiProbe {
    fn read(&mut self) -> Result<Reading, ProbeError> {
        let output = Command::new(Self::COMMAND)
            .arg("--query-gpu=utilization.gpu,memory.used,power.draw")
            .arg("--format=csv,noheader,nounits")
            .arg(format!("--id={}", self.device))
            .output()
            .map_err(|source| ProbeError::Spawn {
                command: Self::COMMAND,
                source,
            })?;
        if !output.status.success() {
            return Err(ProbeError::Status {
                command: Self::COMMAND,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_smi_line(String::from_utf8_lossy(&output.stdout).trim())
    }
}

/// Parse `"<util %>, <mem MiB>, <power W>"`.
fn parse_smi_line(line: &str) -> Result<Reading, ProbeError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let [util, mem, power] = fields.as_slice() else {
        return Err(ProbeError::Parse(line.to_string()));
    };
    let bad = || ProbeError::Parse(line.to_string());
    let utilization_percent: u32 = util.parse().map_err(|_| bad())?;
    let memory_mib: u64 = mem.parse().map_err(|_| bad())?;
    let power_watts: f64 = power.parse().map_err(|_| bad())?;
    if !power_watts.is_finite() || power_watts < 0.0 {
        return Err(bad());
    }
    Ok(Reading {
        utilization_percent,
        memory_used_bytes: memory_mib * MIB,
        power_milliwatts: (power_watts * 1_000.0).round() as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Steady;

    impl HardwareProbe for Steady {
        fn read(&mut self) -> Result<Reading, ProbeError> {
            Ok(Reading {
                utilization_percent: 40,
                memory_used_bytes: 512 * MIB,
                power_milliwatts: 70_000,
            })
        }
    }

    struct FailsAfter {
        left: usize,
    }

    impl HardwareProbe for FailsAfter {
        fn read(&mut self) -> Result<Reading, ProbeError> {
            if self.left == 0 {
                return Err(ProbeError::Device("GPU is lost".to_string()));
            }
            self.left -= 1;
            Ok(Reading::default())
        }
    }

    struct Counted(Arc<AtomicUsize>);

    impl HardwareProbe for Counted {
        fn read(&mut self) -> Result<Reading, ProbeError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Reading::default())
        }
    }

    #[test]
    fn samples_are_ordered_and_delivered_on_stop() {
        let sampler = HardwareSampler::start(Steady, Duration::from_millis(1), Clock::new()).unwrap();
        thread::sleep(Duration::from_millis(30));
        let samples = sampler.stop().unwrap();
        assert!(samples.len() >= 2, "got {} samples", samples.len());
        assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(samples.iter().all(|s| s.power_milliwatts == 70_000));
    }

    #[test]
    fn immediate_stop_yields_no_samples() {
        let sampler = HardwareSampler::start(Steady, Duration::from_secs(60), Clock::new()).unwrap();
        let started = Instant::now();
        let samples = sampler.stop().unwrap();
        assert!(samples.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn no_polling_after_stop() {
        let reads = Arc::new(AtomicUsize::new(0));
        let sampler =
            HardwareSampler::start(Counted(reads.clone()), Duration::from_millis(1), Clock::new())
                .unwrap();
        thread::sleep(Duration::from_millis(10));
        let samples = sampler.stop().unwrap();
        let after_stop = reads.load(Ordering::SeqCst);
        assert_eq!(after_stop, samples.len());
        thread::sleep(Duration::from_millis(10));
        assert_eq!(reads.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn probe_failure_is_recoverable() {
        let sampler =
            HardwareSampler::start(FailsAfter { left: 3 }, Duration::from_millis(1), Clock::new())
                .unwrap();
        thread::sleep(Duration::from_millis(30));
        match sampler.stop() {
            Err(SamplerError::Probe { collected, source }) => {
                assert_eq!(collected.len(), 3);
                assert!(source.to_string().contains("GPU is lost"));
            }
            other => panic!("expected probe error, got {other:?}"),
        }
    }

    #[test]
    fn zero_period_is_rejected() {
        let err = HardwareSampler::start(Steady, Duration::ZERO, Clock::new())
            .err()
            .unwrap();
        assert!(matches!(err, SamplerError::ZeroPeriod));
    }

    #[test]
    fn parses_nvidia_smi_output() {
        let reading = parse_smi_line("87, 2048, 143.52").unwrap();
        assert_eq!(reading.utilization_percent, 87);
        assert_eq!(reading.memory_used_bytes, 2048 * MIB);
        assert_eq!(reading.power_milliwatts, 143_520);
    }

    #[test]
    fn rejects_unsupported_fields() {
        assert!(parse_smi_line("[N/A], 2048, 143.52").is_err());
        assert!(parse_smi_line("87, 2048").is_err());
    }
}
