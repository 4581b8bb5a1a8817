//! Soil-moisture sampling on top of an analog-read capability.
//!
//! A reading equal to the configured sentinel (the ADC's saturated value)
//! means the probe is disconnected or shorted.  Such samples are reported as
//! [`Sample::Malfunction`] and must not reach the state machine or the
//! anomaly baseline.

use tokio::time::Instant;

/// Analog-read capability for one moisture probe.
pub trait MoistureSensor {
    /// Raw ADC counts; higher means drier soil.
    fn read_moisture(&mut self) -> anyhow::Result<i32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoistureReading {
    pub raw: i32,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    Valid(MoistureReading),
    Malfunction(MoistureReading),
}

impl Sample {
    pub fn reading(&self) -> MoistureReading {
        match self {
            Self::Valid(r) | Self::Malfunction(r) => *r,
        }
    }
}

pub struct Sampler<S> {
    sensor: S,
    sentinel: i32,
}

impl<S: MoistureSensor> Sampler<S> {
    pub fn new(sensor: S, sentinel: i32) -> Self {
        Self { sensor, sentinel }
    }

    /// Take one reading.  Driver errors are folded into a malfunction sample
    /// carrying the sentinel value.
    pub fn sample(&mut self, now: Instant) -> Sample {
        let raw = match self.sensor.read_moisture() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("moisture read failed: {e:#}");
                self.sentinel
            }
        };

        let reading = MoistureReading { raw, at: now };
        if raw == self.sentinel {
            Sample::Malfunction(reading)
        } else {
            Sample::Valid(reading)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
