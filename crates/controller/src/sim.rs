//! Stateful soil moisture probe simulator for local development.
//!
//! Models a capacitive probe on a 12-bit ADC:
//! - Temporal coherence via random walk with mean reversion
//! - Gradual drying drift (evaporation)
//! - Per-reading ADC electronic noise
//! - Occasional spikes (exercise the anomaly filter)
//! - Occasional saturated reads (loose probe wire)
//! - Closed-loop watering response (moisture rises while the pump runs)

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::outputs::Outputs;
use crate::sensor::MoistureSensor;

/// Saturated 12-bit reading; the default malfunction sentinel.
const ADC_MAX: i32 = 4095;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries steadily, so watering triggers within a
    /// few samples of crossing the threshold.
    Drying,
    /// Hovers near the centre.  Low noise, rare spikes.
    Stable,
    /// High noise, frequent spikes, and the odd saturated read.  Tests the
    /// anomaly filter and the malfunction path.
    Flaky,
    /// Starts near the wet end and barely moves.  The pump should stay off.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// Produces realistic soil moisture ADC readings for one probe.
pub struct SoilMoistureSim {
    /// Current "true" soil moisture in ADC units.  Evolves each sample.
    base: f64,

    raw_dry: f64,
    raw_wet: f64,

    // Random walk parameters
    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    center: f64,
    noise_sigma: f64,

    // Glitch parameters
    spike_prob: f32,
    spike_sigma: f64,
    saturate_prob: f32,
    /// Value reported by a saturated read.
    sentinel: i32,

    // Watering response
    watering: bool,
    wet_rate: f64,
}

impl SoilMoistureSim {
    /// `raw_dry` / `raw_wet` are the probe's readings in dry air and in
    /// water (typically ~3300 / ~1300 on a 12-bit ADC).
    pub fn new(scenario: Scenario, raw_dry: f64, raw_wet: f64) -> Self {
        let range = raw_dry - raw_wet;
        let center = (raw_dry + raw_wet) / 2.0;

        let (
            drift,
            walk_sigma,
            mean_rev,
            noise_sigma,
            spike_prob,
            spike_sigma,
            saturate_prob,
            start_frac,
        ) = match scenario {
            // start_frac: 0.0 = at raw_wet (wettest), 1.0 = at raw_dry (driest)
            Scenario::Drying => (25.0, 15.0, 0.0, 8.0, 0.02_f32, 600.0, 0.0_f32, 0.55),
            Scenario::Stable => (0.5, 6.0, 0.05, 4.0, 0.005, 300.0, 0.0, 0.5),
            Scenario::Flaky => (5.0, 25.0, 0.02, 20.0, 0.10, 900.0, 0.03, 0.5),
            Scenario::Wet => (1.0, 8.0, 0.02, 6.0, 0.01, 400.0, 0.0, 0.1),
        };

        let start_base = raw_wet + start_frac * range;

        Self {
            base: (start_base + gaussian(0.0, range * 0.02)).clamp(raw_wet, raw_dry),
            raw_dry,
            raw_wet,
            drift_per_sample: drift,
            walk_sigma,
            mean_reversion: mean_rev,
            center,
            noise_sigma,
            spike_prob,
            spike_sigma,
            saturate_prob,
            sentinel: ADC_MAX,
            watering: false,
            wet_rate: -range * 0.04,
        }
    }

    /// Report saturated reads as `sentinel` instead of the 12-bit maximum.
    pub fn with_sentinel(mut self, sentinel: i32) -> Self {
        self.sentinel = sentinel;
        self
    }

    /// Inform the simulator whether the pump is currently running.
    pub fn set_watering(&mut self, active: bool) {
        self.watering = active;
    }

    /// Produce the next ADC reading.  The internal base value evolves with
    /// each call, so call frequency matters.
    pub fn sample(&mut self) -> i32 {
        if fastrand::f32() < self.saturate_prob {
            return self.sentinel;
        }

        // -- Evolve the base value ----------------------------------------

        let pull = self.mean_reversion * (self.center - self.base);
        let walk = gaussian(0.0, self.walk_sigma);
        // Drying drift (positive = toward raw_dry = drier)
        let drift = self.drift_per_sample;
        // Watering effect (negative = toward raw_wet = wetter)
        let wet = if self.watering { self.wet_rate } else { 0.0 };

        self.base = (self.base + drift + pull + walk + wet)
            .clamp(self.raw_wet - 100.0, self.raw_dry + 100.0);

        // -- Build the instantaneous reading ------------------------------

        let noise = gaussian(0.0, self.noise_sigma);
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        // Keep ordinary readings one count below saturation so only the
        // deliberate fault path produces the sentinel.
        (self.base + noise + spike)
            .round()
            .clamp(0.0, f64::from(self.sentinel - 1)) as i32
    }
}

// ---------------------------------------------------------------------------
// Capability adapters
// ---------------------------------------------------------------------------

/// Shared simulator handle.  The same plant backs both the sensor and the
/// pump, so watering feeds back into later readings.
#[derive(Clone)]
pub struct SimulatedPlant {
    sim: Arc<Mutex<SoilMoistureSim>>,
}

impl SimulatedPlant {
    pub fn new(sim: SoilMoistureSim) -> Self {
        Self {
            sim: Arc::new(Mutex::new(sim)),
        }
    }

    /// Wrap real or mock outputs so pump changes also reach the simulator.
    pub fn outputs<O: Outputs>(&self, inner: O) -> SimOutputs<O> {
        SimOutputs {
            inner,
            plant: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SoilMoistureSim> {
        // A poisoned lock only means a panic mid-sample; the state is still usable.
        self.sim.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MoistureSensor for SimulatedPlant {
    fn read_moisture(&mut self) -> anyhow::Result<i32> {
        Ok(self.lock().sample())
    }
}

pub struct SimOutputs<O> {
    inner: O,
    plant: SimulatedPlant,
}

impl<O: Outputs> Outputs for SimOutputs<O> {
    fn set_pump(&mut self, on: bool) {
        self.plant.lock().set_watering(on);
        self.inner.set_pump(on);
    }

    fn set_indicator(&mut self, on: bool) {
        self.inner.set_indicator(on);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingOutputs;

    /// Helper: collect N samples.
    fn collect_samples(sim: &mut SoilMoistureSim, n: usize) -> Vec<i32> {
        (0..n).map(|_| sim.sample()).collect()
    }

    #[test]
    fn readings_within_adc_range() {
        let mut sim = SoilMoistureSim::new(Scenario::Flaky, 3300.0, 1300.0);
        for v in collect_samples(&mut sim, 1000) {
            assert!((0..=4095).contains(&v), "ADC out of range: {v}");
        }
    }

    #[test]
    fn only_flaky_saturates() {
        let mut sim = SoilMoistureSim::new(Scenario::Drying, 3300.0, 1300.0);
        assert!(collect_samples(&mut sim, 500).iter().all(|&v| v < 4095));
    }

    #[test]
    fn flaky_eventually_saturates() {
        let mut sim = SoilMoistureSim::new(Scenario::Flaky, 3300.0, 1300.0);
        // 3% per sample: the chance of zero hits in 2000 draws is negligible.
        assert!(collect_samples(&mut sim, 2000).contains(&4095));
    }

    #[test]
    fn saturated_reads_use_configured_sentinel() {
        let mut sim = SoilMoistureSim::new(Scenario::Flaky, 3300.0, 1300.0)
            .with_sentinel(3500);
        let samples = collect_samples(&mut sim, 2000);
        assert!(samples.contains(&3500));
        assert!(samples.iter().all(|&v| v <= 3500));
        assert!(!samples.contains(&4095));
    }

    #[test]
    fn temporal_coherence() {
        let mut sim = SoilMoistureSim::new(Scenario::Stable, 3300.0, 1300.0);
        let samples = collect_samples(&mut sim, 100);
        let max_jump: i32 = samples
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .max()
            .unwrap();
        // Allow for the rare spike; the full range is 2000.
        assert!(max_jump < 1500, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn drying_trends_upward() {
        let mut sim = SoilMoistureSim::new(Scenario::Drying, 3300.0, 1300.0);
        let first: f64 = (0..10).map(|_| sim.sample() as f64).sum::<f64>() / 10.0;
        for _ in 0..30 {
            sim.sample();
        }
        let later: f64 = (0..10).map(|_| sim.sample() as f64).sum::<f64>() / 10.0;
        assert!(later > first, "drying should raise readings: {first:.0} -> {later:.0}");
    }

    #[test]
    fn watering_decreases_readings() {
        let mut sim = SoilMoistureSim::new(Scenario::Drying, 3300.0, 1300.0);
        for _ in 0..20 {
            sim.sample();
        }
        let before: f64 = (0..10).map(|_| sim.sample() as f64).sum::<f64>() / 10.0;

        sim.set_watering(true);
        for _ in 0..20 {
            sim.sample();
        }
        let after: f64 = (0..10).map(|_| sim.sample() as f64).sum::<f64>() / 10.0;

        assert!(
            after < before,
            "watering should decrease readings: before={before:.0} after={after:.0}"
        );
    }

    #[test]
    fn wet_scenario_starts_low() {
        let mut sim = SoilMoistureSim::new(Scenario::Wet, 3300.0, 1300.0);
        let avg: f64 = (0..10).map(|_| sim.sample() as f64).sum::<f64>() / 10.0;
        assert!(avg < 2300.0, "wet scenario should start below midpoint: {avg:.0}");
    }

    #[test]
    fn pump_output_reaches_simulator() {
        let plant = SimulatedPlant::new(SoilMoistureSim::new(Scenario::Stable, 3300.0, 1300.0));
        let mut outputs = plant.outputs(RecordingOutputs::default());

        outputs.set_pump(true);
        assert!(plant.lock().watering);
        assert_eq!(outputs.inner.pump, Some(true));

        outputs.set_pump(false);
        outputs.set_indicator(true);
        assert!(!plant.lock().watering);
        assert_eq!(outputs.inner.indicator, Some(true));
    }

    #[test]
    fn plant_reads_through_sensor_trait() {
        let mut plant = SimulatedPlant::new(SoilMoistureSim::new(Scenario::Wet, 3300.0, 1300.0));
        let raw = plant.read_moisture().unwrap();
        assert!((0..4095).contains(&raw));
    }

    #[test]
    fn scenario_names_round_trip_through_env_value() {
        for scenario in [Scenario::Drying, Scenario::Stable, Scenario::Flaky, Scenario::Wet] {
            let env_value = scenario.to_string().to_uppercase();
            assert_eq!(Scenario::from_str_lossy(&env_value), scenario);
        }
        assert_eq!(Scenario::from_str_lossy("monsoon"), Scenario::Drying);
    }
}
