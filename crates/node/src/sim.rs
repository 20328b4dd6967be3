//! Field simulator for local development: one soil-moisture probe and one
//! flow meter downstream of the pump.
//!
//! Moisture follows a random walk that dries with evaporation and rises
//! while the pump runs. The flow meter only accrues volume while the pump is
//! on.

use std::fmt;

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

/// Pre-configured field profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts just above the gateway's 15% limit and dries steadily, so the
    /// gateway should start irrigating after a few samples.
    Drying,
    /// Hovers around 20%. Low noise.
    Stable,
    /// Starts saturated. The gateway should keep the motor off.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "wet" => Self::Wet,
            _ => Self::Drying, // default
        }
    }

    /// (start %, drying per sample, noise sigma)
    fn params(self) -> (f64, f64, f64) {
        match self {
            Self::Drying => (18.0, 0.4, 0.5),
            Self::Stable => (20.0, 0.05, 0.2),
            Self::Wet => (45.0, 0.1, 0.4),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// One sampling tick's worth of telemetry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Millilitres through the meter since the previous sample.
    pub volume_ml: f64,
    pub soil_moisture_pct: f64,
}

pub struct FieldSim {
    /// "True" volumetric moisture, evolves every tick.
    moisture: f64,
    dry_rate: f64,
    noise_sigma: f64,

    pump_on: bool,
    /// Moisture gained per tick while the pump runs.
    wet_rate: f64,
    /// Nominal millilitres per tick while the pump runs.
    flow_ml: f64,
}

impl FieldSim {
    /// `flow_ml` is the nominal volume delivered per sample while pumping.
    pub fn new(scenario: Scenario, flow_ml: f64) -> Self {
        let (start, dry_rate, noise_sigma) = scenario.params();
        Self {
            moisture: start,
            dry_rate,
            noise_sigma,
            pump_on: false,
            wet_rate: 1.5,
            flow_ml,
        }
    }

    /// Switch the simulated pump, as commanded by the gateway.
    pub fn set_pump(&mut self, on: bool) {
        self.pump_on = on;
    }

    pub fn pump_on(&self) -> bool {
        self.pump_on
    }

    /// Advance one tick and read both instruments.
    pub fn sample(&mut self) -> Sample {
        let wet = if self.pump_on { self.wet_rate } else { 0.0 };
        let walk = gaussian(0.0, self.noise_sigma * 0.5);
        self.moisture = (self.moisture - self.dry_rate + wet + walk).clamp(0.0, 100.0);

        let volume_ml = if self.pump_on {
            gaussian(self.flow_ml, self.flow_ml * 0.05).max(0.0)
        } else {
            0.0
        };

        // Probe noise on top of the true value.
        let reading = (self.moisture + gaussian(0.0, self.noise_sigma)).clamp(0.0, 100.0);

        Sample {
            volume_ml: volume_ml.round(),
            soil_moisture_pct: (reading * 10.0).round() / 10.0,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
