//! Reference simulation.
//!
//! A small deterministic mass-balance model: a fixed amount of oil is released at
//! step 0 and decays into evaporated and dispersed compartments at first-order
//! rates. Uncertain replicas perturb both rates with a per-replica stream derived
//! from blake3, so a given seed always produces the same bands.
//!
//! The model exists to drive the orchestrator end to end (server, tests,
//! benchmarks). It makes no claim to physical fidelity.

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ValidationError};
use crate::output::{StepOutput, WeatheringRecord};

use super::{SimulationHandle, UncertaintyPolicy};

/// Upper bound on the number of steps of a reference run.
const MAX_TIME_STEPS: usize = 100_000;

/// Upper bound on the number of uncertain replicas.
const MAX_REPLICAS: usize = 64;

/// Configuration of a reference model run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceModelConfig {
    /// Model time of step 0.
    pub start_time: NaiveDateTime,
    /// Length of one time step in seconds.
    pub time_step_secs: u32,
    /// Number of steps in a run.
    pub num_time_steps: usize,
    /// Mass released at step 0.
    pub amount: f64,
    /// First-order evaporation rate per hour.
    pub evaporation_rate: f64,
    /// First-order natural dispersion rate per hour.
    pub dispersion_rate: f64,
    /// Whether runs carry uncertain replicas.
    pub weathering_uncertainty: bool,
    /// Number of uncertain replicas.
    pub replicas: usize,
    /// Relative half-width of the rate perturbation, in `[0, 1)`.
    pub uncertainty_spread: f64,
    /// Seed of the replica perturbation streams.
    pub seed: u64,
}

impl Default for ReferenceModelConfig {
    fn default() -> Self {
        Self {
            start_time: NaiveDate::from_ymd_opt(2014, 8, 6)
                .and_then(|d| d.and_hms_opt(8, 0, 0))
                .unwrap_or_default(),
            time_step_secs: 900,
            num_time_steps: 97,
            amount: 1000.0,
            evaporation_rate: 0.05,
            dispersion_rate: 0.01,
            weathering_uncertainty: true,
            replicas: 4,
            uncertainty_spread: 0.25,
            seed: 0,
        }
    }
}

impl ReferenceModelConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// - `InvalidModelConfig` naming the first out-of-range parameter.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| {
            Err(ValidationError::InvalidModelConfig {
                reason: reason.to_string(),
            })
        };
        if self.time_step_secs == 0 {
            return invalid("time_step_secs must be > 0");
        }
        if self.num_time_steps == 0 || self.num_time_steps > MAX_TIME_STEPS {
            return invalid("num_time_steps must be in 1..=100000");
        }
        if !self.amount.is_finite() || self.amount < 0.0 {
            return invalid("amount must be finite and >= 0");
        }
        if !self.evaporation_rate.is_finite() || self.evaporation_rate < 0.0 {
            return invalid("evaporation_rate must be finite and >= 0");
        }
        if !self.dispersion_rate.is_finite() || self.dispersion_rate < 0.0 {
            return invalid("dispersion_rate must be finite and >= 0");
        }
        if self.replicas > MAX_REPLICAS {
            return invalid("replicas must be <= 64");
        }
        if !(0.0..1.0).contains(&self.uncertainty_spread) {
            return invalid("uncertainty_spread must be in [0, 1)");
        }
        Ok(())
    }

    fn step_hours(&self) -> f64 {
        f64::from(self.time_step_secs) / 3600.0
    }
}

/// Deterministic value in `[-1, 1)` for one replica at one step.
fn perturbation(seed: u64, replica: u64, step: i64, stream: u8) -> f64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    hasher.update(&replica.to_le_bytes());
    hasher.update(&step.to_le_bytes());
    hasher.update(&[stream]);
    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    // 53 high bits give a uniform double in [0, 1).
    #[allow(clippy::cast_precision_loss)]
    let unit = (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64;
    unit.mul_add(2.0, -1.0)
}

/// Reference mass-balance model.
#[derive(Debug, Clone)]
pub struct ReferenceModel {
    config: ReferenceModelConfig,
    replica: Option<u64>,
    current_time_step: i64,
    floating: f64,
    evaporated: f64,
    dispersed: f64,
}

impl ReferenceModel {
    /// Create a nominal model.
    ///
    /// # Errors
    /// - `InvalidModelConfig` if `config` fails validation.
    pub fn new(config: ReferenceModelConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self::build(config, None))
    }

    /// Create uncertain replica `index` of the model described by `config`.
    ///
    /// # Errors
    /// - `InvalidModelConfig` if `config` fails validation.
    pub fn replica(config: ReferenceModelConfig, index: usize) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self::build(config, Some(index as u64)))
    }

    fn build(config: ReferenceModelConfig, replica: Option<u64>) -> Self {
        Self {
            config,
            replica,
            current_time_step: -1,
            floating: 0.0,
            evaporated: 0.0,
            dispersed: 0.0,
        }
    }

    /// The run configuration.
    #[must_use]
    pub fn config(&self) -> &ReferenceModelConfig {
        &self.config
    }

    fn rate_factor(&self, step: i64, stream: u8) -> f64 {
        match self.replica {
            None => 1.0,
            Some(replica) => {
                let u = perturbation(self.config.seed, replica, step, stream);
                u.mul_add(self.config.uncertainty_spread, 1.0)
            }
        }
    }

    fn record(&self, step: u32) -> WeatheringRecord {
        let elapsed = ChronoDuration::seconds(i64::from(self.config.time_step_secs) * i64::from(step));
        WeatheringRecord::new(step, self.config.start_time + elapsed)
            .with_field("amount_released", self.config.amount)
            .with_field("floating", self.floating)
            .with_field("evaporated", self.evaporated)
            .with_field("natural_dispersion", self.dispersed)
    }
}

impl SimulationHandle for ReferenceModel {
    fn step(&mut self) -> Result<StepOutput, ModelError> {
        let next = self.current_time_step + 1;
        let step = u32::try_from(next).map_err(|_| ModelError::step_failed("step counter overflow"))?;
        if step as usize >= self.config.num_time_steps {
            return Err(ModelError::Exhausted);
        }

        if step == 0 {
            self.floating = self.config.amount;
        } else {
            let hours = self.config.step_hours();
            let evap_rate = self.config.evaporation_rate * self.rate_factor(next, 0);
            let disp_rate = self.config.dispersion_rate * self.rate_factor(next, 1);
            let removed = self.floating * (1.0 - (-(evap_rate + disp_rate) * hours).exp());
            let total_rate = evap_rate + disp_rate;
            if total_rate > 0.0 {
                self.evaporated += removed * evap_rate / total_rate;
                self.dispersed += removed * disp_rate / total_rate;
            }
            self.floating -= removed;
        }

        self.current_time_step = next;
        Ok(StepOutput::weathering(self.record(step)))
    }

    fn rewind(&mut self) -> Result<(), ModelError> {
        self.current_time_step = -1;
        self.floating = 0.0;
        self.evaporated = 0.0;
        self.dispersed = 0.0;
        Ok(())
    }

    fn current_time_step(&self) -> i64 {
        self.current_time_step
    }

    fn has_weathering_uncertainty(&self) -> bool {
        self.replica.is_none() && self.config.weathering_uncertainty && self.config.replicas > 0
    }

    fn num_time_steps(&self) -> Option<usize> {
        Some(self.config.num_time_steps)
    }
}

/// Spawns perturbed replicas of a reference model.
#[derive(Debug, Clone)]
pub struct ReferenceUncertainty {
    config: ReferenceModelConfig,
}

impl ReferenceUncertainty {
    /// Create a policy for the model described by `config`.
    #[must_use]
    pub fn new(config: ReferenceModelConfig) -> Self {
        Self { config }
    }
}

impl UncertaintyPolicy for ReferenceUncertainty {
    fn spawn_replicas(&self) -> Result<Vec<Box<dyn SimulationHandle>>, ModelError> {
        (0..self.config.replicas)
            .map(|index| {
                ReferenceModel::replica(self.config.clone(), index)
                    .map(|m| Box::new(m) as Box<dyn SimulationHandle>)
                    .map_err(|e| ModelError::ReplicaSetup {
                        message: e.to_string(),
                    })
            })
            .collect()
    }
}
