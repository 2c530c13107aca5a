//! # gnomestep - gated stepping for long-running spill models
//!
//! gnomestep exposes a stateful, steppable trajectory/weathering simulation through a
//! request/response API. Each session owns at most one active model plus an optional
//! set of uncertain replicas whose outputs bound the nominal run.
//!
//! ## Core Concepts
//!
//! - **Step gate**: a per-model lock serializing every `step`/`rewind`
//! - **Step orchestrator**: first-step initialization, nominal advance, replica fan-out
//! - **Aggregator**: folds replica weathering records into `low`/`high` bands
//! - **Uncertain set**: replica models stepped in parallel on worker threads
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gnomestep::{
//!     ActiveModel, InMemorySessionRegistry, OrchestratorConfig, ReferenceModel,
//!     ReferenceModelConfig, ReferenceUncertainty, SessionId, SessionRegistry, StepOrchestrator,
//! };
//!
//! let registry = Arc::new(InMemorySessionRegistry::default());
//! let config = ReferenceModelConfig::default();
//! let model = ActiveModel::new(
//!     Box::new(ReferenceModel::new(config.clone())?),
//!     Arc::new(ReferenceUncertainty::new(config)),
//! );
//! registry.set_active_model(SessionId::default_session(), model)?;
//!
//! let orchestrator = StepOrchestrator::new(registry, OrchestratorConfig::default())?;
//! let response = orchestrator.advance_step(SessionId::default_session())?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregate;
pub mod config;
pub mod error;
pub mod gate;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod session;
pub mod uncertain;

#[cfg(feature = "transport-http")]
pub mod transport;

pub use aggregate::{aggregate, merge_step_outputs, AggregatedWeathering, StepTimings};
pub use config::{MissingFieldPolicy, OrchestratorConfig, ServerConfig};
pub use error::{
	AggregationError, Diagnostic, GnomeError, GnomeResult, ModelError, StepPhase, ValidationError,
};
pub use gate::{GateGuard, StepGate};
pub use model::reference::{ReferenceModel, ReferenceModelConfig, ReferenceUncertainty};
pub use model::{ModelId, NoUncertainty, SimulationHandle, SimulationState, UncertaintyPolicy};
pub use orchestrator::StepOrchestrator;
pub use output::{
	StepOutput, StepResponse, WeatheringRecord, RESERVED_CHANNELS, WEATHERING_CHANNEL,
};
pub use session::{
	ActiveModel, InMemorySessionRegistry, ModelSlot, ModelSummary, SessionId, SessionRegistry,
};
pub use uncertain::UncertainSet;
