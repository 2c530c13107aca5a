//! Session contexts.
//!
//! A session owns at most one `ActiveModel`. The active model owns its step
//! gate, and the gate owns everything a step may mutate: the nominal handle,
//! the uncertain set, and the lifecycle state. Unrelated sessions therefore never
//! contend on the same gate.

mod memory;

pub use memory::InMemorySessionRegistry;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GnomeResult, ModelError, ValidationError};
use crate::gate::StepGate;
use crate::model::{catch_model_panic, ModelId, SimulationHandle, SimulationState, UncertaintyPolicy};
use crate::output::StepOutput;
use crate::uncertain::UncertainSet;

/// Identifies the caller context that owns an active model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The session used by callers that do not identify themselves.
    #[must_use]
    pub const fn default_session() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > 64 {
            return Err(ValidationError::InvalidSessionId {
                value: s.chars().take(16).chain("...".chars()).collect(),
            });
        }
        s.trim()
            .parse::<Uuid>()
            .map(Self)
            .map_err(|_| ValidationError::InvalidSessionId { value: s.to_string() })
    }
}

/// Everything a step or rewind may mutate. Only reachable through the gate.
pub struct ModelSlot {
    model: Box<dyn SimulationHandle>,
    policy: Arc<dyn UncertaintyPolicy>,
    uncertain: Option<UncertainSet>,
    replicas_lost: bool,
    state: SimulationState,
}

impl ModelSlot {
    fn new(model: Box<dyn SimulationHandle>, policy: Arc<dyn UncertaintyPolicy>) -> Self {
        let state = SimulationState::from_time_step(model.current_time_step());
        Self {
            model,
            policy,
            uncertain: None,
            replicas_lost: false,
            state,
        }
    }

    /// The nominal model.
    #[must_use]
    pub fn model(&self) -> &dyn SimulationHandle {
        self.model.as_ref()
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SimulationState {
        self.state
    }

    /// The uncertain set, if established.
    #[must_use]
    pub fn uncertain_models(&self) -> Option<&UncertainSet> {
        self.uncertain.as_ref()
    }

    /// Drop the uncertain set, joining its workers. Returns how many replicas it held.
    pub fn drop_uncertain_models(&mut self) -> Option<usize> {
        let set = self.uncertain.take()?;
        let count = set.len();
        drop(set);
        tracing::info!(replicas = count, "uncertain models dropped");
        Some(count)
    }

    /// Whether the uncertain set was abandoned since the last rewind.
    #[must_use]
    pub const fn replicas_lost(&self) -> bool {
        self.replicas_lost
    }

    /// Drop the uncertain set without waiting for workers that may still be busy.
    ///
    /// The replicas stay unavailable until the next rewind.
    pub fn abandon_uncertain_models(&mut self) {
        self.replicas_lost = true;
        if let Some(set) = self.uncertain.take() {
            tracing::warn!(replicas = set.len(), "uncertain models abandoned");
            set.abandon();
        }
    }

    /// Replace the uncertain set with fresh replicas from the model's policy.
    ///
    /// Returns the number of replicas established.
    ///
    /// # Errors
    /// - Whatever the policy reports, a panic in it as `Panicked`.
    /// - `ReplicaSetup` if a worker cannot be started.
    pub fn set_uncertain_models(&mut self) -> Result<usize, ModelError> {
        self.drop_uncertain_models();
        let policy = Arc::clone(&self.policy);
        let replicas = catch_model_panic(|| policy.spawn_replicas())?;
        let set = UncertainSet::start(replicas)?;
        let count = set.len();
        self.uncertain = Some(set);
        self.replicas_lost = false;
        tracing::info!(replicas = count, "uncertain models established");
        Ok(count)
    }

    /// Advance the nominal model and record the state transition.
    ///
    /// Exhaustion drops the uncertain set. Any other failure re-derives the
    /// state from the handle's step counter.
    pub(crate) fn step_nominal(&mut self) -> Result<StepOutput, ModelError> {
        let model = &mut self.model;
        match catch_model_panic(|| model.step()) {
            Ok(output) => {
                self.state = SimulationState::Stepping;
                Ok(output)
            }
            Err(ModelError::Exhausted) => {
                self.drop_uncertain_models();
                self.state = SimulationState::Exhausted;
                Err(ModelError::Exhausted)
            }
            Err(err) => {
                self.state = SimulationState::from_time_step(self.model.current_time_step());
                Err(err)
            }
        }
    }

    /// Rewind the nominal model. The uncertain set is dropped either way.
    pub(crate) fn rewind(&mut self) -> Result<(), ModelError> {
        self.drop_uncertain_models();
        let model = &mut self.model;
        let result = catch_model_panic(|| model.rewind());
        self.state = match result {
            Ok(()) => {
                self.replicas_lost = false;
                SimulationState::Fresh
            }
            Err(_) => SimulationState::from_time_step(self.model.current_time_step()),
        };
        result
    }
}

impl fmt::Debug for ModelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSlot")
            .field("state", &self.state)
            .field("current_time_step", &self.model.current_time_step())
            .field("uncertain", &self.uncertain)
            .finish_non_exhaustive()
    }
}

/// Snapshot of an active model for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSummary {
    /// Model identity.
    pub id: ModelId,
    /// Lifecycle state.
    pub state: SimulationState,
    /// Index of the last completed step, -1 before the first.
    pub current_time_step: i64,
    /// Steps in a full run, when the model knows.
    pub num_time_steps: Option<usize>,
    /// Whether steps carry uncertainty bands.
    pub has_weathering_uncertainty: bool,
    /// Replicas currently established.
    pub uncertain_models: usize,
}

/// The active model of one session, with its gate.
pub struct ActiveModel {
    id: ModelId,
    gate: StepGate<ModelSlot>,
}

impl ActiveModel {
    /// Wrap a handle and its uncertainty policy.
    pub fn new(model: Box<dyn SimulationHandle>, policy: Arc<dyn UncertaintyPolicy>) -> Self {
        Self {
            id: ModelId::new(),
            gate: StepGate::new(ModelSlot::new(model, policy)),
        }
    }

    /// Model identity.
    #[must_use]
    pub const fn id(&self) -> ModelId {
        self.id
    }

    /// The gate serializing every mutation of this model.
    #[must_use]
    pub const fn gate(&self) -> &StepGate<ModelSlot> {
        &self.gate
    }

    /// Read a summary under the gate.
    ///
    /// # Errors
    /// - `Timeout` if the gate is not acquired within `timeout`.
    pub fn summary(&self, timeout: Option<Duration>) -> GnomeResult<ModelSummary> {
        let slot = self.gate.acquire_timeout(timeout)?;
        Ok(ModelSummary {
            id: self.id,
            state: slot.state(),
            current_time_step: slot.model().current_time_step(),
            num_time_steps: slot.model().num_time_steps(),
            has_weathering_uncertainty: slot.model().has_weathering_uncertainty(),
            uncertain_models: slot.uncertain_models().map_or(0, UncertainSet::len),
        })
    }
}

impl fmt::Debug for ActiveModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveModel")
            .field("id", &self.id)
            .field("gate", &self.gate)
            .finish()
    }
}

/// Maps sessions to their active model.
///
/// Implementations must be safe for concurrent access. The registry never holds
/// a model's gate; it only hands out shared references to the context.
pub trait SessionRegistry: Send + Sync {
    /// Returns the session's active model, if any.
    fn active_model(&self, session: SessionId) -> Option<Arc<ActiveModel>>;

    /// Install `model` as the session's active model, replacing any previous one.
    ///
    /// # Errors
    /// - `SessionLimit` if the registry is full and `session` is new.
    fn set_active_model(&self, session: SessionId, model: ActiveModel) -> GnomeResult<Arc<ActiveModel>>;

    /// Tear the session down. Returns the model it held.
    fn remove_active_model(&self, session: SessionId) -> Option<Arc<ActiveModel>>;

    /// Number of sessions with an active model.
    fn len(&self) -> usize;

    /// Returns true if no session has an active model.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::reference::{ReferenceModel, ReferenceModelConfig, ReferenceUncertainty};
    use crate::model::NoUncertainty;

    fn reference(num_time_steps: usize, replicas: usize) -> ActiveModel {
        let config = ReferenceModelConfig {
            num_time_steps,
            replicas,
            ..ReferenceModelConfig::default()
        };
        ActiveModel::new(
            Box::new(ReferenceModel::new(config.clone()).unwrap()),
            Arc::new(ReferenceUncertainty::new(config)),
        )
    }

    #[test]
    fn session_id_parses_uuid() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
        assert!("x".repeat(100).parse::<SessionId>().is_err());
    }

    #[test]
    fn new_slot_is_fresh() {
        let active = reference(3, 2);
        let summary = active.summary(None).unwrap();
        assert_eq!(summary.state, SimulationState::Fresh);
        assert_eq!(summary.current_time_step, -1);
        assert_eq!(summary.num_time_steps, Some(3));
        assert_eq!(summary.uncertain_models, 0);
        assert!(!active.gate().is_held());
    }

    #[test]
    fn set_and_drop_uncertain_models() {
        let active = reference(3, 2);
        let mut slot = active.gate().acquire();
        assert_eq!(slot.set_uncertain_models().unwrap(), 2);
        assert_eq!(slot.uncertain_models().map(UncertainSet::len), Some(2));
        assert_eq!(slot.drop_uncertain_models(), Some(2));
        assert!(slot.uncertain_models().is_none());
        assert_eq!(slot.drop_uncertain_models(), None);
    }

    #[test]
    fn exhaustion_drops_uncertain_models() {
        let active = reference(1, 2);
        let mut slot = active.gate().acquire();
        slot.set_uncertain_models().unwrap();
        slot.step_nominal().unwrap();
        assert_eq!(slot.state(), SimulationState::Stepping);
        assert!(slot.step_nominal().unwrap_err().is_exhausted());
        assert_eq!(slot.state(), SimulationState::Exhausted);
        assert!(slot.uncertain_models().is_none());
    }

    #[test]
    fn rewind_returns_to_fresh() {
        let active = reference(3, 2);
        let mut slot = active.gate().acquire();
        slot.set_uncertain_models().unwrap();
        slot.step_nominal().unwrap();
        slot.rewind().unwrap();
        assert_eq!(slot.state(), SimulationState::Fresh);
        assert_eq!(slot.model().current_time_step(), -1);
        assert!(slot.uncertain_models().is_none());
    }

    #[test]
    fn abandoned_replicas_stay_lost_until_rewind() {
        let active = reference(3, 2);
        let mut slot = active.gate().acquire();
        slot.set_uncertain_models().unwrap();
        slot.step_nominal().unwrap();
        assert!(!slot.replicas_lost());
        slot.abandon_uncertain_models();
        assert!(slot.replicas_lost());
        assert!(slot.uncertain_models().is_none());
        slot.rewind().unwrap();
        assert!(!slot.replicas_lost());
    }

    #[test]
    fn no_uncertainty_policy_yields_empty_set() {
        let config = ReferenceModelConfig::default();
        let active = ActiveModel::new(
            Box::new(ReferenceModel::new(config).unwrap()),
            Arc::new(NoUncertainty),
        );
        let mut slot = active.gate().acquire();
        assert_eq!(slot.set_uncertain_models().unwrap(), 0);
        assert!(slot.uncertain_models().unwrap().is_empty());
    }
}
