//! Step and rewind orchestration.
//!
//! Both operations hold the active model's gate from start to finish. The gate
//! guard is dropped on every exit path, so a failure or an exhausted run never
//! leaves the model locked.
//!
//! Within one step the order is fixed: uncertain-set initialization (first step
//! only), then the nominal model, then every replica, then aggregation.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info_span, warn};

use crate::aggregate::{merge_step_outputs, StepTimings};
use crate::config::OrchestratorConfig;
use crate::error::{GnomeError, GnomeResult, ModelError, StepPhase};
use crate::model::{ModelId, SimulationState};
use crate::output::StepResponse;
use crate::session::{ModelSlot, SessionId, SessionRegistry};

/// Coordinates `step` and `rewind` of session models.
pub struct StepOrchestrator {
    registry: Arc<dyn SessionRegistry>,
    config: OrchestratorConfig,
}

impl StepOrchestrator {
    /// Create an orchestrator over `registry`.
    ///
    /// # Errors
    /// - `Validation` if `config` is invalid.
    pub fn new(registry: Arc<dyn SessionRegistry>, config: OrchestratorConfig) -> GnomeResult<Self> {
        config.validate()?;
        Ok(Self { registry, config })
    }

    /// The session registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn SessionRegistry> {
        &self.registry
    }

    /// The orchestrator limits.
    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Advance the session's active model by one step.
    ///
    /// # Errors
    /// - `PreconditionFailed` if the session has no active model.
    /// - `NotFound` if the run is exhausted; a rewind is required to step again.
    /// - `Timeout` if the gate or the replica fan-out exceeds its limit.
    /// - `Unprocessable` for any other failure, with diagnostics.
    pub fn advance_step(&self, session: SessionId) -> GnomeResult<StepResponse> {
        let active = self
            .registry
            .active_model(session)
            .ok_or(GnomeError::PreconditionFailed)?;
        let model_id = active.id();

        let span = info_span!("step", %session, model = %model_id);
        let _enter = span.enter();

        let mut slot = active.gate().acquire_timeout(self.config.gate_timeout())?;
        let result = self.step_locked(model_id, &mut slot);
        match &result {
            Ok(response) => debug!(
                step_num = ?response.step_num(),
                total_response_time = response.total_response_time,
                "step complete"
            ),
            Err(GnomeError::NotFound { .. }) => warn!("model exhausted"),
            Err(err) => error!(error = %err, "step failed"),
        }
        result
    }

    fn step_locked(&self, model_id: ModelId, slot: &mut ModelSlot) -> GnomeResult<StepResponse> {
        match slot.state() {
            SimulationState::Exhausted => return Err(GnomeError::NotFound { model_id }),
            SimulationState::Fresh => {
                slot.drop_uncertain_models();
                if slot.model().has_weathering_uncertainty() {
                    slot.set_uncertain_models()
                        .map_err(|e| unprocessable(StepPhase::Initialize, model_id, slot, &e))?;
                }
            }
            // A handle installed mid-run has no replicas; its bands collapse onto nominal.
            SimulationState::Stepping => {
                if slot.model().has_weathering_uncertainty() && slot.replicas_lost() {
                    let err = ModelError::ReplicasUnavailable;
                    return Err(unprocessable(StepPhase::Initialize, model_id, slot, &err));
                }
            }
        }

        let begin = Instant::now();
        let output = match slot.step_nominal() {
            Ok(output) => output,
            Err(ModelError::Exhausted) => return Err(GnomeError::NotFound { model_id }),
            Err(e) => return Err(unprocessable(StepPhase::Nominal, model_id, slot, &e)),
        };

        let begin_uncertain = Instant::now();
        let uncertain = match slot.uncertain_models() {
            Some(set) if !set.is_empty() => set.step_all(self.config.replica_timeout()),
            _ => Ok(Vec::new()),
        };
        let uncertain = match uncertain {
            Ok(outputs) => outputs,
            Err(ModelError::ReplicaTimeout { duration_ms }) => {
                slot.abandon_uncertain_models();
                return Err(GnomeError::Timeout { duration_ms });
            }
            Err(e) => {
                // Replica state is undefined after a failure.
                slot.abandon_uncertain_models();
                return Err(unprocessable(StepPhase::Uncertain, model_id, slot, &e));
            }
        };
        let end = Instant::now();

        let timings = StepTimings {
            uncertain: end - begin_uncertain,
            total: end - begin,
        };
        merge_step_outputs(output, uncertain, self.config.missing_fields, timings)
            .map_err(|e| unprocessable(StepPhase::Aggregate, model_id, slot, &e))
    }

    /// Reset the session's active model to its initial state.
    ///
    /// The uncertain set is dropped; the next step re-creates it.
    ///
    /// # Errors
    /// - `PreconditionFailed` if the session has no active model.
    /// - `Timeout` if the gate is not acquired in time.
    /// - `Unprocessable` if the model fails to rewind.
    pub fn rewind(&self, session: SessionId) -> GnomeResult<()> {
        let active = self
            .registry
            .active_model(session)
            .ok_or(GnomeError::PreconditionFailed)?;
        let model_id = active.id();

        let span = info_span!("rewind", %session, model = %model_id);
        let _enter = span.enter();

        let mut slot = active.gate().acquire_timeout(self.config.gate_timeout())?;
        slot.rewind().map_err(|e| {
            let err = unprocessable(StepPhase::Rewind, model_id, &slot, &e);
            error!(error = %err, "rewind failed");
            err
        })?;
        debug!("rewind complete");
        Ok(())
    }
}

fn unprocessable(
    phase: StepPhase,
    model_id: ModelId,
    slot: &ModelSlot,
    err: &(dyn std::error::Error + 'static),
) -> GnomeError {
    GnomeError::unprocessable(phase, model_id, slot.model().current_time_step(), err)
}
