//! Simulation handle contract.
//!
//! The physics live behind `SimulationHandle`; this crate only steps, rewinds and
//! observes it. `UncertaintyPolicy` decides which replicas back the uncertainty
//! bands of a model.

pub mod reference;

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;
use crate::output::StepOutput;

/// A steppable, rewindable simulation.
///
/// Handles are not required to be reentrant; callers serialize all mutation
/// through a `StepGate`.
pub trait SimulationHandle: Send {
    /// Advance one time step.
    ///
    /// # Errors
    /// - `Exhausted` when the run has no further steps; the step counter is unchanged.
    /// - Any other variant leaves the handle in an unspecified state.
    fn step(&mut self) -> Result<StepOutput, ModelError>;

    /// Reset to the initial state. The step counter returns to -1.
    ///
    /// # Errors
    /// - `RewindFailed` (or any other variant) if the handle cannot reset.
    fn rewind(&mut self) -> Result<(), ModelError>;

    /// Index of the last completed step, -1 before the first.
    fn current_time_step(&self) -> i64;

    /// Whether uncertain replicas must accompany this model.
    fn has_weathering_uncertainty(&self) -> bool;

    /// Total number of steps in a run, when known.
    fn num_time_steps(&self) -> Option<usize> {
        None
    }
}

/// Creates the uncertain replicas for an active model.
pub trait UncertaintyPolicy: Send + Sync {
    /// Spawn one fresh replica per configured uncertainty source.
    ///
    /// # Errors
    /// - `ReplicaSetup` if the replicas cannot be created.
    fn spawn_replicas(&self) -> Result<Vec<Box<dyn SimulationHandle>>, ModelError>;
}

/// Policy for models that never carry uncertainty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUncertainty;

impl UncertaintyPolicy for NoUncertainty {
    fn spawn_replicas(&self) -> Result<Vec<Box<dyn SimulationHandle>>, ModelError> {
        Ok(Vec::new())
    }
}

/// Lifecycle of an active model as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationState {
    /// Created or rewound; the next step establishes uncertain replicas.
    Fresh,
    /// At least one step has completed.
    Stepping,
    /// The run has no further steps until rewound.
    Exhausted,
}

impl SimulationState {
    /// Derive the state from a handle's step counter.
    #[must_use]
    pub const fn from_time_step(current_time_step: i64) -> Self {
        if current_time_step < 0 {
            Self::Fresh
        } else {
            Self::Stepping
        }
    }
}

impl fmt::Display for SimulationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fresh => "fresh",
            Self::Stepping => "stepping",
            Self::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

/// Stable identifier for an active model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId(Uuid);

impl ModelId {
    /// Create a new random model ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ModelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Where a handle panicked, recorded by the panic hook.
struct PanicSite {
    location: Option<String>,
    backtrace: String,
}

thread_local! {
    static GUARDED: Cell<u32> = const { Cell::new(0) };
    static LAST_PANIC: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

/// Chains a hook in front of the current one that records the panic site of
/// guarded calls on the panicking thread. Unguarded panics are untouched.
fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let guarded = GUARDED.try_with(Cell::get).unwrap_or(0) > 0;
            if guarded {
                let site = PanicSite {
                    location: info.location().map(ToString::to_string),
                    backtrace: Backtrace::force_capture().to_string(),
                };
                let _ = LAST_PANIC.try_with(|last| *last.borrow_mut() = Some(site));
            }
            previous(info);
        }));
    });
}

/// Run a handle operation, converting a panic into `ModelError::Panicked`.
///
/// The error carries the panic location and a backtrace of the panicking thread.
pub(crate) fn catch_model_panic<T>(
    f: impl FnOnce() -> Result<T, ModelError>,
) -> Result<T, ModelError> {
    install_panic_hook();
    GUARDED.with(|g| g.set(g.get() + 1));
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
    GUARDED.with(|g| g.set(g.get() - 1));
    result.unwrap_or_else(|payload| {
        let site = LAST_PANIC.with(|last| last.borrow_mut().take());
        let (location, backtrace) = match site {
            Some(site) => (site.location, Some(site.backtrace)),
            None => (None, None),
        };
        Err(ModelError::Panicked {
            message: panic_message(payload.as_ref()),
            location,
            backtrace,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_from_time_step() {
        assert_eq!(SimulationState::from_time_step(-1), SimulationState::Fresh);
        assert_eq!(SimulationState::from_time_step(0), SimulationState::Stepping);
        assert_eq!(SimulationState::from_time_step(41), SimulationState::Stepping);
    }

    #[test]
    fn catch_model_panic_reports_message() {
        let result: Result<(), ModelError> = catch_model_panic(|| panic!("mass went negative"));
        let Err(ModelError::Panicked {
            message,
            location,
            backtrace,
        }) = result
        else {
            panic!("expected Panicked, got {result:?}");
        };
        assert_eq!(message, "mass went negative");
        assert!(location.unwrap().contains("model/mod.rs"));
        assert!(!backtrace.unwrap().is_empty());
    }

    #[test]
    fn panic_site_is_consumed_and_unguarded_panics_are_not_recorded() {
        let _ = catch_model_panic(|| -> Result<(), ModelError> { panic!("first") });
        assert!(LAST_PANIC.with(|last| last.borrow().is_none()));

        let _ = std::panic::catch_unwind(|| panic!("outside any model call"));
        assert!(LAST_PANIC.with(|last| last.borrow().is_none()));

        let err = catch_model_panic(|| -> Result<(), ModelError> {
            std::panic::panic_any(7_u8)
        })
        .unwrap_err();
        let ModelError::Panicked { message, location, .. } = err else {
            panic!("expected Panicked, got {err:?}");
        };
        assert_eq!(message, "non-string panic payload");
        assert!(location.is_some());
    }

    #[test]
    fn catch_model_panic_passes_through_results() {
        assert!(catch_model_panic(|| Ok::<_, ModelError>(3)).is_ok());
        let err = catch_model_panic(|| Err::<(), _>(ModelError::Exhausted)).unwrap_err();
        assert!(err.is_exhausted());
    }

    #[test]
    fn no_uncertainty_spawns_nothing() {
        assert!(NoUncertainty.spawn_replicas().unwrap().is_empty());
    }
}
