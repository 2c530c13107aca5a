//! Uncertain model set.
//!
//! Each replica lives on its own worker thread. A step is broadcast to every
//! worker, so replicas advance in parallel, and the replies are collected in
//! replica order under one deadline.

use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::error::ModelError;
use crate::model::{catch_model_panic, SimulationHandle};
use crate::output::StepOutput;

/// Commands queued per replica. The set is only driven under the step gate,
/// so at most one command is outstanding per worker.
const COMMAND_QUEUE_CAPACITY: usize = 2;

enum ReplicaCommand {
    Step {
        reply: Sender<Result<StepOutput, ModelError>>,
    },
}

struct ReplicaWorker {
    tx: Sender<ReplicaCommand>,
    handle: JoinHandle<()>,
}

impl ReplicaWorker {
    fn start(index: usize, mut replica: Box<dyn SimulationHandle>) -> Result<Self, ModelError> {
        let (tx, rx) = bounded::<ReplicaCommand>(COMMAND_QUEUE_CAPACITY);
        let handle = thread::Builder::new()
            .name(format!("gnomestep-uncertain-{index}"))
            .spawn(move || {
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        ReplicaCommand::Step { reply } => {
                            let result = catch_model_panic(|| replica.step());
                            let _ = reply.send(result);
                        }
                    }
                }
            })
            .map_err(|e| ModelError::ReplicaSetup {
                message: format!("failed to spawn worker for uncertain model {index}: {e}"),
            })?;
        Ok(Self { tx, handle })
    }
}

/// Ordered collection of uncertain replicas, each on its own worker.
pub struct UncertainSet {
    workers: Vec<ReplicaWorker>,
}

impl UncertainSet {
    /// Start one worker per replica.
    ///
    /// # Errors
    /// - `ReplicaSetup` if a worker thread cannot be spawned. Workers started
    ///   before the failure are shut down.
    pub fn start(replicas: Vec<Box<dyn SimulationHandle>>) -> Result<Self, ModelError> {
        let mut set = Self {
            workers: Vec::with_capacity(replicas.len()),
        };
        for (index, replica) in replicas.into_iter().enumerate() {
            set.workers.push(ReplicaWorker::start(index, replica)?);
        }
        Ok(set)
    }

    /// Number of replicas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true if the set has no replicas.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Advance every replica by exactly one step.
    ///
    /// Outputs are returned in replica order.
    ///
    /// # Errors
    /// - `ReplicaFailed` with the index of the first replica (in order) that failed.
    /// - `ReplicaLost` if a worker is gone.
    /// - `ReplicaTimeout` if all replies did not arrive within `timeout`.
    pub fn step_all(&self, timeout: Duration) -> Result<Vec<StepOutput>, ModelError> {
        let deadline = Instant::now() + timeout;

        let mut pending: Vec<Receiver<Result<StepOutput, ModelError>>> =
            Vec::with_capacity(self.workers.len());
        for (index, worker) in self.workers.iter().enumerate() {
            let (reply, rx) = bounded(1);
            worker
                .tx
                .send(ReplicaCommand::Step { reply })
                .map_err(|_| ModelError::ReplicaLost { index })?;
            pending.push(rx);
        }

        let mut outputs = Vec::with_capacity(pending.len());
        for (index, rx) in pending.into_iter().enumerate() {
            let result = rx.recv_deadline(deadline).map_err(|err| match err {
                RecvTimeoutError::Timeout => ModelError::ReplicaTimeout {
                    duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                },
                RecvTimeoutError::Disconnected => ModelError::ReplicaLost { index },
            })?;
            let output = result.map_err(|source| ModelError::ReplicaFailed {
                index,
                source: Box::new(source),
            })?;
            outputs.push(output);
        }
        Ok(outputs)
    }

    /// Drop the set without waiting for busy workers.
    ///
    /// Used after a timeout, when a replica may still be inside `step`. Each
    /// worker exits once its current command finishes.
    pub fn abandon(mut self) {
        for worker in self.workers.drain(..) {
            drop(worker.tx);
        }
    }
}

impl fmt::Debug for UncertainSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UncertainSet")
            .field("replicas", &self.workers.len())
            .finish()
    }
}

impl Drop for UncertainSet {
    fn drop(&mut self) {
        // Close every channel first so workers shut down in parallel, then join.
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .drain(..)
            .map(|worker| {
                drop(worker.tx);
                worker.handle
            })
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::NaiveDate;

    use crate::output::WeatheringRecord;

    struct Scripted {
        scale: f64,
        step: i64,
        fail_at: Option<i64>,
        panic_at: Option<i64>,
        delay: Duration,
    }

    impl Scripted {
        fn new(scale: f64) -> Self {
            Self {
                scale,
                step: -1,
                fail_at: None,
                panic_at: None,
                delay: Duration::ZERO,
            }
        }
    }

    impl SimulationHandle for Scripted {
        fn step(&mut self) -> Result<StepOutput, ModelError> {
            thread::sleep(self.delay);
            let next = self.step + 1;
            if self.fail_at == Some(next) {
                return Err(ModelError::step_failed("scripted failure"));
            }
            if self.panic_at == Some(next) {
                self.panic_at = None;
                panic!("scripted panic");
            }
            self.step = next;
            let ts = NaiveDate::from_ymd_opt(2014, 8, 6)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap();
            #[allow(clippy::cast_precision_loss)]
            let value = self.scale * next as f64;
            Ok(StepOutput::weathering(
                WeatheringRecord::new(u32::try_from(next).unwrap(), ts).with_field("value", value),
            ))
        }

        fn rewind(&mut self) -> Result<(), ModelError> {
            self.step = -1;
            Ok(())
        }

        fn current_time_step(&self) -> i64 {
            self.step
        }

        fn has_weathering_uncertainty(&self) -> bool {
            false
        }
    }

    fn boxed(s: Scripted) -> Box<dyn SimulationHandle> {
        Box::new(s)
    }

    #[test]
    fn step_all_returns_outputs_in_replica_order() {
        let set = UncertainSet::start(vec![boxed(Scripted::new(1.0)), boxed(Scripted::new(2.0))]).unwrap();
        assert_eq!(set.len(), 2);

        set.step_all(Duration::from_secs(1)).unwrap();
        let outputs = set.step_all(Duration::from_secs(1)).unwrap();
        let values: Vec<f64> = outputs
            .iter()
            .map(|o| o.weathering.as_ref().unwrap().field("value").unwrap())
            .collect();
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[test]
    fn step_all_reports_failing_replica_index() {
        let mut failing = Scripted::new(1.0);
        failing.fail_at = Some(0);
        let set = UncertainSet::start(vec![boxed(Scripted::new(1.0)), boxed(failing)]).unwrap();

        let err = set.step_all(Duration::from_secs(1)).unwrap_err();
        let ModelError::ReplicaFailed { index, source } = err else {
            panic!("expected ReplicaFailed, got {err:?}");
        };
        assert_eq!(index, 1);
        assert!(matches!(*source, ModelError::StepFailed { .. }));
    }

    #[test]
    fn replica_panic_is_reported_not_propagated() {
        let mut panicking = Scripted::new(1.0);
        panicking.panic_at = Some(0);
        let set = UncertainSet::start(vec![boxed(panicking)]).unwrap();

        let err = set.step_all(Duration::from_secs(1)).unwrap_err();
        let ModelError::ReplicaFailed { index: 0, source } = err else {
            panic!("expected ReplicaFailed, got {err:?}");
        };
        assert!(matches!(*source, ModelError::Panicked { .. }));

        // The worker survives the panic.
        assert!(set.step_all(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn step_all_times_out_on_slow_replica() {
        let mut slow = Scripted::new(1.0);
        slow.delay = Duration::from_millis(200);
        let set = UncertainSet::start(vec![boxed(slow)]).unwrap();

        let err = set.step_all(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, ModelError::ReplicaTimeout { duration_ms: 20 }));
        set.abandon();
    }

    #[test]
    fn empty_set_steps_to_nothing() {
        let set = UncertainSet::start(Vec::new()).unwrap();
        assert!(set.is_empty());
        assert!(set.step_all(Duration::from_millis(10)).unwrap().is_empty());
    }
}
