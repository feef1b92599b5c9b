use crate::engine::{Engine, UnitRef};
use crate::error::UnitError;
use crate::metrics::{Snapshot, UnitMetrics};
use crate::phases::{Phase, PhaseBarriers, PhaseTrack};
use crate::pool::ResourcePool;
use crate::store::UnitId;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Created,
    Started,
    ReadyWait,
    Synced,
    Measured,
    Stopped,
    Removed,
    Failed,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitState::Created => "created",
            UnitState::Started => "started",
            UnitState::ReadyWait => "ready_wait",
            UnitState::Synced => "synced",
            UnitState::Measured => "measured",
            UnitState::Stopped => "stopped",
            UnitState::Removed => "removed",
            UnitState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Success(UnitMetrics),
    Failure(UnitError),
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Success(_))
    }
}

// A unit the orchestrator asked the engine for. `container` is `Err` when
// creation itself failed; such a unit still takes its place at every barrier.
#[derive(Debug, Clone)]
pub struct UnitSlot {
    pub index: usize,
    pub unit_id: UnitId,
    pub container: Result<UnitRef, UnitError>,
    pub designated: bool,
}

impl UnitSlot {
    pub fn label(&self) -> String {
        match &self.container {
            Ok(unit) => format!("unit-{}:{}", self.index, unit),
            Err(_) => format!("unit-{}", self.index),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnitReport {
    pub index: usize,
    pub unit_id: UnitId,
    pub container: Option<UnitRef>,
    pub outcome: UnitOutcome,
    pub final_state: UnitState,
}

pub struct Worker<E> {
    slot: UnitSlot,
    pool: Arc<ResourcePool<E>>,
    barriers: Arc<PhaseBarriers>,
    state: UnitState,
    remove_on_teardown: bool,
}

impl<E: Engine> Worker<E> {
    pub fn new(slot: UnitSlot, pool: Arc<ResourcePool<E>>, barriers: Arc<PhaseBarriers>) -> Self {
        Self {
            slot,
            pool,
            barriers,
            state: UnitState::Created,
            remove_on_teardown: true,
        }
    }

    pub fn keep_stopped_unit(mut self) -> Self {
        self.remove_on_teardown = false;
        self
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn run(mut self) -> UnitReport {
        let label = self.slot.label();
        let mut track = PhaseTrack::for_unit(
            Arc::clone(&self.barriers),
            self.slot.designated,
            label.clone(),
        );

        let outcome = match self.lifecycle(&mut track) {
            Ok(metrics) => UnitOutcome::Success(metrics),
            Err(err) => {
                tracing::error!(
                    unit = %label,
                    kind = %err.kind(),
                    error = %err,
                    state = %self.state,
                    "unit failed"
                );
                self.transition(UnitState::Failed);
                UnitOutcome::Failure(err)
            }
        };
        track.release_remaining();
        drop(track);

        self.teardown();

        UnitReport {
            index: self.slot.index,
            unit_id: self.slot.unit_id,
            container: self.slot.container.as_ref().ok().cloned(),
            outcome,
            final_state: self.state,
        }
    }

    fn lifecycle(&mut self, track: &mut PhaseTrack) -> Result<UnitMetrics, UnitError> {
        track.pass(Phase::Init);
        let unit = self.slot.container.clone()?;

        // Timed inside the leased call so queueing for a slot is not counted.
        let startup = self.pool.call(|engine| {
            let issued = Instant::now();
            engine.start(&unit)?;
            Ok(issued.elapsed())
        })?;
        self.transition(UnitState::Started);

        // CPU counters are cumulative since creation, so keep a baseline.
        let baseline = self.snapshot(&unit)?;

        if self.slot.designated {
            self.transition(UnitState::ReadyWait);
            track.pass(Phase::Ready);
        }
        track.pass(Phase::AllStarted);
        self.transition(UnitState::Synced);

        let last = self.snapshot(&unit)?;
        let metrics = UnitMetrics::collect(&baseline, &last, startup);
        self.transition(UnitState::Measured);
        tracing::info!(
            unit = %self.slot.label(),
            cpu_percent = metrics.cpu.percent,
            memory_percent = metrics.memory.percent,
            startup_ms = metrics.startup.startup_ms,
            "unit measured"
        );

        track.pass(Phase::End);
        Ok(metrics)
    }

    fn snapshot(&self, unit: &UnitRef) -> Result<Snapshot, UnitError> {
        let raw = self.pool.call(|engine| engine.stats(unit))?;
        Snapshot::try_from(raw)
    }

    // Best effort: the orchestrator removes every unit again after the run.
    fn teardown(&mut self) {
        let unit = match &self.slot.container {
            Ok(unit) => unit.clone(),
            Err(_) => return,
        };
        match self.pool.call(|engine| engine.stop(&unit)) {
            Ok(()) => {
                if self.state != UnitState::Failed {
                    self.transition(UnitState::Stopped);
                }
            }
            Err(err) => tracing::warn!(unit = %unit, error = %err, "stop failed"),
        }
        if !self.remove_on_teardown {
            return;
        }
        match self.pool.call(|engine| engine.remove(&unit, true)) {
            Ok(()) => {
                if self.state != UnitState::Failed {
                    self.transition(UnitState::Removed);
                }
            }
            Err(err) => tracing::warn!(unit = %unit, error = %err, "remove failed"),
        }
    }

    fn transition(&mut self, next: UnitState) {
        tracing::debug!(unit = %self.slot.label(), from = %self.state, to = %next, "unit transition");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, Script};
    use std::thread;

    fn pool_for(engine: &FakeEngine) -> Arc<ResourcePool<FakeEngine>> {
        let shared = engine.clone();
        ResourcePool::new(4, 2, Box::new(move || Ok::<_, UnitError>(shared.clone()))).unwrap()
    }

    // Stands in for the auxiliary threads of a run.
    fn spawn_aux(barriers: &Arc<PhaseBarriers>) -> thread::JoinHandle<()> {
        let barriers = Arc::clone(barriers);
        thread::spawn(move || {
            barriers.init.wait();
            barriers.ready.wait();
            barriers.all_started.wait();
            barriers.end.wait();
        })
    }

    #[test]
    fn successful_unit_reports_metrics_and_is_removed() {
        let engine = FakeEngine::new(Script::default());
        let unit = engine.create("img", None).unwrap();
        let barriers = PhaseBarriers::for_units(1).unwrap();
        let aux = spawn_aux(&barriers);

        let slot = UnitSlot {
            index: 0,
            unit_id: 7,
            container: Ok(unit.clone()),
            designated: true,
        };
        let report = Worker::new(slot, pool_for(&engine), Arc::clone(&barriers)).run();
        aux.join().unwrap();

        match &report.outcome {
            UnitOutcome::Success(metrics) => {
                assert_eq!(metrics.cpu.percent, 100.0);
                assert_eq!(metrics.memory.percent, 25.0);
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(report.final_state, UnitState::Removed);
        assert_eq!(report.unit_id, 7);
        assert_eq!(engine.removed(), vec![unit]);
    }

    #[test]
    fn start_failure_still_passes_every_barrier() {
        let engine = FakeEngine::new(Script {
            fail_start: vec![0],
            ..Script::default()
        });
        let unit = engine.create("img", None).unwrap();
        let barriers = PhaseBarriers::for_units(1).unwrap();
        let aux = spawn_aux(&barriers);

        let slot = UnitSlot {
            index: 0,
            unit_id: 1,
            container: Ok(unit.clone()),
            designated: true,
        };
        let report = Worker::new(slot, pool_for(&engine), Arc::clone(&barriers)).run();
        aux.join().unwrap();

        assert!(matches!(
            report.outcome,
            UnitOutcome::Failure(UnitError::BackendApi { .. })
        ));
        assert_eq!(report.final_state, UnitState::Failed);
        assert!(barriers.end.is_released());
        assert_eq!(engine.removed(), vec![unit]);
    }

    #[test]
    fn kept_unit_is_only_stopped() {
        let engine = FakeEngine::new(Script::default());
        let unit = engine.create("img", None).unwrap();
        let barriers = PhaseBarriers::for_units(1).unwrap();
        let aux = spawn_aux(&barriers);

        let slot = UnitSlot {
            index: 0,
            unit_id: 1,
            container: Ok(unit),
            designated: true,
        };
        let report = Worker::new(slot, pool_for(&engine), barriers)
            .keep_stopped_unit()
            .run();
        aux.join().unwrap();

        assert!(report.outcome.is_success());
        assert_eq!(report.final_state, UnitState::Stopped);
        assert!(engine.removed().is_empty());
    }

    #[test]
    fn creation_failure_is_terminal_without_backend_calls() {
        let engine = FakeEngine::new(Script::default());
        let barriers = PhaseBarriers::for_units(1).unwrap();
        let aux = spawn_aux(&barriers);

        let slot = UnitSlot {
            index: 3,
            unit_id: 2,
            container: Err(UnitError::api(Some(404), "No such image")),
            designated: true,
        };
        let report = Worker::new(slot, pool_for(&engine), Arc::clone(&barriers)).run();
        aux.join().unwrap();

        assert_eq!(
            report.outcome,
            UnitOutcome::Failure(UnitError::api(Some(404), "No such image"))
        );
        assert!(report.container.is_none());
        assert!(engine.ops().is_empty());
    }

    #[test]
    fn incomplete_snapshot_is_a_measurement_failure() {
        let engine = FakeEngine::new(Script {
            incomplete_stats: vec![0],
            ..Script::default()
        });
        let unit = engine.create("img", None).unwrap();
        let barriers = PhaseBarriers::for_units(1).unwrap();
        let aux = spawn_aux(&barriers);

        let slot = UnitSlot {
            index: 0,
            unit_id: 1,
            container: Ok(unit),
            designated: true,
        };
        let report = Worker::new(slot, pool_for(&engine), barriers).run();
        aux.join().unwrap();

        match report.outcome {
            UnitOutcome::Failure(err) => {
                assert_eq!(err.kind(), crate::error::FailureKind::MeasurementIncomplete)
            }
            other => panic!("expected measurement failure, got {:?}", other),
        }
    }
}
