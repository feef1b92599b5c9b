use crate::config::RunSettings;
use crate::disk::DiskMeter;
use crate::engine::{Engine, UnitRef};
use crate::error::UnitError;
use crate::phases::{unit_phases, Phase, PhaseBarriers, PhaseTrack};
use crate::pool::ResourcePool;
use crate::probe::ResponseProbe;
use crate::store::{MetricsStore, RunId};
use crate::worker::{UnitOutcome, UnitReport, UnitSlot, UnitState, Worker};
use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const PROBE_PHASES: [Phase; 2] = [Phase::Ready, Phase::End];
const MIN_DURATION_PHASES: [Phase; 2] = [Phase::Init, Phase::AllStarted];

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub units: Vec<UnitReport>,
    pub disk_delta: Option<i64>,
    pub response_time: Option<Duration>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.units.iter().filter(|u| u.outcome.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.units.len() - self.succeeded()
    }
}

pub struct Orchestrator<E> {
    settings: RunSettings,
    pool: Arc<ResourcePool<E>>,
    store: Arc<dyn MetricsStore>,
    probe: Option<Arc<dyn ResponseProbe>>,
    #[cfg(test)]
    spawn_failure_at: Option<usize>,
}

struct RunThreads<'a> {
    workers: Vec<(&'a UnitSlot, thread::JoinHandle<UnitReport>)>,
    probe: thread::JoinHandle<Option<Duration>>,
    min_duration: thread::JoinHandle<()>,
}

impl<E: Engine + 'static> Orchestrator<E> {
    pub fn new(
        settings: RunSettings,
        pool: Arc<ResourcePool<E>>,
        store: Arc<dyn MetricsStore>,
    ) -> Self {
        Self {
            settings,
            pool,
            store,
            probe: None,
            #[cfg(test)]
            spawn_failure_at: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResponseProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn store(&self) -> &Arc<dyn MetricsStore> {
        &self.store
    }

    pub fn execute(&self, run_id: RunId, unit_count: usize, image: &str) -> Result<RunReport> {
        let run_started = Instant::now();
        tracing::info!(run_id, unit_count, image, "starting run");

        let barriers = PhaseBarriers::for_units(unit_count)?;

        let mut disk = DiskMeter::new(Arc::clone(&self.pool));
        disk.record_baseline();

        let slots = self.create_units(run_id, unit_count, image)?;
        let designated_ready = slots
            .last()
            .map(|slot| slot.container.is_ok())
            .unwrap_or(false);

        let RunThreads {
            workers,
            probe,
            min_duration,
        } = match self.spawn_threads(&slots, &barriers, designated_ready) {
            Ok(threads) => threads,
            Err(err) => {
                self.remove_units(&slots);
                return Err(err);
            }
        };

        let mut reports = Vec::with_capacity(workers.len());
        for (slot, handle) in workers {
            let report = handle.join().unwrap_or_else(|_| UnitReport {
                index: slot.index,
                unit_id: slot.unit_id,
                container: slot.container.as_ref().ok().cloned(),
                outcome: UnitOutcome::Failure(UnitError::Unexpected(
                    "worker thread panicked".to_string(),
                )),
                final_state: UnitState::Failed,
            });
            reports.push(report);
        }
        let persisted = self.persist_units(&reports);

        if min_duration.join().is_err() {
            tracing::error!("minimum-duration thread panicked");
        }
        let response_time = probe.join().unwrap_or_else(|_| {
            tracing::error!("probe thread panicked");
            None
        });

        let run_level = if persisted.is_ok() {
            let disk_delta = disk.increase();
            self.store
                .save_run_metrics(
                    run_id,
                    disk_delta,
                    response_time.map(|d| d.as_millis() as u64),
                )
                .context("failed to save run metrics")
                .map(|_| disk_delta)
        } else {
            Ok(None)
        };

        self.remove_units(&slots);
        persisted?;
        let disk_delta = run_level?;

        self.store
            .mark_run_ended(run_id)
            .context("failed to mark run ended")?;

        let report = RunReport {
            run_id,
            units: reports,
            disk_delta,
            response_time,
            elapsed: run_started.elapsed(),
        };
        tracing::info!(
            run_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            disk_delta = ?report.disk_delta,
            response_ms = ?report.response_time.map(|d| d.as_millis()),
            "run ended"
        );
        Ok(report)
    }

    fn create_units(&self, run_id: RunId, unit_count: usize, image: &str) -> Result<Vec<UnitSlot>> {
        let mut slots: Vec<UnitSlot> = Vec::with_capacity(unit_count);
        for index in 0..unit_count {
            let designated = index + 1 == unit_count;
            let publish = if designated && self.probe.is_some() {
                Some(self.settings.probe_port)
            } else {
                None
            };
            let container = self.pool.call(|engine| engine.create(image, publish));
            if let Err(err) = &container {
                tracing::error!(index, error = %err, "unit creation failed");
            }
            let backend_id = container.as_ref().ok().map(UnitRef::as_str);
            let unit_id = match self.store.create_unit(run_id, backend_id) {
                Ok(id) => id,
                Err(err) => {
                    let mut created: Vec<UnitRef> = slots
                        .iter()
                        .filter_map(|s| s.container.as_ref().ok().cloned())
                        .collect();
                    created.extend(container.ok());
                    self.remove_refs(&created);
                    return Err(err).context("failed to persist unit");
                }
            };
            slots.push(UnitSlot {
                index,
                unit_id,
                container,
                designated,
            });
        }
        Ok(slots)
    }

    // Start every thread of the run. If one cannot be started, the missing
    // parties forfeit their barriers so the started threads can finish, and
    // those are joined before the error is returned.
    fn spawn_threads<'a>(
        &self,
        slots: &'a [UnitSlot],
        barriers: &Arc<PhaseBarriers>,
        designated_ready: bool,
    ) -> Result<RunThreads<'a>> {
        let mut spawned = 0;
        let mut failure = None;
        let mut workers = Vec::with_capacity(slots.len());
        for slot in slots {
            let worker = Worker::new(slot.clone(), Arc::clone(&self.pool), Arc::clone(barriers))
                .keep_stopped_unit();
            match self.spawn_thread(&mut spawned, format!("unit-{}", slot.index), move || {
                worker.run()
            }) {
                Ok(handle) => workers.push((slot, handle)),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        let mut probe = None;
        if failure.is_none() {
            match self.spawn_probe(&mut spawned, barriers, designated_ready) {
                Ok(handle) => probe = Some(handle),
                Err(err) => failure = Some(err),
            }
        }
        let mut min_duration = None;
        if failure.is_none() {
            match self.spawn_min_duration(&mut spawned, barriers) {
                Ok(handle) => min_duration = Some(handle),
                Err(err) => failure = Some(err),
            }
        }

        if let Some(err) = failure {
            tracing::error!(error = %err, spawned, "run aborted before every thread started");
            for slot in &slots[workers.len()..] {
                barriers.forfeit(&unit_phases(slot.designated));
            }
            if probe.is_none() {
                barriers.forfeit(&PROBE_PHASES);
            }
            if min_duration.is_none() {
                barriers.forfeit(&MIN_DURATION_PHASES);
            }
            for (slot, handle) in workers {
                if handle.join().is_err() {
                    tracing::error!(index = slot.index, "worker thread panicked");
                }
            }
            if let Some(handle) = probe {
                let _ = handle.join();
            }
            if let Some(handle) = min_duration {
                let _ = handle.join();
            }
            return Err(err);
        }
        match (probe, min_duration) {
            (Some(probe), Some(min_duration)) => Ok(RunThreads {
                workers,
                probe,
                min_duration,
            }),
            _ => Err(anyhow!("auxiliary run threads missing")),
        }
    }

    fn spawn_thread<T: Send + 'static>(
        &self,
        spawned: &mut usize,
        name: String,
        body: impl FnOnce() -> T + Send + 'static,
    ) -> Result<thread::JoinHandle<T>> {
        if self.refuse_spawn(*spawned) {
            bail!("failed to spawn thread {}: thread limit reached", name);
        }
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .with_context(|| format!("failed to spawn thread {}", name))?;
        *spawned += 1;
        Ok(handle)
    }

    #[cfg(test)]
    fn refuse_spawn(&self, spawned: usize) -> bool {
        self.spawn_failure_at == Some(spawned)
    }

    #[cfg(not(test))]
    fn refuse_spawn(&self, _spawned: usize) -> bool {
        false
    }

    fn spawn_probe(
        &self,
        spawned: &mut usize,
        barriers: &Arc<PhaseBarriers>,
        designated_ready: bool,
    ) -> Result<thread::JoinHandle<Option<Duration>>> {
        let barriers = Arc::clone(barriers);
        let probe = self.probe.clone();
        let host = self.settings.probe_host.clone();
        let port = self.settings.probe_port;
        let timeout = self.settings.probe_timeout;
        self.spawn_thread(spawned, "probe".to_string(), move || {
            let mut track = PhaseTrack::new(barriers, PROBE_PHASES.to_vec(), "probe");
            track.pass(Phase::Ready);
            let latency = match probe {
                Some(probe) if designated_ready => match probe.measure(&host, port, timeout) {
                    Ok(latency) => Some(latency),
                    Err(err) => {
                        tracing::error!(error = %err, "response time probe failed");
                        None
                    }
                },
                Some(_) => {
                    tracing::warn!("designated unit was never created; skipping probe");
                    None
                }
                None => None,
            };
            track.pass(Phase::End);
            latency
        })
    }

    fn spawn_min_duration(
        &self,
        spawned: &mut usize,
        barriers: &Arc<PhaseBarriers>,
    ) -> Result<thread::JoinHandle<()>> {
        let barriers = Arc::clone(barriers);
        let floor = self.settings.min_duration;
        self.spawn_thread(spawned, "min-duration".to_string(), move || {
            let mut track =
                PhaseTrack::new(barriers, MIN_DURATION_PHASES.to_vec(), "min-duration");
            track.pass(Phase::Init);
            thread::sleep(floor);
            tracing::debug!(floor_ms = floor.as_millis() as u64, "minimum run duration elapsed");
            track.pass(Phase::AllStarted);
        })
    }

    fn persist_units(&self, reports: &[UnitReport]) -> Result<()> {
        for report in reports {
            match &report.outcome {
                UnitOutcome::Success(metrics) => self
                    .store
                    .save_unit_metrics(report.unit_id, metrics)
                    .with_context(|| format!("failed to save metrics for unit {}", report.unit_id))?,
                UnitOutcome::Failure(err) => self
                    .store
                    .save_unit_error(report.unit_id, err.kind(), &err.to_string())
                    .with_context(|| format!("failed to save error for unit {}", report.unit_id))?,
            }
        }
        Ok(())
    }

    fn remove_units(&self, slots: &[UnitSlot]) {
        let refs: Vec<UnitRef> = slots
            .iter()
            .filter_map(|s| s.container.as_ref().ok().cloned())
            .collect();
        self.remove_refs(&refs);
    }

    fn remove_refs(&self, refs: &[UnitRef]) {
        for unit in refs {
            match self.pool.call(|engine| engine.remove(unit, true)) {
                Ok(()) => tracing::debug!(unit = %unit, "unit removed"),
                Err(err) if err.is_not_found() => {
                    tracing::debug!(unit = %unit, "unit already gone")
                }
                Err(err) => tracing::warn!(unit = %unit, error = %err, "failed to remove unit"),
            }
        }
    }
}
