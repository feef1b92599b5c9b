use crate::error::{FailureKind, StoreError};
use crate::metrics::UnitMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub type TestId = u64;
pub type RunId = u64;
pub type UnitId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: TestId,
    pub image_id: String,
    pub number_of_units: usize,
    pub repetitions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub disk_delta: Option<i64>,
    pub response_time_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub test_id: TestId,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub metrics: Option<RunMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcomeRecord {
    Success { metrics: UnitMetrics },
    Failure { kind: FailureKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub id: UnitId,
    pub run_id: RunId,
    pub backend_id: Option<String>,
    pub outcome: Option<UnitOutcomeRecord>,
}

impl UnitRecord {
    pub fn metrics(&self) -> Option<&UnitMetrics> {
        match &self.outcome {
            Some(UnitOutcomeRecord::Success { metrics }) => Some(metrics),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<(FailureKind, &str)> {
        match &self.outcome {
            Some(UnitOutcomeRecord::Failure { kind, message }) => Some((*kind, message.as_str())),
            _ => None,
        }
    }
}

/// Persistence for tests, runs and unit outcomes. Records are write-once:
/// a unit gets metrics or an error but never both, run metrics are saved
/// once, and a run is ended once.
pub trait MetricsStore: Send + Sync {
    fn create_test(
        &self,
        image_id: &str,
        number_of_units: usize,
        repetitions: usize,
    ) -> Result<TestId, StoreError>;
    fn test(&self, test_id: TestId) -> Result<TestRecord, StoreError>;
    fn tests(&self) -> Result<Vec<TestRecord>, StoreError>;
    fn create_run(&self, test_id: TestId) -> Result<RunId, StoreError>;
    fn run(&self, run_id: RunId) -> Result<RunRecord, StoreError>;
    fn runs_for_test(&self, test_id: TestId) -> Result<Vec<RunRecord>, StoreError>;
    fn create_unit(&self, run_id: RunId, backend_id: Option<&str>) -> Result<UnitId, StoreError>;
    fn units_for_run(&self, run_id: RunId) -> Result<Vec<UnitRecord>, StoreError>;
    fn save_unit_metrics(&self, unit_id: UnitId, metrics: &UnitMetrics) -> Result<(), StoreError>;
    fn save_unit_error(
        &self,
        unit_id: UnitId,
        kind: FailureKind,
        message: &str,
    ) -> Result<(), StoreError>;
    fn save_run_metrics(
        &self,
        run_id: RunId,
        disk_delta: Option<i64>,
        response_time_ms: Option<u64>,
    ) -> Result<(), StoreError>;
    fn mark_run_ended(&self, run_id: RunId) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    schema_version: String,
    next_id: u64,
    tests: BTreeMap<TestId, TestRecord>,
    runs: BTreeMap<RunId, RunRecord>,
    units: BTreeMap<UnitId, UnitRecord>,
}

const SCHEMA_VERSION: &str = "phasebench_store_v1";

impl StoreState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // Staged next to the document and renamed over it, so a reader never
    // sees a partial write.
    fn write_to(&self, path: &Path) -> Result<(), StoreError> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(dir) = dir {
            fs::create_dir_all(dir)?;
        }
        let document = serde_json::to_vec_pretty(self)?;
        let staged = path.with_extension(format!("partial.{}", std::process::id()));
        let mut file = fs::File::create(&staged)?;
        file.write_all(&document)?;
        file.sync_all()?;
        fs::rename(&staged, path)?;
        if let Some(dir) = dir.and_then(|d| fs::File::open(d).ok()) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

pub struct JsonStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl JsonStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let state = if path.exists() {
            let bytes = fs::read(path)?;
            serde_json::from_slice(&bytes)?
        } else {
            tracing::info!(path = %path.display(), "creating metrics store");
            let state = StoreState {
                schema_version: SCHEMA_VERSION.to_string(),
                ..StoreState::default()
            };
            state.write_to(path)?;
            state
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(state),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState {
                schema_version: SCHEMA_VERSION.to_string(),
                ..StoreState::default()
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    // Applies `f` to a copy and only commits it once it is on disk.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.path {
            next.write_to(path)?;
        }
        *guard = next;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> Result<T, StoreError>) -> Result<T, StoreError> {
        f(&self.lock())
    }
}

impl MetricsStore for JsonStore {
    fn create_test(
        &self,
        image_id: &str,
        number_of_units: usize,
        repetitions: usize,
    ) -> Result<TestId, StoreError> {
        self.mutate(|state| {
            let id = state.allocate_id();
            state.tests.insert(
                id,
                TestRecord {
                    id,
                    image_id: image_id.to_string(),
                    number_of_units,
                    repetitions,
                },
            );
            Ok(id)
        })
    }

    fn test(&self, test_id: TestId) -> Result<TestRecord, StoreError> {
        self.read(|state| {
            state
                .tests
                .get(&test_id)
                .cloned()
                .ok_or(StoreError::UnknownTest(test_id))
        })
    }

    fn tests(&self) -> Result<Vec<TestRecord>, StoreError> {
        self.read(|state| Ok(state.tests.values().cloned().collect()))
    }

    fn create_run(&self, test_id: TestId) -> Result<RunId, StoreError> {
        self.mutate(|state| {
            if !state.tests.contains_key(&test_id) {
                return Err(StoreError::UnknownTest(test_id));
            }
            let id = state.allocate_id();
            state.runs.insert(
                id,
                RunRecord {
                    id,
                    test_id,
                    started: Utc::now(),
                    ended: None,
                    metrics: None,
                },
            );
            Ok(id)
        })
    }

    fn run(&self, run_id: RunId) -> Result<RunRecord, StoreError> {
        self.read(|state| {
            state
                .runs
                .get(&run_id)
                .cloned()
                .ok_or(StoreError::UnknownRun(run_id))
        })
    }

    fn runs_for_test(&self, test_id: TestId) -> Result<Vec<RunRecord>, StoreError> {
        self.read(|state| {
            if !state.tests.contains_key(&test_id) {
                return Err(StoreError::UnknownTest(test_id));
            }
            Ok(state
                .runs
                .values()
                .filter(|r| r.test_id == test_id)
                .cloned()
                .collect())
        })
    }

    fn create_unit(&self, run_id: RunId, backend_id: Option<&str>) -> Result<UnitId, StoreError> {
        self.mutate(|state| {
            if !state.runs.contains_key(&run_id) {
                return Err(StoreError::UnknownRun(run_id));
            }
            let id = state.allocate_id();
            state.units.insert(
                id,
                UnitRecord {
                    id,
                    run_id,
                    backend_id: backend_id.map(str::to_string),
                    outcome: None,
                },
            );
            Ok(id)
        })
    }

    fn units_for_run(&self, run_id: RunId) -> Result<Vec<UnitRecord>, StoreError> {
        self.read(|state| {
            if !state.runs.contains_key(&run_id) {
                return Err(StoreError::UnknownRun(run_id));
            }
            Ok(state
                .units
                .values()
                .filter(|u| u.run_id == run_id)
                .cloned()
                .collect())
        })
    }

    fn save_unit_metrics(&self, unit_id: UnitId, metrics: &UnitMetrics) -> Result<(), StoreError> {
        self.mutate(|state| {
            set_outcome(
                state,
                unit_id,
                UnitOutcomeRecord::Success { metrics: *metrics },
            )
        })
    }

    fn save_unit_error(
        &self,
        unit_id: UnitId,
        kind: FailureKind,
        message: &str,
    ) -> Result<(), StoreError> {
        self.mutate(|state| {
            set_outcome(
                state,
                unit_id,
                UnitOutcomeRecord::Failure {
                    kind,
                    message: message.to_string(),
                },
            )
        })
    }

    fn save_run_metrics(
        &self,
        run_id: RunId,
        disk_delta: Option<i64>,
        response_time_ms: Option<u64>,
    ) -> Result<(), StoreError> {
        self.mutate(|state| {
            let run = state
                .runs
                .get_mut(&run_id)
                .ok_or(StoreError::UnknownRun(run_id))?;
            if run.metrics.is_some() {
                return Err(StoreError::RunMetricsAlreadySaved(run_id));
            }
            run.metrics = Some(RunMetrics {
                disk_delta,
                response_time_ms,
            });
            Ok(())
        })
    }

    fn mark_run_ended(&self, run_id: RunId) -> Result<(), StoreError> {
        self.mutate(|state| {
            let run = state
                .runs
                .get_mut(&run_id)
                .ok_or(StoreError::UnknownRun(run_id))?;
            if run.ended.is_some() {
                return Err(StoreError::RunAlreadyEnded(run_id));
            }
            run.ended = Some(Utc::now());
            Ok(())
        })
    }
}

fn set_outcome(
    state: &mut StoreState,
    unit_id: UnitId,
    outcome: UnitOutcomeRecord,
) -> Result<(), StoreError> {
    let unit = state
        .units
        .get_mut(&unit_id)
        .ok_or(StoreError::UnknownUnit(unit_id))?;
    if unit.outcome.is_some() {
        return Err(StoreError::UnitAlreadyTerminal(unit_id));
    }
    unit.outcome = Some(outcome);
    Ok(())
}
