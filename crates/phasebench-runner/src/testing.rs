use crate::engine::{
    Engine, EngineInfo, RawCpuStats, RawCpuUsage, RawMemoryStats, RawStats, UnitRef,
};
use crate::error::UnitError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub fail_create: Vec<usize>,
    pub fail_start: Vec<usize>,
    pub timeout_start: Vec<usize>,
    pub incomplete_stats: Vec<usize>,
    pub call_delay: Duration,
    pub slow_start: Vec<usize>,
    pub start_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Start,
    Stats,
    Stop,
    Remove,
}

#[derive(Debug, Clone)]
pub struct Op {
    pub seq: u64,
    pub kind: OpKind,
    pub unit: UnitRef,
}

#[derive(Default)]
struct FakeState {
    attempts: usize,
    indices: HashMap<UnitRef, usize>,
    published: Vec<(UnitRef, u16)>,
    stats_calls: HashMap<UnitRef, u64>,
    removed: Vec<UnitRef>,
    ops: Vec<Op>,
}

struct Inner {
    script: Script,
    seq: AtomicU64,
    state: Mutex<FakeState>,
}

#[derive(Clone)]
pub struct FakeEngine {
    inner: Arc<Inner>,
}

impl FakeEngine {
    pub fn new(script: Script) -> Self {
        Self {
            inner: Arc::new(Inner {
                script,
                seq: AtomicU64::new(0),
                state: Mutex::new(FakeState::default()),
            }),
        }
    }

    pub fn ops(&self) -> Vec<Op> {
        self.inner.state.lock().unwrap().ops.clone()
    }

    pub fn removed(&self) -> Vec<UnitRef> {
        self.inner.state.lock().unwrap().removed.clone()
    }

    pub fn published(&self) -> Vec<(UnitRef, u16)> {
        self.inner.state.lock().unwrap().published.clone()
    }

    pub fn tick(&self) -> u64 {
        self.inner.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn index_of(&self, unit: &UnitRef) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.indices.get(unit).copied().unwrap_or(usize::MAX)
    }

    fn record(&self, kind: OpKind, unit: &UnitRef) -> usize {
        if !self.inner.script.call_delay.is_zero() {
            thread::sleep(self.inner.script.call_delay);
        }
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock().unwrap();
        state.ops.push(Op {
            seq,
            kind,
            unit: unit.clone(),
        });
        state.indices.get(unit).copied().unwrap_or(usize::MAX)
    }
}

impl Engine for FakeEngine {
    fn create(&self, _image: &str, publish: Option<u16>) -> Result<UnitRef, UnitError> {
        let index = {
            let mut state = self.inner.state.lock().unwrap();
            let index = state.attempts;
            state.attempts += 1;
            index
        };
        if self.inner.script.fail_create.contains(&index) {
            return Err(UnitError::api(Some(404), "No such image"));
        }
        let unit = UnitRef(format!("fake{:04}container", index));
        {
            let mut state = self.inner.state.lock().unwrap();
            state.indices.insert(unit.clone(), index);
            if let Some(port) = publish {
                state.published.push((unit.clone(), port));
            }
        }
        self.record(OpKind::Create, &unit);
        Ok(unit)
    }

    fn start(&self, unit: &UnitRef) -> Result<(), UnitError> {
        if self.inner.script.slow_start.contains(&self.index_of(unit)) {
            thread::sleep(self.inner.script.start_delay);
        }
        let index = self.record(OpKind::Start, unit);
        if self.inner.script.fail_start.contains(&index) {
            return Err(UnitError::api(Some(500), "cannot start container"));
        }
        if self.inner.script.timeout_start.contains(&index) {
            return Err(UnitError::BackendTimeout("operation timed out".into()));
        }
        Ok(())
    }

    fn stats(&self, unit: &UnitRef) -> Result<RawStats, UnitError> {
        let index = self.record(OpKind::Stats, unit);
        let n = {
            let mut state = self.inner.state.lock().unwrap();
            let calls = state.stats_calls.entry(unit.clone()).or_insert(0);
            let n = *calls;
            *calls += 1;
            n
        };
        let mut raw = RawStats {
            cpu_stats: RawCpuStats {
                cpu_usage: RawCpuUsage {
                    total_usage: Some(100 + 50 * n),
                    percpu_usage: Some(vec![0, 0]),
                },
                system_cpu_usage: Some(1000 + 100 * n),
                online_cpus: None,
            },
            memory_stats: RawMemoryStats {
                usage: Some(512),
                limit: Some(2048),
                max_usage: Some(1024),
            },
        };
        if self.inner.script.incomplete_stats.contains(&index) {
            raw.memory_stats.limit = None;
        }
        Ok(raw)
    }

    fn stop(&self, unit: &UnitRef) -> Result<(), UnitError> {
        self.record(OpKind::Stop, unit);
        Ok(())
    }

    fn remove(&self, unit: &UnitRef, _force: bool) -> Result<(), UnitError> {
        self.record(OpKind::Remove, unit);
        let mut state = self.inner.state.lock().unwrap();
        if state.removed.contains(unit) {
            return Err(UnitError::api(Some(404), "No such container"));
        }
        state.removed.push(unit.clone());
        Ok(())
    }

    fn info(&self) -> Result<EngineInfo, UnitError> {
        let created = self.inner.state.lock().unwrap().indices.len() as u64;
        let removed = self.inner.state.lock().unwrap().removed.len() as u64;
        let used = 10_000 + 4096 * created.saturating_sub(removed);
        Ok(EngineInfo {
            driver_status: Some(vec![vec![
                "Data Space Used".to_string(),
                format!("{} B", used),
            ]]),
            root_dir: None,
        })
    }
}
