use crate::store::{MetricsStore, RunId, TestId};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Spread {
    pub mean: f64,
    pub max: f64,
}

impl Spread {
    fn over(values: &[f64]) -> Option<Self> {
        let mean = mean(values)?;
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Spread { mean, max })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub test_id: TestId,
    pub ended: bool,
    pub units: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
    pub errors_by_kind: BTreeMap<String, usize>,
    pub cpu_percent: Option<Spread>,
    pub memory_percent: Option<Spread>,
    pub mean_startup_ms: Option<f64>,
    pub disk_delta: Option<i64>,
    pub response_time_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestSummary {
    pub test_id: TestId,
    pub image_id: String,
    pub number_of_units: usize,
    pub repetitions: usize,
    pub runs_ended: usize,
    pub runs_unfinished: usize,
    pub mean_cpu_percent: Option<f64>,
    pub mean_memory_percent: Option<f64>,
    pub mean_startup_ms: Option<f64>,
    pub mean_disk_delta: Option<f64>,
    pub mean_response_time_ms: Option<f64>,
    pub runs: Vec<RunSummary>,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn mean_of(runs: &[RunSummary], pick: impl Fn(&RunSummary) -> Option<f64>) -> Option<f64> {
    let values: Vec<f64> = runs.iter().filter_map(|run| pick(run)).collect();
    mean(&values)
}

// Only units with stored metrics feed the CPU, memory and startup figures.
pub fn summarize_run(store: &dyn MetricsStore, run_id: RunId) -> Result<RunSummary> {
    let run = store
        .run(run_id)
        .with_context(|| format!("failed to load run {}", run_id))?;
    let units = store.units_for_run(run_id)?;

    let mut errors_by_kind = BTreeMap::new();
    let mut cpu = Vec::new();
    let mut memory = Vec::new();
    let mut startup = Vec::new();
    for unit in &units {
        if let Some(metrics) = unit.metrics() {
            cpu.push(metrics.cpu.percent);
            memory.push(metrics.memory.percent);
            startup.push(metrics.startup.startup_ms as f64);
        } else if let Some((kind, _)) = unit.failure() {
            *errors_by_kind.entry(kind.as_str().to_string()).or_insert(0) += 1;
        }
    }
    let succeeded = cpu.len();
    let failed: usize = errors_by_kind.values().sum();

    Ok(RunSummary {
        run_id,
        test_id: run.test_id,
        ended: run.ended.is_some(),
        units: units.len(),
        succeeded,
        failed,
        pending: units.len() - succeeded - failed,
        errors_by_kind,
        cpu_percent: Spread::over(&cpu),
        memory_percent: Spread::over(&memory),
        mean_startup_ms: mean(&startup),
        disk_delta: run.metrics.as_ref().and_then(|m| m.disk_delta),
        response_time_ms: run.metrics.as_ref().and_then(|m| m.response_time_ms),
    })
}

pub fn summarize_test(store: &dyn MetricsStore, test_id: TestId) -> Result<TestSummary> {
    let test = store
        .test(test_id)
        .with_context(|| format!("failed to load test {}", test_id))?;
    let runs = store.runs_for_test(test_id)?;

    let mut summaries = Vec::new();
    let mut unfinished = 0;
    for run in &runs {
        if run.ended.is_none() {
            unfinished += 1;
            continue;
        }
        summaries.push(summarize_run(store, run.id)?);
    }

    let mean_cpu_percent = mean_of(&summaries, |s| s.cpu_percent.map(|c| c.mean));
    let mean_memory_percent = mean_of(&summaries, |s| s.memory_percent.map(|m| m.mean));
    let mean_startup_ms = mean_of(&summaries, |s| s.mean_startup_ms);
    let mean_disk_delta = mean_of(&summaries, |s| s.disk_delta.map(|d| d as f64));
    let mean_response_time_ms = mean_of(&summaries, |s| s.response_time_ms.map(|r| r as f64));

    Ok(TestSummary {
        test_id,
        image_id: test.image_id,
        number_of_units: test.number_of_units,
        repetitions: test.repetitions,
        runs_ended: summaries.len(),
        runs_unfinished: unfinished,
        mean_cpu_percent,
        mean_memory_percent,
        mean_startup_ms,
        mean_disk_delta,
        mean_response_time_ms,
        runs: summaries,
    })
}
