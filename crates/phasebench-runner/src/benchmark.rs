use crate::config::BenchConfig;
use crate::engine::{DockerEngine, Engine};
use crate::orchestrator::{Orchestrator, RunReport};
use crate::pool::ResourcePool;
use crate::probe::{CommandProbe, ResponseProbe};
use crate::store::{JsonStore, MetricsStore, TestId, TestRecord};
use anyhow::{bail, Context, Result};
use std::sync::Arc;

pub struct Benchmark<E> {
    orchestrator: Orchestrator<E>,
}

impl Benchmark<DockerEngine> {
    pub fn from_config(config: &BenchConfig) -> Result<Self> {
        config.validate()?;
        let engine_config = config.engine.clone();
        let pool = ResourcePool::new(
            engine_config.max_concurrent_requests,
            engine_config.max_handles,
            Box::new(move || DockerEngine::connect(&engine_config)),
        )?;
        let store = JsonStore::open(&config.store.path).with_context(|| {
            format!("failed to open store {}", config.store.path.display())
        })?;
        let mut orchestrator =
            Orchestrator::new(config.settings(), pool, Arc::new(store) as Arc<dyn MetricsStore>);
        if config.probe.enabled {
            orchestrator = orchestrator
                .with_probe(Arc::new(CommandProbe::from_config(&config.probe)) as Arc<dyn ResponseProbe>);
        }
        Ok(Self::new(orchestrator))
    }
}

impl<E: Engine + 'static> Benchmark<E> {
    pub fn new(orchestrator: Orchestrator<E>) -> Self {
        Self { orchestrator }
    }

    pub fn store(&self) -> &Arc<dyn MetricsStore> {
        self.orchestrator.store()
    }

    pub fn prepare(&self, image: &str, units: usize, repetitions: usize) -> Result<TestId> {
        prepare_test(self.store().as_ref(), image, units, repetitions)
    }

    pub fn run_test(&self, test_id: TestId) -> Result<Vec<RunReport>> {
        let store = self.store();
        let test = store
            .test(test_id)
            .with_context(|| format!("failed to load test {}", test_id))?;
        let ended = store
            .runs_for_test(test_id)?
            .iter()
            .filter(|run| run.ended.is_some())
            .count();
        let remaining = test.repetitions.saturating_sub(ended);
        tracing::info!(
            test_id,
            image = %test.image_id,
            units = test.number_of_units,
            repetitions = test.repetitions,
            ended,
            remaining,
            "running test"
        );

        let mut reports = Vec::with_capacity(remaining);
        for repetition in 0..remaining {
            let run_id = store
                .create_run(test_id)
                .with_context(|| format!("failed to create run for test {}", test_id))?;
            tracing::info!(test_id, run_id, repetition = ended + repetition + 1, "run created");
            let report = self
                .orchestrator
                .execute(run_id, test.number_of_units, &test.image_id)
                .with_context(|| format!("run {} of test {} failed", run_id, test_id))?;
            reports.push(report);
        }
        Ok(reports)
    }
}

pub fn prepare_test(
    store: &dyn MetricsStore,
    image: &str,
    units: usize,
    repetitions: usize,
) -> Result<TestId> {
    if image.trim().is_empty() {
        bail!("image must not be empty");
    }
    if units == 0 {
        bail!("a test needs at least one unit");
    }
    if repetitions == 0 {
        bail!("a test needs at least one repetition");
    }
    let id = store.create_test(image, units, repetitions)?;
    tracing::info!(test_id = id, image, units, repetitions, "test prepared");
    Ok(id)
}

pub fn describe_test(test: &TestRecord) -> String {
    format!(
        "test {}: {} x {} units, {} repetitions",
        test.id, test.image_id, test.number_of_units, test.repetitions
    )
}
