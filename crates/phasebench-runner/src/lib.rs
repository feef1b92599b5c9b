pub mod barrier;
pub mod benchmark;
pub mod config;
pub mod disk;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod phases;
pub mod pool;
pub mod probe;
pub mod report;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;

pub use benchmark::{prepare_test, Benchmark};
pub use config::{BenchConfig, RunSettings};
pub use engine::{DockerEngine, Engine, UnitRef};
pub use error::{FailureKind, ProbeError, StoreError, UnitError};
pub use orchestrator::{Orchestrator, RunReport};
pub use report::{summarize_run, summarize_test, RunSummary, TestSummary};
pub use store::{JsonStore, MetricsStore, RunId, TestId, UnitId};
