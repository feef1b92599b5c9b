use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::ExitStatus;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    #[error("backend timed out: {0}")]
    BackendTimeout(String),

    #[error("backend API error{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    BackendApi {
        status: Option<u16>,
        message: String,
    },

    #[error("measurement incomplete: snapshot is missing {0}")]
    MeasurementIncomplete(String),

    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl UnitError {
    pub fn api(status: Option<u16>, message: impl Into<String>) -> Self {
        UnitError::BackendApi {
            status,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            UnitError::BackendTimeout(_) => FailureKind::BackendTimeout,
            UnitError::BackendApi { .. } => FailureKind::BackendApi,
            UnitError::MeasurementIncomplete(_) => FailureKind::MeasurementIncomplete,
            UnitError::Unexpected(_) => FailureKind::Unexpected,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, UnitError::BackendApi { status: Some(404), .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BackendTimeout,
    BackendApi,
    MeasurementIncomplete,
    Unexpected,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::BackendTimeout => "backend_timeout",
            FailureKind::BackendApi => "backend_api",
            FailureKind::MeasurementIncomplete => "measurement_incomplete",
            FailureKind::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown test: {0}")]
    UnknownTest(u64),

    #[error("unknown run: {0}")]
    UnknownRun(u64),

    #[error("unknown unit: {0}")]
    UnknownUnit(u64),

    #[error("unit {0} already has a terminal outcome")]
    UnitAlreadyTerminal(u64),

    #[error("run {0} already has run-level metrics")]
    RunMetricsAlreadySaved(u64),

    #[error("run {0} is already marked ended")]
    RunAlreadyEnded(u64),

    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to launch probe '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("probe exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },

    #[error("probe output is not a latency in milliseconds: {0:?}")]
    Parse(String),
}
