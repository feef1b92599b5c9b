use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub engine: EngineConfig,
    pub store: StoreConfig,
    pub run: RunConfig,
    pub probe: ProbeConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub url: String,
    pub max_concurrent_requests: usize,
    pub max_handles: usize,
    pub request_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:2375".to_string(),
            max_concurrent_requests: 5,
            max_handles: 1,
            request_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/benchmark.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub min_duration_secs: f64,
    pub host: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            min_duration_secs: 5.0,
            host: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub enabled: bool,
    pub program: String,
    pub args: Vec<String>,
    pub port: u16,
    pub timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: "java".to_string(),
            args: vec!["-jar".to_string(), "PTChecker.jar".to_string()],
            port: 39000,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub path: Option<PathBuf>,
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: BenchConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.url.trim().is_empty() {
            bail!("engine.url must not be empty");
        }
        if self.engine.max_concurrent_requests == 0 {
            bail!("engine.max_concurrent_requests must be at least 1");
        }
        if self.engine.max_handles == 0 {
            bail!("engine.max_handles must be at least 1");
        }
        if Duration::try_from_secs_f64(self.run.min_duration_secs).is_err() {
            return Err(anyhow!(
                "run.min_duration_secs must be a non-negative number of seconds that fits a duration, got {}",
                self.run.min_duration_secs
            ));
        }
        if self.probe.enabled && self.probe.program.trim().is_empty() {
            bail!("probe.program must be set when the probe is enabled");
        }
        Ok(())
    }

    pub fn settings(&self) -> RunSettings {
        RunSettings {
            // validate() rejects values that do not fit.
            min_duration: Duration::try_from_secs_f64(self.run.min_duration_secs)
                .unwrap_or_default(),
            probe_host: self.run.host.clone(),
            probe_port: self.probe.port,
            probe_timeout: Duration::from_secs(self.probe.timeout_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub min_duration: Duration,
    pub probe_host: String,
    pub probe_port: u16,
    pub probe_timeout: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        BenchConfig::default().settings()
    }
}
