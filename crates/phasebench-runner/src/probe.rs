use crate::config::ProbeConfig;
use crate::error::ProbeError;
use std::process::{Command, Stdio};
use std::time::Duration;

pub trait ResponseProbe: Send + Sync {
    fn measure(&self, host: &str, port: u16, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// Runs `<program> <args..> <host> <port> <timeout_secs>` and reads the
/// latency in milliseconds from the last non-empty stdout line.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    program: String,
    args: Vec<String>,
}

impl CommandProbe {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }
}

impl ResponseProbe for CommandProbe {
    fn measure(&self, host: &str, port: u16, timeout: Duration) -> Result<Duration, ProbeError> {
        tracing::info!(host, port, "measuring response time");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(host)
            .arg(port.to_string())
            .arg(timeout.as_secs().to_string())
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ProbeError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr)
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("")
                .to_string();
            return Err(ProbeError::Failed {
                status: output.status,
                stderr,
            });
        }
        let latency = parse_latency(&String::from_utf8_lossy(&output.stdout))?;
        tracing::info!(latency_ms = latency.as_millis() as u64, "response time measured");
        Ok(latency)
    }
}

pub fn parse_latency(stdout: &str) -> Result<Duration, ProbeError> {
    let line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim();
    line.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ProbeError::Parse(line.to_string()))
}
