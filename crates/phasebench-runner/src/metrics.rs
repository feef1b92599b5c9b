use crate::engine::RawStats;
use crate::error::UnitError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub total_usage: u64,
    pub system_usage: u64,
    pub per_cpu_count: u32,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_max_usage: u64,
}

impl TryFrom<RawStats> for Snapshot {
    type Error = UnitError;

    fn try_from(raw: RawStats) -> Result<Self, Self::Error> {
        let cpu = raw.cpu_stats;
        let mem = raw.memory_stats;
        let per_cpu_count = match (&cpu.cpu_usage.percpu_usage, cpu.online_cpus) {
            (Some(per_cpu), _) if !per_cpu.is_empty() => per_cpu.len() as u32,
            (_, Some(online)) if online > 0 => online,
            _ => return Err(missing("cpu_stats.cpu_usage.percpu_usage")),
        };
        Ok(Snapshot {
            total_usage: cpu
                .cpu_usage
                .total_usage
                .ok_or_else(|| missing("cpu_stats.cpu_usage.total_usage"))?,
            system_usage: cpu
                .system_cpu_usage
                .ok_or_else(|| missing("cpu_stats.system_cpu_usage"))?,
            per_cpu_count,
            memory_usage: mem.usage.ok_or_else(|| missing("memory_stats.usage"))?,
            memory_limit: mem.limit.ok_or_else(|| missing("memory_stats.limit"))?,
            // Peak usage is absent on cgroup v2 hosts; fall back to current usage.
            memory_max_usage: mem.max_usage.or(mem.usage).unwrap_or_default(),
        })
    }
}

fn missing(field: &str) -> UnitError {
    UnitError::MeasurementIncomplete(field.to_string())
}

/// CPU share between two cumulative samples, scaled by the number of CPUs.
/// Zero whenever either counter failed to advance.
pub fn cpu_percent(
    prev_total: u64,
    prev_system: u64,
    curr_total: u64,
    curr_system: u64,
    per_cpu_count: u32,
) -> f64 {
    // Subtract before converting: the counters outgrow f64's 53-bit mantissa.
    match (curr_total.checked_sub(prev_total), curr_system.checked_sub(prev_system)) {
        (Some(cpu_delta), Some(system_delta)) if cpu_delta > 0 && system_delta > 0 => {
            (cpu_delta as f64 / system_delta as f64) * per_cpu_count as f64 * 100.0
        }
        _ => 0.0,
    }
}

pub fn memory_percent(usage: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    usage as f64 / limit as f64 * 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuMetric {
    pub total_cpu: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetric {
    pub usage: u64,
    pub max_usage: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StartupMetric {
    pub startup_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitMetrics {
    pub cpu: CpuMetric,
    pub memory: MemoryMetric,
    pub startup: StartupMetric,
}

impl UnitMetrics {
    pub fn collect(baseline: &Snapshot, last: &Snapshot, startup: Duration) -> Self {
        UnitMetrics {
            cpu: CpuMetric {
                total_cpu: last.total_usage,
                percent: cpu_percent(
                    baseline.total_usage,
                    baseline.system_usage,
                    last.total_usage,
                    last.system_usage,
                    last.per_cpu_count,
                ),
            },
            memory: MemoryMetric {
                usage: last.memory_usage,
                max_usage: last.memory_max_usage,
                percent: memory_percent(last.memory_usage, last.memory_limit),
            },
            startup: StartupMetric {
                startup_ms: startup.as_millis() as u64,
            },
        }
    }
}
