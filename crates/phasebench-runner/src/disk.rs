use crate::engine::Engine;
use crate::pool::ResourcePool;
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

pub const DIVERGENCE_TOLERANCE_BYTES: i64 = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskSample {
    pub engine_bytes: Option<u64>,
    pub walk_bytes: Option<u64>,
}

pub struct DiskMeter<E> {
    pool: Arc<ResourcePool<E>>,
    baseline: DiskSample,
}

impl<E: Engine> DiskMeter<E> {
    pub fn new(pool: Arc<ResourcePool<E>>) -> Self {
        Self {
            pool,
            baseline: DiskSample::default(),
        }
    }

    pub fn baseline(&self) -> DiskSample {
        self.baseline
    }

    pub fn record_baseline(&mut self) {
        self.baseline = self.sample();
        tracing::debug!(
            engine_bytes = ?self.baseline.engine_bytes,
            walk_bytes = ?self.baseline.walk_bytes,
            "recorded disk baseline"
        );
    }

    pub fn sample(&self) -> DiskSample {
        let info = match self.pool.call(|engine| engine.info()) {
            Ok(info) => info,
            Err(err) => {
                tracing::error!(error = %err, "could not query engine info for disk usage");
                return DiskSample::default();
            }
        };
        let engine_bytes = info.data_space_used();
        if engine_bytes.is_none() {
            tracing::error!("\"Data Space Used\" was not found in the engine's driver status");
        }
        let walk_bytes = info.root_dir.as_deref().and_then(|dir| walk_size(Path::new(dir)));
        DiskSample {
            engine_bytes,
            walk_bytes,
        }
    }

    // Engine-reported growth since the baseline. The walk figure only feeds
    // the divergence warning.
    pub fn increase(&self) -> Option<i64> {
        let current = self.sample();
        disk_delta(self.baseline, current)
    }
}

pub fn disk_delta(baseline: DiskSample, current: DiskSample) -> Option<i64> {
    let engine_delta = match (baseline.engine_bytes, current.engine_bytes) {
        (Some(before), Some(after)) => after as i64 - before as i64,
        _ => {
            tracing::error!("engine disk usage unavailable; run disk delta not recorded");
            return None;
        }
    };
    match (baseline.walk_bytes, current.walk_bytes) {
        (Some(before), Some(after)) => {
            let walk_delta = after as i64 - before as i64;
            check_divergence(engine_delta, walk_delta);
        }
        _ => tracing::warn!(
            "at least one directory-walk measure is missing; engine disk delta not cross-checked"
        ),
    }
    Some(engine_delta)
}

pub fn check_divergence(engine_delta: i64, walk_delta: i64) -> Option<i64> {
    tracing::info!(engine_delta, walk_delta, "additional disk demanded by the engine");
    let difference = walk_delta - engine_delta;
    if difference > DIVERGENCE_TOLERANCE_BYTES {
        tracing::warn!(difference, "directory walk measures more than the engine reports");
        Some(difference)
    } else if difference < -DIVERGENCE_TOLERANCE_BYTES {
        tracing::warn!(
            difference = -difference,
            "directory walk measures less than the engine reports"
        );
        Some(difference)
    } else {
        None
    }
}

pub fn walk_size(root: &Path) -> Option<u64> {
    if !root.is_dir() {
        tracing::warn!(root = %root.display(), "engine root directory is not accessible");
        return None;
    }
    let mut total = 0u64;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_file() {
            if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    Some(total)
}
