use crate::barrier::Barrier;
use anyhow::{bail, Context, Result};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    Ready,
    AllStarted,
    End,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Ready => "ready",
            Phase::AllStarted => "all_started",
            Phase::End => "end",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// The barriers shared by every thread of one run.
// `init` and `all_started` count the units plus the minimum-duration thread,
// `end` counts the units plus the probe thread, and `ready` pairs the
// designated unit with the probe thread.
#[derive(Debug)]
pub struct PhaseBarriers {
    pub init: Barrier,
    pub ready: Barrier,
    pub all_started: Barrier,
    pub end: Barrier,
}

impl PhaseBarriers {
    pub fn for_units(unit_count: usize) -> Result<Arc<Self>> {
        if unit_count == 0 {
            bail!("a run needs at least one unit");
        }
        let parties = unit_count + 1;
        let build = |phase: Phase, n: usize| {
            Barrier::new(n).with_context(|| format!("failed to create {} barrier", phase))
        };
        Ok(Arc::new(Self {
            init: build(Phase::Init, parties)?,
            ready: build(Phase::Ready, 2)?,
            all_started: build(Phase::AllStarted, parties)?,
            end: build(Phase::End, parties)?,
        }))
    }

    pub fn forfeit(&self, phases: &[Phase]) {
        for phase in phases {
            self.get(*phase).arrive();
        }
    }

    pub fn get(&self, phase: Phase) -> &Barrier {
        match phase {
            Phase::Init => &self.init,
            Phase::Ready => &self.ready,
            Phase::AllStarted => &self.all_started,
            Phase::End => &self.end,
        }
    }
}

pub fn unit_phases(designated: bool) -> Vec<Phase> {
    let mut phases = vec![Phase::Init];
    if designated {
        phases.push(Phase::Ready);
    }
    phases.push(Phase::AllStarted);
    phases.push(Phase::End);
    phases
}

/// One thread's walk through its registered barriers, in order.
///
/// Whatever happens to the thread, every barrier it registered for is waited
/// on exactly once: `pass` catches up on skipped phases, and dropping the
/// track (normal exit, early return, or unwinding) passes the rest.
pub struct PhaseTrack {
    barriers: Arc<PhaseBarriers>,
    registered: Vec<Phase>,
    passed: usize,
    label: String,
}

impl PhaseTrack {
    pub fn new(barriers: Arc<PhaseBarriers>, registered: Vec<Phase>, label: impl Into<String>) -> Self {
        Self {
            barriers,
            registered,
            passed: 0,
            label: label.into(),
        }
    }

    pub fn for_unit(barriers: Arc<PhaseBarriers>, designated: bool, label: impl Into<String>) -> Self {
        Self::new(barriers, unit_phases(designated), label)
    }

    pub fn registered(&self) -> &[Phase] {
        &self.registered
    }

    pub fn passed(&self) -> &[Phase] {
        &self.registered[..self.passed]
    }

    pub fn pass(&mut self, phase: Phase) {
        while self.passed < self.registered.len() && self.registered[self.passed] <= phase {
            let next = self.registered[self.passed];
            tracing::trace!(unit = %self.label, phase = %next, "waiting at barrier");
            self.barriers.get(next).wait();
            self.passed += 1;
        }
    }

    pub fn release_remaining(&mut self) {
        if let Some(&last) = self.registered.last() {
            if self.passed < self.registered.len() {
                tracing::debug!(
                    unit = %self.label,
                    remaining = self.registered.len() - self.passed,
                    "passing remaining barriers"
                );
            }
            self.pass(last);
        }
    }
}

impl Drop for PhaseTrack {
    fn drop(&mut self) {
        self.release_remaining();
    }
}
