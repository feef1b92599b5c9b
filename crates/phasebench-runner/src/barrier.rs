use anyhow::{bail, Result};
use std::sync::{Condvar, Mutex, MutexGuard};

/// Single-use rendezvous for a fixed number of parties.
///
/// `wait()` blocks until `parties` calls have been observed, then every waiter
/// returns. There is no generation counter: once released the barrier stays
/// open and later calls return immediately. There is no timeout either; a party
/// that never arrives keeps the others blocked.
#[derive(Debug)]
pub struct Barrier {
    parties: usize,
    arrived: Mutex<usize>,
    cv: Condvar,
}

impl Barrier {
    pub fn new(parties: usize) -> Result<Self> {
        if parties == 0 {
            bail!("barrier needs at least one party");
        }
        Ok(Self {
            parties,
            arrived: Mutex::new(0),
            cv: Condvar::new(),
        })
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    pub fn arrived(&self) -> usize {
        *self.lock()
    }

    pub fn is_released(&self) -> bool {
        self.arrived() >= self.parties
    }

    pub fn wait(&self) {
        let mut arrived = self.count_arrival();
        while *arrived < self.parties {
            arrived = match self.cv.wait(arrived) {
                Ok(guard) => guard,
                Err(poison) => poison.into_inner(),
            };
        }
    }

    pub fn arrive(&self) {
        drop(self.count_arrival());
    }

    fn count_arrival(&self) -> MutexGuard<'_, usize> {
        let mut arrived = self.lock();
        *arrived += 1;
        if *arrived >= self.parties {
            self.cv.notify_all();
        }
        arrived
    }

    // A panicking party must not wedge its siblings, so poison is ignored.
    fn lock(&self) -> MutexGuard<'_, usize> {
        match self.arrived.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }
}
