use crate::domain::types::RunId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Single-flight guard keyed by run id.
///
/// At most one lease per run exists at a time; dropping the lease frees
/// the run for the next driver.
#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    active: Arc<Mutex<HashSet<RunId>>>,
}

#[derive(Debug)]
pub struct RunLease {
    active: Arc<Mutex<HashSet<RunId>>>,
    run_id: RunId,
}

fn lock(active: &Mutex<HashSet<RunId>>) -> MutexGuard<'_, HashSet<RunId>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` while another lease for `run_id` is alive.
    pub fn try_acquire(&self, run_id: RunId) -> Option<RunLease> {
        if !lock(&self.active).insert(run_id) {
            return None;
        }
        Some(RunLease {
            active: self.active.clone(),
            run_id,
        })
    }

    pub fn is_active(&self, run_id: RunId) -> bool {
        lock(&self.active).contains(&run_id)
    }
}

impl RunLease {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.run_id);
    }
}
