use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

// Filesystem operation a monitor event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOp {
    Add,
    Write,
    Delete,
}

// Suppression map keyed by (path, op). The engine blocks a key before
// mutating the filesystem and unblocks it one monitor poll interval
// after the mutation, so the monitor never re-reports the engine's own
// writes as user changes.
#[derive(Debug, Default)]
pub struct Interlock {
    blocked: Mutex<HashMap<(String, FileOp), bool>>,
}

impl Interlock {

    pub fn new() -> Self {
        Interlock::default()
    }

    pub fn block(&self, name: &str, op: FileOp) {
        tracing::trace!("block ({}, {:?})", name, op);
        self.lock().insert((name.to_string(), op), true);
    }

    pub fn unblock(&self, name: &str, op: FileOp) {
        tracing::trace!("unblock ({}, {:?})", name, op);
        self.lock().insert((name.to_string(), op), false);
    }

    pub fn is_blocked(&self, name: &str, op: FileOp) -> bool {
        self.lock()
            .get(&(name.to_string(), op))
            .copied()
            .unwrap_or(false)
    }

    // Unblocks after the monitor has had a chance to observe the
    // engine's mutation.
    pub fn unblock_after(self: Arc<Self>, name: String, op: FileOp, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.unblock(&name, op);
        });
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, FileOp), bool>> {
        self.blocked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
