use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::api::command::Command;
use crate::api::{CommandStub, StorageStub};
use crate::{DfsError, Path, Result};

/// Shared locks a path takes before it is copied to every storage server.
pub const DEFAULT_REPLICATION_THRESHOLD: u32 = 20;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationState {
    pub read_count: u32,
    pub replicated: bool,
}

/// Read counters and replica flags per path.
///
/// A hot file is copied from its owner to every other storage server; those
/// copies are full snapshots and are deleted again before anyone writes.
pub struct ReplicationTable {
    states: Mutex<HashMap<Path, ReplicationState>>,
    threshold: u32,
}

impl ReplicationTable {
    pub fn new(threshold: u32) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Count one shared lock of `path`. Returns true each time the count
    /// reaches the threshold, which restarts the count at 1.
    pub fn record_read(&self, path: &Path) -> bool {
        let mut states = self.states.lock();
        let state = states.entry(path.clone()).or_default();
        state.read_count += 1;
        if state.read_count >= self.threshold {
            state.read_count = 1;
            true
        } else {
            false
        }
    }

    /// Copy `path` from `source` onto every target, then mark it and its
    /// ancestors replicated. Nothing is marked if any copy fails.
    pub async fn replicate(
        &self,
        path: &Path,
        source: StorageStub,
        targets: &[CommandStub],
    ) -> Result<()> {
        fan_out(targets, |target| {
            let path = path.clone();
            async move { target.copy(&path, source).await }
        })
        .await?;

        let mut states = self.states.lock();
        for p in path.ancestors().into_iter().chain(Some(path.clone())) {
            states.entry(p).or_default().replicated = true;
        }
        info!(%path, %source, replicas = targets.len(), "Replicated");
        Ok(())
    }

    /// Delete the copies of `path` held by `targets` and clear its replica
    /// flag. The flag stays set if any delete fails.
    pub async fn invalidate(&self, path: &Path, targets: &[CommandStub]) -> Result<()> {
        fan_out(targets, |target| {
            let path = path.clone();
            async move { target.delete(&path).await }
        })
        .await?;

        self.clear(path);
        info!(%path, replicas = targets.len(), "Invalidated replicas");
        Ok(())
    }

    pub fn is_replicated(&self, path: &Path) -> bool {
        self.state(path).replicated
    }

    /// `path` and every path below it that is marked replicated.
    pub fn replicated_under(&self, path: &Path) -> Vec<Path> {
        let states = self.states.lock();
        let mut found: Vec<Path> = states
            .iter()
            .filter(|(p, s)| s.replicated && p.is_subpath(path))
            .map(|(p, _)| p.clone())
            .collect();
        found.sort();
        found
    }

    pub fn clear(&self, path: &Path) {
        if let Some(state) = self.states.lock().get_mut(path) {
            state.replicated = false;
        }
    }

    /// Drop all state of `path` and its descendants.
    pub fn forget(&self, path: &Path) {
        self.states.lock().retain(|p, _| !p.is_subpath(path));
        debug!(%path, "Forgot replication state");
    }

    pub fn state(&self, path: &Path) -> ReplicationState {
        self.states.lock().get(path).copied().unwrap_or_default()
    }
}

impl Default for ReplicationTable {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICATION_THRESHOLD)
    }
}

/// Run `call` against every target in parallel and wait for all of them.
///
/// Returns each target's answer in order. Any failure is reported as `Rpc`,
/// after every call has finished.
pub(crate) async fn fan_out<F, Fut>(targets: &[CommandStub], call: F) -> Result<Vec<bool>>
where
    F: Fn(CommandStub) -> Fut,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    let handles: Vec<_> = targets
        .iter()
        .map(|target| (*target, tokio::spawn(call(*target))))
        .collect();

    let mut answers = Vec::with_capacity(handles.len());
    let mut failure = None;
    for (target, handle) in handles {
        let outcome = handle
            .await
            .unwrap_or_else(|e| Err(DfsError::Rpc(format!("task failed: {e}"))));
        match outcome {
            Ok(answer) => answers.push(answer),
            Err(e) => {
                warn!(%target, error = %e, "Storage server call failed");
                failure.get_or_insert(match e {
                    DfsError::Rpc(_) => e,
                    other => DfsError::Rpc(format!("{target}: {other}")),
                });
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(answers),
    }
}
