use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::{DfsError, Path, Result};

/// Hold counts of one path. `writers` is 0 or 1 and never coexists with
/// readers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LockState {
    pub readers: usize,
    pub writers: usize,
    pub pending_writers: usize,
}

impl LockState {
    fn can_read(&self) -> bool {
        self.writers == 0 && self.pending_writers == 0
    }

    fn can_write(&self) -> bool {
        self.writers == 0 && self.readers == 0
    }

    fn holds(&self, exclusive: bool) -> bool {
        if exclusive {
            self.writers > 0
        } else {
            self.readers > 0
        }
    }
}

/// Writer-priority reader/writer lock for one path.
#[derive(Default)]
struct PathLock {
    state: Mutex<LockState>,
    released: Notify,
}

impl PathLock {
    async fn acquire(&self, exclusive: bool) {
        let _pending = exclusive.then(|| PendingWriter::new(self));
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking, or a release between the check and
            // the await is missed.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if exclusive && state.can_write() {
                    state.writers = 1;
                    return;
                }
                if !exclusive && state.can_read() {
                    state.readers += 1;
                    return;
                }
            }
            notified.await;
        }
    }

    /// Take a shared hold without waiting. Only valid while the caller
    /// already holds this path shared, so no writer can be active.
    fn share_held(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0 && state.writers == 0);
        state.readers += 1;
    }
}

/// Counts a writer as pending for as long as it waits. Dropping it after the
/// grant, or when the waiting future is dropped, withdraws the claim.
struct PendingWriter<'a>(&'a PathLock);

impl<'a> PendingWriter<'a> {
    fn new(lock: &'a PathLock) -> Self {
        lock.state.lock().pending_writers += 1;
        Self(lock)
    }
}

impl Drop for PendingWriter<'_> {
    fn drop(&mut self) {
        self.0.state.lock().pending_writers -= 1;
        self.0.released.notify_waiters();
    }
}

/// Per-path lock state, created on first use.
///
/// Every `lock` takes shared holds on the ancestors from the root down, then
/// the requested hold on the path, then an extra shared hold on the root.
/// Since all callers climb down the tree in the same order, no two callers
/// can wait on each other in a cycle.
#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<Path, Arc<PathLock>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, path: &Path) -> Arc<PathLock> {
        self.locks.lock().entry(path.clone()).or_default().clone()
    }

    fn existing(&self, path: &Path) -> Option<Arc<PathLock>> {
        self.locks.lock().get(path).cloned()
    }

    /// Acquire `path` for shared or exclusive access, waiting as long as it
    /// takes.
    pub async fn lock(&self, path: &Path, exclusive: bool) {
        for ancestor in path.ancestors() {
            self.entry(&ancestor).acquire(false).await;
        }
        self.entry(path).acquire(exclusive).await;
        if !path.is_root() {
            self.entry(&Path::root()).share_held();
        }
        trace!(%path, exclusive, "Locked");
    }

    /// Release every hold taken by a matching [`LockTable::lock`].
    ///
    /// Fails with `BadArgument`, changing nothing, if any of those holds is
    /// not currently held.
    pub fn unlock(&self, path: &Path, exclusive: bool) -> Result<()> {
        let not_held = || {
            DfsError::BadArgument(format!(
                "{} lock on {path} is not held",
                if exclusive { "exclusive" } else { "shared" }
            ))
        };

        let mut locks = Vec::new();
        for p in path.ancestors().iter().chain(Some(path)) {
            locks.push(self.existing(p).ok_or_else(not_held)?);
        }

        // Check and release under the same guards, taken root first like
        // `lock`, so two unlocks of one hold cannot both pass the check.
        let mut states: Vec<_> = locks.iter().map(|l| l.state.lock()).collect();
        let Some((target, chain)) = states.split_last_mut() else {
            return Err(not_held());
        };
        if !target.holds(exclusive) {
            return Err(not_held());
        }
        if let Some((root, rest)) = chain.split_first() {
            // The root carries the ancestor hold and the extra one.
            if root.readers < 2 || rest.iter().any(|s| !s.holds(false)) {
                return Err(not_held());
            }
        }

        if exclusive {
            target.writers = 0;
        } else {
            target.readers -= 1;
        }
        for (depth, state) in chain.iter_mut().enumerate() {
            state.readers -= if depth == 0 { 2 } else { 1 };
        }
        drop(states);

        for lock in &locks {
            lock.released.notify_waiters();
        }
        trace!(%path, exclusive, "Unlocked");
        Ok(())
    }

    /// Current hold counts of `path`; idle if it was never locked.
    pub fn state(&self, path: &Path) -> LockState {
        self.existing(path)
            .map(|l| *l.state.lock())
            .unwrap_or_default()
    }
}
