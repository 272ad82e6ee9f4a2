use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::api::{CommandStub, StorageHandle, StorageStub};
use crate::{DfsError, Path, Result};

/// Kind of an indexed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One tracked path: what it is and which storage server owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub kind: EntryKind,
    pub owner: CommandStub,
}

/// Authoritative map from path to owning storage server, plus the set of
/// registered servers.
///
/// The map is flat: a directory exists because it has an entry of its own,
/// created when the first descendant was registered or by an explicit
/// directory creation. The root is never stored and always exists.
///
/// Lock order is `registration`, then `servers`, then `entries`.
pub struct OwnershipIndex {
    entries: RwLock<BTreeMap<Path, IndexEntry>>,
    /// Registered storage servers, in registration order.
    servers: RwLock<Vec<StorageHandle>>,
    registration: Mutex<()>,
}

impl OwnershipIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            servers: RwLock::new(Vec::new()),
            registration: Mutex::new(()),
        }
    }

    /// Register a storage server and the files it advertises.
    ///
    /// Unowned paths are recorded under `command`, and so are their missing
    /// ancestor directories. Paths owned by another server, the root, and
    /// paths below an existing file are returned as conflicts. The first
    /// registrant of a path keeps it.
    pub fn register(
        &self,
        storage: StorageStub,
        command: CommandStub,
        paths: Vec<Path>,
    ) -> Result<Vec<Path>> {
        let _registering = self.registration.lock();

        {
            let mut servers = self.servers.write();
            if servers.iter().any(|h| h.command == command) {
                return Err(DfsError::BadState(format!("{command} is already registered")));
            }
            servers.push(StorageHandle { command, storage });
        }

        let advertised = paths.len();
        let mut conflicts = Vec::new();
        let mut entries = self.entries.write();
        for path in paths {
            match entries.get(&path) {
                Some(existing) if existing.owner == command => continue,
                Some(_) => {
                    conflicts.push(path);
                    continue;
                }
                None => {}
            }

            let ancestors = path.ancestors();
            let below_file = ancestors
                .iter()
                .any(|a| matches!(entries.get(a), Some(e) if e.kind == EntryKind::File));
            if path.is_root() || below_file {
                conflicts.push(path);
                continue;
            }

            // ancestors[0] is the root, which is never stored
            for ancestor in ancestors.into_iter().skip(1) {
                entries.entry(ancestor).or_insert(IndexEntry {
                    kind: EntryKind::Directory,
                    owner: command,
                });
            }
            entries.insert(
                path,
                IndexEntry {
                    kind: EntryKind::File,
                    owner: command,
                },
            );
        }

        info!(
            server = %command,
            advertised,
            conflicts = conflicts.len(),
            "Registered storage server"
        );
        Ok(conflicts)
    }

    pub fn get(&self, path: &Path) -> Option<IndexEntry> {
        self.entries.read().get(path).copied()
    }

    /// Kind of `path`; the root is always a directory.
    pub fn kind(&self, path: &Path) -> Option<EntryKind> {
        if path.is_root() {
            return Some(EntryKind::Directory);
        }
        self.get(path).map(|e| e.kind)
    }

    /// True for the root and for every tracked path.
    pub fn exists(&self, path: &Path) -> bool {
        path.is_root() || self.entries.read().contains_key(path)
    }

    /// Names of the direct children of `dir`, sorted.
    pub fn children(&self, dir: &Path) -> Vec<String> {
        let entries = self.entries.read();
        let mut names: Vec<String> = entries
            .keys()
            .filter(|p| p.depth() == dir.depth() + 1 && p.is_subpath(dir))
            .filter_map(|p| p.last().ok().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    /// Record `path` unless it is already tracked. Returns whether it was
    /// inserted.
    pub fn insert_if_absent(&self, path: &Path, kind: EntryKind, owner: CommandStub) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(path) {
            return false;
        }
        entries.insert(path.clone(), IndexEntry { kind, owner });
        debug!(%path, ?kind, %owner, "Indexed path");
        true
    }

    /// Remove `path` and everything below it. Returns the removed paths.
    pub fn remove_tree(&self, path: &Path) -> Vec<Path> {
        let mut entries = self.entries.write();
        let doomed: Vec<Path> = entries
            .keys()
            .filter(|p| p.is_subpath(path))
            .cloned()
            .collect();
        for p in &doomed {
            entries.remove(p);
        }
        doomed
    }

    /// Every registered storage server, in registration order.
    pub fn handles(&self) -> Vec<StorageHandle> {
        self.servers.read().clone()
    }

    pub fn handle_for(&self, command: &CommandStub) -> Option<StorageHandle> {
        self.servers
            .read()
            .iter()
            .find(|h| h.command == *command)
            .copied()
    }

    /// The first registered storage server, used when a new path has no
    /// owned parent to inherit from.
    pub fn any_server(&self) -> Option<StorageHandle> {
        self.servers.read().first().copied()
    }

    /// The owning storage server of a tracked path.
    pub fn owner(&self, path: &Path) -> Option<StorageHandle> {
        self.get(path).and_then(|e| self.handle_for(&e.owner))
    }
}

impl Default for OwnershipIndex {
    fn default() -> Self {
        Self::new()
    }
}
