//! The naming server: the single authority on which paths exist, who owns
//! them, and who may touch them.

pub mod index;
pub mod lock;
pub mod replication;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::api::command::Command;
use crate::api::registration::{Registration, RegistrationApi};
use crate::api::service::{Service, ServiceApi};
use crate::api::{CommandStub, RegistrationStub, ServiceStub, StorageHandle, StorageStub};
use crate::rmi::skeleton::DEFAULT_MAX_WORKERS;
use crate::rmi::{Skeleton, Stub};
use crate::{DfsError, Path, Result};

use index::{EntryKind, OwnershipIndex};
use lock::LockTable;
use replication::{fan_out, ReplicationTable, DEFAULT_REPLICATION_THRESHOLD};

/// Well-known port of the client-facing service interface.
pub const SERVICE_PORT: u16 = 6000;
/// Well-known port of the registration interface.
pub const REGISTRATION_PORT: u16 = 6001;

#[derive(Debug, Clone)]
pub struct NamingConfig {
    pub service_addr: SocketAddr,
    pub registration_addr: SocketAddr,
    pub replication_threshold: u32,
    pub max_workers: usize,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            service_addr: SocketAddr::from(([127, 0, 0, 1], SERVICE_PORT)),
            registration_addr: SocketAddr::from(([127, 0, 0, 1], REGISTRATION_PORT)),
            replication_threshold: DEFAULT_REPLICATION_THRESHOLD,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

/// Service and registration logic of the naming server, without the network.
pub struct NameService {
    index: OwnershipIndex,
    locks: LockTable,
    replication: ReplicationTable,
}

impl NameService {
    pub fn new(replication_threshold: u32) -> Self {
        Self {
            index: OwnershipIndex::new(),
            locks: LockTable::new(),
            replication: ReplicationTable::new(replication_threshold),
        }
    }

    pub fn index(&self) -> &OwnershipIndex {
        &self.index
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn replication(&self) -> &ReplicationTable {
        &self.replication
    }

    fn kind_of(&self, path: &Path) -> Result<EntryKind> {
        self.index.kind(path).ok_or_else(|| DfsError::not_found(path))
    }

    /// Command stubs of every registered server except `owner`.
    fn non_owners(&self, owner: &CommandStub) -> Vec<CommandStub> {
        self.index
            .handles()
            .into_iter()
            .map(|h| h.command)
            .filter(|c| c != owner)
            .collect()
    }

    /// Count a shared lock of `path` and copy the file to every other server
    /// once it is hot.
    async fn replicate_if_hot(&self, path: &Path) -> Result<()> {
        if !self.replication.record_read(path) {
            return Ok(());
        }
        let owner = match self.index.get(path) {
            Some(entry) if entry.kind == EntryKind::File => entry.owner,
            _ => {
                debug!(%path, "Read threshold reached on a directory, nothing to copy");
                return Ok(());
            }
        };
        let source = self
            .index
            .handle_for(&owner)
            .ok_or_else(|| DfsError::BadState(format!("owner of {path} is not registered")))?;
        let targets = self.non_owners(&owner);
        self.replication
            .replicate(path, source.storage, &targets)
            .await
    }

    /// Remove every replica at or below `path` before a writer gets in.
    async fn invalidate_replicas(&self, path: &Path) -> Result<()> {
        if !self.replication.is_replicated(path) {
            return Ok(());
        }
        let (files, directories): (Vec<Path>, Vec<Path>) = self
            .replication
            .replicated_under(path)
            .into_iter()
            .partition(|p| self.index.kind(p) == Some(EntryKind::File));

        for file in &files {
            let owner = match self.index.get(file) {
                Some(entry) => entry.owner,
                None => {
                    self.replication.clear(file);
                    continue;
                }
            };
            let targets = self.non_owners(&owner);
            self.replication.invalidate(file, &targets).await?;
        }
        for directory in &directories {
            self.replication.clear(directory);
        }
        Ok(())
    }
}

#[async_trait]
impl Service for NameService {
    async fn lock(&self, path: &Path, exclusive: bool) -> Result<()> {
        if !self.index.exists(path) {
            return Err(DfsError::not_found(path));
        }
        self.locks.lock(path, exclusive).await;

        let replicas = if exclusive {
            self.invalidate_replicas(path).await
        } else {
            self.replicate_if_hot(path).await
        };
        if let Err(e) = replicas {
            warn!(%path, exclusive, error = %e, "Replica maintenance failed, lock not granted");
            self.locks.unlock(path, exclusive)?;
            return Err(match e {
                DfsError::Rpc(_) => e,
                other => DfsError::Rpc(other.to_string()),
            });
        }
        Ok(())
    }

    async fn unlock(&self, path: &Path, exclusive: bool) -> Result<()> {
        if !self.index.exists(path) {
            return Err(DfsError::not_found(path));
        }
        self.locks.unlock(path, exclusive)
    }

    async fn is_directory(&self, path: &Path) -> Result<bool> {
        Ok(self.kind_of(path)? == EntryKind::Directory)
    }

    async fn list(&self, directory: &Path) -> Result<Vec<String>> {
        match self.kind_of(directory)? {
            EntryKind::Directory => Ok(self.index.children(directory)),
            EntryKind::File => Err(DfsError::not_found(directory)),
        }
    }

    async fn create_file(&self, path: &Path) -> Result<bool> {
        if self.index.exists(path) {
            return Ok(false);
        }
        if self.index.any_server().is_none() {
            return Err(DfsError::BadState("no storage servers are registered".into()));
        }
        let parent = path.parent()?;
        if self.index.kind(&parent) != Some(EntryKind::Directory) {
            return Err(DfsError::not_found(&parent));
        }

        let handle = self.creator_for(&parent)?;
        if !handle.command.create(path).await? {
            debug!(%path, server = %handle.command, "Storage server declined to create file");
            return Ok(false);
        }
        let created = self
            .index
            .insert_if_absent(path, EntryKind::File, handle.command);
        if created {
            info!(%path, server = %handle.command, "Created file");
        }
        Ok(created)
    }

    async fn create_directory(&self, path: &Path) -> Result<bool> {
        if self.index.exists(path) {
            return Ok(false);
        }
        if self.index.any_server().is_none() {
            return Err(DfsError::BadState("no storage servers are registered".into()));
        }
        let parent = path.parent()?;
        if self.index.kind(&parent) != Some(EntryKind::Directory) {
            return Err(DfsError::not_found(&parent));
        }

        let handle = self.creator_for(&parent)?;
        let created = self
            .index
            .insert_if_absent(path, EntryKind::Directory, handle.command);
        if created {
            info!(%path, server = %handle.command, "Created directory");
        }
        Ok(created)
    }

    async fn delete(&self, path: &Path) -> Result<bool> {
        let kind = self.kind_of(path)?;
        if path.is_root() {
            return Ok(false);
        }

        // Every server may hold a replica, not only the owner.
        let targets: Vec<CommandStub> =
            self.index.handles().into_iter().map(|h| h.command).collect();
        let answers = fan_out(&targets, |target| {
            let path = path.clone();
            async move { target.delete(&path).await }
        })
        .await?;

        self.replication.forget(path);
        let removed = self.index.remove_tree(path);
        info!(%path, entries = removed.len(), "Deleted");
        Ok(answers.contains(&true) || kind == EntryKind::Directory)
    }

    async fn get_storage(&self, path: &Path) -> Result<StorageHandle> {
        match self.index.get(path) {
            Some(entry) if entry.kind == EntryKind::File => self
                .index
                .handle_for(&entry.owner)
                .ok_or_else(|| DfsError::not_found(path)),
            _ => Err(DfsError::not_found(path)),
        }
    }
}

impl NameService {
    /// The server that should hold a new child of `parent`: the parent's
    /// owner, or the first registered server when the parent has none.
    fn creator_for(&self, parent: &Path) -> Result<StorageHandle> {
        self.index
            .owner(parent)
            .or_else(|| self.index.any_server())
            .ok_or_else(|| DfsError::BadState("no storage servers are registered".into()))
    }
}

#[async_trait]
impl Registration for NameService {
    async fn register(
        &self,
        storage: StorageStub,
        command: CommandStub,
        paths: Vec<Path>,
    ) -> Result<Vec<Path>> {
        self.index.register(storage, command, paths)
    }
}

/// A naming server listening on its service and registration interfaces.
pub struct NamingServer {
    service: Arc<NameService>,
    service_skeleton: Skeleton<ServiceApi>,
    registration_skeleton: Skeleton<RegistrationApi>,
}

impl NamingServer {
    pub fn new(config: &NamingConfig) -> Self {
        let service = Arc::new(NameService::new(config.replication_threshold));
        let service_skeleton =
            Skeleton::<ServiceApi>::new(service.clone(), Some(config.service_addr))
                .with_max_workers(config.max_workers);
        let registration_skeleton =
            Skeleton::<RegistrationApi>::new(service.clone(), Some(config.registration_addr))
                .with_max_workers(config.max_workers);
        Self {
            service,
            service_skeleton,
            registration_skeleton,
        }
    }

    /// Start both interfaces. If the second one cannot bind, the first is
    /// stopped again.
    pub async fn start(&self) -> Result<()> {
        let service_addr = self.service_skeleton.start().await?;
        let registration_addr = match self.registration_skeleton.start().await {
            Ok(addr) => addr,
            Err(e) => {
                self.service_skeleton.stop().await;
                return Err(e);
            }
        };
        info!(%service_addr, %registration_addr, "Naming server started");
        Ok(())
    }

    /// Stop both interfaces, waiting for in-flight calls.
    pub async fn stop(&self) {
        self.service_skeleton.stop().await;
        self.registration_skeleton.stop().await;
        info!("Naming server stopped");
    }

    pub fn service_stub(&self) -> Result<ServiceStub> {
        Stub::for_skeleton(&self.service_skeleton)
    }

    pub fn registration_stub(&self) -> Result<RegistrationStub> {
        Stub::for_skeleton(&self.registration_skeleton)
    }

    pub fn service(&self) -> &Arc<NameService> {
        &self.service
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::api::command::CommandApi;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    /// Command handler that records every call.
    #[derive(Default)]
    struct MockServer {
        calls: Mutex<Vec<String>>,
        fail_copy: bool,
    }

    impl MockServer {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    #[async_trait]
    impl Command for MockServer {
        async fn create(&self, path: &Path) -> Result<bool> {
            self.calls.lock().push(format!("create {path}"));
            Ok(true)
        }

        async fn delete(&self, path: &Path) -> Result<bool> {
            self.calls.lock().push(format!("delete {path}"));
            Ok(false)
        }

        async fn copy(&self, path: &Path, _source: StorageStub) -> Result<bool> {
            self.calls.lock().push(format!("copy {path}"));
            if self.fail_copy {
                return Err(DfsError::Io("no space left".into()));
            }
            Ok(true)
        }
    }

    struct Running {
        mock: Arc<MockServer>,
        skeleton: Skeleton<CommandApi>,
        handle: StorageHandle,
    }

    async fn run_mock(mock: MockServer) -> Running {
        let mock = Arc::new(mock);
        let skeleton = Skeleton::<CommandApi>::new(mock.clone(), None);
        let addr = skeleton.start().await.unwrap();
        let handle = StorageHandle {
            command: Stub::new(addr),
            storage: Stub::new(addr),
        };
        Running {
            mock,
            skeleton,
            handle,
        }
    }

    async fn register(service: &NameService, server: &Running, paths: &[&str]) -> Vec<Path> {
        service
            .register(
                server.handle.storage,
                server.handle.command,
                paths.iter().map(|s| p(s)).collect(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_hot_file_is_replicated_then_invalidated() {
        let service = NameService::new(20);
        let owner = run_mock(MockServer::default()).await;
        let second = run_mock(MockServer::default()).await;
        let third = run_mock(MockServer::default()).await;
        register(&service, &owner, &["/d/x"]).await;
        register(&service, &second, &[]).await;
        register(&service, &third, &[]).await;

        let path = p("/d/x");
        for _ in 0..20 {
            service.lock(&path, false).await.unwrap();
            service.unlock(&path, false).await.unwrap();
        }

        assert_eq!(second.mock.calls(), vec!["copy /d/x"]);
        assert_eq!(third.mock.calls(), vec!["copy /d/x"]);
        assert!(owner.mock.calls().is_empty());
        assert!(service.replication().is_replicated(&path));
        assert!(service.replication().is_replicated(&p("/d")));

        service.lock(&path, true).await.unwrap();
        assert_eq!(second.mock.count("delete /d/x"), 1);
        assert_eq!(third.mock.count("delete /d/x"), 1);
        assert_eq!(owner.mock.count("delete"), 0);
        assert!(!service.replication().is_replicated(&path));
        service.unlock(&path, true).await.unwrap();

        // No replicas left, so the next writer issues nothing.
        service.lock(&path, true).await.unwrap();
        service.unlock(&path, true).await.unwrap();
        assert_eq!(second.mock.count("delete"), 1);

        for server in [owner, second, third] {
            server.skeleton.stop().await;
        }
    }

    #[tokio::test]
    async fn test_exclusive_lock_on_directory_invalidates_files_below() {
        let service = NameService::new(2);
        let owner = run_mock(MockServer::default()).await;
        let other = run_mock(MockServer::default()).await;
        register(&service, &owner, &["/d/x"]).await;
        register(&service, &other, &["/d/mine"]).await;

        for _ in 0..2 {
            service.lock(&p("/d/x"), false).await.unwrap();
            service.unlock(&p("/d/x"), false).await.unwrap();
        }
        assert!(service.replication().is_replicated(&p("/d")));

        service.lock(&p("/d"), true).await.unwrap();
        // Only the replica goes; the other server's own file is untouched.
        assert_eq!(other.mock.calls(), vec!["copy /d/x", "delete /d/x"]);
        assert!(!service.replication().is_replicated(&p("/d")));
        assert!(!service.replication().is_replicated(&p("/d/x")));
        service.unlock(&p("/d"), true).await.unwrap();

        owner.skeleton.stop().await;
        other.skeleton.stop().await;
    }

    #[tokio::test]
    async fn test_hot_directory_is_not_copied() {
        let service = NameService::new(2);
        let owner = run_mock(MockServer::default()).await;
        let other = run_mock(MockServer::default()).await;
        register(&service, &owner, &["/d/x"]).await;
        register(&service, &other, &[]).await;

        for _ in 0..4 {
            service.lock(&p("/d"), false).await.unwrap();
            service.unlock(&p("/d"), false).await.unwrap();
        }
        assert!(other.mock.calls().is_empty());
        assert!(!service.replication().is_replicated(&p("/d")));

        owner.skeleton.stop().await;
        other.skeleton.stop().await;
    }

    #[tokio::test]
    async fn test_failed_copy_grants_no_lock() {
        let service = NameService::new(20);
        let owner = run_mock(MockServer::default()).await;
        let broken = run_mock(MockServer {
            fail_copy: true,
            ..Default::default()
        })
        .await;
        register(&service, &owner, &["/x"]).await;
        register(&service, &broken, &[]).await;

        let path = p("/x");
        for _ in 0..19 {
            service.lock(&path, false).await.unwrap();
            service.unlock(&path, false).await.unwrap();
        }
        let err = service.lock(&path, false).await.unwrap_err();
        assert!(matches!(err, DfsError::Rpc(_)));
        assert!(!service.replication().is_replicated(&path));
        assert_eq!(service.locks().state(&path), lock::LockState::default());
        assert_eq!(service.locks().state(&Path::root()), lock::LockState::default());

        tokio::time::timeout(Duration::from_secs(1), service.lock(&path, true))
            .await
            .expect("writer blocked by a leaked hold")
            .unwrap();
        service.unlock(&path, true).await.unwrap();

        owner.skeleton.stop().await;
        broken.skeleton.stop().await;
    }

    #[tokio::test]
    async fn test_lock_untracked_path() {
        let service = NameService::new(20);
        assert!(matches!(
            service.lock(&p("/nope"), false).await,
            Err(DfsError::NotFound(_))
        ));
        assert!(matches!(
            service.unlock(&p("/nope"), false).await,
            Err(DfsError::NotFound(_))
        ));
        service.lock(&Path::root(), true).await.unwrap();
        service.unlock(&Path::root(), true).await.unwrap();
        assert!(matches!(
            service.unlock(&Path::root(), true).await,
            Err(DfsError::BadArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_reaches_every_server() {
        let service = NameService::new(20);
        let owner = run_mock(MockServer::default()).await;
        let other = run_mock(MockServer::default()).await;
        register(&service, &owner, &["/d/f", "/d/g"]).await;
        register(&service, &other, &[]).await;

        // Never replicated, still sent everywhere.
        assert!(!service.delete(&p("/d/f")).await.unwrap());
        assert_eq!(owner.mock.calls(), vec!["delete /d/f"]);
        assert_eq!(other.mock.calls(), vec!["delete /d/f"]);
        assert!(!service.index().exists(&p("/d/f")));

        assert!(service.delete(&p("/d")).await.unwrap());
        assert!(!service.index().exists(&p("/d/g")));
        assert!(matches!(
            service.delete(&p("/d")).await,
            Err(DfsError::NotFound(_))
        ));
        assert!(!service.delete(&Path::root()).await.unwrap());

        owner.skeleton.stop().await;
        other.skeleton.stop().await;
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_entry() {
        let service = NameService::new(20);
        let owner = run_mock(MockServer::default()).await;
        register(&service, &owner, &["/f"]).await;
        owner.skeleton.stop().await;

        assert!(matches!(
            service.delete(&p("/f")).await,
            Err(DfsError::Rpc(_))
        ));
        assert!(service.index().exists(&p("/f")));
    }

    #[tokio::test]
    async fn test_create_file_and_directory() {
        let service = NameService::new(20);
        assert!(matches!(
            service.create_file(&p("/a")).await,
            Err(DfsError::BadState(_))
        ));

        let owner = run_mock(MockServer::default()).await;
        let other = run_mock(MockServer::default()).await;
        register(&service, &owner, &["/d/f"]).await;
        register(&service, &other, &[]).await;

        assert!(service.create_file(&p("/d/g")).await.unwrap());
        assert_eq!(owner.mock.calls(), vec!["create /d/g"]);
        assert_eq!(
            service.get_storage(&p("/d/g")).await.unwrap(),
            owner.handle
        );

        assert!(!service.create_file(&p("/d/f")).await.unwrap());
        assert!(!service.create_file(&Path::root()).await.unwrap());
        assert!(matches!(
            service.create_file(&p("/missing/x")).await,
            Err(DfsError::NotFound(_))
        ));
        assert!(matches!(
            service.create_file(&p("/d/f/x")).await,
            Err(DfsError::NotFound(_))
        ));

        assert!(service.create_directory(&p("/e")).await.unwrap());
        assert!(!service.create_directory(&p("/e")).await.unwrap());
        assert!(service.is_directory(&p("/e")).await.unwrap());
        assert!(!service.is_directory(&p("/d/g")).await.unwrap());
        assert_eq!(service.list(&Path::root()).await.unwrap(), vec!["d", "e"]);
        assert_eq!(service.list(&p("/d")).await.unwrap(), vec!["f", "g"]);
        assert!(matches!(
            service.list(&p("/d/f")).await,
            Err(DfsError::NotFound(_))
        ));
        assert!(matches!(
            service.get_storage(&p("/e")).await,
            Err(DfsError::NotFound(_))
        ));

        owner.skeleton.stop().await;
        other.skeleton.stop().await;
    }

    fn ephemeral() -> NamingConfig {
        NamingConfig {
            service_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            registration_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_naming_server_over_rpc() {
        let server = NamingServer::new(&ephemeral());
        server.start().await.unwrap();
        let service = server.service_stub().unwrap();
        let registration = server.registration_stub().unwrap();

        assert!(matches!(
            service.get_storage(&p("/missing")).await,
            Err(DfsError::NotFound(m)) if m == "/missing"
        ));

        let first = run_mock(MockServer::default()).await;
        let second = run_mock(MockServer::default()).await;
        let conflicts = registration
            .register(
                first.handle.storage,
                first.handle.command,
                vec![p("/shared/file.txt")],
            )
            .await
            .unwrap();
        assert!(conflicts.is_empty());
        let conflicts = registration
            .register(
                second.handle.storage,
                second.handle.command,
                vec![p("/shared/file.txt"), p("/own.txt")],
            )
            .await
            .unwrap();
        assert_eq!(conflicts, vec![p("/shared/file.txt")]);
        assert!(matches!(
            registration
                .register(first.handle.storage, first.handle.command, vec![])
                .await,
            Err(DfsError::BadState(_))
        ));

        assert_eq!(
            service.get_storage(&p("/shared/file.txt")).await.unwrap(),
            first.handle
        );
        assert_eq!(service.list(&Path::root()).await.unwrap(), vec!["own.txt", "shared"]);
        service.lock(&p("/shared/file.txt"), true).await.unwrap();
        service.unlock(&p("/shared/file.txt"), true).await.unwrap();

        server.stop().await;
        first.skeleton.stop().await;
        second.skeleton.stop().await;
    }

    #[tokio::test]
    async fn test_second_naming_server_cannot_bind() {
        let first = NamingServer::new(&ephemeral());
        first.start().await.unwrap();
        let taken = NamingConfig {
            service_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            registration_addr: first.registration_stub().unwrap().addr(),
            ..Default::default()
        };

        let second = NamingServer::new(&taken);
        assert!(second.start().await.is_err());
        assert!(second.service_stub().is_err());
        first.stop().await;
    }
}
