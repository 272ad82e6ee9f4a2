//! Storage server: file bytes under one local directory, served through the
//! `Storage` and `Command` interfaces.

use std::io::{ErrorKind, SeekFrom};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::api::command::{Command, CommandApi};
use crate::api::registration::Registration;
use crate::api::storage::{Storage, StorageApi};
use crate::api::{CommandStub, StorageStub};
use crate::rmi::skeleton::DEFAULT_MAX_WORKERS;
use crate::rmi::{Skeleton, Stub};
use crate::{DfsError, Path, Result};

/// Largest block fetched per `read` call while copying from another server.
pub const COPY_CHUNK: u32 = 1024 * 1024;

/// `Storage` and `Command` backed by a local directory.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Every regular file under the root. The walk runs on the blocking pool.
    pub async fn files(&self) -> Result<Vec<Path>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || Path::list(&root))
            .await
            .map_err(|e| DfsError::Io(format!("listing {} failed: {e}", self.root.display())))?
    }

    /// Length of the regular file at `path`.
    async fn file_len(&self, path: &Path) -> Result<u64> {
        match fs::metadata(path.to_local(&self.root)).await {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(DfsError::NotFound(format!("{path} is a directory"))),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(DfsError::not_found(path)),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the now-empty directories above `path`, stopping at the root
    /// or the first directory that still has entries.
    async fn prune_empty_parents(&self, path: &Path) {
        let mut dir = match path.parent() {
            Ok(parent) => parent,
            Err(_) => return,
        };
        while !dir.is_root() {
            if fs::remove_dir(dir.to_local(&self.root)).await.is_err() {
                break;
            }
            debug!(%dir, "Pruned empty directory");
            dir = match dir.parent() {
                Ok(parent) => parent,
                Err(_) => break,
            };
        }
    }

    async fn create_parents(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.to_local(&self.root).parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for LocalStore {
    async fn size(&self, path: &Path) -> Result<u64> {
        self.file_len(path).await
    }

    async fn read(&self, path: &Path, offset: u64, length: u32) -> Result<Vec<u8>> {
        let len = self.file_len(path).await?;
        if offset
            .checked_add(u64::from(length))
            .map_or(true, |end| end > len)
        {
            return Err(DfsError::BadRange(format!(
                "{length} bytes at {offset} exceed {path} ({len} bytes)"
            )));
        }

        let mut file = File::open(path.to_local(&self.root)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn write(&self, path: &Path, offset: u64, data: Vec<u8>) -> Result<()> {
        self.file_len(path).await?;
        if offset.checked_add(data.len() as u64).is_none() {
            return Err(DfsError::BadRange(format!("write at {offset} overflows {path}")));
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(path.to_local(&self.root))
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        debug!(%path, offset, bytes = data.len(), "Wrote");
        Ok(())
    }
}

#[async_trait]
impl Command for LocalStore {
    async fn create(&self, path: &Path) -> Result<bool> {
        if path.is_root() {
            return Ok(false);
        }
        self.create_parents(path).await?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.to_local(&self.root))
            .await
        {
            Ok(_) => {
                debug!(%path, "Created file");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &Path) -> Result<bool> {
        if path.is_root() {
            return Ok(false);
        }
        let local = path.to_local(&self.root);
        let meta = match fs::symlink_metadata(&local).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            fs::remove_dir_all(&local).await?;
        } else {
            fs::remove_file(&local).await?;
        }
        self.prune_empty_parents(path).await;
        debug!(%path, "Deleted");
        Ok(true)
    }

    async fn copy(&self, path: &Path, source: StorageStub) -> Result<bool> {
        let size = source.size(path).await?;

        let local = path.to_local(&self.root);
        if fs::metadata(&local).await.map(|m| m.is_dir()).unwrap_or(false) {
            fs::remove_dir_all(&local).await?;
        }
        self.create_parents(path).await?;
        let mut file = File::create(&local).await?;

        let mut offset = 0u64;
        while offset < size {
            let length = (size - offset).min(u64::from(COPY_CHUNK)) as u32;
            let chunk = source.read(path, offset, length).await?;
            file.write_all(&chunk).await?;
            offset += u64::from(length);
        }
        file.flush().await?;

        info!(%path, %source, bytes = size, "Copied from another server");
        Ok(true)
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    /// Address other processes use to reach this server.
    pub host: IpAddr,
    pub storage_port: u16,
    pub command_port: u16,
    pub max_workers: usize,
}

impl StorageConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            storage_port: 0,
            command_port: 0,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

/// A storage server with its two skeletons.
pub struct StorageServer {
    store: Arc<LocalStore>,
    host: IpAddr,
    storage_skeleton: Skeleton<StorageApi>,
    command_skeleton: Skeleton<CommandApi>,
}

impl StorageServer {
    pub fn new(config: &StorageConfig) -> Self {
        let store = Arc::new(LocalStore::new(config.root.clone()));
        let bind = |port| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let storage_skeleton =
            Skeleton::<StorageApi>::new(store.clone(), Some(bind(config.storage_port)))
                .with_max_workers(config.max_workers);
        let command_skeleton =
            Skeleton::<CommandApi>::new(store.clone(), Some(bind(config.command_port)))
                .with_max_workers(config.max_workers);
        Self {
            store,
            host: config.host,
            storage_skeleton,
            command_skeleton,
        }
    }

    /// Start serving, register with the naming server, and delete the local
    /// copies of every path the naming server says belongs to someone else.
    pub async fn start(&self, naming: &dyn Registration) -> Result<()> {
        let files = self.store.files().await?;

        self.storage_skeleton.start().await?;
        if let Err(e) = self.command_skeleton.start().await {
            self.storage_skeleton.stop().await;
            return Err(e);
        }

        let registered = match self.stubs() {
            Ok((storage, command)) => naming.register(storage, command, files).await,
            Err(e) => Err(e),
        };
        let conflicts = match registered {
            Ok(conflicts) => conflicts,
            Err(e) => {
                warn!(root = %self.store.root().display(), error = %e, "Registration failed");
                self.stop().await;
                return Err(e);
            }
        };

        for path in &conflicts {
            if let Err(e) = self.store.delete(path).await {
                warn!(%path, error = %e, "Failed to delete conflicting file");
            }
        }
        info!(
            root = %self.store.root().display(),
            conflicts = conflicts.len(),
            "Storage server started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.storage_skeleton.stop().await;
        self.command_skeleton.stop().await;
        info!(root = %self.store.root().display(), "Storage server stopped");
    }

    /// Stubs of both interfaces, as advertised to the naming server.
    pub fn stubs(&self) -> Result<(StorageStub, CommandStub)> {
        Ok((
            Stub::for_skeleton_at(self.host, &self.storage_skeleton)?,
            Stub::for_skeleton_at(self.host, &self.command_skeleton)?,
        ))
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::api::service::Service;
    use crate::naming::{NamingConfig, NamingServer};
    use tempfile::tempdir;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn setup() -> (LocalStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        (store, dir)
    }

    fn put(dir: &tempfile::TempDir, rel: &str, data: &[u8]) {
        let local = dir.path().join(rel);
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(local, data).unwrap();
    }

    #[tokio::test]
    async fn test_size_and_read() {
        let (store, dir) = setup();
        put(&dir, "d/f.txt", b"hello world");

        assert_eq!(store.size(&p("/d/f.txt")).await.unwrap(), 11);
        assert_eq!(store.read(&p("/d/f.txt"), 6, 5).await.unwrap(), b"world");
        assert_eq!(store.read(&p("/d/f.txt"), 11, 0).await.unwrap(), b"");
        assert!(matches!(
            store.read(&p("/d/f.txt"), 6, 6).await,
            Err(DfsError::BadRange(_))
        ));
        assert!(matches!(
            store.read(&p("/d/f.txt"), u64::MAX, 1).await,
            Err(DfsError::BadRange(_))
        ));
        assert!(matches!(store.size(&p("/d")).await, Err(DfsError::NotFound(_))));
        assert!(matches!(
            store.read(&p("/nope"), 0, 0).await,
            Err(DfsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_files_lists_regular_files() {
        let (store, dir) = setup();
        put(&dir, "b/c/deep", b"1");
        put(&dir, "a", b"2");
        std::fs::create_dir_all(dir.path().join("empty/dir")).unwrap();

        assert_eq!(store.files().await.unwrap(), vec![p("/a"), p("/b/c/deep")]);
        let missing = LocalStore::new(dir.path().join("missing"));
        assert!(matches!(missing.files().await, Err(DfsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_write_extends() {
        let (store, dir) = setup();
        put(&dir, "f", b"abc");

        store.write(&p("/f"), 1, b"XYZW".to_vec()).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"aXYZW");
        assert!(matches!(
            store.write(&p("/missing"), 0, vec![1]).await,
            Err(DfsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let (store, dir) = setup();
        put(&dir, "keep/other", b"");

        assert!(store.create(&p("/a/b/c")).await.unwrap());
        assert!(dir.path().join("a/b/c").is_file());
        assert!(!store.create(&p("/a/b/c")).await.unwrap());
        assert!(!store.create(&Path::root()).await.unwrap());

        assert!(store.delete(&p("/a/b/c")).await.unwrap());
        // Emptied parents go with it.
        assert!(!dir.path().join("a").exists());
        assert!(!store.delete(&p("/a/b/c")).await.unwrap());
        assert!(!store.delete(&Path::root()).await.unwrap());
        assert!(dir.path().exists());

        assert!(store.create(&p("/keep/new")).await.unwrap());
        assert!(store.delete(&p("/keep/new")).await.unwrap());
        assert!(dir.path().join("keep/other").exists());

        assert!(store.delete(&p("/keep")).await.unwrap());
        assert!(!dir.path().join("keep").exists());
    }

    #[tokio::test]
    async fn test_copy_from_another_server() {
        let (source, source_dir) = setup();
        let data: Vec<u8> = (0..(COPY_CHUNK as usize + 10)).map(|i| i as u8).collect();
        put(&source_dir, "big/blob", &data);

        let skeleton = Skeleton::<StorageApi>::new(Arc::new(source), None);
        skeleton.start().await.unwrap();
        let stub: StorageStub = Stub::for_skeleton(&skeleton).unwrap();

        let (target, target_dir) = setup();
        put(&target_dir, "big/blob", b"stale");
        assert!(target.copy(&p("/big/blob"), stub).await.unwrap());
        assert_eq!(std::fs::read(target_dir.path().join("big/blob")).unwrap(), data);

        assert!(matches!(
            target.copy(&p("/absent"), stub).await,
            Err(DfsError::NotFound(_))
        ));
        skeleton.stop().await;
    }

    #[tokio::test]
    async fn test_start_requires_root() {
        let dir = tempdir().unwrap();
        let server = StorageServer::new(&StorageConfig::new(dir.path().join("missing")));
        let naming = NamingServer::new(&ephemeral_naming(20));
        naming.start().await.unwrap();
        let registration = naming.registration_stub().unwrap();

        assert!(matches!(
            server.start(&registration).await,
            Err(DfsError::NotFound(_))
        ));
        naming.stop().await;
    }

    fn ephemeral_naming(replication_threshold: u32) -> NamingConfig {
        NamingConfig {
            service_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            registration_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            replication_threshold,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_naming_and_storage_end_to_end() {
        let naming = NamingServer::new(&ephemeral_naming(2));
        naming.start().await.unwrap();
        let registration = naming.registration_stub().unwrap();
        let service = naming.service_stub().unwrap();

        let first_dir = tempdir().unwrap();
        put(&first_dir, "shared/file.txt", b"first");
        put(&first_dir, "hot.txt", b"popular content");
        let first = StorageServer::new(&StorageConfig::new(first_dir.path()));
        first.start(&registration).await.unwrap();

        let second_dir = tempdir().unwrap();
        put(&second_dir, "shared/file.txt", b"second");
        let second = StorageServer::new(&StorageConfig::new(second_dir.path()));
        second.start(&registration).await.unwrap();

        // The duplicate lost and was removed along with its empty directory.
        assert!(!second_dir.path().join("shared").exists());
        let handle = service.get_storage(&p("/shared/file.txt")).await.unwrap();
        assert_eq!(handle.storage, first.stubs().unwrap().0);
        assert_eq!(handle.storage.read(&p("/shared/file.txt"), 0, 5).await.unwrap(), b"first");

        // A new file goes to the owner of its parent.
        assert!(service.create_file(&p("/shared/new.txt")).await.unwrap());
        assert!(first_dir.path().join("shared/new.txt").is_file());
        assert!(matches!(
            service.create_file(&p("/nowhere/x")).await,
            Err(DfsError::NotFound(_))
        ));

        // Two reads make the file hot and copy it to the second server.
        for _ in 0..2 {
            service.lock(&p("/hot.txt"), false).await.unwrap();
            service.unlock(&p("/hot.txt"), false).await.unwrap();
        }
        assert_eq!(
            std::fs::read(second_dir.path().join("hot.txt")).unwrap(),
            b"popular content"
        );

        // A writer removes the replica first.
        service.lock(&p("/hot.txt"), true).await.unwrap();
        assert!(!second_dir.path().join("hot.txt").exists());
        let hot = service.get_storage(&p("/hot.txt")).await.unwrap();
        hot.storage.write(&p("/hot.txt"), 0, b"POPULAR".to_vec()).await.unwrap();
        service.unlock(&p("/hot.txt"), true).await.unwrap();
        assert_eq!(
            std::fs::read(first_dir.path().join("hot.txt")).unwrap(),
            b"POPULAR content"
        );

        assert!(service.delete(&p("/shared")).await.unwrap());
        assert!(!first_dir.path().join("shared").exists());
        assert_eq!(service.list(&Path::root()).await.unwrap(), vec!["hot.txt"]);

        second.stop().await;
        first.stop().await;
        naming.stop().await;
    }
}
