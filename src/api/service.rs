use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::StorageHandle;
use crate::rmi::{unexpected, Dispatch, RemoteInterface, Signature, Stub};
use crate::{Path, Result};

/// The client-facing interface of the naming server.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Lock `path` for shared or exclusive access. Blocks until granted.
    async fn lock(&self, path: &Path, exclusive: bool) -> Result<()>;

    /// Release a lock taken by a matching [`Service::lock`].
    async fn unlock(&self, path: &Path, exclusive: bool) -> Result<()>;

    async fn is_directory(&self, path: &Path) -> Result<bool>;

    /// Names of the direct children of `directory`.
    async fn list(&self, directory: &Path) -> Result<Vec<String>>;

    async fn create_file(&self, path: &Path) -> Result<bool>;

    async fn create_directory(&self, path: &Path) -> Result<bool>;

    async fn delete(&self, path: &Path) -> Result<bool>;

    /// The storage server that owns the file at `path`.
    async fn get_storage(&self, path: &Path) -> Result<StorageHandle>;
}

pub enum ServiceApi {}

impl RemoteInterface for ServiceApi {
    const NAME: &'static str = "Service";
    type Request = ServiceRequest;
    type Response = ServiceResponse;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceRequest {
    Lock { path: Path, exclusive: bool },
    Unlock { path: Path, exclusive: bool },
    IsDirectory { path: Path },
    List { directory: Path },
    CreateFile { path: Path },
    CreateDirectory { path: Path },
    Delete { path: Path },
    GetStorage { path: Path },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceResponse {
    Done,
    Flag(bool),
    Names(Vec<String>),
    Storage(StorageHandle),
}

impl Signature for ServiceRequest {
    fn method(&self) -> &'static str {
        match self {
            ServiceRequest::Lock { .. } => "lock",
            ServiceRequest::Unlock { .. } => "unlock",
            ServiceRequest::IsDirectory { .. } => "isDirectory",
            ServiceRequest::List { .. } => "list",
            ServiceRequest::CreateFile { .. } => "createFile",
            ServiceRequest::CreateDirectory { .. } => "createDirectory",
            ServiceRequest::Delete { .. } => "delete",
            ServiceRequest::GetStorage { .. } => "getStorage",
        }
    }

    fn param_types(&self) -> &'static [&'static str] {
        match self {
            ServiceRequest::Lock { .. } | ServiceRequest::Unlock { .. } => &["Path", "bool"],
            _ => &["Path"],
        }
    }
}

#[async_trait]
impl<T: Service + ?Sized> Dispatch<ServiceApi> for T {
    async fn dispatch(&self, request: ServiceRequest) -> Result<ServiceResponse> {
        match request {
            ServiceRequest::Lock { path, exclusive } => {
                self.lock(&path, exclusive).await.map(|()| ServiceResponse::Done)
            }
            ServiceRequest::Unlock { path, exclusive } => {
                self.unlock(&path, exclusive).await.map(|()| ServiceResponse::Done)
            }
            ServiceRequest::IsDirectory { path } => {
                self.is_directory(&path).await.map(ServiceResponse::Flag)
            }
            ServiceRequest::List { directory } => {
                self.list(&directory).await.map(ServiceResponse::Names)
            }
            ServiceRequest::CreateFile { path } => {
                self.create_file(&path).await.map(ServiceResponse::Flag)
            }
            ServiceRequest::CreateDirectory { path } => {
                self.create_directory(&path).await.map(ServiceResponse::Flag)
            }
            ServiceRequest::Delete { path } => self.delete(&path).await.map(ServiceResponse::Flag),
            ServiceRequest::GetStorage { path } => {
                self.get_storage(&path).await.map(ServiceResponse::Storage)
            }
        }
    }
}

impl Stub<ServiceApi> {
    async fn done(&self, request: ServiceRequest) -> Result<()> {
        match self.call(request).await? {
            ServiceResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn flag(&self, request: ServiceRequest) -> Result<bool> {
        match self.call(request).await? {
            ServiceResponse::Flag(flag) => Ok(flag),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl Service for Stub<ServiceApi> {
    async fn lock(&self, path: &Path, exclusive: bool) -> Result<()> {
        self.done(ServiceRequest::Lock {
            path: path.clone(),
            exclusive,
        })
        .await
    }

    async fn unlock(&self, path: &Path, exclusive: bool) -> Result<()> {
        self.done(ServiceRequest::Unlock {
            path: path.clone(),
            exclusive,
        })
        .await
    }

    async fn is_directory(&self, path: &Path) -> Result<bool> {
        self.flag(ServiceRequest::IsDirectory { path: path.clone() })
            .await
    }

    async fn list(&self, directory: &Path) -> Result<Vec<String>> {
        let request = ServiceRequest::List {
            directory: directory.clone(),
        };
        match self.call(request).await? {
            ServiceResponse::Names(names) => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    async fn create_file(&self, path: &Path) -> Result<bool> {
        self.flag(ServiceRequest::CreateFile { path: path.clone() })
            .await
    }

    async fn create_directory(&self, path: &Path) -> Result<bool> {
        self.flag(ServiceRequest::CreateDirectory { path: path.clone() })
            .await
    }

    async fn delete(&self, path: &Path) -> Result<bool> {
        self.flag(ServiceRequest::Delete { path: path.clone() })
            .await
    }

    async fn get_storage(&self, path: &Path) -> Result<StorageHandle> {
        match self.call(ServiceRequest::GetStorage { path: path.clone() }).await? {
            ServiceResponse::Storage(handle) => Ok(handle),
            other => Err(unexpected(other)),
        }
    }
}
