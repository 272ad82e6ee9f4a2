use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::rmi::{unexpected, Dispatch, RemoteInterface, Signature, Stub};
use crate::{Path, Result};

/// Data access to the files of one storage server.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Length of a file in bytes. Not found for missing files and directories.
    async fn size(&self, path: &Path) -> Result<u64>;

    /// Read exactly `length` bytes at `offset`. Out of range if the span
    /// leaves the file.
    async fn read(&self, path: &Path, offset: u64, length: u32) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, extending the file if needed.
    async fn write(&self, path: &Path, offset: u64, data: Vec<u8>) -> Result<()>;
}

pub enum StorageApi {}

impl RemoteInterface for StorageApi {
    const NAME: &'static str = "Storage";
    type Request = StorageRequest;
    type Response = StorageResponse;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageRequest {
    Size { path: Path },
    Read { path: Path, offset: u64, length: u32 },
    Write { path: Path, offset: u64, data: Vec<u8> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageResponse {
    Size(u64),
    Data(Vec<u8>),
    Done,
}

impl Signature for StorageRequest {
    fn method(&self) -> &'static str {
        match self {
            StorageRequest::Size { .. } => "size",
            StorageRequest::Read { .. } => "read",
            StorageRequest::Write { .. } => "write",
        }
    }

    fn param_types(&self) -> &'static [&'static str] {
        match self {
            StorageRequest::Size { .. } => &["Path"],
            StorageRequest::Read { .. } => &["Path", "u64", "u32"],
            StorageRequest::Write { .. } => &["Path", "u64", "bytes"],
        }
    }
}

#[async_trait]
impl<T: Storage + ?Sized> Dispatch<StorageApi> for T {
    async fn dispatch(&self, request: StorageRequest) -> Result<StorageResponse> {
        match request {
            StorageRequest::Size { path } => self.size(&path).await.map(StorageResponse::Size),
            StorageRequest::Read {
                path,
                offset,
                length,
            } => self
                .read(&path, offset, length)
                .await
                .map(StorageResponse::Data),
            StorageRequest::Write { path, offset, data } => self
                .write(&path, offset, data)
                .await
                .map(|()| StorageResponse::Done),
        }
    }
}

#[async_trait]
impl Storage for Stub<StorageApi> {
    async fn size(&self, path: &Path) -> Result<u64> {
        match self.call(StorageRequest::Size { path: path.clone() }).await? {
            StorageResponse::Size(size) => Ok(size),
            other => Err(unexpected(other)),
        }
    }

    async fn read(&self, path: &Path, offset: u64, length: u32) -> Result<Vec<u8>> {
        let request = StorageRequest::Read {
            path: path.clone(),
            offset,
            length,
        };
        match self.call(request).await? {
            StorageResponse::Data(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    async fn write(&self, path: &Path, offset: u64, data: Vec<u8>) -> Result<()> {
        let request = StorageRequest::Write {
            path: path.clone(),
            offset,
            data,
        };
        match self.call(request).await? {
            StorageResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
