use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::StorageStub;
use crate::rmi::{Dispatch, RemoteInterface, Signature, Stub};
use crate::{Path, Result};

/// Administrative access to one storage server, used by the naming server.
#[async_trait]
pub trait Command: Send + Sync + 'static {
    /// Create an empty file, creating missing parent directories. `false` if
    /// the file already exists or `path` is the root.
    async fn create(&self, path: &Path) -> Result<bool>;

    /// Delete a file or a whole directory tree. `false` if nothing was there
    /// or `path` is the root.
    async fn delete(&self, path: &Path) -> Result<bool>;

    /// Replace the local copy of `path` with the content served by `source`.
    async fn copy(&self, path: &Path, source: StorageStub) -> Result<bool>;
}

pub enum CommandApi {}

impl RemoteInterface for CommandApi {
    const NAME: &'static str = "Command";
    type Request = CommandRequest;
    type Response = CommandResponse;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandRequest {
    Create { path: Path },
    Delete { path: Path },
    Copy { path: Path, source: StorageStub },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandResponse {
    Flag(bool),
}

impl Signature for CommandRequest {
    fn method(&self) -> &'static str {
        match self {
            CommandRequest::Create { .. } => "create",
            CommandRequest::Delete { .. } => "delete",
            CommandRequest::Copy { .. } => "copy",
        }
    }

    fn param_types(&self) -> &'static [&'static str] {
        match self {
            CommandRequest::Create { .. } | CommandRequest::Delete { .. } => &["Path"],
            CommandRequest::Copy { .. } => &["Path", "Storage"],
        }
    }
}

#[async_trait]
impl<T: Command + ?Sized> Dispatch<CommandApi> for T {
    async fn dispatch(&self, request: CommandRequest) -> Result<CommandResponse> {
        let flag = match request {
            CommandRequest::Create { path } => self.create(&path).await?,
            CommandRequest::Delete { path } => self.delete(&path).await?,
            CommandRequest::Copy { path, source } => self.copy(&path, source).await?,
        };
        Ok(CommandResponse::Flag(flag))
    }
}

impl Stub<CommandApi> {
    async fn flag(&self, request: CommandRequest) -> Result<bool> {
        let CommandResponse::Flag(flag) = self.call(request).await?;
        Ok(flag)
    }
}

#[async_trait]
impl Command for Stub<CommandApi> {
    async fn create(&self, path: &Path) -> Result<bool> {
        self.flag(CommandRequest::Create { path: path.clone() }).await
    }

    async fn delete(&self, path: &Path) -> Result<bool> {
        self.flag(CommandRequest::Delete { path: path.clone() }).await
    }

    async fn copy(&self, path: &Path, source: StorageStub) -> Result<bool> {
        self.flag(CommandRequest::Copy {
            path: path.clone(),
            source,
        })
        .await
    }
}
