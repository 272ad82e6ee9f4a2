use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{CommandStub, StorageStub};
use crate::rmi::{Dispatch, RemoteInterface, Signature, Stub};
use crate::{Path, Result};

/// How storage servers announce themselves to the naming server.
#[async_trait]
pub trait Registration: Send + Sync + 'static {
    /// Register a storage server and the files it already holds. Returns the
    /// advertised paths the naming server refused because another server
    /// owns them; the caller must delete its local copies.
    async fn register(
        &self,
        storage: StorageStub,
        command: CommandStub,
        paths: Vec<Path>,
    ) -> Result<Vec<Path>>;
}

pub enum RegistrationApi {}

impl RemoteInterface for RegistrationApi {
    const NAME: &'static str = "Registration";
    type Request = RegistrationRequest;
    type Response = RegistrationResponse;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistrationRequest {
    Register {
        storage: StorageStub,
        command: CommandStub,
        paths: Vec<Path>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistrationResponse {
    Conflicts(Vec<Path>),
}

impl Signature for RegistrationRequest {
    fn method(&self) -> &'static str {
        match self {
            RegistrationRequest::Register { .. } => "register",
        }
    }

    fn param_types(&self) -> &'static [&'static str] {
        match self {
            RegistrationRequest::Register { .. } => &["Storage", "Command", "Path[]"],
        }
    }
}

#[async_trait]
impl<T: Registration + ?Sized> Dispatch<RegistrationApi> for T {
    async fn dispatch(&self, request: RegistrationRequest) -> Result<RegistrationResponse> {
        match request {
            RegistrationRequest::Register {
                storage,
                command,
                paths,
            } => self
                .register(storage, command, paths)
                .await
                .map(RegistrationResponse::Conflicts),
        }
    }
}

#[async_trait]
impl Registration for Stub<RegistrationApi> {
    async fn register(
        &self,
        storage: StorageStub,
        command: CommandStub,
        paths: Vec<Path>,
    ) -> Result<Vec<Path>> {
        let request = RegistrationRequest::Register {
            storage,
            command,
            paths,
        };
        let RegistrationResponse::Conflicts(conflicts) = self.call(request).await?;
        Ok(conflicts)
    }
}
