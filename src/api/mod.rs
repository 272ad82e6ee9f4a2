//! The four remote interfaces of the system.
//!
//! Clients talk to the naming server through [`service::Service`]; storage
//! servers announce themselves through [`registration::Registration`]; the
//! naming server and clients reach storage servers through
//! [`storage::Storage`] (file data) and [`command::Command`] (administration).
//!
//! Each interface is a handler trait, a tagged request/response pair, a
//! blanket [`crate::rmi::Dispatch`] impl for every handler, and a handler impl
//! for its [`crate::rmi::Stub`], so a stub can stand in wherever a local
//! handler is expected.

pub mod command;
pub mod registration;
pub mod service;
pub mod storage;

use serde::{Deserialize, Serialize};

use crate::rmi::Stub;

pub type ServiceStub = Stub<service::ServiceApi>;
pub type RegistrationStub = Stub<registration::RegistrationApi>;
pub type StorageStub = Stub<storage::StorageApi>;
pub type CommandStub = Stub<command::CommandApi>;

/// Both stubs of one storage server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageHandle {
    pub command: CommandStub,
    pub storage: StorageStub,
}
