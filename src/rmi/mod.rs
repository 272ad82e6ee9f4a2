//! Connection-per-call remote invocation.
//!
//! A remote interface is a marker type implementing [`RemoteInterface`]: it
//! names a tagged request enum (one variant per method) and a response enum.
//! A [`Skeleton`] serves one interface by handing decoded requests to a
//! [`Dispatch`] implementation; a [`Stub`] is the client side, opening one TCP
//! connection per call.
//!
//! Per call the client writes three frames (method name, request, parameter
//! type descriptors) and the server answers with one [`protocol::Reply`]
//! frame before closing the connection.

pub mod protocol;
pub mod skeleton;
pub mod stub;

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{DfsError, Result};

pub use skeleton::Skeleton;
pub use stub::Stub;

/// Describes one remote interface.
///
/// Every method of every interface returns [`crate::Result`], whose error
/// type always carries [`DfsError::Rpc`]. An interface that could not report
/// a remote-call failure cannot be written.
pub trait RemoteInterface: Send + Sync + 'static {
    /// Interface name, part of a stub's identity.
    const NAME: &'static str;

    type Request: Signature + Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static;
    type Response: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static;
}

/// Method identity of a request variant.
pub trait Signature {
    fn method(&self) -> &'static str;
    fn param_types(&self) -> &'static [&'static str];
}

/// Server-side entry point of an interface.
#[async_trait]
pub trait Dispatch<I: RemoteInterface>: Send + Sync + 'static {
    async fn dispatch(&self, request: I::Request) -> Result<I::Response>;
}

/// Error for a response variant that does not belong to the called method.
pub(crate) fn unexpected<T: fmt::Debug>(response: T) -> DfsError {
    DfsError::Rpc(format!("unexpected response {response:?}"))
}
