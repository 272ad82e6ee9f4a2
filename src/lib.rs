pub mod api;
pub mod config;
pub mod naming;
pub mod path;
pub mod rmi;
pub mod storage;

pub use path::Path;

use rmi::protocol::{ErrorKind, RemoteError};

/// Every failure a remote interface method can report.
///
/// The first five variants are the declared kinds: they cross the RPC
/// boundary unchanged. `Rpc` is the remote-call failure every method carries;
/// transport problems are always folded into it at the stub.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("bad state: {0}")]
    BadState(String),

    #[error("out of range: {0}")]
    BadRange(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("remote call failed: {0}")]
    Rpc(String),
}

impl DfsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DfsError::NotFound(_) => ErrorKind::NotFound,
            DfsError::BadArgument(_) => ErrorKind::BadArgument,
            DfsError::BadState(_) => ErrorKind::BadState,
            DfsError::BadRange(_) => ErrorKind::BadRange,
            DfsError::Io(_) => ErrorKind::Io,
            DfsError::Rpc(_) => ErrorKind::Rpc,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            DfsError::NotFound(m)
            | DfsError::BadArgument(m)
            | DfsError::BadState(m)
            | DfsError::BadRange(m)
            | DfsError::Io(m)
            | DfsError::Rpc(m) => m,
        }
    }

    pub(crate) fn not_found(path: &Path) -> Self {
        DfsError::NotFound(path.to_string())
    }
}

impl From<std::io::Error> for DfsError {
    fn from(err: std::io::Error) -> Self {
        DfsError::Io(err.to_string())
    }
}

impl From<RemoteError> for DfsError {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            ErrorKind::NotFound => DfsError::NotFound(err.message),
            ErrorKind::BadArgument => DfsError::BadArgument(err.message),
            ErrorKind::BadState => DfsError::BadState(err.message),
            ErrorKind::BadRange => DfsError::BadRange(err.message),
            ErrorKind::Io => DfsError::Io(err.message),
            ErrorKind::Rpc => DfsError::Rpc(err.message),
        }
    }
}

impl From<&DfsError> for RemoteError {
    fn from(err: &DfsError) -> Self {
        RemoteError {
            kind: err.kind(),
            message: err.message().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DfsError>;
