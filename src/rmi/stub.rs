use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use super::protocol::{self, Reply};
use super::{RemoteInterface, Signature, Skeleton};
use crate::{DfsError, Result};

/// Client-side proxy for the remote interface `I` at a fixed address.
///
/// Identity (equality, hashing, display) depends only on the interface and
/// the address and never touches the network. Each remote method lives in a
/// per-interface trait impl (see [`crate::api`]) and forwards to
/// [`Stub::call`].
pub struct Stub<I: RemoteInterface> {
    addr: SocketAddr,
    _interface: PhantomData<fn() -> I>,
}

impl<I: RemoteInterface> Stub<I> {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            _interface: PhantomData,
        }
    }

    /// Stub for a started skeleton, using the skeleton's bound address.
    pub fn for_skeleton(skeleton: &Skeleton<I>) -> Result<Self> {
        skeleton.local_addr().map(Self::new)
    }

    /// Stub for a started skeleton, reachable at `host` instead of the
    /// skeleton's own bind address. Used when the skeleton listens on a
    /// wildcard address.
    pub fn for_skeleton_at(host: IpAddr, skeleton: &Skeleton<I>) -> Result<Self> {
        let port = skeleton.local_addr()?.port();
        Ok(Self::new(SocketAddr::new(host, port)))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Perform one call: connect, send the request, wait for the reply.
    ///
    /// A raised error of a declared kind comes back as that kind. Anything
    /// that goes wrong in transit becomes [`DfsError::Rpc`].
    pub async fn call(&self, request: I::Request) -> Result<I::Response> {
        let method = request.method();
        let reply = self.exchange(&request).await.map_err(|e| {
            debug!(interface = I::NAME, method, addr = %self.addr, error = %e, "Remote call failed");
            DfsError::Rpc(format!("{}.{} at {}: {:#}", I::NAME, method, self.addr, e))
        })?;

        match reply {
            Reply::Return(response) => Ok(response),
            Reply::Raised(err) => Err(err.into()),
        }
    }

    async fn exchange(&self, request: &I::Request) -> anyhow::Result<Reply<I::Response>> {
        let mut stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;

        protocol::write_frame(&mut stream, request.method()).await?;
        protocol::write_frame(&mut stream, request).await?;
        protocol::write_frame(&mut stream, request.param_types()).await?;
        stream.flush().await?;

        protocol::read_frame(&mut stream).await
    }
}

impl<I: RemoteInterface> Clone for Stub<I> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I: RemoteInterface> Copy for Stub<I> {}

impl<I: RemoteInterface> PartialEq for Stub<I> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl<I: RemoteInterface> Eq for Stub<I> {}

impl<I: RemoteInterface> Hash for Stub<I> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        I::NAME.hash(state);
        self.addr.hash(state);
    }
}

impl<I: RemoteInterface> fmt::Debug for Stub<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stub<{}>({})", I::NAME, self.addr)
    }
}

impl<I: RemoteInterface> fmt::Display for Stub<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", I::NAME, self.addr)
    }
}

impl<I: RemoteInterface> Serialize for Stub<I> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (I::NAME, self.addr).serialize(serializer)
    }
}

impl<'de, I: RemoteInterface> Deserialize<'de> for Stub<I> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (name, addr) = <(String, SocketAddr)>::deserialize(deserializer)?;
        if name != I::NAME {
            return Err(D::Error::custom(format!(
                "expected a {} stub, got a {} stub",
                I::NAME,
                name
            )));
        }
        Ok(Self::new(addr))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::api::command::CommandApi;
    use crate::api::storage::StorageApi;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_identity_is_interface_and_address() {
        let a = Stub::<StorageApi>::new(addr(7000));
        let b = Stub::<StorageApi>::new(addr(7000));
        let c = Stub::<StorageApi>::new(addr(7001));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(a.to_string(), "Storage@127.0.0.1:7000");
    }

    #[test]
    fn test_serialized_stub_keeps_interface() {
        let stub = Stub::<CommandApi>::new(addr(7100));
        let bytes = postcard::to_allocvec(&stub).unwrap();

        let back: Stub<CommandApi> = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, stub);

        // A command stub cannot be decoded as a storage stub.
        assert!(postcard::from_bytes::<Stub<StorageApi>>(&bytes).is_err());
    }

    #[tokio::test]
    async fn test_connection_refused_is_rpc_failure() {
        // Bind and drop to find a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let stub = Stub::<StorageApi>::new(addr(port));
        let path = crate::Path::parse("/f").unwrap();
        let err = stub
            .call(crate::api::storage::StorageRequest::Size { path })
            .await
            .unwrap_err();
        assert!(matches!(err, DfsError::Rpc(_)));
    }
}
