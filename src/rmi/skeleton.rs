use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::protocol::{self, RemoteError, Reply};
use super::{Dispatch, RemoteInterface, Signature};
use crate::{DfsError, Result};

/// Default bound on concurrently served calls per skeleton.
pub const DEFAULT_MAX_WORKERS: usize = 256;

/// How long a caller may take to send its call before the connection is dropped.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A running listener: its address, the shutdown signal, and the acceptor.
struct Listening {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
}

/// Multithreaded TCP server for the remote interface `I`.
///
/// Each accepted connection carries exactly one call and is served by its own
/// task; at most `max_workers` calls run at once and the acceptor stops
/// accepting while the pool is full. A caller that does not deliver its call
/// within the read timeout is disconnected. [`Skeleton::stop`] closes the
/// listener and waits for every in-flight call to finish.
pub struct Skeleton<I: RemoteInterface> {
    handler: Arc<dyn Dispatch<I>>,
    bind_addr: SocketAddr,
    max_workers: usize,
    read_timeout: Duration,
    listening: Mutex<Option<Listening>>,
}

impl<I: RemoteInterface> Skeleton<I> {
    /// Create a skeleton. With no address, an ephemeral loopback port is
    /// chosen at [`Skeleton::start`].
    pub fn new(handler: Arc<dyn Dispatch<I>>, bind_addr: Option<SocketAddr>) -> Self {
        Self {
            handler,
            bind_addr: bind_addr.unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0))),
            max_workers: DEFAULT_MAX_WORKERS,
            read_timeout: DEFAULT_READ_TIMEOUT,
            listening: Mutex::new(None),
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Bound the time between accepting a connection and having read its
    /// whole call. Running the handler is not bounded.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Bind the listening socket and spawn the acceptor. Returns the bound
    /// address.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.listening.lock().is_some() {
            return Err(DfsError::BadState(format!("{} skeleton already started", I::NAME)));
        }

        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            DfsError::Rpc(format!("cannot bind {} skeleton to {}: {e}", I::NAME, self.bind_addr))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DfsError::Rpc(format!("cannot read bound address: {e}")))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let limit = Arc::new(Semaphore::new(self.max_workers));
        let acceptor = tokio::spawn(accept_loop::<I>(
            listener,
            self.handler.clone(),
            limit,
            self.read_timeout,
            shutdown_rx,
        ));

        let mut listening = self.listening.lock();
        if listening.is_some() {
            // Lost a race with a concurrent start.
            let _ = shutdown.send(true);
            return Err(DfsError::BadState(format!("{} skeleton already started", I::NAME)));
        }
        *listening = Some(Listening {
            local_addr,
            shutdown,
            acceptor,
        });

        info!(interface = I::NAME, %local_addr, "Skeleton listening");
        Ok(local_addr)
    }

    /// Stop accepting and wait for every in-flight call to finish. Stopping
    /// a skeleton that is not running does nothing. A stopped skeleton may be
    /// started again.
    pub async fn stop(&self) {
        let Some(listening) = self.listening.lock().take() else {
            return;
        };

        let _ = listening.shutdown.send(true);
        if let Err(e) = listening.acceptor.await {
            warn!(interface = I::NAME, error = %e, "Acceptor task ended abnormally");
        }
        info!(interface = I::NAME, addr = %listening.local_addr, "Skeleton stopped");
    }

    pub fn is_running(&self) -> bool {
        self.listening.lock().is_some()
    }

    /// The bound address of a running skeleton.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listening
            .lock()
            .as_ref()
            .map(|l| l.local_addr)
            .ok_or_else(|| DfsError::BadState(format!("{} skeleton is not started", I::NAME)))
    }
}

/// Accept connections until shutdown, then drain the workers.
async fn accept_loop<I: RemoteInterface>(
    listener: TcpListener,
    handler: Arc<dyn Dispatch<I>>,
    limit: Arc<Semaphore>,
    read_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut workers = JoinSet::new();

    loop {
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = limit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(interface = I::NAME, error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let handler = handler.clone();
        workers.spawn(async move {
            let _permit = permit;
            serve_call::<I>(handler.as_ref(), stream, peer, read_timeout).await;
        });

        // Reap finished workers so the set does not grow without bound.
        while let Some(done) = workers.try_join_next() {
            if let Err(e) = done {
                warn!(interface = I::NAME, error = %e, "Worker task panicked");
            }
        }
    }

    drop(listener);
    debug!(interface = I::NAME, in_flight = workers.len(), "Listener closed, draining workers");
    while let Some(done) = workers.join_next().await {
        if let Err(e) = done {
            warn!(interface = I::NAME, error = %e, "Worker task panicked");
        }
    }
}

/// Why a call could not be handed to the handler.
enum ReadError {
    /// The connection broke; nothing can be sent back.
    Transport(anyhow::Error),
    /// The call arrived intact but names no method of this interface.
    Unresolved(DfsError),
}

/// Read the three call frames in order and resolve the method.
async fn read_call<I: RemoteInterface>(stream: &mut TcpStream) -> std::result::Result<I::Request, ReadError> {
    let method: String = protocol::read_frame(stream)
        .await
        .map_err(ReadError::Transport)?;
    let raw_request = protocol::read_raw_frame(stream)
        .await
        .map_err(ReadError::Transport)?;
    let param_types: Vec<String> = protocol::read_frame(stream)
        .await
        .map_err(ReadError::Transport)?;

    let unresolved = || {
        ReadError::Unresolved(DfsError::BadArgument(format!(
            "{} has no method {}({})",
            I::NAME,
            method,
            param_types.join(", ")
        )))
    };

    let request: I::Request = postcard::from_bytes(&raw_request).map_err(|_| unresolved())?;
    let same_types = request
        .param_types()
        .iter()
        .copied()
        .eq(param_types.iter().map(String::as_str));
    if request.method() != method || !same_types {
        return Err(unresolved());
    }
    Ok(request)
}

/// Serve the single call carried by `stream`, then close it.
async fn serve_call<I: RemoteInterface>(
    handler: &dyn Dispatch<I>,
    mut stream: TcpStream,
    peer: SocketAddr,
    read_timeout: Duration,
) {
    let Ok(call) = tokio::time::timeout(read_timeout, read_call::<I>(&mut stream)).await else {
        warn!(interface = I::NAME, %peer, ?read_timeout, "Timed out reading call, dropping connection");
        return;
    };

    let reply = match call {
        Ok(request) => {
            let method = request.method();
            debug!(interface = I::NAME, method, %peer, "Dispatching call");
            match handler.dispatch(request).await {
                Ok(response) => Reply::Return(response),
                Err(e) => {
                    debug!(interface = I::NAME, method, %peer, error = %e, "Call raised");
                    Reply::Raised(RemoteError::from(&e))
                }
            }
        }
        Err(ReadError::Unresolved(e)) => {
            warn!(interface = I::NAME, %peer, error = %e, "Unresolvable call");
            Reply::Raised(RemoteError::from(&e))
        }
        Err(ReadError::Transport(e)) => {
            warn!(interface = I::NAME, %peer, error = %e, "Failed to read call");
            return;
        }
    };

    if let Err(e) = protocol::write_frame(&mut stream, &reply).await {
        warn!(interface = I::NAME, %peer, error = %e, "Failed to send reply");
        return;
    }
    let _ = stream.shutdown().await;
}
