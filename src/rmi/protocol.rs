use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Error kinds that survive the trip across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    BadArgument,
    BadState,
    BadRange,
    Io,
    Rpc,
}

/// Error envelope written by a skeleton in place of a return value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

/// The single response frame of a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply<T> {
    Return(T),
    Raised(RemoteError),
}

/// Maximum frame size (16 MiB) to prevent unbounded allocations.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Write a length-prefixed, postcard-serialized frame.
pub async fn write_frame<W, T>(send: &mut W, value: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let bytes = postcard::to_allocvec(value)?;
    anyhow::ensure!(
        bytes.len() <= MAX_FRAME_SIZE as usize,
        "frame too large: {} bytes",
        bytes.len()
    );
    let len = bytes.len() as u32;
    send.write_all(&len.to_be_bytes()).await?;
    send.write_all(&bytes).await?;
    Ok(())
}

/// Read the raw payload of one length-prefixed frame without decoding it.
pub async fn read_raw_frame<R>(recv: &mut R) -> anyhow::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    anyhow::ensure!(len <= MAX_FRAME_SIZE, "frame too large: {} bytes", len);

    let mut buf = vec![0u8; len as usize];
    recv.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read and decode one length-prefixed, postcard-serialized frame.
pub async fn read_frame<R, T>(recv: &mut R) -> anyhow::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let buf = read_raw_frame(recv).await?;
    Ok(postcard::from_bytes(&buf)?)
}
