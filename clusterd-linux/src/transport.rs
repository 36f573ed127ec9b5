//! Framed cipher channel over TCP: chunked encrypted writes, terminator-scanning reads,
//! and the client side of a one-shot request.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use clusterd_core::wire::{self, FrameBuffer, FrameDecodeError, FrameEncodeError, SEND_CHUNK_SIZE};
use clusterd_core::{ClusterKey, ProtocolError, Request, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Size of each socket read.
pub const RECV_CHUNK_SIZE: usize = 4096;

/// Write `bytes` in slices of at most [`SEND_CHUNK_SIZE`], resuming after partial
/// writes. Returns the number of bytes written, always `bytes.len()` on success.
pub async fn write_chunked<W>(writer: &mut W, bytes: &[u8]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut sent = 0;
    while sent < bytes.len() {
        let end = (sent + SEND_CHUNK_SIZE).min(bytes.len());
        let n = writer.write(&bytes[sent..end]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "peer stopped accepting data",
            ));
        }
        sent += n;
    }
    writer.flush().await?;
    Ok(sent)
}

/// Encrypt, frame and send one message within `io_timeout`.
pub async fn write_frame<W>(
    writer: &mut W,
    key: &ClusterKey,
    plaintext: &[u8],
    io_timeout: Duration,
) -> Result<usize, TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = wire::encode_frame(key, plaintext)?;
    let sent = timeout(io_timeout, write_chunked(writer, &frame))
        .await
        .map_err(|_| TransportError::Timeout)??;
    debug!(sent, total = frame.len(), "frame sent");
    Ok(sent)
}

/// Read until `buffer` holds a full frame and return its token (still encrypted).
/// `on_chunk` sees every chunk as it arrives. Each read is bounded by `io_timeout`.
pub async fn read_frame<R>(
    reader: &mut R,
    buffer: &mut FrameBuffer,
    io_timeout: Duration,
    mut on_chunk: impl FnMut(&[u8]),
) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; RECV_CHUNK_SIZE];
    loop {
        if let Some(token) = buffer.take_frame() {
            return Ok(token);
        }
        let n = timeout(io_timeout, reader.read(&mut chunk))
            .await
            .map_err(|_| TransportError::Timeout)??;
        if n == 0 {
            return Err(TransportError::ConnectionClosed);
        }
        on_chunk(&chunk[..n]);
        buffer.push(&chunk[..n])?;
    }
}

/// Connect to `addr`, send `request`, wait for the single reply and decode it.
pub async fn send_request(
    addr: SocketAddr,
    key: &ClusterKey,
    request: &Request,
    io_timeout: Duration,
) -> Result<Response, TransportError> {
    let mut stream = timeout(io_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)??;
    debug!(%addr, command = request.command.name(), "sending request");
    write_frame(&mut stream, key, &request.encode(), io_timeout).await?;

    let mut buffer = FrameBuffer::new();
    let token = read_frame(&mut stream, &mut buffer, io_timeout, |_| {}).await?;
    let plaintext = wire::decode_frame(key, &token)?;
    Ok(Response::decode(&request.command, plaintext)?)
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("timed out waiting for peer")]
    Timeout,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// The peer is gone or silent; nothing more can be sent to it.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::Timeout | TransportError::ConnectionClosed
        )
    }
}
