//! Server side of one connection: read a single framed request, dispatch it, reply, close.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clusterd_core::wire::{self, FrameBuffer, FrameDecodeError};
use clusterd_core::{ClusterKey, Command, Request, Response, SharedStatus, SyncError};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backend::SyncBackend;
use crate::transport::{self, TransportError};

/// Where a connection is in its single exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    AwaitingTerminator,
    Dispatching,
    Responding,
    Closed,
    Error,
}

/// Sent to the master loop after every connection once the peer is idle again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundEvent {
    pub peer: IpAddr,
    /// The connection finished an `m_c_sync` push.
    pub client_sync: bool,
}

/// What every handler shares. Cloned per connection.
#[derive(Clone)]
pub struct HandlerContext {
    pub key: ClusterKey,
    pub backend: Arc<dyn SyncBackend>,
    pub status: Arc<SharedStatus>,
    /// Set on the master only.
    pub round_events: Option<mpsc::UnboundedSender<RoundEvent>>,
    pub io_timeout: Duration,
}

pub struct ConnectionHandler<S> {
    stream: S,
    peer: IpAddr,
    ctx: HandlerContext,
    buffer: FrameBuffer,
    state: HandlerState,
    client_sync: bool,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: IpAddr, ctx: HandlerContext) -> Self {
        Self {
            stream,
            peer,
            ctx,
            buffer: FrameBuffer::new(),
            state: HandlerState::AwaitingTerminator,
            client_sync: false,
        }
    }

    /// Serve the connection to completion. Returns `Closed` after a normal reply and
    /// `Error` for everything else; the stream is shut down either way.
    pub async fn run(mut self) -> HandlerState {
        let flag = self.ctx.status.peers.flag(self.peer);
        let failed = match self.exchange(&flag).await {
            Ok(()) => false,
            Err(e) if e.is_connection_error() => {
                debug!(peer = %self.peer, error = %e, "connection dropped without reply");
                true
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "connection aborted");
                true
            }
        };
        if let Err(e) = self.stream.shutdown().await {
            debug!(peer = %self.peer, error = %e, "shutdown after reply");
        }
        flag.store(false, Ordering::Release);

        if let Some(tx) = &self.ctx.round_events {
            // The master loop may already be gone during shutdown.
            let _ = tx.send(RoundEvent {
                peer: self.peer,
                client_sync: self.client_sync,
            });
        }
        if failed || self.state == HandlerState::Error {
            self.state = HandlerState::Error;
        } else {
            self.state = HandlerState::Closed;
        }
        self.state
    }

    async fn exchange(&mut self, flag: &AtomicBool) -> Result<(), TransportError> {
        let token = transport::read_frame(
            &mut self.stream,
            &mut self.buffer,
            self.ctx.io_timeout,
            |_| flag.store(true, Ordering::Release),
        )
        .await?;

        self.state = HandlerState::Dispatching;
        let response = match wire::decode_frame(&self.ctx.key, &token) {
            Ok(plaintext) => self.dispatch(&plaintext).await,
            Err(FrameDecodeError::Decrypt(e)) if e.is_decryption_failure() => {
                warn!(peer = %self.peer, error = %e, "could not decrypt request");
                self.state = HandlerState::Error;
                Response::error(format!("Could not decrypt message from {}", self.peer))
            }
            Err(e) => {
                error!(peer = %self.peer, error = %e, "cannot decode request");
                self.state = HandlerState::Error;
                Response::error(e.to_string())
            }
        };

        if self.state != HandlerState::Error {
            self.state = HandlerState::Responding;
        }
        let bytes = match response.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "could not encode reply");
                self.state = HandlerState::Error;
                Response::error(e.to_string()).encode()?
            }
        };
        transport::write_frame(&mut self.stream, &self.ctx.key, &bytes, self.ctx.io_timeout)
            .await?;
        Ok(())
    }

    /// Decode and run one request. Failures become error replies.
    async fn dispatch(&mut self, plaintext: &[u8]) -> Response {
        let request = match Request::decode(plaintext) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "rejected request");
                self.state = HandlerState::Error;
                return Response::error(e.to_string());
            }
        };
        let name = request.command.name();
        debug!(peer = %self.peer, command = name, "dispatching");
        match self.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(peer = %self.peer, command = name, error = %e, "command failed");
                self.state = HandlerState::Error;
                Response::error(e.to_string())
            }
        }
    }

    async fn execute(&mut self, request: Request) -> Result<Response, SyncError> {
        let backend = self.ctx.backend.clone();
        match request.command {
            Command::Node => Ok(Response::ok(backend.node_identity())),
            Command::MasterClientSync => {
                let status = self.ctx.status.clone();
                let rounds = &status.rounds;
                rounds.record_connected();
                let payload = request.payload;
                let applied = blocking(move || {
                    let files = backend.decompress_archive(&payload)?;
                    backend.apply_incoming_files(files)
                })
                .await;
                match applied {
                    Ok(outcome) => {
                        rounds.record_finished(self.peer, outcome.restart_required);
                        self.client_sync = true;
                        info!(
                            peer = %self.peer,
                            bytes = outcome.archive.len(),
                            restart = outcome.restart_required,
                            "client sync applied"
                        );
                        Ok(Response::Binary(outcome.archive))
                    }
                    Err(e) => {
                        rounds.record_abandoned();
                        Err(e)
                    }
                }
            }
            Command::FileStatus => {
                let report = blocking(move || backend.file_status()).await?;
                Ok(Response::ok(report))
            }
            Command::ForceSync { reason } => {
                info!(peer = %self.peer, %reason, "sync forced by peer");
                backend.push_client_state(&reason).await?;
                Ok(Response::ok(json!(1)))
            }
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, SyncError>
where
    F: FnOnce() -> Result<T, SyncError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
}
