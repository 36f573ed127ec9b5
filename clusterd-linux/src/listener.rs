//! TCP listener: accepts peers and runs one handler task per connection.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::AbortHandle;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::handler::{ConnectionHandler, HandlerContext};

/// Pending connections the kernel queues before `accept`.
pub const BACKLOG: u32 = 50;

/// Live connections, so shutdown can close all of them.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    live: Arc<Mutex<HashMap<Uuid, (SocketAddr, AbortHandle)>>>,
}

/// Removes its connection from the registry when the handler task ends, however it ends.
struct RegistryGuard {
    registry: ConnectionRegistry,
    id: Uuid,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.live.lock().remove(&self.id);
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    /// Spawn `task` as a tracked connection.
    fn spawn<F>(&self, peer: SocketAddr, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let guard = RegistryGuard {
            registry: self.clone(),
            id,
        };
        // Held across the spawn so the guard cannot remove the entry before it exists.
        let mut live = self.live.lock();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            task.await;
        });
        live.insert(id, (peer, handle.abort_handle()));
    }

    /// Abort every live connection; dropping a handler closes its socket.
    /// Returns how many were still open.
    pub fn close_all(&self) -> usize {
        let live: Vec<_> = self.live.lock().drain().map(|(_, v)| v).collect();
        for (peer, handle) in &live {
            if handle.is_finished() {
                debug!(%peer, "connection already closed");
            } else {
                debug!(%peer, "closing connection");
                handle.abort();
            }
        }
        live.len()
    }
}

pub struct Listener {
    listener: TcpListener,
    ctx: HandlerContext,
    registry: ConnectionRegistry,
}

impl Listener {
    /// Bind `addr` with address reuse and a bounded backlog.
    pub fn bind(
        addr: SocketAddr,
        ctx: HandlerContext,
        registry: ConnectionRegistry,
    ) -> io::Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(BACKLOG)?;
        Ok(Self {
            listener,
            ctx,
            registry,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept forever. Only an accept failure ends the loop; handler errors stay in
    /// their task.
    pub async fn run(self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let handler = ConnectionHandler::new(stream, peer.ip(), self.ctx.clone());
            let span = info_span!("connection", %peer);
            self.registry.spawn(
                peer,
                async move {
                    let state = handler.run().await;
                    debug!(?state, "connection finished");
                }
                .instrument(span),
            );
            debug!(%peer, live = self.registry.len(), "accepted connection");
        }
    }
}
