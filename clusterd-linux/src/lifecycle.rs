//! Process lifecycle: daemonizing, privilege drop, PID file and shutdown.

use std::io;
use std::path::{Path, PathBuf};

use tokio::task::AbortHandle;
use tracing::{debug, error, info};

use crate::listener::ConnectionRegistry;

/// Every shutdown path exits with this status.
pub const SHUTDOWN_EXIT_CODE: i32 = 1;

/// Wait for Ctrl+C or SIGTERM.
pub async fn shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

/// Detach from the terminal. Must run before the async runtime starts.
pub fn daemonize() -> Result<(), LifecycleError> {
    nix::unistd::daemon(false, false)?;
    Ok(())
}

/// Switch the group and effective user to `user`.
pub fn drop_privileges(user: &str) -> Result<(), LifecycleError> {
    let account = nix::unistd::User::from_name(user)?
        .ok_or_else(|| LifecycleError::UnknownUser(user.to_string()))?;
    nix::unistd::setgid(account.gid)?;
    nix::unistd::seteuid(account.uid)?;
    debug!(user, uid = account.uid.as_raw(), "dropped privileges");
    Ok(())
}

/// `<dir>/clusterd-<pid>.pid`, removed when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(dir: &Path) -> io::Result<Self> {
        let pid = std::process::id();
        let path = dir.join(format!("clusterd-{pid}.pid"));
        std::fs::write(&path, format!("{pid}\n"))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!(path = %self.path.display(), error = %e, "could not remove pid file");
        }
    }
}

/// Everything torn down when a signal arrives.
pub struct Shutdown {
    pub scheduler: Option<AbortHandle>,
    pub registry: ConnectionRegistry,
    pub pid_file: Option<PidFile>,
}

impl Shutdown {
    /// Stop the role loop, close open connections, remove the PID file.
    /// Failures are logged; the exit status is always [`SHUTDOWN_EXIT_CODE`].
    pub fn run(self) -> i32 {
        if let Some(scheduler) = self.scheduler {
            scheduler.abort();
            debug!("role scheduler stopped");
        }
        let closed = self.registry.close_all();
        info!(closed, "connections closed");
        drop(self.pid_file);
        SHUTDOWN_EXIT_CODE
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("user {0:?} does not exist")]
    UnknownUser(String),
    #[error("system call failed: {0}")]
    Os(#[from] nix::Error),
}
