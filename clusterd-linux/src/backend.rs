//! Sync collaborators behind one trait, plus the filesystem implementation the daemon runs.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clusterd_core::{
    archive, integrity, ApplyOutcome, Command, FileEntry, FileSet, Request, Response, Role,
    SyncError,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::transport;

/// Work the protocol engine hands off. The blocking methods run on the blocking pool.
#[async_trait]
pub trait SyncBackend: Send + Sync + 'static {
    /// Descriptor returned by `node`.
    fn node_identity(&self) -> Value;

    /// Descriptor returned by `file_status`, from the master's point of view.
    fn file_status(&self) -> Result<Value, SyncError>;

    fn decompress_archive(&self, bytes: &[u8]) -> Result<FileSet, SyncError> {
        archive::decompress(bytes)
    }

    /// Merge a client's files; the outcome carries the archive sent back to it.
    fn apply_incoming_files(&self, files: FileSet) -> Result<ApplyOutcome, SyncError>;

    /// Push this node's files to the master and apply its reply.
    async fn push_client_state(&self, reason: &str) -> Result<(), SyncError>;

    /// Called on the master after a round in which `clients` changed its files.
    async fn restart_after_sync(&self, clients: &[IpAddr]) -> Result<(), SyncError>;
}

/// Synchronizes the regular files under `sync_dir`. The master's copy wins conflicts.
pub struct FsBackend {
    config: Arc<ClusterConfig>,
    key: clusterd_core::ClusterKey,
    /// Where the other nodes listen.
    remotes: Vec<SocketAddr>,
    local: HashSet<IpAddr>,
}

impl FsBackend {
    pub fn new(
        config: Arc<ClusterConfig>,
        key: clusterd_core::ClusterKey,
        remotes: Vec<SocketAddr>,
        local: HashSet<IpAddr>,
    ) -> Self {
        Self {
            config,
            key,
            remotes,
            local,
        }
    }

    fn sync_dir(&self) -> &Path {
        &self.config.sync_dir
    }

    /// Ask every remote node who it is; the one reporting `master` gets the push.
    async fn locate_master(&self) -> Result<SocketAddr, SyncError> {
        for addr in &self.remotes {
            let request = Request::new(Command::Node);
            match transport::send_request(*addr, &self.key, &request, self.config.socket_timeout())
                .await
            {
                Ok(Response::Json(env)) if env.error == 0 && env.data["type"] == "master" => {
                    return Ok(*addr);
                }
                Ok(_) => debug!(%addr, "node is not the master"),
                Err(e) => warn!(%addr, error = %e, "could not query node"),
            }
        }
        Err(SyncError::NoMaster)
    }
}

#[async_trait]
impl SyncBackend for FsBackend {
    fn node_identity(&self) -> Value {
        let mut ips: Vec<String> = self.local.iter().map(IpAddr::to_string).collect();
        ips.sort();
        json!({
            "cluster": self.config.name,
            "node": self.config.node_name,
            "type": self.config.node_type.to_string(),
            "ip": ips,
        })
    }

    fn file_status(&self) -> Result<Value, SyncError> {
        let files = collect_files(self.sync_dir())?;
        Ok(integrity::status_report(&files))
    }

    fn apply_incoming_files(&self, incoming: FileSet) -> Result<ApplyOutcome, SyncError> {
        let local = collect_files(self.sync_dir())?;
        let reply = files_missing_or_different(&local, &incoming)?;
        let new_files = files_missing(&incoming, &local)?;
        let restart_required = !new_files.is_empty();
        write_files(self.sync_dir(), &new_files)?;
        debug!(
            received = incoming.len(),
            written = new_files.len(),
            replied = reply.len(),
            "applied client files"
        );
        Ok(ApplyOutcome {
            archive: archive::compress(&reply)?,
            restart_required,
        })
    }

    async fn push_client_state(&self, reason: &str) -> Result<(), SyncError> {
        if self.config.node_type == Role::Master {
            return Err(SyncError::Remote("the master does not push to itself".into()));
        }
        let master = self.locate_master().await?;
        let dir = self.sync_dir().to_path_buf();
        let blob = tokio::task::spawn_blocking(move || {
            collect_files(&dir).and_then(|files| archive::compress(&files))
        })
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))??;
        info!(%master, reason, bytes = blob.len(), "pushing files to master");

        let request = Request::with_payload(Command::MasterClientSync, blob);
        let reply = transport::send_request(master, &self.key, &request, self.config.socket_timeout())
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let bytes = match reply {
            Response::Binary(bytes) => bytes,
            Response::Json(env) => return Err(SyncError::Remote(env.data.to_string())),
        };

        let dir = self.sync_dir().to_path_buf();
        let written = tokio::task::spawn_blocking(move || {
            let files = archive::decompress(&bytes)?;
            write_files(&dir, &files).map(|_| files.len())
        })
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))??;
        info!(%master, written, "files from master applied");
        Ok(())
    }

    async fn restart_after_sync(&self, clients: &[IpAddr]) -> Result<(), SyncError> {
        let Some(cmd) = self.config.restart_command.as_deref() else {
            info!(clients = clients.len(), "files changed; no restart command configured");
            return Ok(());
        };
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .status()
            .await?;
        if !status.success() {
            return Err(SyncError::Remote(format!("restart command exited with {status}")));
        }
        info!(clients = clients.len(), "restart command finished");
        Ok(())
    }
}

/// Every regular file under `root`, keyed by path relative to it. A missing root is empty.
pub fn collect_files(root: &Path) -> Result<FileSet, SyncError> {
    let mut files = FileSet::new();
    if !root.exists() {
        return Ok(files);
    }
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let rel = path
                    .strip_prefix(root)
                    .map_err(|_| SyncError::UnsafePath(path.clone()))?
                    .to_path_buf();
                let mode = file_mode(&entry.metadata()?);
                files.insert(FileEntry {
                    path: rel,
                    contents: std::fs::read(&path)?,
                    mode,
                })?;
            }
        }
    }
    Ok(files)
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    clusterd_core::sync::DEFAULT_MODE
}

/// Write every file of `files` under `root`, creating directories as needed.
pub fn write_files(root: &Path, files: &FileSet) -> Result<(), SyncError> {
    for file in files.iter() {
        clusterd_core::sync::check_relative(&file.path)?;
        let dest: PathBuf = root.join(&file.path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, &file.contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(file.mode))?;
        }
    }
    Ok(())
}

/// Files of `ours` that `theirs` lacks or holds with other contents.
fn files_missing_or_different(ours: &FileSet, theirs: &FileSet) -> Result<FileSet, SyncError> {
    let mut out = FileSet::new();
    for file in ours.iter() {
        if theirs.get(&file.path).map_or(true, |t| t.contents != file.contents) {
            out.insert(file.clone())?;
        }
    }
    Ok(out)
}

/// Files of `ours` whose path `theirs` does not have at all.
fn files_missing(ours: &FileSet, theirs: &FileSet) -> Result<FileSet, SyncError> {
    let mut out = FileSet::new();
    for file in ours.iter().filter(|f| theirs.get(&f.path).is_none()) {
        out.insert(file.clone())?;
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    /// Records calls; `push_failures` makes the first N pushes fail.
    #[derive(Default)]
    pub struct StubBackend {
        pub reply_files: FileSet,
        pub restart_required: bool,
        pub push_failures: Mutex<u32>,
        pub pushes: Mutex<Vec<(Instant, String)>>,
        pub restarts: Mutex<Vec<Vec<IpAddr>>>,
        pub applied: Mutex<Vec<FileSet>>,
    }

    #[async_trait]
    impl SyncBackend for StubBackend {
        fn node_identity(&self) -> Value {
            json!({"node": "stub", "type": "master"})
        }

        fn file_status(&self) -> Result<Value, SyncError> {
            Ok(json!({"perspective": integrity::PERSPECTIVE, "files": {}}))
        }

        fn apply_incoming_files(&self, files: FileSet) -> Result<ApplyOutcome, SyncError> {
            self.applied.lock().push(files);
            Ok(ApplyOutcome {
                archive: archive::compress(&self.reply_files)?,
                restart_required: self.restart_required,
            })
        }

        async fn push_client_state(&self, reason: &str) -> Result<(), SyncError> {
            self.pushes.lock().push((Instant::now(), reason.to_string()));
            let mut failures = self.push_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(SyncError::NoMaster);
            }
            Ok(())
        }

        async fn restart_after_sync(&self, clients: &[IpAddr]) -> Result<(), SyncError> {
            self.restarts.lock().push(clients.to_vec());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn config_for(dir: &Path, role: &str) -> Arc<ClusterConfig> {
        let s = format!(
            r#"
name = "test"
node_name = "{role}-node"
node_type = "{role}"
key = "0123456789abcdef0123456789abcdef"
nodes = ["127.0.0.1"]
interval = "10s"
socket_timeout = 5
sync_dir = "{}"
"#,
            dir.display()
        );
        Arc::new(config::parse(&s).unwrap())
    }

    fn backend(dir: &Path, role: &str, remotes: Vec<SocketAddr>) -> FsBackend {
        let config = config_for(dir, role);
        let key = clusterd_core::ClusterKey::from_secret(&config.key).unwrap();
        FsBackend::new(config, key, remotes, HashSet::from([IpAddr::from([127, 0, 0, 1])]))
    }

    fn set(files: &[(&str, &str)]) -> FileSet {
        let mut out = FileSet::new();
        for (path, contents) in files {
            out.insert(FileEntry::new(*path, contents.as_bytes().to_vec())).unwrap();
        }
        out
    }

    #[test]
    fn file_set_differences() {
        let ours = set(&[("a", "same"), ("b", "ours"), ("c", "only ours")]);
        let theirs = set(&[("a", "same"), ("b", "theirs"), ("d", "only theirs")]);

        let reply = files_missing_or_different(&ours, &theirs).unwrap();
        assert_eq!(reply, set(&[("b", "ours"), ("c", "only ours")]));
        let new_files = files_missing(&theirs, &ours).unwrap();
        assert_eq!(new_files, set(&[("d", "only theirs")]));
        assert!(files_missing(&ours, &ours).unwrap().is_empty());
    }

    #[test]
    fn collect_and_write_files() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("etc/shared")).unwrap();
        std::fs::write(src.path().join("etc/client.keys"), b"001 agent").unwrap();
        std::fs::write(src.path().join("etc/shared/merged.mg"), b"merged").unwrap();

        let files = collect_files(src.path()).unwrap();
        assert_eq!(files.len(), 2);

        let dst = tempfile::tempdir().unwrap();
        write_files(dst.path(), &files).unwrap();
        assert_eq!(std::fs::read(dst.path().join("etc/shared/merged.mg")).unwrap(), b"merged");
        assert_eq!(collect_files(dst.path()).unwrap(), files);
    }

    #[test]
    fn missing_dir_collects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_files(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn master_apply_merges_and_replies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("shared.conf"), b"master copy").unwrap();
        std::fs::write(dir.path().join("same.txt"), b"same").unwrap();
        let master = backend(dir.path(), "master", vec![]);

        let mut incoming = FileSet::new();
        incoming.insert(FileEntry::new("shared.conf", b"client copy".to_vec())).unwrap();
        incoming.insert(FileEntry::new("same.txt", b"same".to_vec())).unwrap();
        incoming.insert(FileEntry::new("agent-info/agent-1", b"info".to_vec())).unwrap();

        let outcome = master.apply_incoming_files(incoming).unwrap();
        assert!(outcome.restart_required);
        // Master copy is kept; the new file is added.
        assert_eq!(std::fs::read(dir.path().join("shared.conf")).unwrap(), b"master copy");
        assert_eq!(std::fs::read(dir.path().join("agent-info/agent-1")).unwrap(), b"info");

        let reply = archive::decompress(&outcome.archive).unwrap();
        assert_eq!(reply.len(), 1);
        assert_eq!(
            reply.get(Path::new("shared.conf")).unwrap().contents,
            b"master copy"
        );
    }

    #[test]
    fn apply_without_new_files_needs_no_restart() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"1").unwrap();
        let master = backend(dir.path(), "master", vec![]);
        let mut incoming = FileSet::new();
        incoming.insert(FileEntry::new("a", b"2".to_vec())).unwrap();
        assert!(!master.apply_incoming_files(incoming).unwrap().restart_required);
    }

    #[test]
    fn identity_and_status() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"abc").unwrap();
        let node = backend(dir.path(), "client", vec![]);
        let id = node.node_identity();
        assert_eq!(id["type"], "client");
        assert_eq!(id["node"], "client-node");
        let status = node.file_status().unwrap();
        assert_eq!(status["perspective"], "master");
        assert_eq!(status["files"]["a"]["size"], 3);
    }

    #[tokio::test]
    async fn master_refuses_to_push() {
        let dir = tempfile::tempdir().unwrap();
        let master = backend(dir.path(), "master", vec![]);
        assert!(master.push_client_state("Client interval").await.is_err());
    }

    #[tokio::test]
    async fn no_reachable_master() {
        let dir = tempfile::tempdir().unwrap();
        // Nothing listens on this port once the listener is dropped.
        let addr = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let client = backend(dir.path(), "client", vec![addr]);
        assert!(matches!(
            client.push_client_state("Client interval").await,
            Err(SyncError::NoMaster)
        ));
    }

    #[tokio::test]
    async fn client_push_against_live_master() {
        use crate::handler::HandlerContext;
        use crate::listener::{ConnectionRegistry, Listener};
        use clusterd_core::SharedStatus;

        let master_dir = tempfile::tempdir().unwrap();
        std::fs::write(master_dir.path().join("shared.conf"), b"from master").unwrap();
        let master = Arc::new(backend(master_dir.path(), "master", vec![]));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = HandlerContext {
            key: master.key.clone(),
            backend: master,
            status: Arc::new(SharedStatus::new([])),
            round_events: Some(tx),
            io_timeout: std::time::Duration::from_secs(5),
        };
        let listener =
            Listener::bind("127.0.0.1:0".parse().unwrap(), ctx, ConnectionRegistry::new())
                .unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(listener.run());

        let client_dir = tempfile::tempdir().unwrap();
        std::fs::write(client_dir.path().join("shared.conf"), b"stale").unwrap();
        std::fs::create_dir_all(client_dir.path().join("agents")).unwrap();
        std::fs::write(client_dir.path().join("agents/web01"), b"agent").unwrap();
        let client = backend(client_dir.path(), "client", vec![addr]);
        client.push_client_state("Client interval").await.unwrap();

        assert_eq!(
            std::fs::read(client_dir.path().join("shared.conf")).unwrap(),
            b"from master"
        );
        assert_eq!(
            std::fs::read(master_dir.path().join("agents/web01")).unwrap(),
            b"agent"
        );
        assert_eq!(rx.recv().await.unwrap().peer, IpAddr::from([127, 0, 0, 1]));
        server.abort();
    }

    #[tokio::test]
    async fn restart_command_runs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("restarted");
        let mut config = (*config_for(dir.path(), "master")).clone();
        config.restart_command = Some(format!("touch {}", marker.display()));
        let key = clusterd_core::ClusterKey::from_secret(&config.key).unwrap();
        let master = FsBackend::new(Arc::new(config), key, vec![], HashSet::new());
        master
            .restart_after_sync(&[IpAddr::from([10, 0, 0, 2])])
            .await
            .unwrap();
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn failing_restart_command_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = (*config_for(dir.path(), "master")).clone();
        config.restart_command = Some("exit 3".into());
        let key = clusterd_core::ClusterKey::from_secret(&config.key).unwrap();
        let master = FsBackend::new(Arc::new(config), key, vec![], HashSet::new());
        assert!(master.restart_after_sync(&[]).await.is_err());
    }
}
