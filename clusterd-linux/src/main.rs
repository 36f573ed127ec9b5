// clusterd: cluster sync daemon. One listener plus the master or client role loop.

mod backend;
mod config;
mod discovery;
mod handler;
mod lifecycle;
mod listener;
mod logging;
mod roles;
mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clusterd_core::{ClusterKey, Role, SharedStatus};
use tokio::sync::mpsc;
use tracing::{error, info, info_span, Instrument};

use crate::backend::{FsBackend, SyncBackend};
use crate::config::{ClusterConfig, ConfigError};
use crate::handler::HandlerContext;
use crate::lifecycle::{PidFile, Shutdown};
use crate::listener::{ConnectionRegistry, Listener};

#[derive(Debug, Parser)]
#[command(name = "clusterd", version, about = "Cluster synchronization daemon")]
struct Cli {
    /// Run in the foreground.
    #[arg(short = 'f')]
    foreground: bool,
    /// Debug logging.
    #[arg(short = 'd')]
    debug: bool,
    /// Keep running as root instead of the service user.
    #[arg(short = 'r')]
    root: bool,
    /// Config file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Unprivileged account to switch to.
    #[arg(long, default_value = "ossec")]
    user: String,
    #[arg(long, default_value = "/var/run/clusterd")]
    pid_dir: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let loaded = config::read_config(cli.config.as_deref());
    let configured_log = loaded.as_ref().ok().and_then(|c| c.log_file.clone());
    let target = logging::LogTarget::new(cli.foreground, configured_log);
    if let Err(e) = logging::init(cli.debug, &target) {
        eprintln!("clusterd: {e:#}");
        return Ok(1);
    }
    let Some(config) = enabled_config(loaded)? else {
        return Ok(1);
    };

    if !cli.foreground {
        lifecycle::daemonize().context("cannot daemonize")?;
    }
    if !cli.root {
        lifecycle::drop_privileges(&cli.user).context("cannot drop privileges")?;
    }
    let pid_file = PidFile::create(&cli.pid_dir)
        .with_context(|| format!("cannot write pid file in {}", cli.pid_dir.display()))?;
    config.validate()?;
    info!(
        pid_file = %pid_file.path().display(),
        log_file = ?target.file,
        cluster = %config.name,
        node = %config.node_name,
        role = %config.node_type,
        "starting"
    );

    let node = Node::new(config)?;
    let rt = tokio::runtime::Runtime::new()?;
    let code = rt.block_on(serve(node, pid_file));
    rt.shutdown_timeout(Duration::from_secs(1));
    code
}

/// The config to run with, or `None` when clustering is off or not configured.
fn enabled_config(
    loaded: Result<ClusterConfig, ConfigError>,
) -> anyhow::Result<Option<ClusterConfig>> {
    match loaded {
        Ok(c) if !c.disabled => Ok(Some(c)),
        Ok(_) | Err(ConfigError::NotConfigured) => {
            error!("Cluster disabled");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Everything built from the validated config before the runtime starts.
struct Node {
    config: Arc<ClusterConfig>,
    key: ClusterKey,
    status: Arc<SharedStatus>,
    backend: Arc<dyn SyncBackend>,
}

impl Node {
    fn new(config: ClusterConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let key = ClusterKey::from_secret(&config.key)?;
        let local = discovery::local_addresses().context("cannot list local addresses")?;
        let remotes = discovery::remote_nodes(&config.node_addrs(), &local);
        let status = Arc::new(SharedStatus::new(remotes.iter().copied()));
        let backend: Arc<dyn SyncBackend> = Arc::new(FsBackend::new(
            config.clone(),
            key.clone(),
            remotes
                .iter()
                .map(|ip| SocketAddr::new(*ip, config.port))
                .collect(),
            local,
        ));
        Ok(Self {
            config,
            key,
            status,
            backend,
        })
    }
}

/// Bind the listener, start the role loop and run until a signal or a fatal accept
/// error. A bind failure returns before the role loop starts.
async fn serve(node: Node, pid_file: PidFile) -> anyhow::Result<i32> {
    let Node {
        config,
        key,
        status,
        backend,
    } = node;
    let (round_events, round_rx) = match config.node_type {
        Role::Master => {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        }
        Role::Client => (None, None),
    };

    let registry = ConnectionRegistry::new();
    let ctx = HandlerContext {
        key,
        backend: backend.clone(),
        status: status.clone(),
        round_events,
        io_timeout: config.socket_timeout(),
    };
    let addr = SocketAddr::new(config.bind_addr, config.port);
    let listener = Listener::bind(addr, ctx, registry.clone())
        .with_context(|| format!("cannot bind {addr}"))?;

    let scheduler = match round_rx {
        Some(rx) => tokio::spawn(roles::run_master(rx, status, backend)),
        None => {
            let period = config.interval.as_duration();
            tokio::spawn(roles::run_client(period, backend))
        }
    };

    let outcome = tokio::select! {
        r = listener.run().instrument(info_span!("listener")) => {
            r.context("listener stopped accepting connections")
        }
        r = lifecycle::shutdown_signal() => {
            info!("shutdown signal received");
            r.context("signal handler failed")
        }
    };
    let code = Shutdown {
        scheduler: Some(scheduler.abort_handle()),
        registry,
        pid_file: Some(pid_file),
    }
    .run();
    outcome.map(|()| code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const CONFIG: &str = r#"
name = "test"
node_name = "node01"
node_type = "client"
key = "0123456789abcdef0123456789abcdef"
nodes = ["127.0.0.1"]
interval = "10s"
bind_addr = "127.0.0.1"
"#;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("cluster.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn missing_config_disables_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = config::read_config(Some(&dir.path().join("absent.toml")));
        assert!(enabled_config(loaded).unwrap().is_none());
    }

    #[test]
    fn disabled_flag_disables_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &format!("disabled = true\n{CONFIG}"));
        let loaded = config::read_config(Some(&path));
        assert!(enabled_config(loaded).unwrap().is_none());
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "name = ");
        assert!(enabled_config(config::read_config(Some(&path))).is_err());
    }

    #[test]
    fn short_key_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let body = CONFIG.replace("0123456789abcdef0123456789abcdef", "short");
        let path = write_config(dir.path(), &body);
        let config = enabled_config(config::read_config(Some(&path)))
            .unwrap()
            .expect("enabled");
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn taken_port_fails_startup_and_removes_pid_file() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let body = format!("{CONFIG}port = {port}\nsync_dir = \"{}\"\n", dir.path().display());
        let config = config::parse(&body).unwrap();
        config.validate().unwrap();

        let pid_file = PidFile::create(dir.path()).unwrap();
        let pid_path = pid_file.path().to_path_buf();
        let err = serve(Node::new(config).unwrap(), pid_file).await.unwrap_err();
        assert!(err.to_string().contains("cannot bind"), "{err:#}");
        assert!(!pid_path.exists());
    }
}
