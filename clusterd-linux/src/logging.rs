//! Tracing subscriber setup.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::fmt::layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{registry, EnvFilter};

/// Log file of a daemonized node without `log_file` in its config.
pub const DEFAULT_LOG_FILE: &str = "/var/log/clusterd.log";

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTarget {
    pub file: Option<PathBuf>,
    pub console: bool,
}

impl LogTarget {
    /// A daemon has no terminal, so it always logs to a file. In the foreground the
    /// console is used, plus `configured` when set.
    pub fn new(foreground: bool, configured: Option<PathBuf>) -> Self {
        let file = match configured {
            Some(path) => Some(path),
            None if foreground => None,
            None => Some(PathBuf::from(DEFAULT_LOG_FILE)),
        };
        Self {
            file,
            console: foreground,
        }
    }
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "clusterd=debug"
    } else {
        "clusterd=info"
    }
}

fn open_log(path: &Path) -> anyhow::Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("cannot open log file {}: {e}", path.display()))
}

/// Install the global subscriber. `RUST_LOG` overrides the `-d` level when set.
/// The file is opened here, before daemonizing, so the descriptor survives the fork.
pub fn init(debug: bool, target: &LogTarget) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));
    let file_layer = match &target.file {
        Some(path) => Some(
            layer()
                .with_ansi(false)
                .with_writer(Mutex::new(open_log(path)?)),
        ),
        None => None,
    };
    let console_layer = target
        .console
        .then(|| layer().with_writer(std::io::stderr));
    registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("cannot install logger: {e}"))
}
