//! Command-line arguments of the two binaries.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::ConfigOverrides;
use crate::plugin::IsolationMode;

/// Serve documentation tools over HTTP, with third-party tools loaded into a
/// sandboxed plugin worker.
#[derive(Debug, Parser)]
#[command(name = "docserve", version, about)]
pub struct ServeArgs {
    /// JSON config file (defaults to ./docserve.json when present)
    #[arg(long, env = "DOCSERVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory containing the markdown documentation
    #[arg(long, env = "DOCSERVE_DOCS_DIR")]
    pub docs_dir: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "DOCSERVE_BIND")]
    pub bind: Option<SocketAddr>,

    /// Plugin module specifier (repeatable)
    #[arg(long = "plugin", value_name = "SPEC")]
    pub plugins: Vec<String>,

    /// Directory searched for plugins referenced by package name (repeatable)
    #[arg(long = "plugin-dir", value_name = "DIR")]
    pub plugin_dirs: Vec<PathBuf>,

    /// Filesystem isolation of the plugin worker
    #[arg(long, value_enum, env = "DOCSERVE_ISOLATION")]
    pub isolation: Option<IsolationMode>,

    #[arg(long, env = "DOCSERVE_LOAD_TIMEOUT_MS")]
    pub load_timeout_ms: Option<u64>,

    #[arg(long, env = "DOCSERVE_INVOKE_TIMEOUT_MS")]
    pub invoke_timeout_ms: Option<u64>,

    #[arg(long, env = "DOCSERVE_GRACE_PERIOD_MS")]
    pub grace_period_ms: Option<u64>,

    /// Path to the docserve-plugin-worker binary
    #[arg(long)]
    pub worker_path: Option<PathBuf>,
}

impl ServeArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            docs_dir: self.docs_dir.clone(),
            bind: self.bind,
            plugins: self.plugins.clone(),
            plugin_dirs: self.plugin_dirs.clone(),
            isolation: self.isolation,
            load_timeout_ms: self.load_timeout_ms,
            invoke_timeout_ms: self.invoke_timeout_ms,
            grace_period_ms: self.grace_period_ms,
            worker_path: self.worker_path.clone(),
        }
    }
}

/// Plugin worker process. Started by `docserve`, not meant to be run by hand.
#[derive(Debug, Parser)]
#[command(name = "docserve-plugin-worker", version, about)]
pub struct WorkerArgs {
    /// Supervisor channel address
    #[arg(long, value_name = "ADDR")]
    pub channel: String,

    /// Directory the worker may read (repeatable). None means unrestricted.
    #[arg(long = "allow-fs-read", value_name = "DIR")]
    pub allow_fs_read: Vec<PathBuf>,

    #[arg(long = "plugin-dir", value_name = "DIR")]
    pub plugin_dirs: Vec<PathBuf>,

    /// Channel authentication token
    #[arg(long, env = "DOCSERVE_CHANNEL_TOKEN", hide_env_values = true)]
    pub token: String,
}
