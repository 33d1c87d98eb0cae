//! Server configuration.
//!
//! Values come from an optional JSON file, then command-line flags and
//! environment variables override them.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::plugin::{HostConfig, IsolationMode};

/// Looked up in the current directory when no `--config` is given.
pub const CONFIG_FILE: &str = "docserve.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DocserveConfig {
    pub docs_dir: PathBuf,
    pub bind: SocketAddr,
    /// Plugin module specifiers loaded into the worker.
    pub plugins: Vec<String>,
    pub plugin_dirs: Vec<PathBuf>,
    pub isolation: IsolationMode,
    pub load_timeout_ms: u64,
    pub invoke_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub worker_path: Option<PathBuf>,
    pub plugin_options: Option<Value>,
}

impl Default for DocserveConfig {
    fn default() -> Self {
        Self {
            docs_dir: PathBuf::from("docs"),
            bind: SocketAddr::from(([127, 0, 0, 1], 4850)),
            plugins: Vec::new(),
            plugin_dirs: Vec::new(),
            isolation: IsolationMode::Strict,
            load_timeout_ms: 10_000,
            invoke_timeout_ms: 10_000,
            grace_period_ms: 2_000,
            worker_path: None,
            plugin_options: None,
        }
    }
}

/// Values supplied on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub docs_dir: Option<PathBuf>,
    pub bind: Option<SocketAddr>,
    pub plugins: Vec<String>,
    pub plugin_dirs: Vec<PathBuf>,
    pub isolation: Option<IsolationMode>,
    pub load_timeout_ms: Option<u64>,
    pub invoke_timeout_ms: Option<u64>,
    pub grace_period_ms: Option<u64>,
    pub worker_path: Option<PathBuf>,
}

impl DocserveConfig {
    /// Reads `path`, or `docserve.json` in `cwd` when present, or defaults.
    pub fn load(path: Option<&Path>, cwd: &Path) -> CoreResult<Self> {
        let path = match path {
            Some(path) => cwd.join(path),
            None => {
                let default = cwd.join(CONFIG_FILE);
                if !default.is_file() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let content = std::fs::read_to_string(&path).map_err(|error| {
            CoreError::Config(format!("failed to read {}: {error}", path.display()))
        })?;
        let config = Self::from_json(&content)?;
        tracing::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_json(content: &str) -> CoreResult<Self> {
        serde_json::from_str(content)
            .map_err(|error| CoreError::Config(format!("failed to parse config: {error}")))
    }

    /// Applies overrides. Plugins and plugin directories are appended.
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(docs_dir) = overrides.docs_dir {
            self.docs_dir = docs_dir;
        }
        if let Some(bind) = overrides.bind {
            self.bind = bind;
        }
        for plugin in overrides.plugins {
            if !self.plugins.contains(&plugin) {
                self.plugins.push(plugin);
            }
        }
        for dir in overrides.plugin_dirs {
            if !self.plugin_dirs.contains(&dir) {
                self.plugin_dirs.push(dir);
            }
        }
        if let Some(isolation) = overrides.isolation {
            self.isolation = isolation;
        }
        if let Some(ms) = overrides.load_timeout_ms {
            self.load_timeout_ms = ms;
        }
        if let Some(ms) = overrides.invoke_timeout_ms {
            self.invoke_timeout_ms = ms;
        }
        if let Some(ms) = overrides.grace_period_ms {
            self.grace_period_ms = ms;
        }
        if overrides.worker_path.is_some() {
            self.worker_path = overrides.worker_path;
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        for (field, value) in [
            ("load_timeout_ms", self.load_timeout_ms),
            ("invoke_timeout_ms", self.invoke_timeout_ms),
            ("grace_period_ms", self.grace_period_ms),
        ] {
            if value == 0 {
                return Err(CoreError::Config(format!("{field} must be greater than zero")));
            }
        }
        if self.plugins.iter().any(|spec| spec.trim().is_empty()) {
            return Err(CoreError::Config("plugin specifiers must not be empty".to_string()));
        }
        Ok(())
    }

    /// Plugin host settings, with relative paths resolved against `cwd`.
    pub fn host_config(&self, cwd: &Path) -> HostConfig {
        HostConfig {
            worker_path: self.worker_path.as_ref().map(|path| cwd.join(path)),
            cwd: cwd.to_path_buf(),
            plugin_dirs: self.plugin_dirs.iter().map(|dir| cwd.join(dir)).collect(),
            load_timeout: Duration::from_millis(self.load_timeout_ms),
            invoke_timeout: Duration::from_millis(self.invoke_timeout_ms),
            grace_period: Duration::from_millis(self.grace_period_ms),
            plugin_options: self.plugin_options.clone(),
        }
    }
}
