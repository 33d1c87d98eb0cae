//! Filesystem read restrictions for the plugin worker.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// File name of a plugin manifest inside a plugin directory.
pub const MANIFEST_FILE: &str = "plugin.json";

/// Worker privilege level, resolved once at startup.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Worker runs with the supervisor's privileges.
    None,
    /// Worker reads are limited to a computed allow-list.
    #[default]
    Strict,
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationMode::None => f.write_str("none"),
            IsolationMode::Strict => f.write_str("strict"),
        }
    }
}

/// Resolves a module specifier to a plugin manifest on disk.
///
/// Accepts a manifest path, a plugin directory, a `file://` URL, or a bare
/// package name looked up under `plugin_dirs`. Returns `None` for other URL
/// schemes and for anything that does not exist.
pub fn resolve_manifest_path(spec: &str, cwd: &Path, plugin_dirs: &[PathBuf]) -> Option<PathBuf> {
    let raw = if let Some(path) = spec.strip_prefix("file://") {
        path
    } else if spec.contains("://") {
        return None;
    } else {
        spec
    };

    if let Some(found) = manifest_at(&cwd.join(raw)) {
        return Some(found);
    }

    if is_package_name(raw) {
        return plugin_dirs
            .iter()
            .find_map(|dir| manifest_at(&dir.join(raw)));
    }
    None
}

fn manifest_at(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    let manifest = path.join(MANIFEST_FILE);
    manifest.is_file().then_some(manifest)
}

fn is_package_name(spec: &str) -> bool {
    !spec.is_empty()
        && !spec.starts_with('.')
        && !Path::new(spec).is_absolute()
        && !spec.contains(['/', '\\'])
}

fn is_remote(spec: &str) -> bool {
    spec.starts_with("http://") || spec.starts_with("https://")
}

/// Directories the worker may read under strict isolation.
///
/// The current directory, then per specifier the directory that contains the
/// resolved manifest. Unresolvable specifiers fall back to the parent of the
/// specifier taken relative to `cwd`. Remote URLs contribute nothing.
pub fn compute_read_allow_list(specs: &[String], cwd: &Path, plugin_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs = vec![canonical_or_raw(cwd)];
    for spec in specs {
        if is_remote(spec) {
            continue;
        }
        let dir = match resolve_manifest_path(spec, cwd, plugin_dirs) {
            Some(manifest) => manifest.parent().map(Path::to_path_buf),
            None => cwd.join(spec).parent().map(Path::to_path_buf),
        };
        if let Some(dir) = dir {
            let dir = canonical_or_raw(&dir);
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
    }
    dirs
}

/// Worker command-line arguments for an allow-list.
pub fn allow_list_args(dirs: &[PathBuf]) -> Vec<String> {
    dirs.iter()
        .map(|dir| format!("--allow-fs-read={}", dir.display()))
        .collect()
}

fn canonical_or_raw(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Read capability held by the worker.
///
/// Enforced for everything the worker reads itself. Child processes would
/// escape the allow-list, so an allow-list also forbids spawning them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReadCapability {
    #[default]
    Unrestricted,
    AllowList(Vec<PathBuf>),
}

impl ReadCapability {
    /// Builds a capability from `--allow-fs-read` directories. An empty list
    /// means the worker was started without isolation.
    pub fn from_allow_list(dirs: Vec<PathBuf>) -> Self {
        if dirs.is_empty() {
            return ReadCapability::Unrestricted;
        }
        ReadCapability::AllowList(dirs.iter().map(|dir| canonical_or_raw(dir)).collect())
    }

    pub fn permits(&self, path: &Path) -> bool {
        match self {
            ReadCapability::Unrestricted => true,
            ReadCapability::AllowList(dirs) => {
                let resolved = canonical_or_raw(path);
                dirs.iter().any(|dir| resolved.starts_with(dir))
            }
        }
    }

    /// Child processes may only be started without an allow-list.
    pub fn permits_spawn(&self) -> bool {
        matches!(self, ReadCapability::Unrestricted)
    }

    pub fn check(&self, path: &Path) -> CoreResult<()> {
        if self.permits(path) {
            return Ok(());
        }
        Err(CoreError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("read access to {} is not allowed", path.display()),
        )))
    }

    pub async fn read_to_string(&self, path: &Path) -> CoreResult<String> {
        self.check(path)?;
        Ok(tokio::fs::read_to_string(path).await?)
    }
}
