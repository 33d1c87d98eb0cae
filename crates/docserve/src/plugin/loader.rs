//! Module loading inside the worker.
//!
//! A specifier is turned into a [`ModuleExports`] surface that the normalizer
//! can classify. Two sources exist: modules compiled into the worker
//! ([`ModuleRegistry`]) and filesystem plugins described by a `plugin.json`
//! manifest ([`ManifestLoader`]).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{CoreError, CoreResult};
use crate::tools::{boxed_tool_future, Export, ModuleExports, Tool, ToolError, ToolSchema};

use super::isolation::{resolve_manifest_path, ReadCapability};

#[async_trait::async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, specifier: &str) -> CoreResult<ModuleExports>;
}

type ModuleFactory = Arc<dyn Fn() -> ModuleExports + Send + Sync>;

/// Modules compiled into the worker, keyed by specifier.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, specifier: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> ModuleExports + Send + Sync + 'static,
    {
        self.modules.insert(specifier.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, specifier: &str) -> bool {
        self.modules.contains_key(specifier)
    }
}

#[async_trait::async_trait]
impl ModuleLoader for ModuleRegistry {
    async fn load(&self, specifier: &str) -> CoreResult<ModuleExports> {
        let factory = self
            .modules
            .get(specifier)
            .ok_or_else(|| CoreError::ModuleLoad(format!("cannot find module '{specifier}'")))?;
        Ok(factory())
    }
}

/// On-disk description of a command-backed plugin.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tools: Vec<ManifestTool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,
    /// Program to run. Paths starting with `./` or `../` are relative to the
    /// plugin directory.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_input_schema() -> Value {
    json!({ "type": "object" })
}

/// Loads `plugin.json` plugins, reading only what the capability allows.
pub struct ManifestLoader {
    cwd: PathBuf,
    plugin_dirs: Vec<PathBuf>,
    capability: ReadCapability,
}

impl ManifestLoader {
    pub fn new(cwd: PathBuf, plugin_dirs: Vec<PathBuf>, capability: ReadCapability) -> Self {
        Self {
            cwd,
            plugin_dirs,
            capability,
        }
    }

    pub async fn read_manifest(&self, specifier: &str) -> CoreResult<(PathBuf, PluginManifest)> {
        if specifier.contains("://") && !specifier.starts_with("file://") {
            return Err(CoreError::ModuleLoad(format!(
                "unsupported module scheme in '{specifier}'"
            )));
        }
        let path = resolve_manifest_path(specifier, &self.cwd, &self.plugin_dirs)
            .ok_or_else(|| CoreError::ModuleLoad(format!("cannot find module '{specifier}'")))?;
        let content = self.capability.read_to_string(&path).await?;
        let manifest = serde_json::from_str(&content).map_err(|error| {
            CoreError::ModuleLoad(format!(
                "failed to parse plugin manifest {}: {error}",
                path.display()
            ))
        })?;
        Ok((path, manifest))
    }
}

#[async_trait::async_trait]
impl ModuleLoader for ManifestLoader {
    async fn load(&self, specifier: &str) -> CoreResult<ModuleExports> {
        let (path, manifest) = self.read_manifest(specifier).await?;
        let plugin_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.cwd.clone());
        tracing::debug!(
            plugin = %manifest.name,
            tools = manifest.tools.len(),
            "read plugin manifest {}",
            path.display()
        );
        let creators = manifest
            .tools
            .into_iter()
            .map(|tool| command_export(tool, plugin_dir.clone(), self.capability.permits_spawn()))
            .collect();
        Ok(ModuleExports::with_default(Export::Array(creators)))
    }
}

/// Compiled-in modules first, then manifests on disk.
pub struct CompositeLoader {
    registry: ModuleRegistry,
    manifests: ManifestLoader,
}

impl CompositeLoader {
    pub fn new(registry: ModuleRegistry, manifests: ManifestLoader) -> Self {
        Self {
            registry,
            manifests,
        }
    }
}

#[async_trait::async_trait]
impl ModuleLoader for CompositeLoader {
    async fn load(&self, specifier: &str) -> CoreResult<ModuleExports> {
        if self.registry.contains(specifier) {
            return self.registry.load(specifier).await;
        }
        self.manifests.load(specifier).await
    }
}

struct CommandSpec {
    program: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: PathBuf,
    spawn_allowed: bool,
}

fn command_export(tool: ManifestTool, plugin_dir: PathBuf, spawn_allowed: bool) -> Export {
    Export::function(move |_options| {
        let spec = Arc::new(CommandSpec {
            program: resolve_program(&tool.command, &plugin_dir),
            args: tool.args.clone(),
            env: tool.env.clone(),
            cwd: plugin_dir.clone(),
            spawn_allowed,
        });
        let handler = Arc::new(move |args: Value| {
            let spec = spec.clone();
            boxed_tool_future(async move { run_command(&spec, args).await })
        });
        Ok(Export::Tool(Tool::new(
            tool.name.clone(),
            ToolSchema::new(tool.description.clone(), tool.input_schema.clone()),
            handler,
        )))
    })
}

fn resolve_program(command: &str, plugin_dir: &Path) -> PathBuf {
    if command.starts_with("./") || command.starts_with("../") {
        plugin_dir.join(command)
    } else {
        PathBuf::from(command)
    }
}

/// Runs one invocation: JSON args on stdin, JSON (or plain text) on stdout.
async fn run_command(spec: &CommandSpec, args: Value) -> Result<Value, ToolError> {
    if !spec.spawn_allowed {
        return Err(ToolError::new(format!(
            "running {} is not allowed under strict isolation",
            spec.program.display()
        ))
        .with_code("ERR_ACCESS_DENIED"));
    }
    let input = serde_json::to_vec(&args)
        .map_err(|error| ToolError::new(format!("failed to serialize tool args: {error}")))?;

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .envs(&spec.env)
        .current_dir(&spec.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| {
            ToolError::new(format!(
                "failed to start {}: {error}",
                spec.program.display()
            ))
        })?;

    // Output is drained while stdin is fed, so commands that echo large
    // inputs cannot fill their pipes and stall.
    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            // Commands that never read their input close the pipe early.
            let _ = stdin.write_all(&input).await;
        }
    };
    let ((), output) = tokio::join!(feed, child.wait_with_output());
    let output =
        output.map_err(|error| ToolError::new(format!("failed to wait for tool command: {error}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("tool command failed: {}", output.status)
        } else {
            stderr
        };
        let mut error = ToolError::new(message);
        if let Some(code) = output.status.code() {
            error = error.with_code(code.to_string());
        }
        return Err(error);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::isolation::MANIFEST_FILE;
    use crate::tools::normalize_to_creators;
    use tempfile::tempdir;

    fn write_manifest(dir: &Path, manifest: Value) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), manifest.to_string()).unwrap();
    }

    fn loader(cwd: &Path) -> ManifestLoader {
        ManifestLoader::new(cwd.to_path_buf(), Vec::new(), ReadCapability::Unrestricted)
    }

    fn first_tool(exports: &ModuleExports) -> Tool {
        let creators = normalize_to_creators(exports, None);
        creators[0].create().unwrap()
    }

    #[tokio::test]
    async fn registry_loads_registered_modules_only() {
        let mut registry = ModuleRegistry::new();
        registry.register("builtin:empty", || ModuleExports::bare(Export::Value(json!({}))));

        assert!(registry.load("builtin:empty").await.is_ok());
        let error = registry.load("builtin:missing").await.unwrap_err();
        assert!(error.to_string().contains("builtin:missing"));
    }

    #[tokio::test]
    async fn manifest_tools_become_creators() {
        let root = tempdir().unwrap();
        write_manifest(
            &root.path().join("docs-extra"),
            json!({
                "name": "docs-extra",
                "tools": [
                    {"name": "first", "description": "First", "command": "true"},
                    {"name": "second", "command": "true", "input_schema": {"type": "object", "required": ["q"]}}
                ]
            }),
        );

        let exports = loader(root.path()).load("./docs-extra").await.unwrap();
        let creators = normalize_to_creators(&exports, None);
        assert_eq!(creators.len(), 2);

        let second = creators[1].create().unwrap();
        assert_eq!(second.name, "second");
        assert_eq!(second.schema.input_schema["required"], json!(["q"]));
        assert_eq!(creators[0].create().unwrap().schema.description, "First");
    }

    #[tokio::test]
    async fn rejects_unsupported_schemes_and_missing_modules() {
        let root = tempdir().unwrap();
        let loader = loader(root.path());

        let error = loader.load("https://example.com/plugin").await.unwrap_err();
        assert!(error.to_string().contains("unsupported module scheme"));

        let error = loader.load("./nowhere").await.unwrap_err();
        assert!(error.to_string().contains("cannot find module './nowhere'"));
    }

    #[tokio::test]
    async fn invalid_manifest_is_a_load_error() {
        let root = tempdir().unwrap();
        let dir = root.path().join("broken");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), "{ not json").unwrap();

        let error = loader(root.path()).load("./broken").await.unwrap_err();
        assert!(matches!(error, CoreError::ModuleLoad(_)));
    }

    #[tokio::test]
    async fn capability_blocks_manifests_outside_allow_list() {
        let allowed = tempdir().unwrap();
        let elsewhere = tempdir().unwrap();
        write_manifest(
            &elsewhere.path().join("p"),
            json!({"name": "p", "tools": []}),
        );

        let loader = ManifestLoader::new(
            allowed.path().to_path_buf(),
            Vec::new(),
            ReadCapability::from_allow_list(vec![allowed.path().to_path_buf()]),
        );
        let spec = elsewhere.path().join("p").display().to_string();
        let error = loader.load(&spec).await.unwrap_err();
        assert!(error.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn composite_prefers_compiled_modules() {
        let root = tempdir().unwrap();
        let mut registry = ModuleRegistry::new();
        registry.register("echo", || {
            ModuleExports::with_default(Export::Array(vec![Export::function(|_| {
                Ok(Export::Tool(Tool::new(
                    "compiled",
                    ToolSchema::new("", json!({})),
                    Arc::new(|args: Value| boxed_tool_future(async move { Ok(args) })),
                )))
            })]))
        });
        write_manifest(
            &root.path().join("echo"),
            json!({"name": "echo", "tools": [{"name": "from-disk", "command": "true"}]}),
        );

        let composite = CompositeLoader::new(registry, loader(root.path()));
        let exports = composite.load("echo").await.unwrap();
        assert_eq!(first_tool(&exports).name, "compiled");
        let exports = composite.load("./echo").await.unwrap();
        assert_eq!(first_tool(&exports).name, "from-disk");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn strict_capability_refuses_to_run_commands() {
        let allowed = tempdir().unwrap();
        let elsewhere = tempdir().unwrap();
        let secret = elsewhere.path().join("secret.txt");
        std::fs::write(&secret, "TOP-SECRET").unwrap();
        write_manifest(
            &allowed.path().join("snoop"),
            json!({
                "name": "snoop",
                "tools": [{"name": "snoop", "command": "cat", "args": [secret.display().to_string()]}]
            }),
        );

        let capability = ReadCapability::from_allow_list(vec![allowed.path().to_path_buf()]);
        assert!(!capability.permits(&secret));
        let loader = ManifestLoader::new(allowed.path().to_path_buf(), Vec::new(), capability);
        let exports = loader.load("./snoop").await.unwrap();

        let error = first_tool(&exports).call(json!({})).await.unwrap_err();
        assert_eq!(error.code.as_deref(), Some("ERR_ACCESS_DENIED"));
        assert!(!error.message.contains("TOP-SECRET"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn large_arguments_do_not_stall_echoing_commands() {
        let root = tempdir().unwrap();
        write_manifest(
            &root.path().join("echo"),
            json!({"name": "echo", "tools": [{"name": "echo", "command": "sh", "args": ["-c", "cat"]}]}),
        );
        let exports = loader(root.path()).load("./echo").await.unwrap();
        let echo = first_tool(&exports);

        let payload = "x".repeat(1024 * 1024);
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            echo.call(json!({"text": payload})),
        )
        .await
        .expect("command should finish")
        .unwrap();
        assert_eq!(result["text"].as_str().map(str::len), Some(1024 * 1024));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_tool_round_trips_json_over_stdio() {
        let root = tempdir().unwrap();
        write_manifest(
            &root.path().join("echo"),
            json!({
                "name": "echo",
                "tools": [
                    {"name": "echo", "command": "sh", "args": ["-c", "cat"]},
                    {"name": "plain", "command": "sh", "args": ["-c", "echo hello"]},
                    {"name": "fail", "command": "sh", "args": ["-c", "echo boom >&2; exit 4"]}
                ]
            }),
        );

        let exports = loader(root.path()).load("./echo").await.unwrap();
        let creators = normalize_to_creators(&exports, None);

        let echo = creators[0].create().unwrap();
        let result = echo.call(json!({"q": "button"})).await.unwrap();
        assert_eq!(result, json!({"q": "button"}));

        let plain = creators[1].create().unwrap();
        assert_eq!(plain.call(Value::Null).await.unwrap(), json!("hello"));

        let fail = creators[2].create().unwrap();
        let error = fail.call(json!({})).await.unwrap_err();
        assert_eq!(error.message, "boom");
        assert_eq!(error.code.as_deref(), Some("4"));
    }
}
