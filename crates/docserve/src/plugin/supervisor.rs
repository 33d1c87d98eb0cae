use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::process::Command;

use crate::error::{CoreError, CoreResult};
use crate::tools::{boxed_tool_future, Tool, ToolCreator, ToolError, ToolSchema};

use super::channel::MessageChannel;
use super::isolation::{allow_list_args, compute_read_allow_list, IsolationMode};
use super::process::ProcessMonitor;
use super::protocol::{matchers, new_correlation_id, ToolDescriptor, WorkerRequest};
use super::worker::DEFAULT_INVOKE_TIMEOUT;

pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);
/// A connection that sends no token within this window is dropped.
const TOKEN_READ_TIMEOUT: Duration = Duration::from_secs(1);
/// Extra wait on top of the worker's own invoke timeout, so the worker's
/// "invoke timeout" reply arrives before the proxy gives up.
const PROXY_TIMEOUT_MARGIN: Duration = Duration::from_millis(500);

pub const WORKER_BINARY_NAME: &str = "docserve-plugin-worker";
/// Overrides the worker binary location.
pub const WORKER_PATH_ENV: &str = "DOCSERVE_WORKER_PATH";
/// Carries the channel token to the worker.
pub const CHANNEL_TOKEN_ENV: &str = "DOCSERVE_CHANNEL_TOKEN";

/// Settings the plugin host needs from the server configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub worker_path: Option<PathBuf>,
    /// Working directory of the worker and base for relative specifiers.
    pub cwd: PathBuf,
    pub plugin_dirs: Vec<PathBuf>,
    pub load_timeout: Duration,
    pub invoke_timeout: Duration,
    pub grace_period: Duration,
    /// Passed to every module factory.
    pub plugin_options: Option<Value>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            worker_path: None,
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            plugin_dirs: Vec::new(),
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            plugin_options: None,
        }
    }
}

/// Warnings and errors reported by the worker's `load:ack`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// A live worker after a successful handshake.
pub struct HostHandle {
    channel: Arc<MessageChannel>,
    process: ProcessMonitor,
    tools: Vec<ToolDescriptor>,
    load_report: LoadReport,
    invoke_timeout: Duration,
}

impl HostHandle {
    pub(crate) fn from_parts(
        channel: Arc<MessageChannel>,
        process: ProcessMonitor,
        tools: Vec<ToolDescriptor>,
        load_report: LoadReport,
        invoke_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            process,
            tools,
            load_report,
            invoke_timeout,
        }
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn load_report(&self) -> &LoadReport {
        &self.load_report
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn has_exited(&self) -> bool {
        self.process.has_exited()
    }

    pub(crate) fn channel(&self) -> &Arc<MessageChannel> {
        &self.channel
    }

    pub(crate) fn process(&self) -> &ProcessMonitor {
        &self.process
    }
}

impl std::fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHandle")
            .field("pid", &self.process.pid())
            .field("tools", &self.tools.len())
            .field("load_report", &self.load_report)
            .finish_non_exhaustive()
    }
}

/// Spawns the plugin worker and runs the hello → load → manifest handshake.
///
/// Any failure kills the worker and is returned as a single error.
pub async fn spawn_host(
    specs: &[String],
    isolation: IsolationMode,
    config: &HostConfig,
) -> CoreResult<HostHandle> {
    let worker_path = resolve_worker_binary(config.worker_path.as_deref());
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let address = listener.local_addr()?;
    let token = new_correlation_id();

    let mut command = Command::new(&worker_path);
    if isolation == IsolationMode::Strict {
        let allowed = compute_read_allow_list(specs, &config.cwd, &config.plugin_dirs);
        tracing::debug!(?allowed, "plugin worker read allow-list");
        command.args(allow_list_args(&allowed));
    }
    for dir in &config.plugin_dirs {
        command.arg("--plugin-dir").arg(dir);
    }
    command
        .arg("--channel")
        .arg(address.to_string())
        .env(CHANNEL_TOKEN_ENV, &token)
        .current_dir(&config.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|error| {
        CoreError::Spawn(format!("{}: {error}", worker_path.display()))
    })?;
    let process = ProcessMonitor::start(child);
    tracing::debug!(pid = ?process.pid(), %isolation, "spawned plugin worker");

    let (reader, writer) = tokio::select! {
        accepted = accept_worker(&listener, &token, address) => accepted?,
        info = process.exited() => {
            return Err(CoreError::Spawn(format!("worker exited before connecting ({info})")));
        }
        _ = tokio::time::sleep(config.load_timeout) => {
            process.kill();
            return Err(CoreError::Spawn(format!(
                "worker did not connect within {}ms",
                config.load_timeout.as_millis()
            )));
        }
    };
    drop(listener);

    let channel = Arc::new(MessageChannel::spawn(reader, writer));
    let exited = process.exited();
    let exit_channel = channel.clone();
    tokio::spawn(async move {
        let info = exited.await;
        exit_channel.notify_exit(info);
    });

    match handshake(&channel, specs, config).await {
        Ok((tools, load_report)) => Ok(HostHandle::from_parts(
            channel,
            process,
            tools,
            load_report,
            config.invoke_timeout,
        )),
        Err(error) => {
            process.kill();
            Err(error)
        }
    }
}

/// Accepts connections until one presents the expected token.
async fn accept_worker(
    listener: &TcpListener,
    token: &str,
    address: SocketAddr,
) -> CoreResult<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        match tokio::time::timeout(TOKEN_READ_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                tracing::warn!(%peer, "failed to read channel token: {}", error);
                continue;
            }
            Err(_) => {
                tracing::warn!(%peer, "connection sent no channel token in time");
                continue;
            }
        }
        if line.trim_end() == token {
            tracing::debug!(%peer, %address, "plugin worker connected");
            return Ok((reader, writer));
        }
        tracing::warn!(%peer, "rejected connection with invalid channel token");
    }
}

async fn handshake(
    channel: &MessageChannel,
    specs: &[String],
    config: &HostConfig,
) -> CoreResult<(Vec<ToolDescriptor>, LoadReport)> {
    let timeout = config.load_timeout;

    channel
        .request(
            &WorkerRequest::Hello {
                id: new_correlation_id(),
            },
            matchers::hello_ack(),
            timeout,
        )
        .await
        .map_err(|source| CoreError::Handshake {
            stage: "hello",
            source,
        })?;

    let load_id = new_correlation_id();
    let ack = channel
        .request(
            &WorkerRequest::Load {
                id: load_id.clone(),
                specs: specs.to_vec(),
                invoke_timeout_ms: Some(
                    u64::try_from(config.invoke_timeout.as_millis()).unwrap_or(u64::MAX),
                ),
                options: config.plugin_options.clone(),
            },
            matchers::load_ack(&load_id),
            timeout,
        )
        .await
        .map_err(|source| CoreError::Handshake {
            stage: "load",
            source,
        })?;
    for warning in &ack.warnings {
        tracing::warn!("plugin load warning: {}", warning);
    }
    for error in &ack.errors {
        tracing::error!("plugin load error: {}", error);
    }

    let manifest_id = new_correlation_id();
    let manifest = channel
        .request(
            &WorkerRequest::ManifestGet {
                id: manifest_id.clone(),
            },
            matchers::manifest_result(&manifest_id),
            timeout,
        )
        .await
        .map_err(|source| CoreError::Handshake {
            stage: "manifest",
            source,
        })?;
    tracing::info!(tools = manifest.tools.len(), "plugin host ready");

    Ok((
        manifest.tools,
        LoadReport {
            warnings: ack.warnings,
            errors: ack.errors,
        },
    ))
}

/// One creator per remote tool. Each call is forwarded to the worker.
pub fn make_proxy_creators(handle: &HostHandle) -> Vec<ToolCreator> {
    proxy_creators(&handle.channel, &handle.tools, proxy_timeout(handle.invoke_timeout))
}

fn proxy_timeout(invoke_timeout: Duration) -> Duration {
    invoke_timeout.saturating_add(PROXY_TIMEOUT_MARGIN)
}

fn proxy_creators(
    channel: &Arc<MessageChannel>,
    descriptors: &[ToolDescriptor],
    timeout: Duration,
) -> Vec<ToolCreator> {
    descriptors
        .iter()
        .cloned()
        .map(|descriptor| {
            let channel = channel.clone();
            ToolCreator::labeled(descriptor.name.clone(), move || {
                Ok(proxy_tool(channel.clone(), &descriptor, timeout))
            })
        })
        .collect()
}

fn proxy_tool(channel: Arc<MessageChannel>, descriptor: &ToolDescriptor, timeout: Duration) -> Tool {
    let tool_id = descriptor.id.clone();
    let handler = Arc::new(move |args: Value| {
        let channel = channel.clone();
        let tool_id = tool_id.clone();
        boxed_tool_future(async move {
            let id = new_correlation_id();
            let request = WorkerRequest::Invoke {
                id: id.clone(),
                tool_id,
                args,
            };
            let result = channel
                .request(&request, matchers::invoke_result(&id), timeout)
                .await
                .map_err(|error| ToolError::from_error(&error))?;
            result.into_outcome()
        })
    });
    Tool::new(
        descriptor.name.clone(),
        ToolSchema::new(descriptor.description.clone(), descriptor.input_schema.clone()),
        handler,
    )
}

/// Locates the worker executable.
///
/// Order: `DOCSERVE_WORKER_PATH`, the configured path, a sibling of the
/// current executable, then the bare name for `PATH` lookup.
pub fn resolve_worker_binary(configured: Option<&Path>) -> PathBuf {
    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Some(path) = configured {
        return path.to_path_buf();
    }

    let file_name = format!("{WORKER_BINARY_NAME}{}", std::env::consts::EXE_SUFFIX);
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join(&file_name);
            if sibling.exists() {
                return sibling;
            }
            // test harnesses run from target/<profile>/deps
            if let Some(profile_dir) = dir.parent() {
                let candidate = profile_dir.join(&file_name);
                if candidate.exists() {
                    return candidate;
                }
            }
        }
    }
    PathBuf::from(file_name)
}
