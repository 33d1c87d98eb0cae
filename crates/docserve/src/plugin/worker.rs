//! Plugin worker runtime.
//!
//! Runs inside the spawned worker process. Owns the worker-side tool registry
//! and answers supervisor requests read from the channel, one JSON object per
//! line. Invocations run concurrently in their own tasks, each racing the
//! per-invocation timeout.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::tools::{normalize_to_creators, Tool, ToolCreator, ToolError};
use crate::utils::panic_message;

use super::loader::ModuleLoader;
use super::protocol::{
    InvokeResult, LoadAck, ManifestResult, ToolDescriptor, WorkerRequest, WorkerResponse,
    SENTINEL_ID,
};

pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Why the runtime loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// A `shutdown` request was acknowledged.
    Shutdown,
    /// The channel reached EOF or failed.
    Disconnected,
}

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

#[derive(Clone)]
struct Outbox {
    writer: SharedWriter,
}

impl Outbox {
    fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    async fn send(&self, response: &WorkerResponse) {
        let mut line = match serde_json::to_string(response) {
            Ok(line) => line,
            Err(error) => {
                tracing::debug!("failed to serialize worker response: {}", error);
                return;
            }
        };
        line.push('\n');
        let mut writer = self.writer.lock().await;
        if let Err(error) = writer.write_all(line.as_bytes()).await {
            tracing::debug!("failed to write worker response: {}", error);
            return;
        }
        if let Err(error) = writer.flush().await {
            tracing::debug!("failed to flush worker response: {}", error);
        }
    }
}

/// The single reply owed to one `invoke` request.
struct Reply {
    id: String,
    outbox: Outbox,
}

impl Reply {
    fn new(id: String, outbox: Outbox) -> Self {
        Self { id, outbox }
    }

    async fn finish(self, outcome: Result<Value, ToolError>) {
        let result = match outcome {
            Ok(value) => InvokeResult::success(self.id, value),
            Err(error) => InvokeResult::failure(self.id, error.into()),
        };
        self.outbox
            .send(&WorkerResponse::InvokeResult(result))
            .await;
    }
}

/// Worker-side state: realized tools and their descriptors.
pub struct WorkerRuntime {
    loader: Arc<dyn ModuleLoader>,
    tools: HashMap<String, Tool>,
    descriptors: Vec<ToolDescriptor>,
    invoke_timeout: Duration,
    next_tool: u64,
}

impl WorkerRuntime {
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            loader,
            tools: HashMap::new(),
            descriptors: Vec::new(),
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
            next_tool: 1,
        }
    }

    /// Loads every specifier and registers the tools it yields.
    ///
    /// Returns `(warnings, errors)`. Import failures are errors, individual
    /// creator failures are warnings; neither stops the remaining specifiers.
    pub async fn load(
        &mut self,
        specs: &[String],
        invoke_timeout_ms: Option<u64>,
        options: Option<&Value>,
    ) -> (Vec<String>, Vec<String>) {
        if let Some(ms) = invoke_timeout_ms {
            self.invoke_timeout = Duration::from_millis(ms);
        }

        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        for spec in specs {
            let exports = match self.loader.load(spec).await {
                Ok(exports) => exports,
                Err(error) => {
                    errors.push(format!("failed to load {spec}: {error}"));
                    continue;
                }
            };
            let creators = normalize_to_creators(&exports, options);
            if creators.is_empty() {
                tracing::debug!("module {} exports no tools", spec);
                continue;
            }
            for creator in creators {
                match realize(&creator) {
                    Ok(tool) => self.register(tool, spec),
                    Err(reason) => warnings.push(format!(
                        "failed to create tool{} from {spec}: {reason}",
                        creator
                            .label()
                            .map(|label| format!(" '{label}'"))
                            .unwrap_or_default()
                    )),
                }
            }
        }
        (warnings, errors)
    }

    fn register(&mut self, tool: Tool, source: &str) {
        let id = format!("tool-{}", self.next_tool);
        self.next_tool += 1;
        self.descriptors.push(ToolDescriptor {
            id: id.clone(),
            name: tool.name.clone(),
            description: tool.schema.description.clone(),
            input_schema: tool.schema.input_schema.clone(),
            source: source.to_string(),
        });
        tracing::debug!(tool_id = %id, name = %tool.name, "registered plugin tool");
        self.tools.insert(id, tool);
    }

    /// Serves requests until shutdown or disconnect.
    pub async fn run<R, W>(mut self, reader: R, writer: W) -> WorkerExit
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let outbox = Outbox::new(writer);
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return WorkerExit::Disconnected,
                Err(error) => {
                    tracing::debug!("worker channel read failed: {}", error);
                    return WorkerExit::Disconnected;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let request = match serde_json::from_str::<WorkerRequest>(&line) {
                Ok(request) => request,
                Err(error) => {
                    let reply = Reply::new(request_id(&line), outbox.clone());
                    reply
                        .finish(Err(ToolError::new(format!("invalid request: {error}"))))
                        .await;
                    continue;
                }
            };

            match request {
                WorkerRequest::Hello { id } => {
                    outbox.send(&WorkerResponse::HelloAck { id }).await;
                }
                WorkerRequest::Load {
                    id,
                    specs,
                    invoke_timeout_ms,
                    options,
                } => {
                    let (warnings, errors) =
                        self.load(&specs, invoke_timeout_ms, options.as_ref()).await;
                    outbox
                        .send(&WorkerResponse::LoadAck(LoadAck {
                            id,
                            warnings,
                            errors,
                        }))
                        .await;
                }
                WorkerRequest::ManifestGet { id } => {
                    outbox
                        .send(&WorkerResponse::ManifestResult(ManifestResult {
                            id,
                            tools: self.descriptors.clone(),
                        }))
                        .await;
                }
                WorkerRequest::Invoke { id, tool_id, args } => {
                    self.dispatch_invoke(Reply::new(id, outbox.clone()), &tool_id, args)
                        .await;
                }
                WorkerRequest::Shutdown { id } => {
                    outbox.send(&WorkerResponse::ShutdownAck { id }).await;
                    return WorkerExit::Shutdown;
                }
            }
        }
    }

    async fn dispatch_invoke(&self, reply: Reply, tool_id: &str, args: Value) {
        let Some(tool) = self.tools.get(tool_id).cloned() else {
            reply.finish(Err(ToolError::new("Unknown toolId"))).await;
            return;
        };
        let timeout = self.invoke_timeout;
        tokio::spawn(async move {
            let handler = tokio::spawn(async move { tool.call(args).await });
            let outcome = tokio::select! {
                joined = handler => match joined {
                    Ok(result) => result,
                    Err(error) if error.is_panic() => Err(ToolError::new(format!(
                        "tool panicked: {}",
                        panic_message(error.into_panic().as_ref())
                    ))),
                    Err(error) => Err(ToolError::new(error.to_string())),
                },
                _ = tokio::time::sleep(timeout) => Err(ToolError::new("invoke timeout")),
            };
            reply.finish(outcome).await;
        });
    }
}

fn realize(creator: &ToolCreator) -> Result<Tool, String> {
    match catch_unwind(AssertUnwindSafe(|| creator.create())) {
        Ok(Ok(tool)) if tool.name.trim().is_empty() => Err("tool has an empty name".to_string()),
        Ok(Ok(tool)) => Ok(tool),
        Ok(Err(error)) => Err(error.message),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

/// Id of a request that failed to parse, or the sentinel.
fn request_id(line: &str) -> String {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|value| value.get("id").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| SENTINEL_ID.to_string())
}

/// Connects to the supervisor, authenticates with `token` and runs `runtime`.
pub async fn connect_and_run(
    address: &str,
    token: &str,
    runtime: WorkerRuntime,
) -> CoreResult<WorkerExit> {
    let stream = TcpStream::connect(address).await.map_err(|error| {
        CoreError::Spawn(format!("failed to connect to supervisor at {address}: {error}"))
    })?;
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(format!("{token}\n").as_bytes()).await?;
    writer.flush().await?;
    Ok(runtime.run(reader, writer).await)
}
