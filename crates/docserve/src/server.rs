use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use crate::error::CoreResult;
use crate::tools::ToolRegistry;

pub mod error;

use error::ApiError;

/// HTTP surface serving the registered tools.
pub struct Server {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Server {
    pub async fn start(bind: SocketAddr, tools: Arc<ToolRegistry>) -> CoreResult<Self> {
        let state = Arc::new(ServerState { tools });
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        let app = Router::new()
            .route("/health", get(health))
            .route("/tools", get(list_tools))
            .route("/tools/:name/invoke", post(invoke_tool))
            .with_state(state)
            .layer(cors);
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                tracing::error!("http server failed: {}", error);
            }
        });
        tracing::info!(%addr, "serving tools");

        Ok(Server {
            addr,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting requests and waits for in-flight ones to finish.
    pub async fn shutdown(&mut self) {
        if let Some(sender) = self.shutdown.take() {
            let _ = sender.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(sender) = self.shutdown.take() {
            let _ = sender.send(());
        }
    }
}

struct ServerState {
    tools: Arc<ToolRegistry>,
}

async fn health() -> &'static str {
    "ok"
}

async fn list_tools(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let tools: Vec<Value> = state
        .tools
        .tools()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.schema.description,
                "inputSchema": tool.schema.input_schema,
            })
        })
        .collect();
    Json(json!({ "tools": tools }))
}

async fn invoke_tool(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let tool = state
        .tools
        .get(&name)
        .cloned()
        .ok_or_else(|| ApiError::unknown_tool(&name))?;
    let args = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(&body).map_err(ApiError::invalid_arguments)?
    };

    tracing::debug!(tool = %name, "invoking tool");
    let result = tool.call(args).await.map_err(|error| {
        tracing::warn!(tool = %name, "tool call failed: {}", error);
        ApiError::from(error)
    })?;
    Ok(Json(json!({ "ok": true, "result": result })))
}
