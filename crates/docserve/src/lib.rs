pub mod builtins;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod plugin;
pub mod server;
pub mod tools;

mod utils;

pub use crate::error::{CoreError, CoreResult};
pub use crate::plugin::{
    make_proxy_creators, shutdown_host, spawn_host, HostConfig, HostHandle, IsolationMode,
};
pub use crate::tools::{normalize_to_creators, Tool, ToolCreator, ToolError, ToolRegistry};
