//! Sandboxed plugin host.
//!
//! Third-party tool modules run in a separate worker process. The supervisor
//! spawns it, drives the handshake over a message channel, exposes remote
//! tools as local proxies and tears the worker down on shutdown.

pub mod channel;
pub mod isolation;
pub mod loader;
pub mod process;
pub mod protocol;
pub mod shutdown;
pub mod supervisor;
pub mod worker;

pub use channel::{ChannelError, ExitInfo, MessageChannel};
pub use isolation::{compute_read_allow_list, IsolationMode, ReadCapability};
pub use loader::{CompositeLoader, ManifestLoader, ModuleLoader, ModuleRegistry};
pub use protocol::ToolDescriptor;
pub use shutdown::{shutdown_host, ShutdownOutcome};
pub use supervisor::{make_proxy_creators, spawn_host, HostConfig, HostHandle, LoadReport};
pub use worker::{connect_and_run, WorkerExit, WorkerRuntime};
