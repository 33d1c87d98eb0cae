use crate::plugin::{make_proxy_creators, spawn_host, HostConfig, HostHandle, IsolationMode};

use super::registry::ToolRegistry;
use super::tool::ToolCreator;

/// Tools ready to serve plus the plugin host backing the remote ones.
#[derive(Debug)]
pub struct ComposedTools {
    pub registry: ToolRegistry,
    pub host: Option<HostHandle>,
}

/// Merges built-in creators with proxies for plugin tools.
///
/// Built-ins are registered first and win name collisions. When the plugin
/// host fails to start, only the built-ins are served.
pub async fn compose_tools(
    builtins: Vec<ToolCreator>,
    specs: &[String],
    isolation: IsolationMode,
    config: &HostConfig,
) -> ComposedTools {
    let mut creators = builtins;
    let host = if specs.is_empty() {
        None
    } else {
        match spawn_host(specs, isolation, config).await {
            Ok(handle) => {
                creators.extend(make_proxy_creators(&handle));
                Some(handle)
            }
            Err(error) => {
                tracing::warn!("plugin host unavailable, serving built-in tools only: {}", error);
                None
            }
        }
    };

    let registry = ToolRegistry::from_creators(creators);
    tracing::info!(tools = registry.len(), plugins = host.is_some(), "tools composed");
    ComposedTools { registry, host }
}
