//! Name-keyed registry of realized tools.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::utils::panic_message;

use super::tool::{Tool, ToolCreator};

/// Registry of realized tools, in registration order.
///
/// Names are unique: the first tool registered under a name wins.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Realizes each creator exactly once and registers the result.
    pub fn from_creators<I>(creators: I) -> Self
    where
        I: IntoIterator<Item = ToolCreator>,
    {
        let mut registry = Self::new();
        for creator in creators {
            registry.register_creator(&creator);
        }
        registry
    }

    /// Realizes `creator` and registers the tool. Returns whether a tool was added.
    pub fn register_creator(&mut self, creator: &ToolCreator) -> bool {
        let label = creator.label().unwrap_or("<unnamed>").to_string();
        match catch_unwind(AssertUnwindSafe(|| creator.create())) {
            Ok(Ok(tool)) => self.register(tool),
            Ok(Err(error)) => {
                tracing::warn!(creator = %label, "failed to create tool: {}", error);
                false
            }
            Err(payload) => {
                tracing::warn!(
                    creator = %label,
                    "tool creator panicked: {}",
                    panic_message(payload.as_ref())
                );
                false
            }
        }
    }

    pub fn register(&mut self, tool: Tool) -> bool {
        if tool.name.trim().is_empty() {
            tracing::warn!("skipping tool with an empty name");
            return false;
        }
        if self.tools.contains_key(&tool.name) {
            tracing::warn!(tool = %tool.name, "duplicate tool name, keeping the first registration");
            return false;
        }
        self.order.push(tool.name.clone());
        self.tools.insert(tool.name.clone(), tool);
        true
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn tools(&self) -> impl Iterator<Item = &Tool> {
        self.order.iter().filter_map(|name| self.tools.get(name))
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{boxed_tool_future, ToolError, ToolSchema};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn named(name: &str, reply: &'static str) -> Tool {
        Tool::new(
            name,
            ToolSchema::new("", json!({})),
            Arc::new(move |_: serde_json::Value| boxed_tool_future(async move { Ok(json!(reply)) })),
        )
    }

    #[test]
    fn realizes_each_creator_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let creator = ToolCreator::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(named("count", "x"))
        });

        let registry = ToolRegistry::from_creators(vec![creator]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.names(), vec!["count"]);
    }

    #[tokio::test]
    async fn duplicate_names_keep_first_registration() {
        let registry = ToolRegistry::from_creators(vec![
            ToolCreator::from_tool(named("search_docs", "builtin")),
            ToolCreator::from_tool(named("search_docs", "plugin")),
            ToolCreator::from_tool(named("extra", "plugin")),
        ]);

        assert_eq!(registry.len(), 2);
        let tool = registry.get("search_docs").unwrap();
        assert_eq!(tool.call(json!({})).await.unwrap(), json!("builtin"));
        assert_eq!(registry.names(), vec!["search_docs", "extra"]);
    }

    #[test]
    fn failing_and_panicking_creators_are_skipped() {
        let registry = ToolRegistry::from_creators(vec![
            ToolCreator::labeled("broken", || Err(ToolError::new("nope"))),
            ToolCreator::labeled("explosive", || panic!("creator exploded")),
            ToolCreator::from_tool(named("", "blank")),
            ToolCreator::from_tool(named("ok", "fine")),
        ]);
        assert_eq!(registry.names(), vec!["ok"]);
        assert!(!registry.is_empty());
    }
}
