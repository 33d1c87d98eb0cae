use std::sync::Arc;

use serde_json::{json, Value};

use crate::tools::{boxed_tool_future, Tool, ToolCreator, ToolError, ToolSchema};

use super::catalog::DocCatalog;

const DEFAULT_SEARCH_LIMIT: usize = 10;
const MAX_SEARCH_LIMIT: usize = 50;

pub fn list_docs(catalog: Arc<DocCatalog>) -> ToolCreator {
    ToolCreator::labeled("list_docs", move || {
        let catalog = catalog.clone();
        Ok(Tool::new(
            "list_docs",
            ToolSchema::new(
                "List every documentation page with its title.",
                json!({"type": "object", "properties": {}}),
            ),
            Arc::new(move |_args: Value| {
                let catalog = catalog.clone();
                boxed_tool_future(async move {
                    serde_json::to_value(catalog.entries())
                        .map_err(|error| ToolError::from_error(&error))
                })
            }),
        ))
    })
}

pub fn get_doc(catalog: Arc<DocCatalog>) -> ToolCreator {
    ToolCreator::labeled("get_doc", move || {
        let catalog = catalog.clone();
        Ok(Tool::new(
            "get_doc",
            ToolSchema::new(
                "Return the markdown content of one documentation page.",
                json!({
                    "type": "object",
                    "required": ["name"],
                    "properties": {
                        "name": {"type": "string"}
                    }
                }),
            ),
            Arc::new(move |args: Value| {
                let catalog = catalog.clone();
                boxed_tool_future(async move {
                    let name = required_str(&args, "name")?;
                    let entry = catalog.find(name).ok_or_else(|| {
                        ToolError::new(format!("document not found: {name}")).with_code("NOT_FOUND")
                    })?;
                    let content = catalog.read(entry)?;
                    Ok(json!({
                        "name": entry.name,
                        "title": entry.title,
                        "content": content.as_str(),
                    }))
                })
            }),
        ))
    })
}

pub fn search_docs(catalog: Arc<DocCatalog>) -> ToolCreator {
    ToolCreator::labeled("search_docs", move || {
        let catalog = catalog.clone();
        Ok(Tool::new(
            "search_docs",
            ToolSchema::new(
                "Fuzzy search documentation pages by name and title.",
                json!({
                    "type": "object",
                    "required": ["query"],
                    "properties": {
                        "query": {"type": "string"},
                        "limit": {"type": "integer", "minimum": 1, "maximum": MAX_SEARCH_LIMIT}
                    }
                }),
            ),
            Arc::new(move |args: Value| {
                let catalog = catalog.clone();
                boxed_tool_future(async move {
                    let query = required_str(&args, "query")?;
                    let limit = args
                        .get("limit")
                        .and_then(Value::as_u64)
                        .map(|limit| (limit as usize).clamp(1, MAX_SEARCH_LIMIT))
                        .unwrap_or(DEFAULT_SEARCH_LIMIT);
                    serde_json::to_value(catalog.search(query, limit))
                        .map_err(|error| ToolError::from_error(&error))
                })
            }),
        ))
    })
}

fn required_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    args.get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            ToolError::new(format!("missing required string argument '{field}'"))
                .with_code("INVALID_ARGS")
        })
}
