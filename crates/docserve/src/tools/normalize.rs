//! Classification of plugin module exports into tool creators.
//!
//! A loaded module exposes a default export and the module object itself.
//! Each candidate is classified into one of three shapes:
//!
//! - a factory that returns a realized [`Tool`] when called once with the
//!   optional options value;
//! - a factory that returns a list of callables, or a bare list of callables,
//!   each of which is treated as a [`ToolCreator`];
//! - anything else, which contributes nothing.
//!
//! Factories are called at most once per normalization.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::utils::panic_message;

use super::tool::{Tool, ToolCreator, ToolError};

/// A callable export. Receives the optional options value.
pub type ExportFn = Arc<dyn Fn(Option<&Value>) -> Result<Export, ToolError> + Send + Sync>;

/// One exported value of a plugin module.
#[derive(Clone)]
pub enum Export {
    Function(ExportFn),
    Array(Vec<Export>),
    Tool(Tool),
    Value(Value),
}

impl Export {
    pub fn function<F>(factory: F) -> Self
    where
        F: Fn(Option<&Value>) -> Result<Export, ToolError> + Send + Sync + 'static,
    {
        Export::Function(Arc::new(factory))
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Export::Function(_))
    }
}

impl std::fmt::Debug for Export {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Export::Function(_) => formatter.write_str("Function"),
            Export::Array(items) => formatter.debug_tuple("Array").field(items).finish(),
            Export::Tool(tool) => formatter.debug_tuple("Tool").field(&tool.name).finish(),
            Export::Value(value) => formatter.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// The export surface of one loaded module.
#[derive(Debug, Clone)]
pub struct ModuleExports {
    pub default: Option<Export>,
    pub module: Export,
}

impl ModuleExports {
    /// Module whose only meaningful export is its default export.
    pub fn with_default(export: Export) -> Self {
        Self {
            default: Some(export),
            module: Export::Value(Value::Object(Default::default())),
        }
    }

    /// Module without a default export; the module object itself is the candidate.
    pub fn bare(module: Export) -> Self {
        Self {
            default: None,
            module,
        }
    }

    fn candidates(&self) -> impl Iterator<Item = &Export> {
        self.default.iter().chain(std::iter::once(&self.module))
    }
}

/// Result of classifying a single export candidate.
pub enum ExportShape {
    RealizedTool(Tool),
    CreatorList(Vec<ToolCreator>),
    Unrecognized,
}

impl std::fmt::Debug for ExportShape {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportShape::RealizedTool(tool) => {
                formatter.debug_tuple("RealizedTool").field(&tool.name).finish()
            }
            ExportShape::CreatorList(creators) => {
                formatter.debug_tuple("CreatorList").field(&creators.len()).finish()
            }
            ExportShape::Unrecognized => formatter.write_str("Unrecognized"),
        }
    }
}

/// Classifies one candidate. Calls a function candidate exactly once.
pub fn classify_export(export: &Export, options: Option<&Value>) -> ExportShape {
    match export {
        Export::Function(factory) => match call_factory(factory, options) {
            Some(Export::Tool(tool)) => ExportShape::RealizedTool(tool),
            Some(Export::Array(items)) if items.iter().all(Export::is_callable) => {
                ExportShape::CreatorList(creators_from(&items))
            }
            _ => ExportShape::Unrecognized,
        },
        Export::Array(items) if items.iter().all(Export::is_callable) => {
            ExportShape::CreatorList(creators_from(items))
        }
        _ => ExportShape::Unrecognized,
    }
}

/// Extracts tool creators from a module. Returns an empty list when no
/// candidate has a recognizable shape.
pub fn normalize_to_creators(exports: &ModuleExports, options: Option<&Value>) -> Vec<ToolCreator> {
    let mut called: Vec<&ExportFn> = Vec::new();
    for candidate in exports.candidates() {
        if let Export::Function(factory) = candidate {
            if called.iter().any(|seen| Arc::ptr_eq(*seen, factory)) {
                continue;
            }
            called.push(factory);
        }
        match classify_export(candidate, options) {
            ExportShape::RealizedTool(tool) => return vec![ToolCreator::from_tool(tool)],
            ExportShape::CreatorList(creators) if !creators.is_empty() => return creators,
            _ => {}
        }
    }
    Vec::new()
}

/// Like [`normalize_to_creators`], but an empty result is an error.
pub fn normalize_to_creators_strict(
    exports: &ModuleExports,
    options: Option<&Value>,
) -> CoreResult<Vec<ToolCreator>> {
    let creators = normalize_to_creators(exports, options);
    if creators.is_empty() {
        return Err(CoreError::InvalidInput(
            "module exports no recognizable tools".to_string(),
        ));
    }
    Ok(creators)
}

fn call_factory(factory: &ExportFn, options: Option<&Value>) -> Option<Export> {
    match catch_unwind(AssertUnwindSafe(|| factory(options))) {
        Ok(Ok(export)) => Some(export),
        Ok(Err(error)) => {
            tracing::debug!("export factory failed: {}", error);
            None
        }
        Err(payload) => {
            tracing::debug!("export factory panicked: {}", panic_message(payload.as_ref()));
            None
        }
    }
}

fn creators_from(items: &[Export]) -> Vec<ToolCreator> {
    items
        .iter()
        .filter_map(|item| match item {
            Export::Function(factory) => Some(creator_from_callable(factory.clone())),
            _ => None,
        })
        .collect()
}

fn creator_from_callable(factory: ExportFn) -> ToolCreator {
    ToolCreator::new(move || match catch_unwind(AssertUnwindSafe(|| factory(None))) {
        Ok(Ok(Export::Tool(tool))) => Ok(tool),
        Ok(Ok(other)) => Err(ToolError::new(format!(
            "creator returned {other:?} instead of a tool"
        ))),
        Ok(Err(error)) => Err(error),
        Err(payload) => Err(ToolError::new(format!(
            "creator panicked: {}",
            panic_message(payload.as_ref())
        ))),
    })
}
