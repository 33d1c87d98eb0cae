//! Built-in documentation tools.
//!
//! Always available, whether or not a plugin host is running. Registered
//! ahead of plugin tools, so a plugin cannot shadow them.

pub mod catalog;
pub mod docs;
pub mod search;

use std::sync::Arc;

use crate::tools::ToolCreator;

pub use catalog::{DocCatalog, DocEntry};

/// Creators for every built-in tool, backed by `catalog`.
pub fn builtin_creators(catalog: Arc<DocCatalog>) -> Vec<ToolCreator> {
    vec![
        docs::list_docs(catalog.clone()),
        docs::get_doc(catalog.clone()),
        docs::search_docs(catalog),
    ]
}
