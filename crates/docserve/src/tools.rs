//! Tools: realized tools, deferred creators, export normalization and the
//! registry the server dispatches from.

pub mod compose;
pub mod normalize;
pub mod registry;
pub mod tool;

pub use compose::{compose_tools, ComposedTools};
pub use normalize::{
    classify_export, normalize_to_creators, normalize_to_creators_strict, Export, ExportFn,
    ExportShape, ModuleExports,
};
pub use registry::ToolRegistry;
pub use tool::{boxed_tool_future, Tool, ToolCreator, ToolError, ToolFuture, ToolHandler, ToolSchema};
