pub mod dispatcher;
pub mod profiles;
pub mod tools;

pub use dispatcher::*;
pub use tools::{ToolDefinition, ToolOutput};
