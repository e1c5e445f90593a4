pub mod config;
pub mod context;
pub mod error;
pub mod stream;
pub mod tool;

pub use context::{AgentContext, AgentResult};
pub use error::{Error, Result};
pub use tool::{Message, Role, ToolCall, ToolDefinition};
