pub mod event;
pub mod handler;
pub mod manager;
pub mod session;
pub mod sse;
pub mod terminal;

pub use event::{StreamEvent, StreamEventKind, ToolCallStatus, ToolStatus};
pub use handler::StreamHandler;
pub use manager::StreamingManager;
pub use session::StreamingSession;
pub use sse::{SseHandler, SseHandlerConfig};
pub use terminal::TerminalHandler;
