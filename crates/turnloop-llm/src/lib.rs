pub mod client;
pub mod http_status;
pub mod response_parse;
pub mod tool_call_builder;
pub mod trace;
pub mod types;
pub mod watchdog;

pub use client::LlmClient;
pub use trace::TraceSink;
pub use types::{LlmResponse, LlmStreamEvent, LlmUsage, ToolCallDelta};
