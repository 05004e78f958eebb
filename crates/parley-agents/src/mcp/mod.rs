mod bridge;
mod manager;

pub use bridge::McpTool;
pub use manager::{McpManager, McpToolInfo};
