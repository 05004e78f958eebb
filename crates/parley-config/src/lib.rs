pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AppConfig, DatabaseConfig, GatewayConfig, LlmProviderConfig, McpServerConfig, PipelineConfig,
    RateLimitConfig, ToolsConfig,
};
