use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parley_common::{Error, Result};
use rmcp::service::{Peer, RoleClient};
use tracing::warn;

use crate::tools::{Tool, ToolContext, ToolOutput};
use crate::toolset::NAMESPACE_SEPARATOR;

/// Adapts one discovered MCP tool to the local [`Tool`] trait. The exposed
/// name carries the `server__tool` namespace.
pub struct McpTool {
    name: String,
    remote_name: String,
    description: String,
    input_schema: serde_json::Value,
    peer: Arc<Peer<RoleClient>>,
    timeout: Duration,
}

impl McpTool {
    pub fn new(
        server_name: &str,
        remote_name: String,
        description: Option<String>,
        input_schema: serde_json::Value,
        peer: Arc<Peer<RoleClient>>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: format!("{server_name}{NAMESPACE_SEPARATOR}{remote_name}"),
            remote_name,
            description: description.unwrap_or_default(),
            input_schema,
            peer,
            timeout,
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        self.input_schema.clone()
    }

    async fn execute(&self, _context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let arguments = match args {
            serde_json::Value::Object(map) => Some(map),
            serde_json::Value::Null => None,
            other => {
                return Ok(ToolOutput::error(format!(
                    "tool arguments must be an object, got {other}"
                )));
            }
        };

        let params = rmcp::model::CallToolRequestParams {
            meta: None,
            name: self.remote_name.clone().into(),
            arguments,
            task: None,
        };

        let result = tokio::time::timeout(self.timeout, self.peer.call_tool(params))
            .await
            .map_err(|_| {
                Error::Mcp(format!(
                    "tool '{}' timed out after {:?}",
                    self.name, self.timeout
                ))
            })?
            .map_err(|e| Error::Mcp(format!("tool '{}' failed: {e}", self.name)))?;

        let text: Vec<String> = result
            .content
            .into_iter()
            .filter_map(|c| c.as_text().map(|t| t.text.clone()))
            .collect();

        if text.is_empty() {
            warn!("tool '{}' returned no text content", self.name);
        }

        if result.is_error.unwrap_or(false) {
            Ok(ToolOutput::error(text.join("\n")))
        } else {
            Ok(ToolOutput::ok(text.join("\n")))
        }
    }
}
