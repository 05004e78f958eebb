use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parley_common::{Error, Result};
use rmcp::ServiceExt;
use rmcp::service::{Peer, RoleClient, RunningService};
use rmcp::transport::TokioChildProcess;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::bridge::McpTool;
use crate::tools::Tool;

/// Cached info about a tool discovered from an MCP server.
#[derive(Debug, Clone)]
pub struct McpToolInfo {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// A live connection to one MCP server.
struct McpConnection {
    server_name: String,
    service: RunningService<RoleClient, ()>,
    tools: Vec<McpToolInfo>,
}

/// Manages the lifecycle of MCP server connections and exposes their tools
/// as namespaced [`Tool`] objects.
pub struct McpManager {
    connections: Arc<RwLock<HashMap<String, McpConnection>>>,
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new()
    }
}

impl McpManager {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Connect to an MCP server by spawning a child process and running the
    /// handshake, then discover its tools.
    pub async fn connect(
        &self,
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        timeout_secs: u64,
    ) -> Result<()> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let transport = TokioChildProcess::new(cmd)
            .map_err(|e| Error::Mcp(format!("failed to spawn MCP server '{name}': {e}")))?;

        let service = tokio::time::timeout(Duration::from_secs(timeout_secs), ().serve(transport))
            .await
            .map_err(|_| {
                Error::Mcp(format!(
                    "MCP server '{name}' handshake timed out after {timeout_secs}s"
                ))
            })?
            .map_err(|e| Error::Mcp(format!("MCP server '{name}' handshake failed: {e}")))?;

        let mcp_tools = service
            .list_all_tools()
            .await
            .map_err(|e| Error::Mcp(format!("failed to list tools from '{name}': {e}")))?;

        let tools: Vec<McpToolInfo> = mcp_tools
            .into_iter()
            .map(|t| McpToolInfo {
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()),
                input_schema: serde_json::to_value(&*t.input_schema).unwrap_or_default(),
            })
            .collect();

        info!(
            "MCP server '{name}' connected: {} tool(s) discovered",
            tools.len()
        );
        for tool in &tools {
            info!("  -> {name}.{}", tool.name);
        }

        self.connections.write().await.insert(
            name.to_string(),
            McpConnection {
                server_name: name.to_string(),
                service,
                tools,
            },
        );
        Ok(())
    }

    /// Disconnect all MCP servers.
    pub async fn disconnect_all(&self) {
        let conns: HashMap<String, McpConnection> =
            std::mem::take(&mut *self.connections.write().await);
        for (name, conn) in conns {
            info!("disconnecting MCP server '{name}'");
            if let Err(e) = conn.service.cancel().await {
                warn!("error cancelling MCP server '{name}': {e}");
            }
        }
    }

    /// Build `Tool` objects for every tool on every connected server, each
    /// named `server__tool`. The tools share the server's peer handle.
    pub async fn discovered_tools(&self, timeout: Duration) -> Vec<Arc<dyn Tool>> {
        let conns = self.connections.read().await;
        let mut tools: Vec<Arc<dyn Tool>> = Vec::new();

        for conn in conns.values() {
            let peer: Arc<Peer<RoleClient>> = Arc::new(conn.service.peer().clone());
            for info in &conn.tools {
                tools.push(Arc::new(McpTool::new(
                    &conn.server_name,
                    info.name.clone(),
                    info.description.clone(),
                    info.input_schema.clone(),
                    Arc::clone(&peer),
                    timeout,
                )));
            }
        }
        tools
    }

    /// List all connected servers with their tool counts and liveness.
    pub async fn list_servers(&self) -> Vec<(String, usize, bool)> {
        let conns = self.connections.read().await;
        conns
            .iter()
            .map(|(name, conn)| (name.clone(), conn.tools.len(), !conn.service.is_closed()))
            .collect()
    }
}
