use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::providers::ToolDefinition;
use crate::tools::Tool;

/// Separator between an MCP server name and a discovered tool name. Built-in
/// tool names never contain it, so a name containing the separator always
/// routes to the discovered-tool path.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Where an active tool came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSource {
    Core,
    Discovered,
    Selected,
}

/// One entry in the active tool set.
#[derive(Clone)]
pub struct ToolEntry {
    pub name: String,
    pub source: ToolSource,
    pub tool: Arc<dyn Tool>,
}

impl ToolEntry {
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.tool.description().to_string(),
            input_schema: self.tool.input_schema(),
        }
    }
}

/// Holds every tool the process knows about. The per-request active set is
/// computed by [`ToolRegistry::active_toolset`].
#[derive(Default)]
pub struct ToolRegistry {
    builtins: Vec<Arc<dyn Tool>>,
    discovered: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_builtin(&mut self, tool: Arc<dyn Tool>) {
        if tool.name().contains(NAMESPACE_SEPARATOR) {
            warn!(
                "refusing built-in tool '{}': name contains the namespace separator",
                tool.name()
            );
            return;
        }
        info!("registered built-in tool: {}", tool.name());
        self.builtins.push(tool);
    }

    /// Register an externally discovered tool. Its name must already carry
    /// the `server__tool` namespace.
    pub fn register_discovered(&mut self, tool: Arc<dyn Tool>) {
        if !tool.name().contains(NAMESPACE_SEPARATOR) {
            warn!(
                "refusing discovered tool '{}': name is not namespaced",
                tool.name()
            );
            return;
        }
        info!("registered discovered tool: {}", tool.name());
        self.discovered.push(tool);
    }

    pub fn builtin(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.builtins.iter().find(|t| t.name() == name)
    }

    fn discovered_tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.discovered.iter().find(|t| t.name() == name)
    }

    /// Compute the active set for one request.
    ///
    /// The merge is an explicit ordered list: always-on core tools first,
    /// then discovered tools the caller named, then caller-selected
    /// built-ins. Later entries replace earlier ones with the same name.
    pub fn active_toolset(
        &self,
        supports_tools: bool,
        core_names: &[String],
        selected: &[String],
    ) -> Vec<ToolEntry> {
        if !supports_tools {
            return Vec::new();
        }

        let mut entries: Vec<ToolEntry> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();

        let mut insert = |entries: &mut Vec<ToolEntry>, entry: ToolEntry| {
            match by_name.get(&entry.name) {
                Some(&i) => entries[i] = entry,
                None => {
                    by_name.insert(entry.name.clone(), entries.len());
                    entries.push(entry);
                }
            }
        };

        for name in core_names {
            match self.builtin(name) {
                Some(tool) => insert(
                    &mut entries,
                    ToolEntry {
                        name: name.clone(),
                        source: ToolSource::Core,
                        tool: Arc::clone(tool),
                    },
                ),
                None => warn!("always-on tool '{name}' is not registered; skipping"),
            }
        }

        for name in selected.iter().filter(|n| n.contains(NAMESPACE_SEPARATOR)) {
            match self.discovered_tool(name) {
                Some(tool) => insert(
                    &mut entries,
                    ToolEntry {
                        name: name.clone(),
                        source: ToolSource::Discovered,
                        tool: Arc::clone(tool),
                    },
                ),
                None => warn!("selected tool '{name}' is not a discovered tool; skipping"),
            }
        }

        for name in selected.iter().filter(|n| !n.contains(NAMESPACE_SEPARATOR)) {
            match self.builtin(name) {
                Some(tool) => insert(
                    &mut entries,
                    ToolEntry {
                        name: name.clone(),
                        source: ToolSource::Selected,
                        tool: Arc::clone(tool),
                    },
                ),
                None => warn!("selected tool '{name}' is not registered; skipping"),
            }
        }

        entries
    }
}
