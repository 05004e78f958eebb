use parley_common::{Error, Result};
use tracing::info;

use crate::store::ConversationStore;

/// Prefix that routes a model id through the agent table.
pub const AGENT_PREFIX: &str = "agent/";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly assistant. Keep your responses concise \
     and helpful. Use the available tools when they would improve your answer.";

const REASONING_SYSTEM_PROMPT: &str = "You are a friendly assistant. Think through the problem \
     step by step before answering. Keep your final response concise.";

/// Effective generation parameters for one request. Computed once, before
/// persistence or streaming, and immutable afterwards.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub model: String,
    pub system_prompt: String,
    pub temperature: f64,
    pub context_window: u32,
    pub agent_id: Option<String>,
}

/// Default prompt for a plain model id.
pub fn default_prompt_for(model: &str) -> &'static str {
    if model.contains("reasoning") || model.contains("thinking") {
        REASONING_SYSTEM_PROMPT
    } else {
        DEFAULT_SYSTEM_PROMPT
    }
}

/// Resolve a requested model id into effective generation parameters.
///
/// `agent/<id>` looks up the stored agent; a missing agent is a hard
/// `NotFound` and the request must not proceed. A found agent's model,
/// prompt, and generation parameters win over the defaults.
pub async fn resolve_model(
    store: &dyn ConversationStore,
    requested: &str,
    default_temperature: f64,
    default_context_window: u32,
) -> Result<ResolvedModel> {
    if let Some(agent_id) = requested.strip_prefix(AGENT_PREFIX) {
        let agent = store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("agent '{agent_id}'")))?;
        info!("resolved agent '{agent_id}' -> model '{}'", agent.model);
        return Ok(ResolvedModel {
            model: agent.model,
            system_prompt: agent.system_prompt,
            temperature: agent.temperature,
            context_window: agent.context_window,
            agent_id: Some(agent.id),
        });
    }

    Ok(ResolvedModel {
        model: requested.to_string(),
        system_prompt: default_prompt_for(requested).to_string(),
        temperature: default_temperature,
        context_window: default_context_window,
        agent_id: None,
    })
}
