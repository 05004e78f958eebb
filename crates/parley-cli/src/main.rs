use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use parley_agents::mcp::McpManager;
use parley_agents::tools::builtins::{
    CreateDocument, DocumentStore, ExtractContractFields, GenerateImage, GetWeather,
    RequestSignature, UpdateDocument, WebSearch,
};
use parley_agents::{
    AnthropicProvider, ChatPipeline, ConversationStore, LlmProvider, OpenAiProvider, ToolRegistry,
};
use parley_common::{Identity, WorkspaceId};
use parley_config::{AppConfig, ConfigLoader};
use parley_db::ChatStore;
use parley_gateway::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Streaming chat and tool orchestration backend")]
struct Cli {
    /// Path to parley.toml. Falls back to ./parley.toml, then to defaults.
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config =
        ConfigLoader::load_or_default(cli.config.as_deref()).context("failed to load config")?;

    let store = Arc::new(
        ChatStore::open(PathBuf::from(&config.database.path).as_path())
            .context("failed to open database")?,
    );

    let provider = build_provider(&config)?;
    match provider.health_check().await {
        Ok(true) => info!("LLM provider '{}' is reachable", provider.provider_id()),
        Ok(false) => warn!("LLM provider '{}' responded unhealthy", provider.provider_id()),
        Err(e) => warn!("LLM provider health check failed: {e}"),
    }

    let mcp = McpManager::new();
    for server in &config.mcp.servers {
        if let Err(e) = mcp
            .connect(
                &server.name,
                &server.command,
                &server.args,
                &server.env,
                server.timeout_secs,
            )
            .await
        {
            warn!("skipping MCP server '{}': {e}", server.name);
        }
    }

    let registry = build_registry(&config, Arc::clone(&provider), &mcp).await;

    if let Some(token) = &config.gateway.dev_token {
        store.insert_session(
            token,
            &Identity {
                user_id: config.gateway.dev_user.clone(),
                workspace_id: WorkspaceId::from(config.gateway.dev_workspace.as_str()),
            },
        )?;
        info!(
            "seeded development session for user '{}' in workspace '{}'",
            config.gateway.dev_user, config.gateway.dev_workspace
        );
    }

    let pipeline = ChatPipeline::new(
        Arc::clone(&store) as Arc<dyn ConversationStore>,
        Arc::clone(&provider),
        Arc::new(registry),
        config.tools.core.clone(),
        config.pipeline.max_tool_steps as u32,
        config.pipeline.default_temperature,
        config.pipeline.default_context_window,
    );

    let state = AppState {
        config: Arc::new(config),
        store,
        pipeline: Arc::new(pipeline),
    };

    parley_gateway::serve(state).await?;
    mcp.disconnect_all().await;
    Ok(())
}

fn build_provider(config: &AppConfig) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let llm = &config.llm;
    let provider: Arc<dyn LlmProvider> = match llm.provider.as_str() {
        "anthropic" => {
            let mut provider = AnthropicProvider::from_env(&llm.api_key_env)?;
            if let Some(base_url) = &llm.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Arc::new(provider)
        }
        "openai" => {
            let mut provider = OpenAiProvider::from_env(&llm.api_key_env)?;
            if let Some(base_url) = &llm.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Arc::new(provider)
        }
        other => anyhow::bail!("unknown LLM provider '{other}' (expected anthropic or openai)"),
    };
    Ok(provider)
}

async fn build_registry(
    config: &AppConfig,
    provider: Arc<dyn LlmProvider>,
    mcp: &McpManager,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let documents = DocumentStore::new();

    registry.register_builtin(Arc::new(GetWeather::new()));
    registry.register_builtin(Arc::new(WebSearch::new()));
    registry.register_builtin(Arc::new(CreateDocument::new(Arc::clone(&documents))));
    registry.register_builtin(Arc::new(UpdateDocument::new(Arc::clone(&documents))));
    registry.register_builtin(Arc::new(RequestSignature::new(Arc::clone(&documents))));
    registry.register_builtin(Arc::new(ExtractContractFields::new(
        Arc::clone(&documents),
        provider,
        config.llm.model.clone(),
    )));

    // Image generation degrades to an in-band tool error when no key is set.
    let image_key = std::env::var("OPENAI_API_KEY").ok();
    registry.register_builtin(Arc::new(GenerateImage::standard(image_key.clone())));
    registry.register_builtin(Arc::new(GenerateImage::hd(image_key)));

    for tool in mcp.discovered_tools(Duration::from_secs(30)).await {
        registry.register_discovered(tool);
    }

    registry
}
