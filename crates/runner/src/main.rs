mod logging;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use blockbot_core::agent::{DecisionProvider, LlmDecisionProvider, ToolAction};
use blockbot_core::config::{BackendConfig, EngineConfig};
use blockbot_core::llm::{ChatCompletionsClient, OllamaClient};
use blockbot_core::world::{WorldApi, WorldState};
use blockbot_core::{Engine, EngineSettings, RawProgram};

/// Client for the game server's agent routes.
struct HttpWorldApi {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct StateEnvelope {
    #[serde(default)]
    game_state: WorldState,
}

impl HttpWorldApi {
    fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build world http client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn command_body(agent_id: &str, action: &ToolAction) -> serde_json::Value {
        json!({
            "agent_id": agent_id,
            "action": {
                "tool_type": action.tool_type,
                "parameters": action.parameters,
            },
        })
    }
}

impl WorldApi for HttpWorldApi {
    fn register_agent<'a>(
        &'a self,
        agent_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.http
                .post(self.url("/api/agent/register"))
                .json(&json!({ "agent_id": agent_id }))
                .send()
                .await
                .context("register request failed")?
                .error_for_status()
                .context("register non-2xx response")?;
            Ok(())
        })
    }

    fn fetch_state<'a>(
        &'a self,
        agent_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<WorldState>> + Send + 'a>> {
        Box::pin(async move {
            let envelope = self
                .http
                .get(self.url(&format!("/api/agent/state/{agent_id}")))
                .send()
                .await
                .context("state request failed")?
                .error_for_status()
                .context("state non-2xx response")?
                .json::<StateEnvelope>()
                .await
                .context("decode game state")?;
            Ok(envelope.game_state)
        })
    }

    fn send_action<'a>(
        &'a self,
        agent_id: &'a str,
        action: &'a ToolAction,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.http
                .post(self.url("/api/agent/command"))
                .json(&Self::command_body(agent_id, action))
                .send()
                .await
                .context("command request failed")?
                .error_for_status()
                .context("command non-2xx response")?;
            Ok(())
        })
    }

    fn remove_agent<'a>(
        &'a self,
        agent_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.http
                .delete(self.url(&format!("/api/agent/{agent_id}")))
                .send()
                .await
                .context("remove request failed")?
                .error_for_status()
                .context("remove non-2xx response")?;
            Ok(())
        })
    }
}

fn build_provider(cfg: &EngineConfig, http: reqwest::Client) -> Arc<dyn DecisionProvider> {
    let channels = cfg.aux_channels.clone();
    match &cfg.backend {
        BackendConfig::Ollama(c) => Arc::new(LlmDecisionProvider::new(
            "ollama",
            OllamaClient::new(c.clone(), http),
            channels,
        )),
        BackendConfig::ChatCompletions(c) => Arc::new(LlmDecisionProvider::new(
            "chat_completions",
            ChatCompletionsClient::new(c.clone(), http),
            channels,
        )),
    }
}

async fn load_program(path: &Path) -> anyhow::Result<RawProgram> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read program {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("decode program {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config_path = std::env::var("BLOCKBOT_CONFIG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| blockbot_core::config::DEFAULT_CONFIG_FILE.to_string());
    let mut cfg = EngineConfig::load(&config_path)?;
    cfg.apply_env()?;

    let program_paths: Vec<String> = std::env::args().skip(1).collect();
    if program_paths.is_empty() {
        anyhow::bail!("usage: blockbot-runner <program.json>...");
    }

    // No client-side timeout here: the engine enforces the decision timeout itself.
    let llm_http = reqwest::Client::builder()
        .build()
        .context("build llm http client")?;
    let provider = build_provider(&cfg, llm_http);
    let world = Arc::new(HttpWorldApi::new(
        &cfg.world.base_url,
        Duration::from_millis(cfg.world.timeout_ms),
    )?);

    let engine = Arc::new(Engine::new(EngineSettings::from(&cfg), provider, world));

    for path in &program_paths {
        let raw = load_program(Path::new(path)).await?;
        match engine.register_agent(raw).await {
            Ok(id) => info!(agent = %id, program = %path, "loaded program"),
            Err(err) => warn!(program = %path, error = %err, "program rejected"),
        }
    }

    engine.start_session().await?;
    let cadence = engine.start_auto_ticking(None).await?;
    info!(
        cadence_ms = cadence.as_millis() as u64,
        world = %cfg.world.base_url,
        "running; ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;

    let report = engine.cleanup_session().await?;
    info!(
        final_tick = report.final_tick,
        removed = report.removed_agents.len(),
        "shut down"
    );
    Ok(())
}
