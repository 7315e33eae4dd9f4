//! The decision provider contract and the LLM-backed implementation of it.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::memory::ActionRecord;
use super::prompt::{PromptConfig, build_decision_prompt};
use super::tools::AuxChannel;
use crate::program::{BlockId, ToolKind};

/// One tool the provider may choose, with the parameters its block declares.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ToolOffer {
    pub kind: ToolKind,
    pub tool_block: BlockId,
    pub parameters: BTreeMap<String, String>,
}

/// Everything a provider gets to make one decision.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DecisionRequest {
    pub agent_id: String,
    pub decision_block: BlockId,
    /// Backend identifier authored on the agent block (model name).
    pub backend: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub world_summary: String,
    pub current_plan: Option<String>,
    pub history: Vec<ActionRecord>,
    pub tools: Vec<ToolOffer>,
    /// Exactly the channels the offered tools need.
    pub aux_channels: BTreeSet<AuxChannel>,
}

/// Reasoning backend that picks the next tool.
///
/// Returns raw text; the engine parses and validates it, and enforces the decision timeout by
/// dropping the returned future. Implementations need no timeout handling of their own.
pub trait DecisionProvider: Send + Sync {
    fn name(&self) -> &str;

    fn decide<'a>(
        &'a self,
        request: DecisionRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>>;
}

/// A single completion call against a hosted or local model.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    /// Backend-specific handles for auxiliary channels (e.g. MCP server names).
    pub aux_handles: Vec<String>,
}

pub trait LlmClient: Send + Sync {
    fn complete<'a>(
        &'a self,
        request: LlmRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>>;
}

/// Handles the configured backend uses for each auxiliary channel.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct AuxChannelConfig {
    #[serde(default)]
    pub planner: Option<String>,
    #[serde(default)]
    pub web_search: Option<String>,
}

impl AuxChannelConfig {
    pub fn handle(&self, channel: AuxChannel) -> Option<&str> {
        match channel {
            AuxChannel::Planner => self.planner.as_deref(),
            AuxChannel::WebSearch => self.web_search.as_deref(),
        }
    }
}

/// Decision provider that prompts an LLM.
#[derive(Debug)]
pub struct LlmDecisionProvider<C> {
    name: String,
    client: C,
    channels: AuxChannelConfig,
    prompt_cfg: PromptConfig,
}

impl<C: LlmClient> LlmDecisionProvider<C> {
    pub fn new(name: impl Into<String>, client: C, channels: AuxChannelConfig) -> Self {
        Self {
            name: name.into(),
            client,
            channels,
            prompt_cfg: PromptConfig::default(),
        }
    }

    pub fn with_prompt_config(mut self, prompt_cfg: PromptConfig) -> Self {
        self.prompt_cfg = prompt_cfg;
        self
    }

    pub fn to_llm_request(&self, request: &DecisionRequest) -> LlmRequest {
        let aux_handles = request
            .aux_channels
            .iter()
            .filter_map(|c| {
                let handle = self.channels.handle(*c);
                if handle.is_none() {
                    debug!(channel = ?c, "no handle configured for aux channel");
                }
                handle.map(str::to_string)
            })
            .collect();

        LlmRequest {
            model: request.backend.clone(),
            system: request.system_prompt.clone(),
            prompt: build_decision_prompt(request, &self.prompt_cfg),
            aux_handles,
        }
    }
}

impl<C: LlmClient> DecisionProvider for LlmDecisionProvider<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn decide<'a>(
        &'a self,
        request: DecisionRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        let llm_request = self.to_llm_request(&request);
        Box::pin(async move { self.client.complete(llm_request).await })
    }
}
