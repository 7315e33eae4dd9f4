//! Engine configuration: a TOML file found through [`ConfigLoader`], then `BLOCKBOT_*`
//! environment overrides.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::agent::StepConfig;
use crate::agent::memory::DEFAULT_HISTORY_LIMIT;
use crate::agent::provider::AuxChannelConfig;
use crate::agent::tools::DEFAULT_MOVE_BOUND;
use crate::llm::{ChatCompletionsConfig, OllamaConfig};

pub const CONFIG_DIR_ENV: &str = "BLOCKBOT_CONFIG_DIR";
pub const DEFAULT_CONFIG_FILE: &str = "blockbot.toml";

/// Locates and parses TOML config files.
///
/// Search order:
/// 1) `BLOCKBOT_CONFIG_DIR/<relative_path>`
/// 2) `./<relative_path>`
/// 3) `<repo_root>/config/<relative_path>`
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn parse_from_file<T: DeserializeOwned>(relative_path: &str) -> anyhow::Result<T> {
        let path = Self::resolve_path(relative_path)?;
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Self::parse_from_string(text)
    }

    pub fn parse_from_string<T: DeserializeOwned>(text: String) -> anyhow::Result<T> {
        toml::from_str(&text).with_context(|| "Failed to parse TOML")
    }

    pub fn resolve_path(relative_path: &str) -> anyhow::Result<PathBuf> {
        Self::candidates(relative_path)
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no config file '{relative_path}' under ${CONFIG_DIR_ENV}, the working directory or config/"
                )
            })
    }

    fn candidates(relative_path: &str) -> Vec<PathBuf> {
        let rel = Path::new(relative_path);
        if rel.is_absolute() {
            return vec![rel.to_path_buf()];
        }

        let mut out = Vec::with_capacity(3);
        if let Some(dir) = env::var_os(CONFIG_DIR_ENV) {
            out.push(PathBuf::from(dir).join(rel));
        }
        if let Ok(cwd) = env::current_dir() {
            out.push(cwd.join(rel));
        }
        // Workspace `config/`, two levels above this crate's manifest.
        if let Some(root) = Path::new(env!("CARGO_MANIFEST_DIR")).ancestors().nth(2) {
            out.push(root.join("config").join(rel));
        }
        out
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Ollama(OllamaConfig),
    ChatCompletions(ChatCompletionsConfig),
}

fn default_ollama() -> OllamaConfig {
    OllamaConfig {
        endpoint: "http://127.0.0.1:11434/api/generate".to_string(),
        default_model: "llama3.1".to_string(),
    }
}

fn default_chat_completions() -> ChatCompletionsConfig {
    ChatCompletionsConfig {
        endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
        default_model: "gpt-4o-mini".to_string(),
        api_key: None,
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Ollama(default_ollama())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WorldConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub decision_timeout_ms: u64,
    pub cadence_ms: u64,
    pub history_limit: usize,
    pub move_bound: f64,
    pub backend: BackendConfig,
    pub aux_channels: AuxChannelConfig,
    pub world: WorldConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            decision_timeout_ms: 8_000,
            cadence_ms: 2_000,
            history_limit: DEFAULT_HISTORY_LIMIT,
            move_bound: DEFAULT_MOVE_BOUND,
            backend: BackendConfig::default(),
            aux_channels: AuxChannelConfig::default(),
            world: WorldConfig::default(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(v) => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{key}={v}: {e}")),
        None => Ok(None),
    }
}

impl EngineConfig {
    /// Reads `relative_path` if it can be found, falling back to defaults when it cannot.
    pub fn load(relative_path: &str) -> anyhow::Result<Self> {
        let cfg: Self = match ConfigLoader::resolve_path(relative_path) {
            Ok(_) => ConfigLoader::parse_from_file(relative_path)?,
            Err(_) => Self::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.move_bound.is_finite() || self.move_bound < 0.0 {
            anyhow::bail!(
                "move_bound must be a finite, non-negative number, got {}",
                self.move_bound
            );
        }
        Ok(())
    }

    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Applies `BLOCKBOT_*` overrides from `lookup`. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = parse_env(&lookup, "BLOCKBOT_DECISION_TIMEOUT_MS")? {
            self.decision_timeout_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "BLOCKBOT_CADENCE_MS")? {
            self.cadence_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "BLOCKBOT_HISTORY_LIMIT")? {
            self.history_limit = v;
        }
        if let Some(v) = parse_env(&lookup, "BLOCKBOT_MOVE_BOUND")? {
            self.move_bound = v;
        }
        if let Some(v) = parse_env::<String>(&lookup, "BLOCKBOT_WORLD_URL")? {
            self.world.base_url = v;
        }

        if let Some(kind) = parse_env::<String>(&lookup, "BLOCKBOT_LLM_BACKEND")? {
            self.backend = match kind.as_str() {
                "ollama" => BackendConfig::Ollama(match &self.backend {
                    BackendConfig::Ollama(cfg) => cfg.clone(),
                    _ => default_ollama(),
                }),
                "chat_completions" => BackendConfig::ChatCompletions(match &self.backend {
                    BackendConfig::ChatCompletions(cfg) => cfg.clone(),
                    _ => default_chat_completions(),
                }),
                other => anyhow::bail!("BLOCKBOT_LLM_BACKEND: unknown backend '{other}'"),
            };
        }

        let endpoint = parse_env::<String>(&lookup, "BLOCKBOT_LLM_ENDPOINT")?;
        let model = parse_env::<String>(&lookup, "BLOCKBOT_LLM_MODEL")?;
        let api_key = parse_env::<String>(&lookup, "BLOCKBOT_LLM_API_KEY")?;
        match &mut self.backend {
            BackendConfig::Ollama(cfg) => {
                if let Some(v) = endpoint {
                    cfg.endpoint = v;
                }
                if let Some(v) = model {
                    cfg.default_model = v;
                }
            }
            BackendConfig::ChatCompletions(cfg) => {
                if let Some(v) = endpoint {
                    cfg.endpoint = v;
                }
                if let Some(v) = model {
                    cfg.default_model = v;
                }
                if api_key.is_some() {
                    cfg.api_key = api_key;
                }
            }
        }

        self.validate()
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms)
    }

    pub fn step_config(&self) -> StepConfig {
        StepConfig {
            decision_timeout: self.decision_timeout(),
            move_bound: self.move_bound,
        }
    }
}
