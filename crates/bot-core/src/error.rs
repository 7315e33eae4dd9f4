//! Error types for the agent engine.
//!
//! Engine operations return `EngineResult<T>`. Collaborator boundaries (world server, LLM
//! backends, config files) stay on `anyhow` and get wrapped into `DecisionFailed` or logged.

use thiserror::Error;

/// Reasons a raw program is rejected. Validation is all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("program must have at least one block")]
    EmptyProgram,

    #[error("program must have at least one 'onStart' action block")]
    MissingStartEntry,

    #[error("duplicate block id: {0}")]
    DuplicateBlockId(String),

    #[error("block {block} references non-existent block: {target}")]
    DanglingSuccessor { block: String, target: String },

    #[error("agent block {block} references non-existent tool block: {target}")]
    DanglingToolBinding { block: String, target: String },

    #[error("agent block {block} binds '{tool}' to {target}, which is not a '{tool}' tool block")]
    BindingTargetMismatch {
        block: String,
        tool: String,
        target: String,
    },

    #[error("agent block {0} must have at least one tool connection")]
    NoToolBindings(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid program: {0}")]
    Validation(#[from] ValidationError),

    #[error("agent with id '{0}' already exists")]
    DuplicateAgent(String),

    #[error("agent with id '{0}' not found")]
    AgentNotFound(String),

    /// Never surfaced from a step: the executor turns it into a skipped tick.
    #[error("decision for agent '{agent}' timed out after {timeout_ms}ms")]
    DecisionTimeout { agent: String, timeout_ms: u64 },

    #[error("decision provider failed for agent '{agent}': {reason}")]
    DecisionFailed { agent: String, reason: String },

    #[error("agent '{agent}' cursor points at missing block '{block}'")]
    MalformedProgramState { agent: String, block: String },

    #[error("current node '{block}' of agent '{agent}' is not an agent block")]
    NotADecisionBlock { agent: String, block: String },

    #[error("agent '{agent}' resolved tool '{tool}' with no matching binding")]
    ToolResolutionFailure { agent: String, tool: String },

    #[error("game session is not active")]
    SessionInactive,

    #[error("no agents registered")]
    NoAgentsRegistered,

    #[error("auto-ticking is already running")]
    AutoTickAlreadyRunning,

    #[error("auto-ticking is not running")]
    AutoTickNotRunning,
}

pub type EngineResult<T> = Result<T, EngineError>;
