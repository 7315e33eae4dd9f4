//! Per-agent decision making: run state, the decision provider contract, provider-output
//! parsing and the single-agent step.

pub mod executor;
pub mod memory;
pub mod prompt;
pub mod provider;
pub mod tools;
pub mod wire;

pub use executor::{SkipReason, StepConfig, StepOutcome, ToolAction, step};
pub use memory::{ActionRecord, RunState, RuntimeState};
pub use provider::{DecisionProvider, DecisionRequest, LlmClient, LlmDecisionProvider, LlmRequest};
pub use tools::AuxChannel;
pub use wire::{FallbackReason, parse_decision, select_tool};
