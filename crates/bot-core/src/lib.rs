//! Block-program agent engine.
//!
//! Agents are authored as small graphs of entry, agent (decision) and tool blocks. The engine
//! validates those graphs, asks a reasoning backend which tool to use at each agent block, and
//! drives every registered agent against an external game-world server tick by tick.

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod llm;
pub mod program;
pub mod world;

pub use engine::{AgentTickResult, Engine, EngineSettings, TickReport};
pub use error::{EngineError, EngineResult, ValidationError};
pub use program::{Program, RawProgram};
