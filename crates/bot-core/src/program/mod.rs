//! Agent programs: the block graph an agent's behavior is authored as.
//!
//! The wire format matches what the editor sends:
//!
//! ```json
//! { "agent_id": "bot_1", "blocks": [
//!     { "id": "start", "type": "action", "action_type": "onStart", "next": "think" },
//!     { "id": "think", "type": "agent", "model": "gpt-4o-mini", "system_prompt": "...",
//!       "user_prompt": "...", "tool_connections": [{ "tool_id": "mv", "tool_name": "move" }] },
//!     { "id": "mv", "type": "tool", "tool_type": "move",
//!       "parameters": { "x": "number", "y": "number" }, "next": "think" }
//! ] }
//! ```
//!
//! All references between blocks are ids. `Program` is the validated arena built from a
//! `RawProgram`; see [`graph`].

pub mod graph;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use graph::Program;

pub type BlockId = String;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Move,
    Attack,
    Collect,
    Plan,
    Search,
}

impl ToolKind {
    pub const ALL: [ToolKind; 5] = [
        ToolKind::Move,
        ToolKind::Attack,
        ToolKind::Collect,
        ToolKind::Plan,
        ToolKind::Search,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::Move => "move",
            ToolKind::Attack => "attack",
            ToolKind::Collect => "collect",
            ToolKind::Plan => "plan",
            ToolKind::Search => "search",
        }
    }

    /// Lenient lookup used on provider output: trims and ignores case.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What an entry block listens for.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    #[serde(rename = "onStart", alias = "on-start", alias = "on_start")]
    OnStart,
    #[serde(
        rename = "onDamaged",
        alias = "on-damaged",
        alias = "on_damaged",
        alias = "onAttacked"
    )]
    OnDamaged,
}

/// An external event reported alongside a tick.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum Trigger {
    #[serde(
        rename = "damaged",
        alias = "was-damaged",
        alias = "was_damaged",
        alias = "attacked"
    )]
    Damaged,
}

impl Trigger {
    pub fn entry_kind(self) -> TriggerKind {
        match self {
            Trigger::Damaged => TriggerKind::OnDamaged,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct EntryBlock {
    pub id: BlockId,
    #[serde(rename = "action_type")]
    pub trigger: TriggerKind,
    #[serde(default)]
    pub next: Option<BlockId>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ToolBinding {
    pub tool_id: BlockId,
    pub tool_name: ToolKind,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DecisionBlock {
    pub id: BlockId,
    /// Reasoning backend identifier, passed through to the provider as the model name.
    #[serde(rename = "model")]
    pub backend: String,
    pub system_prompt: String,
    pub user_prompt: String,
    #[serde(rename = "tool_connections")]
    pub bindings: Vec<ToolBinding>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ToolBlock {
    pub id: BlockId,
    #[serde(rename = "tool_type")]
    pub kind: ToolKind,
    /// Parameter name -> type hint (e.g. `"x": "number"`).
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub next: Option<BlockId>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Block {
    #[serde(rename = "action")]
    Entry(EntryBlock),
    #[serde(rename = "agent")]
    Decision(DecisionBlock),
    #[serde(rename = "tool")]
    Tool(ToolBlock),
}

impl Block {
    pub fn id(&self) -> &str {
        match self {
            Block::Entry(b) => &b.id,
            Block::Decision(b) => &b.id,
            Block::Tool(b) => &b.id,
        }
    }

    /// Every id this block points at, in wiring order.
    pub fn references(&self) -> Vec<&str> {
        match self {
            Block::Entry(b) => b.next.as_deref().into_iter().collect(),
            Block::Tool(b) => b.next.as_deref().into_iter().collect(),
            Block::Decision(b) => b.bindings.iter().map(|c| c.tool_id.as_str()).collect(),
        }
    }
}

/// Unvalidated program as received from the editor.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RawProgram {
    pub agent_id: String,
    pub blocks: Vec<Block>,
}
