use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::program::{BlockId, ToolKind};

pub const DEFAULT_HISTORY_LIMIT: usize = 5;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ActionRecord {
    pub tool: ToolKind,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rationale: String,
}

/// Per-agent cursor into its program plus scratch memory.
///
/// Only the step executor mutates this; everyone else reads a [`RuntimeState`] snapshot.
#[derive(Debug, Clone)]
pub struct RunState {
    pub cursor: Option<BlockId>,
    pub last_decision_block: Option<BlockId>,
    pub last_tool_block: Option<BlockId>,
    pub current_plan: Option<String>,
    history: VecDeque<ActionRecord>,
    history_limit: usize,
}

impl RunState {
    pub fn new(cursor: Option<BlockId>, history_limit: usize) -> Self {
        let history_limit = history_limit.max(1);
        Self {
            cursor,
            last_decision_block: None,
            last_tool_block: None,
            current_plan: None,
            history: VecDeque::with_capacity(history_limit),
            history_limit,
        }
    }

    pub fn history(&self) -> &VecDeque<ActionRecord> {
        &self.history
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Appends a record, evicting the oldest past the limit.
    pub fn record(&mut self, record: ActionRecord) {
        self.history.push_back(record);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    pub fn snapshot(&self) -> RuntimeState {
        RuntimeState {
            cursor: self.cursor.clone(),
            last_tool_block: self.last_tool_block.clone(),
            last_decision_block: self.last_decision_block.clone(),
            current_plan: self.current_plan.clone(),
            history: self.history.iter().cloned().collect(),
        }
    }
}

/// Read-only view of an agent's run state.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RuntimeState {
    pub cursor: Option<BlockId>,
    pub last_tool_block: Option<BlockId>,
    pub last_decision_block: Option<BlockId>,
    pub current_plan: Option<String>,
    pub history: Vec<ActionRecord>,
}
