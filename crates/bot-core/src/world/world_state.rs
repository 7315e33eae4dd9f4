use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::program::Trigger;

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
pub struct Position {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct NearbyAgent {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What the world server reports about one agent before a tick.
///
/// The schema is owned by the server and still moving, so unknown fields are kept in `extra`
/// rather than rejected.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct WorldState {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub health: Option<i64>,
    #[serde(default)]
    pub nearby_agents: Vec<NearbyAgent>,
    #[serde(default)]
    pub inventory: Vec<String>,
    /// Event the server observed since the previous tick (e.g. the agent took damage).
    #[serde(default, alias = "action_occurred")]
    pub trigger: Option<Trigger>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorldState {
    /// One-line, prompt-friendly rendering of the known fields.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();

        if let Some(pos) = self.position {
            parts.push(format!("Position: x={}, y={}", pos.x, pos.y));
        }
        if let Some(health) = self.health {
            parts.push(format!("Health: {health}"));
        }
        if !self.inventory.is_empty() {
            parts.push(format!("Inventory: {}", self.inventory.join(", ")));
        }
        if !self.nearby_agents.is_empty() {
            let ids: Vec<&str> = self.nearby_agents.iter().map(|a| a.id.as_str()).collect();
            parts.push(format!("Nearby agents: {}", ids.join(", ")));
        }

        if parts.is_empty() {
            return "No specific game state information available.".to_string();
        }
        parts.join(" | ")
    }
}
