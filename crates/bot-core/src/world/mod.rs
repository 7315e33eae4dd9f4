//! The game-world side of the engine: per-agent state snapshots and the server boundary.

pub mod api;
pub mod world_state;

pub use api::WorldApi;
pub use world_state::WorldState;
