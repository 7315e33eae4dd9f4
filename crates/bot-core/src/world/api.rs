use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use super::WorldState;
use crate::agent::ToolAction;

/// Boundary to the authoritative game-world server.
///
/// The engine never owns positions, health or inventory; it reads them through here before a
/// tick and pushes chosen actions back.
pub trait WorldApi: Send + Sync {
    fn register_agent<'a>(
        &'a self,
        agent_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

    fn fetch_state<'a>(
        &'a self,
        agent_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<WorldState>> + Send + 'a>>;

    /// Batched read. Every requested id gets an entry; failures stay per agent.
    ///
    /// The default issues all single reads concurrently.
    fn fetch_states<'a>(
        &'a self,
        agent_ids: &'a [String],
    ) -> Pin<Box<dyn Future<Output = HashMap<String, anyhow::Result<WorldState>>> + Send + 'a>>
    {
        Box::pin(async move {
            let reads = agent_ids.iter().map(|id| async move {
                let state = self.fetch_state(id).await;
                (id.clone(), state)
            });
            futures::future::join_all(reads).await.into_iter().collect()
        })
    }

    fn send_action<'a>(
        &'a self,
        agent_id: &'a str,
        action: &'a ToolAction,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

    fn remove_agent<'a>(
        &'a self,
        agent_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;
}
