use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::Engine;
use super::scheduler::auto_tick_loop;
use crate::error::{EngineError, EngineResult};

pub(super) struct AutoTicker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    cadence: Duration,
}

#[derive(Default)]
pub(super) struct Session {
    pub(super) active: bool,
    /// Number of the last tick started in this session.
    pub(super) tick: u64,
    pub(super) participants: BTreeSet<String>,
    pub(super) ticker: Option<AutoTicker>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SessionStatus {
    pub active: bool,
    pub auto_ticking: bool,
    pub tick: u64,
    pub cadence_ms: Option<u64>,
    pub registered_agents: Vec<String>,
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub final_tick: u64,
    pub removed_agents: Vec<String>,
}

impl Engine {
    /// Activates the session with every registered agent participating.
    ///
    /// Starting an already active session keeps its tick count and refreshes the participants.
    pub async fn start_session(&self) -> EngineResult<()> {
        let ids = self.agent_ids().await;
        if ids.is_empty() {
            return Err(EngineError::NoAgentsRegistered);
        }

        let mut session = self.session.lock().await;
        if !session.active {
            session.active = true;
            session.tick = 0;
        }
        session.participants = ids.into_iter().collect();
        info!(agents = session.participants.len(), "session started");
        Ok(())
    }

    /// Spawns the cadence loop. `interval` overrides the configured cadence.
    pub async fn start_auto_ticking(self: &Arc<Self>, interval: Option<Duration>) -> EngineResult<Duration> {
        let mut session = self.session.lock().await;
        if !session.active {
            return Err(EngineError::SessionInactive);
        }
        if session.ticker.is_some() {
            return Err(EngineError::AutoTickAlreadyRunning);
        }

        let cadence = interval.unwrap_or(self.settings.cadence);
        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(auto_tick_loop(Arc::clone(self), cadence, stop_rx));
        session.ticker = Some(AutoTicker {
            stop,
            handle,
            cadence,
        });
        info!(cadence_ms = cadence.as_millis() as u64, "auto-ticking started");
        Ok(cadence)
    }

    /// Stops the cadence loop, letting an in-flight tick finish first.
    pub async fn stop_auto_ticking(&self) -> EngineResult<()> {
        // The loop takes the session lock every tick, so release it before waiting on the loop.
        let ticker = self.session.lock().await.ticker.take();
        let Some(ticker) = ticker else {
            return Err(EngineError::AutoTickNotRunning);
        };

        let _ = ticker.stop.send(());
        if let Err(err) = ticker.handle.await {
            warn!(error = %err, "auto-tick task ended abnormally");
        }
        info!("auto-ticking stopped");
        Ok(())
    }

    /// Ends the session and deregisters every agent from the world server and the engine.
    pub async fn cleanup_session(&self) -> EngineResult<CleanupReport> {
        match self.stop_auto_ticking().await {
            Ok(()) | Err(EngineError::AutoTickNotRunning) => {}
            Err(err) => return Err(err),
        }

        let final_tick = {
            let mut session = self.session.lock().await;
            session.active = false;
            session.participants.clear();
            session.tick
        };

        let mut removed: Vec<String> = self.agents.write().await.drain().map(|(id, _)| id).collect();
        removed.sort();

        let removals = removed.iter().map(|id| async move {
            if let Err(err) = self.world.remove_agent(id).await {
                warn!(agent = %id, error = %format!("{err:#}"), "world removal failed");
            }
        });
        futures::future::join_all(removals).await;

        info!(final_tick, removed = removed.len(), "session cleaned up");
        Ok(CleanupReport {
            final_tick,
            removed_agents: removed,
        })
    }

    pub async fn session_status(&self) -> SessionStatus {
        let registered_agents = self.agent_ids().await;
        let session = self.session.lock().await;
        SessionStatus {
            active: session.active,
            auto_ticking: session.ticker.is_some(),
            tick: session.tick,
            cadence_ms: session.ticker.as_ref().map(|t| t.cadence.as_millis() as u64),
            registered_agents,
            participants: session.participants.iter().cloned().collect(),
        }
    }
}
