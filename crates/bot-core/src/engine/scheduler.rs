use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Engine;
use crate::agent::{SkipReason, StepOutcome, ToolAction};
use crate::error::{EngineError, EngineResult};
use crate::world::WorldState;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentTickResult {
    /// The action was chosen; `send_error` is set when the world server refused it.
    Action {
        action: ToolAction,
        #[serde(default)]
        send_error: Option<String>,
    },
    NoAction {
        #[serde(default)]
        skipped: Option<SkipReason>,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    /// One entry per participating agent.
    pub results: BTreeMap<String, AgentTickResult>,
    pub duration_ms: u64,
}

impl TickReport {
    pub fn actions(&self) -> usize {
        self.results
            .values()
            .filter(|r| matches!(r, AgentTickResult::Action { .. }))
            .count()
    }

    pub fn errors(&self) -> usize {
        self.results
            .values()
            .filter(|r| matches!(r, AgentTickResult::Error { .. }))
            .count()
    }
}

impl Engine {
    /// Advances every participating agent by one step.
    ///
    /// World states are fetched in one batch, then each agent steps in its own task and sends its
    /// action from there, so a slow provider or world call for one agent never holds up another.
    /// Per-agent failures land in the report; only session errors fail the whole tick.
    pub async fn run_global_tick(self: &Arc<Self>) -> EngineResult<TickReport> {
        let started = Instant::now();
        let (tick, participants) = {
            let mut session = self.session.lock().await;
            if !session.active {
                return Err(EngineError::SessionInactive);
            }
            session.tick += 1;
            (
                session.tick,
                session.participants.iter().cloned().collect::<Vec<_>>(),
            )
        };
        debug!(tick, agents = participants.len(), "tick started");

        let mut states = self.world.fetch_states(&participants).await;

        let mut results = BTreeMap::new();
        let mut tasks = Vec::with_capacity(participants.len());
        for agent_id in participants {
            let world_state = match states.remove(&agent_id) {
                Some(Ok(state)) => state,
                Some(Err(err)) => {
                    warn!(tick, agent = %agent_id, error = %format!("{err:#}"), "world state fetch failed");
                    results.insert(
                        agent_id,
                        AgentTickResult::Error {
                            error: format!("failed to fetch world state: {err:#}"),
                        },
                    );
                    continue;
                }
                None => {
                    results.insert(
                        agent_id,
                        AgentTickResult::Error {
                            error: "world server returned no state".to_string(),
                        },
                    );
                    continue;
                }
            };

            let engine = Arc::clone(self);
            let task_id = agent_id.clone();
            let handle = tokio::spawn(async move { engine.tick_and_send(&task_id, world_state).await });
            tasks.push((agent_id, handle));
        }

        for (agent_id, handle) in tasks {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => {
                    warn!(tick, agent = %agent_id, error = %err, "agent task failed");
                    AgentTickResult::Error {
                        error: format!("agent task failed: {err}"),
                    }
                }
            };
            results.insert(agent_id, result);
        }

        let report = TickReport {
            tick,
            results,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            tick,
            actions = report.actions(),
            errors = report.errors(),
            duration_ms = report.duration_ms,
            "tick finished"
        );
        Ok(report)
    }

    async fn tick_and_send(&self, agent_id: &str, world: WorldState) -> AgentTickResult {
        let trigger = world.trigger;
        match self.tick(agent_id, &world, trigger).await {
            Ok(StepOutcome::Action(action)) => {
                let send_error = match self.world.send_action(agent_id, &action).await {
                    Ok(()) => None,
                    Err(err) => {
                        warn!(agent = agent_id, error = %format!("{err:#}"), "world rejected action");
                        Some(format!("{err:#}"))
                    }
                };
                AgentTickResult::Action { action, send_error }
            }
            Ok(StepOutcome::NoAction { skipped }) => AgentTickResult::NoAction { skipped },
            Err(err) => {
                warn!(agent = agent_id, error = %err, "agent step failed");
                AgentTickResult::Error {
                    error: err.to_string(),
                }
            }
        }
    }
}

/// Ticks every `cadence` until `stop` fires.
///
/// The wait after a tick is the cadence minus the tick's duration, so an overrunning tick is
/// followed immediately by the next. A failed tick waits the full cadence. Each tick runs in its
/// own task, so a panicking tick counts as a failed one and the loop keeps going.
pub(super) async fn auto_tick_loop(engine: Arc<Engine>, cadence: Duration, mut stop: oneshot::Receiver<()>) {
    loop {
        let started = Instant::now();
        let tick = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run_global_tick().await }
        });
        let wait = match tick.await {
            Ok(Ok(_)) => cadence.saturating_sub(started.elapsed()),
            Ok(Err(err)) => {
                warn!(error = %err, "auto tick failed");
                cadence
            }
            Err(err) => {
                warn!(error = %err, "auto tick task failed");
                cadence
            }
        };

        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!("auto-tick loop exited");
}
