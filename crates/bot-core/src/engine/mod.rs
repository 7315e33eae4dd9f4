//! The engine context: registered agents, their run state and the game session.
//!
//! One [`Engine`] is shared behind an `Arc` by whoever drives it (the runner, tests, an HTTP
//! front end). There is no global state.

mod scheduler;
mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, watch};
use tracing::{info, warn};

pub use scheduler::{AgentTickResult, TickReport};
pub use session::{CleanupReport, SessionStatus};

use crate::agent::memory::DEFAULT_HISTORY_LIMIT;
use crate::agent::{DecisionProvider, RunState, RuntimeState, StepConfig, StepOutcome, step};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::program::{Program, RawProgram, Trigger};
use crate::world::{WorldApi, WorldState};
use session::Session;

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub step: StepConfig,
    /// Default auto-tick cadence.
    pub cadence: Duration,
    pub history_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            step: StepConfig::default(),
            cadence: Duration::from_secs(2),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            step: cfg.step_config(),
            cadence: cfg.cadence(),
            history_limit: cfg.history_limit,
        }
    }
}

/// A registered agent. The state mutex is held for a whole step, which serializes ticks of the
/// same agent while leaving other agents free to run. Readers never take it: every finished
/// step publishes a fresh snapshot on the watch channel.
struct AgentSlot {
    program: Arc<Program>,
    state: Mutex<RunState>,
    snapshot: watch::Sender<RuntimeState>,
}

impl AgentSlot {
    fn new(program: Program, state: RunState) -> Self {
        let (snapshot, _) = watch::channel(state.snapshot());
        Self {
            program: Arc::new(program),
            state: Mutex::new(state),
            snapshot,
        }
    }
}

pub struct Engine {
    settings: EngineSettings,
    provider: Arc<dyn DecisionProvider>,
    world: Arc<dyn WorldApi>,
    agents: RwLock<HashMap<String, Arc<AgentSlot>>>,
    session: Mutex<Session>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        provider: Arc<dyn DecisionProvider>,
        world: Arc<dyn WorldApi>,
    ) -> Self {
        Self {
            settings,
            provider,
            world,
            agents: RwLock::new(HashMap::new()),
            session: Mutex::new(Session::default()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Validates and registers a program, then announces the agent to the world server.
    ///
    /// Nothing is mutated when validation fails or the id is taken. A failed world
    /// registration is logged and does not undo the engine registration.
    pub async fn register_agent(&self, raw: RawProgram) -> EngineResult<String> {
        let program = Program::validate(raw)?;
        let agent_id = program.agent_id().to_string();
        let cursor = program.start_entry().next.clone();

        {
            let mut agents = self.agents.write().await;
            if agents.contains_key(&agent_id) {
                return Err(EngineError::DuplicateAgent(agent_id));
            }
            let state = RunState::new(cursor, self.settings.history_limit);
            agents.insert(agent_id.clone(), Arc::new(AgentSlot::new(program, state)));
        }

        {
            let mut session = self.session.lock().await;
            if session.active {
                session.participants.insert(agent_id.clone());
            }
        }

        info!(agent = %agent_id, "agent registered");
        if let Err(err) = self.world.register_agent(&agent_id).await {
            warn!(agent = %agent_id, error = %format!("{err:#}"), "world registration failed");
        }
        Ok(agent_id)
    }

    /// Removes an agent from the engine and the world server.
    pub async fn deregister_agent(&self, agent_id: &str) -> EngineResult<()> {
        if self.agents.write().await.remove(agent_id).is_none() {
            return Err(EngineError::AgentNotFound(agent_id.to_string()));
        }
        self.session.lock().await.participants.remove(agent_id);

        info!(agent = agent_id, "agent deregistered");
        if let Err(err) = self.world.remove_agent(agent_id).await {
            warn!(agent = agent_id, error = %format!("{err:#}"), "world removal failed");
        }
        Ok(())
    }

    /// Runs one step for one agent against a world state the caller already has.
    pub async fn tick(
        &self,
        agent_id: &str,
        world: &WorldState,
        trigger: Option<Trigger>,
    ) -> EngineResult<StepOutcome> {
        let slot = self.slot(agent_id).await?;
        let mut state = slot.state.lock().await;
        let outcome = step(
            agent_id,
            &slot.program,
            &mut state,
            self.provider.as_ref(),
            world,
            trigger,
            &self.settings.step,
        )
        .await;
        slot.snapshot.send_replace(state.snapshot());
        outcome
    }

    /// Read-only snapshot as of the agent's last finished step. Never waits on a step in flight.
    pub async fn agent_runtime_state(&self, agent_id: &str) -> EngineResult<RuntimeState> {
        let slot = self.slot(agent_id).await?;
        let snapshot = slot.snapshot.borrow().clone();
        Ok(snapshot)
    }

    pub async fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn program(&self, agent_id: &str) -> EngineResult<Arc<Program>> {
        Ok(Arc::clone(&self.slot(agent_id).await?.program))
    }

    async fn slot(&self, agent_id: &str) -> EngineResult<Arc<AgentSlot>> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fakes shared by the engine tests.

    use std::collections::{HashMap, HashSet, VecDeque};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::agent::{DecisionProvider, DecisionRequest, ToolAction};
    use crate::program::{
        Block, DecisionBlock, EntryBlock, RawProgram, ToolBinding, ToolBlock, ToolKind, TriggerKind,
    };
    use crate::world::{WorldApi, WorldState};

    /// Per-agent queues of raw answers. Agents in `stalled` never answer; agents in `slow` answer
    /// after the given delay.
    #[derive(Default)]
    pub struct ScriptedProvider {
        pub scripts: Mutex<HashMap<String, VecDeque<String>>>,
        pub stalled: HashSet<String>,
        pub slow: HashMap<String, Duration>,
        pub fallback: Option<String>,
    }

    impl ScriptedProvider {
        pub fn always(raw: &str) -> Self {
            Self {
                fallback: Some(raw.to_string()),
                ..Self::default()
            }
        }

        pub fn push(&self, agent: &str, raw: &str) {
            self.scripts
                .lock()
                .unwrap()
                .entry(agent.to_string())
                .or_default()
                .push_back(raw.to_string());
        }
    }

    impl DecisionProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn decide<'a>(
            &'a self,
            request: DecisionRequest,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
            Box::pin(async move {
                if self.stalled.contains(&request.agent_id) {
                    std::future::pending::<()>().await;
                }
                if let Some(delay) = self.slow.get(&request.agent_id) {
                    tokio::time::sleep(*delay).await;
                }
                let queued = self
                    .scripts
                    .lock()
                    .unwrap()
                    .get_mut(&request.agent_id)
                    .and_then(VecDeque::pop_front);
                queued
                    .or_else(|| self.fallback.clone())
                    .ok_or_else(|| anyhow::anyhow!("no decision queued for {}", request.agent_id))
            })
        }
    }

    #[derive(Default)]
    pub struct FakeWorld {
        pub states: Mutex<HashMap<String, WorldState>>,
        pub unreadable: HashSet<String>,
        pub reject_actions: bool,
        pub registered: Mutex<Vec<String>>,
        pub removed: Mutex<Vec<String>>,
        pub sent: Mutex<Vec<(String, ToolAction, Instant)>>,
        /// Number of upcoming state fetches that panic after 60ms.
        pub fetch_panics: AtomicU32,
    }

    impl FakeWorld {
        pub fn sent(&self) -> Vec<(String, ToolAction, Instant)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl WorldApi for FakeWorld {
        fn register_agent<'a>(
            &'a self,
            agent_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
            Box::pin(async move {
                self.registered.lock().unwrap().push(agent_id.to_string());
                Ok(())
            })
        }

        fn fetch_state<'a>(
            &'a self,
            agent_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<WorldState>> + Send + 'a>> {
            Box::pin(async move {
                if self
                    .fetch_panics
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    panic!("world client crashed while fetching {agent_id}");
                }
                if self.unreadable.contains(agent_id) {
                    anyhow::bail!("state for {agent_id} unavailable");
                }
                Ok(self
                    .states
                    .lock()
                    .unwrap()
                    .get(agent_id)
                    .cloned()
                    .unwrap_or_default())
            })
        }

        fn send_action<'a>(
            &'a self,
            agent_id: &'a str,
            action: &'a ToolAction,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
            Box::pin(async move {
                if self.reject_actions {
                    anyhow::bail!("world rejected command");
                }
                self.sent
                    .lock()
                    .unwrap()
                    .push((agent_id.to_string(), action.clone(), Instant::now()));
                Ok(())
            })
        }

        fn remove_agent<'a>(
            &'a self,
            agent_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
            Box::pin(async move {
                self.removed.lock().unwrap().push(agent_id.to_string());
                Ok(())
            })
        }
    }

    /// onStart -> D, D offers move/attack, both loop back to D. An onDamaged entry leads to R,
    /// which only offers attack.
    pub fn brawler(agent_id: &str) -> RawProgram {
        RawProgram {
            agent_id: agent_id.to_string(),
            blocks: vec![
                Block::Entry(EntryBlock {
                    id: "start".to_string(),
                    trigger: TriggerKind::OnStart,
                    next: Some("D".to_string()),
                }),
                Block::Entry(EntryBlock {
                    id: "hurt".to_string(),
                    trigger: TriggerKind::OnDamaged,
                    next: Some("R".to_string()),
                }),
                Block::Decision(DecisionBlock {
                    id: "D".to_string(),
                    backend: "m".to_string(),
                    system_prompt: "sys".to_string(),
                    user_prompt: "usr".to_string(),
                    bindings: vec![
                        ToolBinding {
                            tool_id: "mv".to_string(),
                            tool_name: ToolKind::Move,
                        },
                        ToolBinding {
                            tool_id: "hit".to_string(),
                            tool_name: ToolKind::Attack,
                        },
                    ],
                }),
                Block::Decision(DecisionBlock {
                    id: "R".to_string(),
                    backend: "m".to_string(),
                    system_prompt: "sys".to_string(),
                    user_prompt: "strike back".to_string(),
                    bindings: vec![ToolBinding {
                        tool_id: "hit".to_string(),
                        tool_name: ToolKind::Attack,
                    }],
                }),
                Block::Tool(ToolBlock {
                    id: "mv".to_string(),
                    kind: ToolKind::Move,
                    parameters: [("x", "number"), ("y", "number")]
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    next: Some("D".to_string()),
                }),
                Block::Tool(ToolBlock {
                    id: "hit".to_string(),
                    kind: ToolKind::Attack,
                    parameters: Default::default(),
                    next: Some("D".to_string()),
                }),
            ],
        }
    }
}
