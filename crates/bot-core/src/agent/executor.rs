use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::memory::{ActionRecord, RunState};
use super::provider::{DecisionProvider, DecisionRequest, ToolOffer};
use super::tools::{DEFAULT_MOVE_BOUND, ToolMeta, clamp_movement, required_channels};
use super::wire::{FallbackReason, select_tool};
use crate::error::{EngineError, EngineResult};
use crate::program::{Block, BlockId, DecisionBlock, Program, ToolKind, Trigger};
use crate::world::WorldState;

#[derive(Debug, Clone, Copy)]
pub struct StepConfig {
    pub decision_timeout: Duration,
    pub move_bound: f64,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            decision_timeout: Duration::from_secs(8),
            move_bound: DEFAULT_MOVE_BOUND,
        }
    }
}

/// The game action chosen by one step.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ToolAction {
    pub tool_type: ToolKind,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rationale: String,
    /// Tool block that was applied.
    pub tool_block: BlockId,
    /// Cursor after the step.
    pub next_block: Option<BlockId>,
    /// Set when the provider's answer was unusable and the first binding was applied.
    #[serde(default)]
    pub fallback: Option<FallbackReason>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    DecisionTimeout { timeout_ms: u64 },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Action(ToolAction),
    /// Nothing to do this tick. `skipped` is set when a decision was attempted but abandoned.
    NoAction {
        #[serde(default)]
        skipped: Option<SkipReason>,
    },
}

impl StepOutcome {
    pub fn action(&self) -> Option<&ToolAction> {
        match self {
            StepOutcome::Action(a) => Some(a),
            StepOutcome::NoAction { .. } => None,
        }
    }
}

fn tool_offers(program: &Program, decision: &DecisionBlock) -> Vec<ToolOffer> {
    decision
        .bindings
        .iter()
        .map(|b| ToolOffer {
            kind: b.tool_name,
            tool_block: b.tool_id.clone(),
            parameters: program
                .tool_block(&b.tool_id)
                .map(|t| t.parameters.clone())
                .unwrap_or_default(),
        })
        .collect()
}

/// Picks the block this tick starts from, applying trigger interrupts and loop fallback.
fn resolve_cursor(program: &Program, state: &mut RunState, trigger: Option<Trigger>) -> Option<BlockId> {
    if let Some(trigger) = trigger
        && let Some(entry) = program.entry_for(trigger.entry_kind())
        && let Some(next) = entry.next.as_ref()
    {
        debug!(entry = %entry.id, next = %next, "trigger interrupt");
        state.cursor = Some(next.clone());
    }

    // Idle agents resume at the last agent block they entered. This also revives agents whose
    // program deliberately ends in a tool block without a successor.
    if state.cursor.is_none() {
        state.cursor = state.last_decision_block.clone();
    }
    state.cursor.clone()
}

/// Advances one agent by one decision.
///
/// Owns no timers or clients: the caller supplies the provider and serializes steps per agent.
/// A provider that misses `cfg.decision_timeout` is dropped and the tick is reported as skipped,
/// leaving the cursor on the agent block so the next tick retries it.
pub async fn step(
    agent_id: &str,
    program: &Program,
    state: &mut RunState,
    provider: &dyn DecisionProvider,
    world: &WorldState,
    trigger: Option<Trigger>,
    cfg: &StepConfig,
) -> EngineResult<StepOutcome> {
    let Some(cursor) = resolve_cursor(program, state, trigger) else {
        debug!(agent = agent_id, "idle, no action");
        return Ok(StepOutcome::NoAction { skipped: None });
    };

    let decision = match program.block(&cursor) {
        Some(Block::Decision(decision)) => decision,
        Some(_) => {
            return Err(EngineError::NotADecisionBlock {
                agent: agent_id.to_string(),
                block: cursor,
            });
        }
        None => {
            error!(agent = agent_id, block = %cursor, "cursor points outside the program");
            return Err(EngineError::MalformedProgramState {
                agent: agent_id.to_string(),
                block: cursor,
            });
        }
    };

    state.last_decision_block = Some(decision.id.clone());

    let request = DecisionRequest {
        agent_id: agent_id.to_string(),
        decision_block: decision.id.clone(),
        backend: decision.backend.clone(),
        system_prompt: decision.system_prompt.clone(),
        user_prompt: decision.user_prompt.clone(),
        world_summary: world.summary(),
        current_plan: state.current_plan.clone(),
        history: state.history().iter().cloned().collect(),
        tools: tool_offers(program, decision),
        aux_channels: required_channels(&decision.bindings),
    };
    debug!(
        agent = agent_id,
        block = %decision.id,
        provider = provider.name(),
        channels = ?request.aux_channels,
        "requesting decision"
    );

    let raw = match tokio::time::timeout(cfg.decision_timeout, provider.decide(request)).await {
        Ok(Ok(raw)) => raw,
        Ok(Err(err)) => {
            return Err(EngineError::DecisionFailed {
                agent: agent_id.to_string(),
                reason: format!("{err:#}"),
            });
        }
        Err(_elapsed) => {
            let timeout_ms = cfg.decision_timeout.as_millis() as u64;
            warn!(agent = agent_id, timeout_ms, "decision timed out, skipping tick");
            return Ok(StepOutcome::NoAction {
                skipped: Some(SkipReason::DecisionTimeout { timeout_ms }),
            });
        }
    };

    let selection = select_tool(&raw, &decision.bindings);
    if let Some(reason) = &selection.fallback {
        warn!(
            agent = agent_id,
            block = %decision.id,
            %reason,
            fallback = %selection.binding.tool_name,
            "provider answer unusable, using first tool"
        );
    }

    let Some(tool) = program.tool_block(&selection.binding.tool_id) else {
        error!(agent = agent_id, tool = %selection.binding.tool_id, "bound tool block missing");
        return Err(EngineError::ToolResolutionFailure {
            agent: agent_id.to_string(),
            tool: selection.binding.tool_name.to_string(),
        });
    };

    let mut parameters = selection.parameters;
    if tool.kind.is_bounded_movement() {
        clamp_movement(&mut parameters, cfg.move_bound);
    }

    state.record(ActionRecord {
        tool: tool.kind,
        parameters: parameters.clone(),
        rationale: selection.rationale.clone(),
    });

    if tool.kind == ToolKind::Plan {
        let plan = parameters
            .get("plan")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|p| !p.trim().is_empty())
            .or_else(|| Some(selection.rationale.clone()).filter(|r| !r.is_empty()));
        if let Some(plan) = plan {
            info!(agent = agent_id, plan = %plan, "stored plan");
            state.current_plan = Some(plan);
        }
    }

    state.last_tool_block = Some(tool.id.clone());
    state.cursor = tool.next.clone();

    debug!(
        agent = agent_id,
        tool = %tool.kind,
        next = ?state.cursor,
        "step applied"
    );

    Ok(StepOutcome::Action(ToolAction {
        tool_type: tool.kind,
        parameters,
        rationale: selection.rationale,
        tool_block: tool.id.clone(),
        next_block: state.cursor.clone(),
        fallback: selection.fallback,
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::agent::tools::AuxChannel;
    use crate::program::{EntryBlock, RawProgram, ToolBinding, ToolBlock, TriggerKind};

    #[derive(Default)]
    struct FakeProvider {
        responses: Mutex<VecDeque<anyhow::Result<String>>>,
        requests: Mutex<Vec<DecisionRequest>>,
    }

    impl FakeProvider {
        fn push(&self, raw: impl Into<String>) {
            self.responses.lock().unwrap().push_back(Ok(raw.into()));
        }

        fn requests(&self) -> Vec<DecisionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl DecisionProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        fn decide<'a>(
            &'a self,
            request: DecisionRequest,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(request);
                self.responses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| anyhow::bail!("no decision queued"))
            })
        }
    }

    struct StalledProvider;

    impl DecisionProvider for StalledProvider {
        fn name(&self) -> &str {
            "stalled"
        }

        fn decide<'a>(
            &'a self,
            _request: DecisionRequest,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
            Box::pin(std::future::pending())
        }
    }

    fn tool(id: &str, kind: ToolKind, params: &[&str], next: Option<&str>) -> Block {
        Block::Tool(ToolBlock {
            id: id.to_string(),
            kind,
            parameters: params
                .iter()
                .map(|p| (p.to_string(), "number".to_string()))
                .collect::<BTreeMap<_, _>>(),
            next: next.map(str::to_string),
        })
    }

    fn decision(id: &str, bindings: &[(&str, ToolKind)]) -> Block {
        Block::Decision(DecisionBlock {
            id: id.to_string(),
            backend: "m".to_string(),
            system_prompt: "sys".to_string(),
            user_prompt: "usr".to_string(),
            bindings: bindings
                .iter()
                .map(|(t, k)| ToolBinding {
                    tool_id: t.to_string(),
                    tool_name: *k,
                })
                .collect(),
        })
    }

    fn entry(id: &str, trigger: TriggerKind, next: Option<&str>) -> Block {
        Block::Entry(EntryBlock {
            id: id.to_string(),
            trigger,
            next: next.map(str::to_string),
        })
    }

    /// start -> D (move -> T1, attack -> T2), T1/T2 -> D, plus an unwired onDamaged entry.
    fn looping_program() -> Program {
        Program::validate(RawProgram {
            agent_id: "bot".to_string(),
            blocks: vec![
                entry("start", TriggerKind::OnStart, Some("D")),
                entry("hurt", TriggerKind::OnDamaged, None),
                decision("D", &[("T1", ToolKind::Move), ("T2", ToolKind::Attack)]),
                tool("T1", ToolKind::Move, &["x", "y"], Some("D")),
                tool("T2", ToolKind::Attack, &[], Some("D")),
            ],
        })
        .unwrap()
    }

    fn initial_state(program: &Program) -> RunState {
        RunState::new(program.start_entry().next.clone(), 5)
    }

    #[tokio::test]
    async fn scenario_move_then_unwired_trigger_falls_back_to_decision() -> anyhow::Result<()> {
        let program = looping_program();
        let mut state = initial_state(&program);
        let provider = FakeProvider::default();
        let world = WorldState::default();
        let cfg = StepConfig::default();

        provider.push(r#"{"action":"move","parameters":{"x":5,"y":-10}}"#);
        let out = step("bot", &program, &mut state, &provider, &world, None, &cfg).await?;
        let action = out.action().expect("action");
        assert_eq!(action.tool_type, ToolKind::Move);
        assert_eq!(Value::Object(action.parameters.clone()), json!({"x": 5, "y": -10}));
        assert_eq!(state.cursor.as_deref(), Some("D"));

        provider.push(r#"{"action":"attack","parameters":{}}"#);
        let out = step(
            "bot",
            &program,
            &mut state,
            &provider,
            &world,
            Some(Trigger::Damaged),
            &cfg,
        )
        .await?;
        assert_eq!(out.action().map(|a| a.tool_type), Some(ToolKind::Attack));
        assert_eq!(state.cursor.as_deref(), Some("D"));
        assert_eq!(state.last_decision_block.as_deref(), Some("D"));
        assert_eq!(state.last_tool_block.as_deref(), Some("T2"));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_tool_falls_back_to_first_binding() -> anyhow::Result<()> {
        let program = looping_program();
        let mut state = initial_state(&program);
        let provider = FakeProvider::default();
        provider.push(r#"{"action":"fly","parameters":{"x":1}}"#);

        let out = step(
            "bot",
            &program,
            &mut state,
            &provider,
            &WorldState::default(),
            None,
            &StepConfig::default(),
        )
        .await?;
        let action = out.action().expect("action");
        assert_eq!(action.tool_type, ToolKind::Move);
        assert!(action.parameters.is_empty());
        assert!(action.fallback.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn move_parameters_are_clamped() -> anyhow::Result<()> {
        let program = looping_program();
        let mut state = initial_state(&program);
        let provider = FakeProvider::default();
        provider.push(r#"{"action":"move","parameters":{"x":999,"y":-999}}"#);

        let out = step(
            "bot",
            &program,
            &mut state,
            &provider,
            &WorldState::default(),
            None,
            &StepConfig::default(),
        )
        .await?;
        let action = out.action().expect("action");
        assert_eq!(Value::Object(action.parameters.clone()), json!({"x": 25, "y": -25}));
        assert_eq!(
            Value::Object(state.history()[0].parameters.clone()),
            json!({"x": 25, "y": -25})
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_skips_and_keeps_cursor() -> anyhow::Result<()> {
        let program = looping_program();
        let mut state = initial_state(&program);
        let cfg = StepConfig {
            decision_timeout: Duration::from_millis(50),
            ..StepConfig::default()
        };

        let out = step(
            "bot",
            &program,
            &mut state,
            &StalledProvider,
            &WorldState::default(),
            None,
            &cfg,
        )
        .await?;
        assert_eq!(
            out,
            StepOutcome::NoAction {
                skipped: Some(SkipReason::DecisionTimeout { timeout_ms: 50 })
            }
        );
        assert_eq!(state.cursor.as_deref(), Some("D"));
        assert!(state.history().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn idle_agent_without_history_produces_nothing() -> anyhow::Result<()> {
        let program = Program::validate(RawProgram {
            agent_id: "bot".to_string(),
            blocks: vec![entry("start", TriggerKind::OnStart, None)],
        })?;
        let mut state = initial_state(&program);
        let provider = FakeProvider::default();

        let out = step(
            "bot",
            &program,
            &mut state,
            &provider,
            &WorldState::default(),
            Some(Trigger::Damaged),
            &StepConfig::default(),
        )
        .await?;
        assert_eq!(out, StepOutcome::NoAction { skipped: None });
        assert!(provider.requests().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn trigger_preempts_cursor_and_terminal_tool_idles_then_loops_back() -> anyhow::Result<()> {
        let program = Program::validate(RawProgram {
            agent_id: "bot".to_string(),
            blocks: vec![
                entry("start", TriggerKind::OnStart, Some("calm")),
                entry("hurt", TriggerKind::OnDamaged, Some("angry")),
                decision("calm", &[("walk", ToolKind::Move)]),
                decision("angry", &[("hit", ToolKind::Attack)]),
                tool("walk", ToolKind::Move, &["x"], Some("calm")),
                tool("hit", ToolKind::Attack, &[], None),
            ],
        })?;
        let mut state = initial_state(&program);
        let provider = FakeProvider::default();
        let world = WorldState::default();
        let cfg = StepConfig::default();

        provider.push(r#"{"action":"attack"}"#);
        let out = step("bot", &program, &mut state, &provider, &world, Some(Trigger::Damaged), &cfg)
            .await?;
        assert_eq!(out.action().map(|a| a.tool_block.as_str()), Some("hit"));
        assert_eq!(state.cursor, None);

        // Terminal tool leaves the agent idle; the next tick loops back to "angry".
        provider.push(r#"{"action":"attack"}"#);
        let out = step("bot", &program, &mut state, &provider, &world, None, &cfg).await?;
        assert_eq!(out.action().map(|a| a.tool_block.as_str()), Some("hit"));

        let reqs = provider.requests();
        assert_eq!(reqs.len(), 2);
        assert!(reqs.iter().all(|r| r.decision_block == "angry"));
        Ok(())
    }

    #[tokio::test]
    async fn non_decision_cursor_is_an_error() {
        let program = looping_program();
        let mut state = RunState::new(Some("T1".to_string()), 5);
        let err = step(
            "bot",
            &program,
            &mut state,
            &FakeProvider::default(),
            &WorldState::default(),
            None,
            &StepConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::NotADecisionBlock { block, .. } if block == "T1"));
    }

    #[tokio::test]
    async fn dangling_cursor_is_malformed_state() {
        let program = looping_program();
        let mut state = RunState::new(Some("gone".to_string()), 5);
        let err = step(
            "bot",
            &program,
            &mut state,
            &FakeProvider::default(),
            &WorldState::default(),
            None,
            &StepConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::MalformedProgramState { .. }));
    }

    #[tokio::test]
    async fn provider_error_is_reported_without_advancing() {
        let program = looping_program();
        let mut state = initial_state(&program);
        let provider = FakeProvider::default();

        let err = step(
            "bot",
            &program,
            &mut state,
            &provider,
            &WorldState::default(),
            None,
            &StepConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::DecisionFailed { .. }));
        assert_eq!(state.cursor.as_deref(), Some("D"));
        assert_eq!(state.last_tool_block, None);
    }

    #[tokio::test]
    async fn plan_tool_stores_plan_and_requests_planner_channel() -> anyhow::Result<()> {
        let program = Program::validate(RawProgram {
            agent_id: "bot".to_string(),
            blocks: vec![
                entry("start", TriggerKind::OnStart, Some("D")),
                decision("D", &[("mv", ToolKind::Move), ("pl", ToolKind::Plan)]),
                tool("mv", ToolKind::Move, &["x", "y"], Some("D")),
                Block::Tool(ToolBlock {
                    id: "pl".to_string(),
                    kind: ToolKind::Plan,
                    parameters: BTreeMap::from([("plan".to_string(), "string".to_string())]),
                    next: Some("D".to_string()),
                }),
            ],
        })?;
        let mut state = initial_state(&program);
        let provider = FakeProvider::default();
        let world = WorldState::default();
        let cfg = StepConfig::default();

        provider.push(r#"{"action":"plan","parameters":{"plan":"circle east"},"rationale":"safer"}"#);
        step("bot", &program, &mut state, &provider, &world, None, &cfg).await?;
        assert_eq!(state.current_plan.as_deref(), Some("circle east"));

        provider.push(r#"{"action":"move","parameters":{"x":1,"y":1}}"#);
        step("bot", &program, &mut state, &provider, &world, None, &cfg).await?;

        let reqs = provider.requests();
        assert_eq!(reqs[0].aux_channels.iter().copied().collect::<Vec<_>>(), vec![AuxChannel::Planner]);
        assert_eq!(reqs[0].tools.len(), 2);
        assert_eq!(reqs[0].current_plan, None);
        assert_eq!(reqs[1].current_plan.as_deref(), Some("circle east"));
        assert_eq!(reqs[1].history.len(), 1);
        assert_eq!(state.current_plan.as_deref(), Some("circle east"));
        Ok(())
    }
}
