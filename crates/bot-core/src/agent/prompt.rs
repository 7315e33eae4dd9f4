use std::fmt::Write;

use super::provider::{DecisionRequest, ToolOffer};

#[derive(Debug, Clone)]
pub struct PromptConfig {
    pub response_contract: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            response_contract: "Respond with a JSON object containing 'action' (the action name), 'parameters' (an object with the required parameters) and 'rationale' (one short sentence).\nExample: {\"action\": \"move\", \"parameters\": {\"x\": 5, \"y\": -2}, \"rationale\": \"close the distance\"}".to_string(),
        }
    }
}

fn describe_tool(tool: &ToolOffer) -> String {
    if tool.parameters.is_empty() {
        return format!("{} (no parameters)", tool.kind);
    }
    let params: Vec<String> = tool
        .parameters
        .iter()
        .map(|(name, hint)| format!("{name}: {hint}"))
        .collect();
    format!("{} (parameters: {})", tool.kind, params.join(", "))
}

/// User-turn prompt for a decision. The system instruction travels separately.
pub fn build_decision_prompt(req: &DecisionRequest, cfg: &PromptConfig) -> String {
    let mut out = String::new();
    let _ = write!(out, "{}\n\nCurrent game state: {}", req.user_prompt, req.world_summary);

    if let Some(plan) = req.current_plan.as_deref() {
        let _ = write!(out, "\n\nCurrent strategic plan: {plan}");
    }

    if !req.history.is_empty() {
        out.push_str("\n\nRecent actions (oldest first):");
        for rec in &req.history {
            let params = serde_json::to_string(&rec.parameters).unwrap_or_else(|_| "{}".to_string());
            let _ = write!(out, "\n- {} {params}", rec.tool);
            if !rec.rationale.is_empty() {
                let _ = write!(out, " ({})", rec.rationale);
            }
        }
    }

    out.push_str("\n\nAvailable actions:");
    for tool in &req.tools {
        let _ = write!(out, "\n- {}", describe_tool(tool));
    }

    let _ = write!(out, "\n\n{}\n", cfg.response_contract);
    out
}
