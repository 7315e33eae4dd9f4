use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::program::{ToolBinding, ToolKind};

/// Per-axis bound applied to movement parameters when none is configured.
pub const DEFAULT_MOVE_BOUND: f64 = 25.0;

/// External augmentation a provider may need to serve a decision (e.g. an MCP server).
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuxChannel {
    Planner,
    WebSearch,
}

pub trait ToolMeta {
    /// Auxiliary channel this tool needs at decision time, if any.
    fn aux_channel(&self) -> Option<AuxChannel>;
    /// Whether numeric parameters are bounded per step.
    fn is_bounded_movement(&self) -> bool;
}

impl ToolMeta for ToolKind {
    fn aux_channel(&self) -> Option<AuxChannel> {
        aux_channel(*self)
    }

    fn is_bounded_movement(&self) -> bool {
        matches!(self, ToolKind::Move)
    }
}

pub fn aux_channel(kind: ToolKind) -> Option<AuxChannel> {
    match kind {
        ToolKind::Plan => Some(AuxChannel::Planner),
        ToolKind::Search => Some(AuxChannel::WebSearch),
        ToolKind::Move | ToolKind::Attack | ToolKind::Collect => None,
    }
}

/// Exactly the channels the offered bindings need; empty when none do.
pub fn required_channels(bindings: &[ToolBinding]) -> BTreeSet<AuxChannel> {
    bindings
        .iter()
        .filter_map(|b| b.tool_name.aux_channel())
        .collect()
}

/// Clamps every numeric movement parameter into `[-bound, bound]`.
///
/// Integers stay integers. Numeric strings (`"12"`) are coerced to numbers first; other
/// values are left untouched. A NaN bound falls back to [`DEFAULT_MOVE_BOUND`].
pub fn clamp_movement(parameters: &mut Map<String, Value>, bound: f64) {
    let bound = if bound.is_nan() {
        DEFAULT_MOVE_BOUND
    } else {
        bound.abs()
    };
    for value in parameters.values_mut() {
        let clamped = match value {
            Value::Number(n) => clamp_number(n, bound),
            Value::String(s) => s.trim().parse::<f64>().ok().and_then(|f| clamp_float(f, bound)),
            _ => None,
        };
        if let Some(v) = clamped {
            *value = v;
        }
    }
}

fn clamp_number(n: &Number, bound: f64) -> Option<Value> {
    if let Some(i) = n.as_i64() {
        let limit = bound.trunc() as i64;
        return Some(Value::from(i.clamp(-limit, limit)));
    }
    clamp_float(n.as_f64()?, bound)
}

fn clamp_float(f: f64, bound: f64) -> Option<Value> {
    if f.is_nan() {
        return Some(Value::from(0));
    }
    let c = f.clamp(-bound, bound);
    if c.fract() == 0.0 {
        Some(Value::from(c as i64))
    } else {
        Number::from_f64(c).map(Value::Number)
    }
}
