//! Parsing of free-form provider output into a tool choice.
//!
//! Providers are asked for `{"action": "...", "parameters": {...}, "rationale": "..."}` but
//! routinely wrap it in code fences, `<tool_call>` tags or prose. Whatever cannot be read, or
//! names a tool that was not offered, falls back to the first offered binding.

use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::program::{ToolBinding, ToolKind};

pub const TOOL_CALL_START: &str = "<tool_call>";
pub const TOOL_CALL_END: &str = "</tool_call>";

const RATIONALE_MAX_CHARS: usize = 200;

const ACTION_KEYS: [&str; 4] = ["action", "tool", "name", "tool_type"];
const PARAMETER_KEYS: [&str; 2] = ["parameters", "arguments"];
const RATIONALE_KEYS: [&str; 3] = ["rationale", "reasoning", "reason"];

/// The decision object as providers write it.
///
/// Field names vary between models, so each field is read from the first key present in its
/// list (`action` before `tool`, `name`, `tool_type`, and so on). Extra keys are ignored.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DecisionWire {
    pub action: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl DecisionWire {
    pub fn from_object(mut obj: Map<String, Value>) -> Result<Self, DecisionParseError> {
        fn take(obj: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
            keys.iter().find_map(|k| obj.remove(*k).filter(|v| !v.is_null()))
        }

        let action = match take(&mut obj, &ACTION_KEYS) {
            Some(Value::String(action)) => action,
            Some(_) => {
                return Err(DecisionParseError::InvalidJson(
                    "action must be a string".to_string(),
                ));
            }
            None => {
                return Err(DecisionParseError::InvalidJson(
                    "missing field `action`".to_string(),
                ));
            }
        };
        let rationale = match take(&mut obj, &RATIONALE_KEYS) {
            Some(Value::String(r)) => Some(r),
            Some(other) => Some(other.to_string()),
            None => None,
        };

        Ok(Self {
            action,
            parameters: take(&mut obj, &PARAMETER_KEYS).unwrap_or(Value::Null),
            rationale,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionParseError {
    EmptyResponse,
    MultipleToolCallBlocks,
    InvalidJson(String),
    ParametersNotObject,
}

impl std::fmt::Display for DecisionParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionParseError::EmptyResponse => write!(f, "empty response"),
            DecisionParseError::MultipleToolCallBlocks => write!(f, "multiple <tool_call> blocks"),
            DecisionParseError::InvalidJson(msg) => write!(f, "invalid decision json: {msg}"),
            DecisionParseError::ParametersNotObject => write!(f, "parameters must be an object"),
        }
    }
}

impl std::error::Error for DecisionParseError {}

/// A syntactically valid decision; the tool name is not yet checked against the offer.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDecision {
    pub tool: String,
    pub parameters: Map<String, Value>,
    pub rationale: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FallbackReason {
    Unparseable(String),
    ToolNotOffered(String),
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackReason::Unparseable(msg) => write!(f, "unparseable response ({msg})"),
            FallbackReason::ToolNotOffered(tool) => write!(f, "tool '{tool}' not offered"),
        }
    }
}

/// The binding the engine will apply, after validation and fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection<'p> {
    pub binding: &'p ToolBinding,
    pub parameters: Map<String, Value>,
    pub rationale: String,
    pub fallback: Option<FallbackReason>,
}

/// Removes delimiter wrapping around the structured payload.
///
/// Handles a single `<tool_call>` block, markdown fences (with or without a language tag) and
/// prose before or after one JSON object. Returns the trimmed remainder when nothing matches.
pub fn strip_delimiters(raw: &str) -> Result<&str, DecisionParseError> {
    let mut s = raw.trim();

    if let Some(start) = s.find(TOOL_CALL_START) {
        let inner = &s[start + TOOL_CALL_START.len()..];
        let end = inner.find(TOOL_CALL_END).unwrap_or(inner.len());
        if inner[end..].contains(TOOL_CALL_START) {
            return Err(DecisionParseError::MultipleToolCallBlocks);
        }
        s = inner[..end].trim();
    }

    if let Some(rest) = s.strip_prefix("```") {
        // Drop the optional language tag on the fence line.
        let body = match rest.find('\n') {
            Some(nl) => &rest[nl + 1..],
            None => rest,
        };
        let end = body.find("```").unwrap_or(body.len());
        s = body[..end].trim();
    }

    if let Some(open) = s.find('{') {
        s = &s[open..];
        // Keep exactly the first JSON value; whatever follows it is commentary.
        let mut values = serde_json::Deserializer::from_str(s).into_iter::<IgnoredAny>();
        if let Some(Ok(_)) = values.next() {
            s = &s[..values.byte_offset()];
        }
    }

    Ok(s)
}

/// Reads a decision out of raw provider text.
///
/// A bare tool name (`"attack"`) is accepted as a decision with no parameters.
pub fn parse_decision(raw: &str) -> Result<ParsedDecision, DecisionParseError> {
    let payload = strip_delimiters(raw)?;
    if payload.is_empty() {
        return Err(DecisionParseError::EmptyResponse);
    }

    if !payload.starts_with('{') {
        if ToolKind::parse(payload).is_some() {
            return Ok(ParsedDecision {
                tool: payload.trim().to_ascii_lowercase(),
                parameters: Map::new(),
                rationale: String::new(),
            });
        }
        return Err(DecisionParseError::InvalidJson(
            "no json object in response".to_string(),
        ));
    }

    let obj: Map<String, Value> = serde_json::from_str(payload)
        .map_err(|e| DecisionParseError::InvalidJson(e.to_string()))?;
    let wire = DecisionWire::from_object(obj)?;

    let parameters = match wire.parameters {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        _ => return Err(DecisionParseError::ParametersNotObject),
    };

    Ok(ParsedDecision {
        tool: wire.action.trim().to_ascii_lowercase(),
        parameters,
        rationale: one_line(wire.rationale.as_deref().unwrap_or("")),
    })
}

/// Picks the binding to apply. Never fails: anything unusable selects the first binding with
/// empty parameters and records why.
///
/// `bindings` must be non-empty, which program validation guarantees for agent blocks.
pub fn select_tool<'p>(raw: &str, bindings: &'p [ToolBinding]) -> Selection<'p> {
    let first = &bindings[0];
    let fallback = |reason: FallbackReason| Selection {
        binding: first,
        parameters: Map::new(),
        rationale: String::new(),
        fallback: Some(reason),
    };

    let parsed = match parse_decision(raw) {
        Ok(parsed) => parsed,
        Err(err) => return fallback(FallbackReason::Unparseable(err.to_string())),
    };

    let chosen = ToolKind::parse(&parsed.tool)
        .and_then(|kind| bindings.iter().find(|b| b.tool_name == kind));
    match chosen {
        Some(binding) => Selection {
            binding,
            parameters: parsed.parameters,
            rationale: parsed.rationale,
            fallback: None,
        },
        None => fallback(FallbackReason::ToolNotOffered(parsed.tool)),
    }
}

/// First non-empty line, capped in length.
pub fn one_line(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    line.chars().take(RATIONALE_MAX_CHARS).collect()
}
