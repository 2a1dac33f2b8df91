//! Inbound request normalization.
//!
//! Two request dialects reach the gateway: a simple `{prompt}` body and a chat-style
//! `{messages: [{role, content}]}` body. Both collapse into one [`NormalizedInput`] that the
//! upstream client sends as a single `input` string.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Request/response shape selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `{prompt}` in, `{success, result}` out.
    Simple,
    /// `{messages}` in, chat-completion out.
    ChatStyle,
}

/// Reasoning effort forwarded to the upstream engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Effort {
    Low,
    #[default]
    Medium,
    High,
    /// Any other caller-supplied level, forwarded verbatim.
    Other(String),
}

impl Effort {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Effort::Medium;
        };
        match raw.to_ascii_lowercase().as_str() {
            "low" => Effort::Low,
            "medium" => Effort::Medium,
            "high" => Effort::High,
            _ => Effort::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Effort::Low => "low",
            Effort::Medium => "medium",
            Effort::High => "high",
            Effort::Other(s) => s.as_str(),
        }
    }

    fn rank(&self) -> Option<u8> {
        match self {
            Effort::Low => Some(0),
            Effort::Medium => Some(1),
            Effort::High => Some(2),
            Effort::Other(_) => None,
        }
    }
}

impl fmt::Display for Effort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Effort {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Server-side control over the caller's effort level.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EffortPolicy {
    /// Forward whatever the caller asked for.
    #[default]
    Passthrough,
    /// Ignore the caller and always send this level.
    Fixed(Effort),
    /// Clamp known levels to this maximum; unrecognized levels become the ceiling.
    Ceiling(Effort),
}

impl EffortPolicy {
    /// Parse `passthrough`, `fixed:<level>` or `ceiling:<level>`.
    pub fn from_spec(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() || spec.eq_ignore_ascii_case("passthrough") {
            return Some(EffortPolicy::Passthrough);
        }
        let (kind, level) = spec.split_once(':')?;
        let level = match Effort::parse(Some(level)) {
            Effort::Other(_) => return None,
            known => known,
        };
        match kind.trim().to_ascii_lowercase().as_str() {
            "fixed" => Some(EffortPolicy::Fixed(level)),
            "ceiling" => Some(EffortPolicy::Ceiling(level)),
            _ => None,
        }
    }

    pub fn apply(&self, requested: Effort) -> Effort {
        match self {
            EffortPolicy::Passthrough => requested,
            EffortPolicy::Fixed(level) => level.clone(),
            EffortPolicy::Ceiling(max) => match (requested.rank(), max.rank()) {
                (Some(r), Some(m)) if r <= m => requested,
                _ => max.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

/// Raw request body. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<InboundMessage>>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub effort: Option<String>,
}

impl InboundRequest {
    pub fn dialect(&self) -> Dialect {
        if self.messages.is_some() {
            Dialect::ChatStyle
        } else {
            Dialect::Simple
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedInput {
    pub text: String,
    pub stream: bool,
    pub effort: Effort,
    pub dialect: Dialect,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Collapse either dialect into one upstream input.
pub fn normalize(req: &InboundRequest) -> Result<NormalizedInput, ValidationError> {
    let from_messages = req
        .messages
        .as_deref()
        .map(render_messages)
        .filter(|t| has_text(t));
    let text = from_messages
        .or_else(|| req.prompt.clone().filter(|p| has_text(p)))
        .ok_or_else(|| ValidationError("Prompt or messages are required".into()))?;

    Ok(NormalizedInput {
        text,
        stream: req.stream.unwrap_or(false),
        effort: Effort::parse(req.effort.as_deref()),
        dialect: req.dialect(),
    })
}

fn has_text(s: &str) -> bool {
    !s.trim().is_empty()
}

fn render_messages(messages: &[InboundMessage]) -> String {
    // A list whose contents are all blank renders as blank so the prompt can take over.
    if messages.iter().all(|m| !has_text(&content_text(&m.content))) {
        return String::new();
    }
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, content_text(&m.content)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn content_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p {
                Value::String(s) => Some(s.clone()),
                Value::Object(_) => p.get("text").and_then(|t| t.as_str()).map(str::to_string),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}
