//! Outbound bodies: buffered envelopes and SSE frames for both dialects.

use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::normalize::Dialect;

/// Emitted before any upstream data so intermediaries start flushing.
pub const KEEP_ALIVE_FRAME: &[u8] = b": keep-alive\n\n";
/// Stream terminator.
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Proprietary `{success, result}` body.
#[derive(Debug, Clone, Serialize)]
pub struct LxdEnvelope {
    pub success: bool,
    pub result: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: &'static str,
}

/// OpenAI-compatible chat completion body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
}

impl ChatCompletion {
    pub fn new(model: &str, content: String) -> Self {
        Self {
            id: completion_id(),
            object: "chat.completion",
            created: now_epoch(),
            model: model.to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: "assistant",
                    content,
                },
                finish_reason: "stop",
            }],
        }
    }
}

/// Serializes incremental frames for one stream. Chat chunks share one id.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    dialect: Dialect,
    id: String,
    model: String,
    created: u64,
}

impl FrameEncoder {
    pub fn new(dialect: Dialect, model: &str) -> Self {
        Self {
            dialect,
            id: completion_id(),
            model: model.to_string(),
            created: now_epoch(),
        }
    }

    pub fn delta(&self, text: &str) -> Bytes {
        let body = match self.dialect {
            Dialect::ChatStyle => self.chat_chunk(json!({ "content": text }), None),
            Dialect::Simple => json!({ "success": true, "delta": text }),
        };
        data_frame(&body)
    }

    /// Closing chunk before the sentinel. Only the chat dialect carries one.
    pub fn finish(&self) -> Option<Bytes> {
        match self.dialect {
            Dialect::ChatStyle => Some(data_frame(&self.chat_chunk(json!({}), Some("stop")))),
            Dialect::Simple => None,
        }
    }

    pub fn error(&self, message: &str) -> Bytes {
        let body = match self.dialect {
            Dialect::ChatStyle => json!({ "error": { "message": message, "type": "upstream_error" } }),
            Dialect::Simple => json!({ "success": false, "error": message }),
        };
        data_frame(&body)
    }

    fn chat_chunk(&self, delta: serde_json::Value, finish_reason: Option<&str>) -> serde_json::Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }]
        })
    }
}

fn data_frame(body: &serde_json::Value) -> Bytes {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(body.to_string().as_bytes());
    out.extend_from_slice(b"\n\n");
    Bytes::from(out)
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
