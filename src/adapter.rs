//! Extraction of the answer text from upstream response payloads.
//!
//! The inference engine has answered in several incompatible layouts over time. Each layout
//! is one [`UpstreamResult`] variant; [`UpstreamResult::classify`] tries them in a fixed
//! order and always succeeds.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamResult {
    /// `{output: [{type: "message", content: [{text}]}]}`
    StructuredMessage(String),
    /// `{result: {response: "..."}}`
    NestedResponse(String),
    /// `{response: "..."}`
    PlainResponse(String),
    /// `{result: "..."}` or a bare JSON string.
    RawString(String),
    /// A payload carrying `error` and no recognizable answer.
    ErrorShape(Value),
    /// Anything else.
    Unrecognized(Value),
}

impl UpstreamResult {
    /// Classify a payload. Structured output wins over every flatter legacy shape.
    pub fn classify(payload: Value) -> Self {
        if let Some(text) = structured_message_text(&payload) {
            return UpstreamResult::StructuredMessage(text);
        }
        if let Some(text) = payload
            .get("result")
            .and_then(|r| r.get("response"))
            .and_then(Value::as_str)
        {
            return UpstreamResult::NestedResponse(text.to_string());
        }
        if let Some(text) = payload.get("response").and_then(Value::as_str) {
            return UpstreamResult::PlainResponse(text.to_string());
        }
        if let Some(text) = payload.get("result").and_then(Value::as_str) {
            return UpstreamResult::RawString(text.to_string());
        }
        match payload {
            Value::String(text) => UpstreamResult::RawString(text),
            other if other.get("error").is_some() => UpstreamResult::ErrorShape(other),
            other => UpstreamResult::Unrecognized(other),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            UpstreamResult::ErrorShape(_) | UpstreamResult::Unrecognized(_)
        )
    }

    pub fn shape(&self) -> &'static str {
        match self {
            UpstreamResult::StructuredMessage(_) => "structured_message",
            UpstreamResult::NestedResponse(_) => "nested_response",
            UpstreamResult::PlainResponse(_) => "plain_response",
            UpstreamResult::RawString(_) => "raw_string",
            UpstreamResult::ErrorShape(_) => "error",
            UpstreamResult::Unrecognized(_) => "unrecognized",
        }
    }

    /// The answer text. Fallback shapes serialize the whole payload.
    pub fn into_text(self) -> String {
        match self {
            UpstreamResult::StructuredMessage(t)
            | UpstreamResult::NestedResponse(t)
            | UpstreamResult::PlainResponse(t)
            | UpstreamResult::RawString(t) => t,
            UpstreamResult::ErrorShape(v) | UpstreamResult::Unrecognized(v) => v.to_string(),
        }
    }
}

/// Classify and extract in one step.
pub fn extract_text(payload: Value) -> String {
    let result = UpstreamResult::classify(payload);
    if result.is_fallback() {
        tracing::warn!(shape = result.shape(), "upstream payload had no recognizable answer");
    }
    result.into_text()
}

fn structured_message_text(payload: &Value) -> Option<String> {
    payload
        .get("output")?
        .as_array()?
        .iter()
        .find(|entry| entry.get("type").and_then(Value::as_str) == Some("message"))?
        .get("content")?
        .as_array()?
        .first()?
        .get("text")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_message_array() {
        let payload = json!({
            "output": [
                {"type": "reasoning", "content": [{"text": "thinking..."}]},
                {"type": "message", "content": [{"type": "output_text", "text": "hello"}, {"text": "ignored"}]}
            ]
        });
        assert_eq!(
            UpstreamResult::classify(payload),
            UpstreamResult::StructuredMessage("hello".into())
        );
    }

    #[test]
    fn nested_result_response() {
        let payload = json!({"result": {"response": "hi"}});
        assert_eq!(extract_text(payload), "hi");
    }

    #[test]
    fn plain_response_field() {
        let payload = json!({"response": "plain", "usage": {"tokens": 3}});
        assert_eq!(
            UpstreamResult::classify(payload),
            UpstreamResult::PlainResponse("plain".into())
        );
    }

    #[test]
    fn raw_string_result() {
        assert_eq!(extract_text(json!({"result": "raw"})), "raw");
        assert_eq!(extract_text(json!("bare")), "bare");
    }

    #[test]
    fn structured_output_takes_priority_over_legacy_fields() {
        let payload = json!({
            "output": [{"type": "message", "content": [{"text": "structured"}]}],
            "result": {"response": "nested"},
            "response": "plain"
        });
        assert_eq!(extract_text(payload), "structured");
    }

    #[test]
    fn output_without_message_falls_through() {
        let payload = json!({
            "output": [{"type": "reasoning", "content": [{"text": "x"}]}],
            "response": "plain"
        });
        assert_eq!(extract_text(payload), "plain");
    }

    #[test]
    fn error_and_unknown_shapes_serialize_payload() {
        let err = UpstreamResult::classify(json!({"error": "overloaded"}));
        assert!(matches!(err, UpstreamResult::ErrorShape(_)));
        assert_eq!(err.into_text(), r#"{"error":"overloaded"}"#);

        let unknown = UpstreamResult::classify(json!({"foo": 1}));
        assert!(unknown.is_fallback());
        assert_eq!(unknown.into_text(), r#"{"foo":1}"#);

        assert_eq!(extract_text(json!(null)), "null");
    }
}
