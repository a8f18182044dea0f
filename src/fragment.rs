//! Partial replies produced by a streaming backend.
//!
//! Ollama client versions disagree on where the text of a chunk lives, so the
//! text is located by trying a fixed list of extractors in order and falling
//! back to the whole value.

use std::borrow::Cow;

use serde_json::Value;

type Extractor = fn(&Value) -> Option<&Value>;

/// Tried in order; the first one that finds a non-null value wins.
const EXTRACTORS: &[Extractor] = &[message_content, flat_content];

fn message_content(value: &Value) -> Option<&Value> {
    value.get("message")?.get("content")
}

fn flat_content(value: &Value) -> Option<&Value> {
    value.get("content")
}

fn coerce(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(text) => Cow::Borrowed(text.as_str()),
        Value::Null => Cow::Borrowed(""),
        other => Cow::Owned(other.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fragment(Value);

impl Fragment {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// A fragment that is nothing but text, as produced by the CLI backend.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self(Value::String(text.into()))
    }

    /// The error reported in place of content, if any.
    ///
    /// Null, `false` and blank strings mean no error.
    pub fn error(&self) -> Option<String> {
        match self.0.get("error")? {
            Value::Null | Value::Bool(false) => None,
            Value::String(message) if message.trim().is_empty() => None,
            Value::String(message) => Some(message.clone()),
            other => Some(other.to_string()),
        }
    }

    /// The incremental text carried by this fragment, untrimmed.
    pub fn text(&self) -> Cow<'_, str> {
        EXTRACTORS
            .iter()
            .find_map(|extract| extract(&self.0).filter(|value| !value.is_null()))
            .map(coerce)
            .unwrap_or_else(|| coerce(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_message_content_preferred() {
        let fragment = Fragment::new(json!({
            "message": {"role": "assistant", "content": "He"},
            "content": "ignored",
        }));
        assert_eq!(fragment.text(), "He");
    }

    #[test]
    fn test_flat_content_used_when_message_missing() {
        let fragment = Fragment::new(json!({"content": " world"}));
        assert_eq!(fragment.text(), " world");
    }

    #[test]
    fn test_null_nested_content_falls_through() {
        let fragment = Fragment::new(json!({"message": {"content": null}, "content": "llo"}));
        assert_eq!(fragment.text(), "llo");
    }

    #[test]
    fn test_whitespace_is_preserved() {
        let fragment = Fragment::new(json!({"message": {"content": "  \n"}}));
        assert_eq!(fragment.text(), "  \n");
    }

    #[test]
    fn test_unknown_shape_coerced_to_text() {
        let fragment = Fragment::new(json!({"response": "x"}));
        assert_eq!(fragment.text(), r#"{"response":"x"}"#);

        let fragment = Fragment::from_text("plain line\n");
        assert_eq!(fragment.text(), "plain line\n");
    }

    #[test]
    fn test_error_field_detected() {
        let fragment = Fragment::new(json!({"error": "model 'nope' not found"}));
        assert_eq!(fragment.error().as_deref(), Some("model 'nope' not found"));

        let fragment = Fragment::new(json!({"message": {"content": "ok"}}));
        assert_eq!(fragment.error(), None);

        let fragment = Fragment::new(json!({"error": true}));
        assert_eq!(fragment.error().as_deref(), Some("true"));
    }

    #[test]
    fn test_falsy_error_field_is_not_an_error() {
        for error in [json!(null), json!(""), json!("  "), json!(false)] {
            let fragment = Fragment::new(json!({"message": {"content": "ok"}, "error": error}));
            assert_eq!(fragment.error(), None, "error field {}", fragment.0["error"]);
            assert_eq!(fragment.text(), "ok");
        }
    }
}
