use std::time::Duration;
use thiserror::Error;

/// Prefix that marks an assistant turn as a failed reply.
pub const ERROR_MARKER: &str = "[Error]";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// The `ollama` executable or the HTTP service could not be reached at all.
    #[error("model backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend ran but reported a failure.
    #[error("model backend failed: {0}")]
    BackendInvocation(String),

    #[error("model backend timed out after {0:?}")]
    BackendTimeout(Duration),

    /// Contract violation inside the transcript; never caused by user input.
    #[error("invalid transcript state: {0}")]
    InvalidState(&'static str),

    #[error("message is empty")]
    EmptyInput,
}

impl ChatError {
    /// Render as the content of an assistant turn.
    pub fn to_turn_text(&self) -> String {
        format!("{} {}", ERROR_MARKER, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_text_carries_marker() {
        let err = ChatError::BackendUnavailable("executable 'ollama' not found".to_string());
        let text = err.to_turn_text();
        assert!(text.starts_with(ERROR_MARKER));
        assert!(text.contains("not found"));
    }

    #[test]
    fn test_timeout_message_names_duration() {
        let text = ChatError::BackendTimeout(Duration::from_secs(60)).to_turn_text();
        assert_eq!(text, "[Error] model backend timed out after 60s");
    }
}
