//! Model backends.
//!
//! Both transports implement [`ModelBackend`]; which one is used is decided
//! once at startup from [`Settings`].

pub mod cli;
pub mod http;

use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::ChatError;
use crate::fragment::Fragment;
use crate::transcript::Turn;

pub use cli::CliBackend;
pub use http::HttpBackend;

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment, ChatError>> + Send + 'static>>;

/// What gets sent to a backend: the model and the ordered context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<Turn>,
}

impl ModelRequest {
    /// Build a request, leading with a system turn when `system_prompt` has text.
    pub fn new<'a>(
        model: &str,
        system_prompt: Option<&str>,
        history: impl IntoIterator<Item = &'a Turn>,
    ) -> Self {
        let mut messages = Vec::new();
        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            messages.push(Turn::system(prompt));
        }
        messages.extend(history.into_iter().cloned());

        Self {
            model: model.to_string(),
            messages,
        }
    }
}

/// A way of reaching the model.
///
/// `complete` returns one reply; `stream` returns the reply piece by piece.
/// Futures and streams are boxed so backends can be held as `dyn ModelBackend`.
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    fn complete<'a>(&'a self, request: &'a ModelRequest) -> BoxFuture<'a, Result<String, ChatError>>;

    fn stream(&self, request: ModelRequest) -> FragmentStream;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Ollama HTTP API
    #[default]
    Http,
    /// The `ollama run` command
    Cli,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Http => "http",
            BackendKind::Cli => "cli",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "http" | "api" | "lib" | "library" => Some(BackendKind::Http),
            "cli" | "process" | "command" => Some(BackendKind::Cli),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            BackendKind::Http => "Ollama API",
            BackendKind::Cli => "ollama run",
        }
    }
}

pub fn from_settings(settings: &Settings) -> Arc<dyn ModelBackend> {
    match settings.backend {
        BackendKind::Http => Arc::new(HttpBackend::new(&settings.host)),
        BackendKind::Cli => Arc::new(CliBackend::new(&settings.ollama_bin)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_leads_with_system_turn() {
        let history = vec![Turn::user("Hi"), Turn::assistant("Hello")];
        let request = ModelRequest::new("llama3.2", Some("Be brief."), &history);

        assert_eq!(request.model, "llama3.2");
        assert_eq!(
            request.messages,
            vec![Turn::system("Be brief."), Turn::user("Hi"), Turn::assistant("Hello")]
        );
    }

    #[test]
    fn test_blank_system_prompt_is_skipped() {
        let history = vec![Turn::user("Hi")];
        let request = ModelRequest::new("llama3.2", Some("   "), &history);
        assert_eq!(request.messages, vec![Turn::user("Hi")]);

        let request = ModelRequest::new("llama3.2", None, &history);
        assert_eq!(request.messages.len(), 1);
    }

    #[test]
    fn test_backend_kind_names() {
        assert_eq!(BackendKind::from_name("CLI"), Some(BackendKind::Cli));
        assert_eq!(BackendKind::from_name(" http "), Some(BackendKind::Http));
        assert_eq!(BackendKind::from_name("grpc"), None);
        assert_eq!(BackendKind::default().as_str(), "http");
    }
}
