//! Turns a user message into a sequence of transcript snapshots.
//!
//! [`ResponseAssembler::handle_user_message`] appends the user turn and an
//! empty assistant placeholder, asks the backend for a reply and fills the
//! placeholder in, yielding a snapshot after every visible change. Backend
//! failures never escape: they become an assistant turn starting with
//! [`ERROR_MARKER`](crate::error::ERROR_MARKER).

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::{ModelBackend, ModelRequest};
use crate::error::ChatError;
use crate::transcript::{Role, Transcript, Turn};

/// Read-only copy of the transcript handed to renderers.
pub type Snapshot = Vec<Turn>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyMode {
    /// One call, one complete reply.
    Atomic,
    /// Fragments are folded into the reply as they arrive.
    #[default]
    Streaming,
}

impl ReplyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyMode::Atomic => "atomic",
            ReplyMode::Streaming => "streaming",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssemblerOptions {
    pub system_prompt: Option<String>,
    pub mode: ReplyMode,
    /// Bounds atomic calls only; streams run until the backend ends them.
    pub timeout: Duration,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            mode: ReplyMode::default(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Reject blank input before it reaches the assembler.
pub fn validate_input(text: &str) -> Result<&str, ChatError> {
    if text.trim().is_empty() {
        Err(ChatError::EmptyInput)
    } else {
        Ok(text)
    }
}

#[derive(Clone)]
pub struct ResponseAssembler {
    transcript: Arc<Mutex<Transcript>>,
    backend: Arc<dyn ModelBackend>,
    options: Arc<AssemblerOptions>,
}

impl ResponseAssembler {
    pub fn new(transcript: Transcript, backend: Arc<dyn ModelBackend>, options: AssemblerOptions) -> Self {
        Self {
            transcript: Arc::new(Mutex::new(transcript)),
            backend,
            options: Arc::new(options),
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.transcript.lock().await.snapshot()
    }

    /// Clear unless a reply is being assembled. Returns whether it cleared.
    pub fn try_clear(&self) -> bool {
        match self.transcript.try_lock() {
            Ok(mut transcript) => {
                transcript.clear();
                true
            }
            Err(_) => false,
        }
    }

    /// Run one exchange and yield a snapshot after each change.
    ///
    /// The transcript stays locked for the whole exchange, so messages sent
    /// concurrently are handled one after another. The only `Err` item is
    /// [`ChatError::InvalidState`], which indicates a bug here.
    pub fn handle_user_message(
        &self,
        text: &str,
        model: &str,
    ) -> impl Stream<Item = Result<Snapshot, ChatError>> + Send + 'static {
        let this = self.clone();
        let text = text.to_string();
        let model = model.to_string();

        async_stream::stream! {
            if validate_input(&text).is_err() {
                debug!("ignoring blank message");
                return;
            }

            let mut transcript = this.transcript.clone().lock_owned().await;
            transcript.append(Role::User, text);
            transcript.append(Role::Assistant, "");
            yield Ok(transcript.snapshot());

            let request = this.build_request(&model, &transcript);
            info!(
                backend = this.backend.name(),
                model = %model,
                mode = this.options.mode.as_str(),
                context_turns = request.messages.len(),
                "dispatching model request"
            );

            match this.options.mode {
                ReplyMode::Atomic => {
                    let content = match this.complete(&request).await {
                        Ok(reply) => reply.trim().to_string(),
                        Err(e) => {
                            warn!(error = %e, "model request failed");
                            e.to_turn_text()
                        }
                    };
                    if let Err(e) = transcript.update_last(content) {
                        error!(error = %e, "assistant placeholder missing");
                        yield Err(e);
                        return;
                    }
                    yield Ok(transcript.snapshot());
                }
                ReplyMode::Streaming => {
                    let mut fragments = this.backend.stream(request);
                    let mut accumulated = String::new();
                    let mut received = 0usize;
                    let mut failure = None;

                    while let Some(item) = fragments.next().await {
                        let fragment = match item {
                            Ok(fragment) => fragment,
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        };
                        if let Some(message) = fragment.error() {
                            failure = Some(ChatError::BackendInvocation(message));
                            break;
                        }

                        received += 1;
                        accumulated.push_str(&fragment.text());
                        if let Err(e) = transcript.update_last(accumulated.clone()) {
                            error!(error = %e, "assistant placeholder missing");
                            yield Err(e);
                            return;
                        }
                        yield Ok(transcript.snapshot());
                    }

                    if let Some(e) = failure {
                        warn!(error = %e, fragments = received, "model stream failed");
                        if let Err(e) = transcript.update_last(e.to_turn_text()) {
                            error!(error = %e, "assistant placeholder missing");
                            yield Err(e);
                            return;
                        }
                        yield Ok(transcript.snapshot());
                        return;
                    }

                    debug!(fragments = received, chars = accumulated.len(), "model stream finished");
                    yield Ok(transcript.snapshot());
                }
            }
        }
    }

    /// Context is everything before the placeholder, led by the system prompt.
    fn build_request(&self, model: &str, transcript: &Transcript) -> ModelRequest {
        let history = transcript.len().saturating_sub(1);
        ModelRequest::new(
            model,
            self.options.system_prompt.as_deref(),
            transcript.iter().take(history),
        )
    }

    async fn complete(&self, request: &ModelRequest) -> Result<String, ChatError> {
        match tokio::time::timeout(self.options.timeout, self.backend.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(ChatError::BackendTimeout(self.options.timeout)),
        }
    }
}
