use std::io;
use std::process::{ExitStatus, Stdio};

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{FragmentStream, ModelBackend, ModelRequest};
use crate::error::ChatError;
use crate::fragment::Fragment;
use crate::transcript::{Role, Turn};

/// Runs `<program> run <model> <prompt>` for every request.
#[derive(Debug, Clone)]
pub struct CliBackend {
    program: String,
}

impl CliBackend {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    fn command(&self, model: &str, prompt: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("run")
            .arg(model)
            .arg(prompt)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    pub async fn run(&self, request: &ModelRequest) -> Result<String, ChatError> {
        let prompt = flatten_prompt(&request.messages);
        debug!(program = %self.program, model = %request.model, "running model command");

        let output = self
            .command(&request.model, &prompt)
            .output()
            .await
            .map_err(|e| launch_error(&self.program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ChatError::BackendInvocation(exit_message(
                output.status,
                stderr.trim(),
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl ModelBackend for CliBackend {
    fn name(&self) -> &str {
        "cli"
    }

    fn complete<'a>(&'a self, request: &'a ModelRequest) -> BoxFuture<'a, Result<String, ChatError>> {
        Box::pin(self.run(request))
    }

    /// Every stdout line, newline included, becomes one fragment.
    fn stream(&self, request: ModelRequest) -> FragmentStream {
        let backend = self.clone();

        Box::pin(async_stream::stream! {
            let prompt = flatten_prompt(&request.messages);
            let mut command = backend.command(&request.model, &prompt);
            command.stdout(Stdio::piped()).stderr(Stdio::piped());

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    yield Err(launch_error(&backend.program, e));
                    return;
                }
            };

            let Some(stdout) = child.stdout.take() else {
                yield Err(ChatError::BackendInvocation("stdout was not captured".to_string()));
                return;
            };

            // Drained on the side so a chatty stderr can't fill its pipe and stall the child.
            let stderr = child.stderr.take();
            let stderr_task = tokio::spawn(async move {
                let mut text = String::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_string(&mut text).await;
                }
                text
            });

            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        yield Ok(Fragment::from_text(line.clone()));
                    }
                    Err(e) => {
                        yield Err(ChatError::BackendInvocation(format!("failed to read model output: {}", e)));
                        return;
                    }
                }
            }

            let stderr_text = stderr_task.await.unwrap_or_default();
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    yield Err(ChatError::BackendInvocation(exit_message(status, stderr_text.trim())));
                }
                Err(e) => {
                    yield Err(ChatError::BackendInvocation(format!("failed to wait for '{}': {}", backend.program, e)));
                }
            }
        })
    }
}

/// Collapse the context into the single prompt argument `ollama run` accepts.
pub fn flatten_prompt(messages: &[Turn]) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(messages.len() + 1);

    for turn in messages {
        match turn.role() {
            Role::System => parts.push(turn.content().trim().to_string()),
            Role::User => parts.push(format!("User: {}", turn.content())),
            Role::Assistant => parts.push(format!("Assistant: {}", turn.content())),
        }
    }

    parts.push("Assistant:".to_string());
    parts.join("\n")
}

fn launch_error(program: &str, err: io::Error) -> ChatError {
    if err.kind() == io::ErrorKind::NotFound {
        ChatError::BackendUnavailable(format!(
            "command '{}' not found. Make sure Ollama is installed and in PATH",
            program
        ))
    } else {
        ChatError::BackendInvocation(format!("failed to launch '{}': {}", program, err))
    }
}

fn exit_message(status: ExitStatus, stderr: &str) -> String {
    if stderr.is_empty() {
        format!("ollama exited with {}", status)
    } else {
        format!("ollama exited with {}: {}", status, stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn request(text: &str) -> ModelRequest {
        ModelRequest::new("llama3.2", None, &[Turn::user(text)])
    }

    #[test]
    fn test_flatten_prompt_layout() {
        let messages = vec![
            Turn::system("  You are terse. "),
            Turn::user("Hi"),
            Turn::assistant("Hello"),
            Turn::user("Bye"),
        ];
        assert_eq!(
            flatten_prompt(&messages),
            "You are terse.\nUser: Hi\nAssistant: Hello\nUser: Bye\nAssistant:"
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let backend = CliBackend::new("ollama-chat-test-no-such-binary");
        let result = backend.complete(&request("Hi")).await;
        assert!(matches!(result, Err(ChatError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_missing_program_streams_single_error() {
        let backend = CliBackend::new("ollama-chat-test-no-such-binary");
        let items: Vec<_> = backend.stream(request("Hi")).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ChatError::BackendUnavailable(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdout_is_trimmed_reply() {
        // `echo run <model> <prompt>` stands in for the real binary.
        let backend = CliBackend::new("echo");
        let reply = backend.complete(&request("Hi")).await.unwrap();
        assert_eq!(reply, "run llama3.2 User: Hi\nAssistant:");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_invocation_failure() {
        let backend = CliBackend::new("false");
        let result = backend.complete(&request("Hi")).await;
        assert!(matches!(result, Err(ChatError::BackendInvocation(_))));

        let items: Vec<_> = backend.stream(request("Hi")).collect().await;
        assert!(matches!(items.last(), Some(Err(ChatError::BackendInvocation(_)))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stream_yields_lines_verbatim() {
        let backend = CliBackend::new("echo");
        let items: Vec<_> = backend.stream(request("Hi")).collect().await;
        let text: String = items
            .into_iter()
            .map(|item| item.unwrap().text().into_owned())
            .collect();
        assert_eq!(text, "run llama3.2 User: Hi\nAssistant:\n");
    }
}
