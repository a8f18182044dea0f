use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{FragmentStream, ModelBackend, ModelRequest};
use crate::error::ChatError;
use crate::fragment::Fragment;
use crate::transcript::Turn;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

#[derive(Deserialize)]
struct OllamaModelsResponse {
    models: Vec<OllamaModel>,
}

/// Client for the Ollama HTTP API (`/api/chat`, `/api/tags`).
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_chat(&self, request: &ModelRequest, stream: bool) -> Result<reqwest::Response, ChatError> {
        let url = format!("{}/api/chat", self.base_url);
        debug!(%url, model = %request.model, stream, "posting chat request");

        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            stream,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ChatError::BackendInvocation(format!(
                "Ollama request failed with status {}: {}",
                status,
                error_detail(&text)
            )));
        }

        Ok(response)
    }

    pub async fn chat(&self, request: &ModelRequest) -> Result<String, ChatError> {
        let response = self.post_chat(request, false).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| ChatError::BackendInvocation(format!("invalid reply from Ollama: {}", e)))?;

        let fragment = Fragment::new(value);
        if let Some(message) = fragment.error() {
            return Err(ChatError::BackendInvocation(message));
        }
        Ok(fragment.text().trim().to_string())
    }

    pub async fn list_models(&self) -> Result<Vec<String>, ChatError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            return Err(ChatError::BackendInvocation(format!(
                "failed to list models: {}",
                response.status()
            )));
        }

        let models_response: OllamaModelsResponse = response
            .json()
            .await
            .map_err(|e| ChatError::BackendInvocation(format!("invalid model list: {}", e)))?;

        Ok(models_response
            .models
            .into_iter()
            .map(|model| model.name)
            .collect())
    }

    fn request_error(&self, err: reqwest::Error) -> ChatError {
        if err.is_connect() {
            ChatError::BackendUnavailable(format!(
                "cannot reach Ollama at {}. Make sure Ollama is running with: ollama serve",
                self.base_url
            ))
        } else {
            ChatError::BackendInvocation(format!("request to Ollama failed: {}", err))
        }
    }
}

impl ModelBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    fn complete<'a>(&'a self, request: &'a ModelRequest) -> BoxFuture<'a, Result<String, ChatError>> {
        Box::pin(self.chat(request))
    }

    fn stream(&self, request: ModelRequest) -> FragmentStream {
        let backend = self.clone();

        Box::pin(async_stream::stream! {
            let response = match backend.post_chat(&request, true).await {
                Ok(response) => response,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut body = response.bytes_stream();
            let mut decoder = NdjsonDecoder::default();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(ChatError::BackendInvocation(format!("reply stream interrupted: {}", e)));
                        return;
                    }
                };
                for item in decoder.push(&chunk) {
                    yield item.map(Fragment::new);
                }
            }
            if let Some(item) = decoder.finish() {
                yield item.map(Fragment::new);
            }
        })
    }
}

/// Splits a byte stream of newline-delimited JSON into values.
///
/// Chunk boundaries from the network don't line up with lines, so partial
/// lines are buffered until their newline arrives.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Value, ChatError>> {
        self.buffer.extend_from_slice(chunk);

        let mut values = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(value) = parse_line(&line) {
                values.push(value);
            }
        }
        values
    }

    /// Whatever is left once the body ends without a trailing newline.
    pub fn finish(&mut self) -> Option<Result<Value, ChatError>> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> Option<Result<Value, ChatError>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(serde_json::from_slice(line).map_err(|e| {
        ChatError::BackendInvocation(format!("malformed stream chunk: {}", e))
    }))
}

/// Pull `error` out of an Ollama error body, else return the body as-is.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decoder_joins_split_lines() {
        let mut decoder = NdjsonDecoder::default();

        let first = decoder.push(br#"{"message":{"content":"He"}}
{"message":{"con"#);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].as_ref().unwrap(), &json!({"message": {"content": "He"}}));

        let second = decoder.push(b"tent\":\"llo\"}}\n\n");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].as_ref().unwrap(), &json!({"message": {"content": "llo"}}));

        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_decoder_flushes_unterminated_tail() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.push(br#"{"done":true}"#).is_empty());

        let tail = decoder.finish().unwrap().unwrap();
        assert_eq!(tail, json!({"done": true}));
    }

    #[test]
    fn test_decoder_reports_malformed_line() {
        let mut decoder = NdjsonDecoder::default();
        let values = decoder.push(b"not json\n");
        assert!(matches!(values[0], Err(ChatError::BackendInvocation(_))));
    }

    #[test]
    fn test_error_detail_extracts_message() {
        assert_eq!(error_detail(r#"{"error":"model not found"}"#), "model not found");
        assert_eq!(error_detail(" bad gateway \n"), "bad gateway");
    }

    #[test]
    fn test_chat_request_shape() {
        let messages = vec![Turn::system("Be brief."), Turn::user("Hi")];
        let body = ChatRequest {
            model: "llama3.2",
            messages: &messages,
            stream: true,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "model": "llama3.2",
                "messages": [
                    {"role": "system", "content": "Be brief."},
                    {"role": "user", "content": "Hi"}
                ],
                "stream": true
            })
        );
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let backend = HttpBackend::new("http://localhost:11434/");
        assert_eq!(backend.base_url(), "http://localhost:11434");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        // Port 9 (discard) is closed on test machines; the connect is refused.
        let backend = HttpBackend::new("http://127.0.0.1:9");
        let request = ModelRequest::new("llama3.2", None, &[Turn::user("Hi")]);

        let result = backend.complete(&request).await;
        assert!(matches!(result, Err(ChatError::BackendUnavailable(_))));
    }
}
