// SPDX-License-Identifier: MIT OR Apache-2.0
//! LLM client for `BackendKind::SelfHostedGeneric` backends:
//! an Ollama-shaped HTTP API.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lbp_clients::{
    resolve_finish_reason, validate_chat_turns, ChatClient, EmbedClient, ModelManagementClient,
    PromptClient, RemoteModel, StreamClient, TokenStream,
};
use lbp_core::{ChatMessage, FinishReason, Role};
use lbp_error::{ErrorCode, LbpError};
use serde::{Deserialize, Serialize};

/// A client speaking the Ollama-shaped API at one base URL, bound to one
/// model name.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    /// Construct a client bound to `base_url` (e.g. `http://localhost:11434`)
    /// and `model` (e.g. `"llama3.1:8b"`).
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant | Role::Model => "assistant",
    }
}

fn map_reqwest_err(e: reqwest::Error) -> LbpError {
    if e.is_timeout() {
        LbpError::new(ErrorCode::UpstreamTimeout, e.to_string())
    } else {
        LbpError::new(ErrorCode::UpstreamUnavailable, e.to_string())
    }
}

fn map_decode_err(e: reqwest::Error) -> LbpError {
    LbpError::new(ErrorCode::UpstreamInvalidResponse, e.to_string())
}

// -- /api/tags ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

// -- /api/pull, /api/delete ---------------------------------------------------

#[derive(Debug, Serialize)]
struct NameRequest<'a> {
    name: &'a str,
    stream: bool,
}

// -- /api/chat -----------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: WireMessageOwned,
    #[serde(default)]
    done_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessageOwned {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatStreamLine {
    #[serde(default)]
    message: Option<WireMessageOwned>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
}

// -- /api/generate ---------------------------------------------------------

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    done_reason: Option<String>,
}

// -- /api/embeddings ---------------------------------------------------------

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

fn map_done_reason(done_reason: Option<&str>) -> FinishReason {
    match done_reason {
        Some("stop") | None => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some(_) => FinishReason::Other,
    }
}

#[async_trait]
impl ChatClient for OllamaClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatMessage, LbpError> {
        validate_chat_turns(messages)?;
        let wire: Vec<WireMessage<'_>> = messages
            .iter()
            .map(|m| WireMessage {
                role: role_str(m.role),
                content: &m.content,
            })
            .collect();
        let resp = self
            .client
            .post(self.url("/api/chat"))
            .json(&ChatRequest {
                model: &self.model,
                messages: wire,
                stream: false,
            })
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let body: ChatResponse = resp.json().await.map_err(map_decode_err)?;
        let content = body.message.content;
        resolve_finish_reason(
            map_done_reason(body.done_reason.as_deref()),
            content.is_empty(),
        )?;
        Ok(ChatMessage::new(Role::Assistant, content))
    }
}

#[async_trait]
impl PromptClient for OllamaClient {
    async fn prompt(&self, input: &str) -> Result<String, LbpError> {
        let resp = self
            .client
            .post(self.url("/api/generate"))
            .json(&GenerateRequest {
                model: &self.model,
                prompt: input,
                stream: false,
            })
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let body: GenerateResponse = resp.json().await.map_err(map_decode_err)?;
        resolve_finish_reason(
            map_done_reason(body.done_reason.as_deref()),
            body.response.is_empty(),
        )?;
        Ok(body.response)
    }
}

#[async_trait]
impl EmbedClient for OllamaClient {
    async fn embed(&self, input: &str) -> Result<Vec<f32>, LbpError> {
        let resp = self
            .client
            .post(self.url("/api/embeddings"))
            .json(&EmbeddingsRequest {
                model: &self.model,
                prompt: input,
            })
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let body: EmbeddingsResponse = resp.json().await.map_err(map_decode_err)?;
        Ok(body.embedding)
    }
}

#[async_trait]
impl StreamClient for OllamaClient {
    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, LbpError> {
        validate_chat_turns(messages)?;
        let wire: Vec<WireMessage<'_>> = messages
            .iter()
            .map(|m| WireMessage {
                role: role_str(m.role),
                content: &m.content,
            })
            .collect();
        let resp = self
            .client
            .post(self.url("/api/chat"))
            .json(&ChatRequest {
                model: &self.model,
                messages: wire,
                stream: true,
            })
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let byte_stream = resp
            .bytes_stream()
            .map(|r| r.map(|b| b.to_vec()).map_err(map_reqwest_err));
        let lines = ndjson_lines(byte_stream);
        let chunks = lines.map(|line| {
            let line = line?;
            let parsed: ChatStreamLine = serde_json::from_str(&line)
                .map_err(|e| LbpError::new(ErrorCode::UpstreamInvalidResponse, e.to_string()))?;
            if parsed.done {
                resolve_finish_reason(map_done_reason(parsed.done_reason.as_deref()), false)?;
            }
            Ok(parsed.message.map(|m| m.content).unwrap_or_default())
        });
        Ok(Box::pin(chunks.filter(|r| {
            let keep = !matches!(r, Ok(s) if s.is_empty());
            async move { keep }
        })))
    }
}

#[async_trait]
impl ModelManagementClient for OllamaClient {
    async fn list_models(&self) -> Result<Vec<RemoteModel>, LbpError> {
        let resp = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let body: TagsResponse = resp.json().await.map_err(map_decode_err)?;
        Ok(body
            .models
            .into_iter()
            .map(|m| RemoteModel {
                name: m.name,
                digest: m.digest,
                bytes: m.size,
            })
            .collect())
    }

    async fn pull_model(&self, name: &str) -> Result<(), LbpError> {
        self.client
            .post(self.url("/api/pull"))
            .json(&NameRequest { name, stream: false })
            .send()
            .await
            .map_err(map_reqwest_err)?
            .error_for_status()
            .map_err(map_reqwest_err)?;
        Ok(())
    }

    async fn delete_model(&self, name: &str) -> Result<(), LbpError> {
        let resp = self
            .client
            .delete(self.url("/api/delete"))
            .json(&NameRequest { name, stream: false })
            .send()
            .await
            .map_err(map_reqwest_err)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status().map_err(map_reqwest_err)?;
        Ok(())
    }
}

/// Turn a byte-chunk stream into newline-delimited JSON lines, Ollama's
/// streaming wire format (as opposed to the `data:`-prefixed SSE framing
/// the OpenAI-shaped vendors use).
fn ndjson_lines<S>(byte_stream: S) -> impl Stream<Item = Result<String, LbpError>> + Send
where
    S: Stream<Item = Result<Vec<u8>, LbpError>> + Send + Unpin + 'static,
{
    use futures::stream;

    struct State<S> {
        inner: S,
        buf: Vec<u8>,
        finished: bool,
    }

    stream::unfold(
        State {
            inner: byte_stream,
            buf: Vec::new(),
            finished: false,
        },
        |mut st| async move {
            loop {
                if let Some(pos) = st.buf.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = st.buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return Some((Ok(line.to_string()), st));
                }
                if st.finished {
                    return None;
                }
                match st.inner.next().await {
                    Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e), st)),
                    None => st.finished = true,
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: String) -> OllamaClient {
        OllamaClient::new(reqwest::Client::new(), base_url, "llama3.1:8b".to_string())
    }

    #[tokio::test]
    async fn chat_maps_stop_with_content_to_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "hello there"},
                "done": true,
                "done_reason": "stop",
            })))
            .mount(&server)
            .await;

        let reply = client(server.uri())
            .chat(&[ChatMessage::new(Role::User, "hi")])
            .await
            .unwrap();
        assert_eq!(reply.content, "hello there");
        assert_eq!(reply.role, Role::Assistant);
    }

    #[tokio::test]
    async fn chat_rejects_empty_turn_list() {
        let err = client("http://unused".into()).chat(&[]).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn chat_maps_empty_stop_content_to_unexpected_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": ""},
                "done": true,
                "done_reason": "stop",
            })))
            .mount(&server)
            .await;

        let err = client(server.uri())
            .chat(&[ChatMessage::new(Role::User, "hi")])
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnexpectedCompletion);
    }

    #[tokio::test]
    async fn chat_maps_length_finish_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "partial"},
                "done": true,
                "done_reason": "length",
            })))
            .mount(&server)
            .await;

        let err = client(server.uri())
            .chat(&[ChatMessage::new(Role::User, "hi")])
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TokenLimitReached);
    }

    #[tokio::test]
    async fn list_models_parses_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{"name": "llama3.1:8b", "digest": "sha256:abc", "size": 4_700_000_000u64}],
            })))
            .mount(&server)
            .await;

        let models = client(server.uri()).list_models().await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "llama3.1:8b");
        assert_eq!(models[0].bytes, Some(4_700_000_000));
    }

    #[tokio::test]
    async fn delete_missing_model_is_a_no_op() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/delete"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        client(server.uri()).delete_model("missing:1b").await.unwrap();
    }

    #[tokio::test]
    async fn embed_returns_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embedding": [0.1, 0.2, 0.3],
            })))
            .mount(&server)
            .await;

        let v = client(server.uri()).embed("hello").await.unwrap();
        assert_eq!(v, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn unreachable_backend_surfaces_as_upstream_unavailable() {
        let err = client("http://127.0.0.1:1".into())
            .chat(&[ChatMessage::new(Role::User, "hi")])
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UpstreamUnavailable);
    }
}
