// SPDX-License-Identifier: MIT OR Apache-2.0
//! LLM client for `BackendKind::CloudB`: the OpenAI Chat
//! Completions and Embeddings APIs.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use futures::StreamExt;
use lbp_clients::{
    resolve_finish_reason, sse_data_frames, validate_chat_turns, ChatClient, EmbedClient,
    PromptClient, StreamClient, TokenStream,
};
use lbp_core::{ChatMessage, FinishReason, Role};
use lbp_error::{ErrorCode, LbpError};
use serde::{Deserialize, Serialize};

/// A client speaking the OpenAI Chat Completions and Embeddings APIs.
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    embedding_model: String,
}

impl OpenAiClient {
    /// Construct a client bound to `base_url` (normally
    /// `https://api.openai.com`), `api_key`, and `model`, using
    /// `embedding_model` for [`EmbedClient::embed`].
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        embedding_model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            embedding_model: embedding_model.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
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

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some(_) => FinishReason::Other,
        None => FinishReason::Stop,
    }
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: WireMessageOwned,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessageOwned {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingEntry>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingEntry {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ChatClient for OpenAiClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatMessage, LbpError> {
        validate_chat_turns(messages)?;
        let wire = messages
            .iter()
            .map(|m| WireMessage {
                role: role_str(m.role),
                content: &m.content,
            })
            .collect();
        let resp = self
            .client
            .post(self.url("/v1/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model,
                messages: wire,
                stream: false,
            })
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let body: ChatResponse = resp.json().await.map_err(map_decode_err)?;
        let choice = body.choices.into_iter().next().ok_or_else(|| {
            LbpError::new(ErrorCode::UpstreamInvalidResponse, "no choices in response")
        })?;
        let content = choice.message.content;
        resolve_finish_reason(
            map_finish_reason(choice.finish_reason.as_deref()),
            content.is_empty(),
        )?;
        Ok(ChatMessage::new(Role::Assistant, content))
    }
}

#[async_trait]
impl PromptClient for OpenAiClient {
    async fn prompt(&self, input: &str) -> Result<String, LbpError> {
        let reply = self.chat(&[ChatMessage::new(Role::User, input)]).await?;
        Ok(reply.content)
    }
}

#[async_trait]
impl EmbedClient for OpenAiClient {
    async fn embed(&self, input: &str) -> Result<Vec<f32>, LbpError> {
        let resp = self
            .client
            .post(self.url("/v1/embeddings"))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingsRequest {
                model: &self.embedding_model,
                input,
            })
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let body: EmbeddingsResponse = resp.json().await.map_err(map_decode_err)?;
        let entry = body.data.into_iter().next().ok_or_else(|| {
            LbpError::new(ErrorCode::UpstreamInvalidResponse, "no embedding in response")
        })?;
        Ok(entry.embedding)
    }
}

#[async_trait]
impl StreamClient for OpenAiClient {
    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, LbpError> {
        validate_chat_turns(messages)?;
        let wire = messages
            .iter()
            .map(|m| WireMessage {
                role: role_str(m.role),
                content: &m.content,
            })
            .collect();
        let resp = self
            .client
            .post(self.url("/v1/chat/completions"))
            .bearer_auth(&self.api_key)
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
        let frames = sse_data_frames(byte_stream);
        let tokens = frames.map(|frame| {
            let frame = frame?;
            if frame == "[DONE]" {
                return Ok(String::new());
            }
            let parsed: ChatStreamChunk = serde_json::from_str(&frame)
                .map_err(|e| LbpError::new(ErrorCode::UpstreamInvalidResponse, e.to_string()))?;
            let Some(choice) = parsed.choices.into_iter().next() else {
                return Ok(String::new());
            };
            if let Some(reason) = choice.finish_reason.as_deref() {
                resolve_finish_reason(map_finish_reason(Some(reason)), false)?;
            }
            Ok(choice.delta.content.unwrap_or_default())
        });
        Ok(Box::pin(tokens.filter(|r| {
            let keep = !matches!(r, Ok(s) if s.is_empty());
            async move { keep }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: String) -> OpenAiClient {
        OpenAiClient::new(
            reqwest::Client::new(),
            base_url,
            "sk-test",
            "gpt-4o",
            "text-embedding-3-small",
        )
    }

    #[tokio::test]
    async fn chat_sends_bearer_auth_and_returns_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            })))
            .mount(&server)
            .await;

        let reply = client(server.uri())
            .chat(&[ChatMessage::new(Role::User, "hello")])
            .await
            .unwrap();
        assert_eq!(reply.content, "hi");
    }

    #[tokio::test]
    async fn content_filter_finish_reason_maps_to_content_filtered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": ""}, "finish_reason": "content_filter"}],
            })))
            .mount(&server)
            .await;

        let err = client(server.uri())
            .chat(&[ChatMessage::new(Role::User, "hello")])
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ContentFiltered);
    }

    #[tokio::test]
    async fn embed_returns_first_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.1, 0.2], "index": 0}],
            })))
            .mount(&server)
            .await;

        let v = client(server.uri()).embed("hello").await.unwrap();
        assert_eq!(v, vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn prompt_wraps_a_single_user_turn_chat_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "answer"}, "finish_reason": "stop"}],
            })))
            .mount(&server)
            .await;

        let out = client(server.uri()).prompt("question").await.unwrap();
        assert_eq!(out, "answer");
    }
}
