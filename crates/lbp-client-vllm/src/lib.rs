// SPDX-License-Identifier: MIT OR Apache-2.0
//! LLM client for `BackendKind::SelfHostedOpenAiCompatible` backends
//!: the OpenAI Chat Completions wire shape, self-hosted.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use futures::StreamExt;
use lbp_clients::{
    resolve_finish_reason, sse_data_frames, validate_chat_turns, ChatClient, ModelManagementClient,
    PromptClient, RemoteModel, StreamClient, TokenStream,
};
use lbp_core::{ChatMessage, FinishReason, Role};
use lbp_error::{ErrorCode, LbpError};
use serde::{Deserialize, Serialize};

/// A client speaking the OpenAI Chat Completions shape against a
/// self-hosted, OpenAI-compatible server (vLLM, TGI, etc).
pub struct VllmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl VllmClient {
    /// Construct a client bound to `base_url` and `model`.
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
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
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
impl ChatClient for VllmClient {
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
impl PromptClient for VllmClient {
    async fn prompt(&self, input: &str) -> Result<String, LbpError> {
        let resp = self
            .client
            .post(self.url("/v1/completions"))
            .json(&CompletionRequest {
                model: &self.model,
                prompt: input,
                stream: false,
            })
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let body: CompletionResponse = resp.json().await.map_err(map_decode_err)?;
        let choice = body.choices.into_iter().next().ok_or_else(|| {
            LbpError::new(ErrorCode::UpstreamInvalidResponse, "no choices in response")
        })?;
        resolve_finish_reason(
            map_finish_reason(choice.finish_reason.as_deref()),
            choice.text.is_empty(),
        )?;
        Ok(choice.text)
    }
}

#[async_trait]
impl StreamClient for VllmClient {
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

#[async_trait]
impl ModelManagementClient for VllmClient {
    async fn list_models(&self) -> Result<Vec<RemoteModel>, LbpError> {
        let resp = self
            .client
            .get(self.url("/v1/models"))
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let body: ModelsResponse = resp.json().await.map_err(map_decode_err)?;
        Ok(body
            .data
            .into_iter()
            .map(|m| RemoteModel {
                name: m.id,
                digest: None,
                bytes: None,
            })
            .collect())
    }

    async fn pull_model(&self, _name: &str) -> Result<(), LbpError> {
        Ok(())
    }

    async fn delete_model(&self, _name: &str) -> Result<(), LbpError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: String) -> VllmClient {
        VllmClient::new(reqwest::Client::new(), base_url, "meta-llama/Llama-3.1-8B".to_string())
    }

    #[tokio::test]
    async fn chat_returns_assistant_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
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
    async fn prompt_maps_length_to_token_limit_reached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"text": "partial output", "finish_reason": "length"}],
            })))
            .mount(&server)
            .await;

        let err = client(server.uri()).prompt("go on").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::TokenLimitReached);
    }

    #[tokio::test]
    async fn list_models_parses_openai_shape() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "meta-llama/Llama-3.1-8B", "object": "model"}],
            })))
            .mount(&server)
            .await;

        let models = client(server.uri()).list_models().await.unwrap();
        assert_eq!(models[0].name, "meta-llama/Llama-3.1-8B");
    }

    #[tokio::test]
    async fn pull_and_delete_are_no_ops() {
        let c = client("http://unused".into());
        c.pull_model("whatever").await.unwrap();
        c.delete_model("whatever").await.unwrap();
    }

    #[tokio::test]
    async fn empty_choices_surfaces_as_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [],
            })))
            .mount(&server)
            .await;

        let err = client(server.uri())
            .chat(&[ChatMessage::new(Role::User, "hello")])
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UpstreamInvalidResponse);
    }
}
