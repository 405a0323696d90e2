// SPDX-License-Identifier: MIT OR Apache-2.0
//! LLM client for `BackendKind::CloudA`: the Anthropic
//! Messages API.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use futures::StreamExt;
use lbp_clients::{
    hoist_leading_system, resolve_finish_reason, sse_data_frames, validate_chat_turns, ChatClient,
    PromptClient, StreamClient, TokenStream,
};
use lbp_core::{ChatMessage, FinishReason, Role};
use lbp_error::{ErrorCode, LbpError};
use serde::{Deserialize, Serialize};

const DEFAULT_MAX_TOKENS: u32 = 4096;
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A client speaking the Anthropic Messages API.
pub struct AnthropicClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicClient {
    /// Construct a client bound to `base_url` (normally
    /// `https://api.anthropic.com`), `api_key`, and `model`.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, req: &MessagesRequest<'_>, stream: bool) -> reqwest::RequestBuilder {
        let req = req.clone_with_stream(stream);
        self.client
            .post(self.url("/v1/messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant | Role::Model => "assistant",
        Role::System => "user",
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

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        None => FinishReason::Stop,
        Some(_) => FinishReason::Other,
    }
}

#[derive(Debug, Clone, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

impl<'a> MessagesRequest<'a> {
    fn clone_with_stream(&self, stream: bool) -> Self {
        Self {
            stream,
            ..self.clone()
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: TextDelta },
    #[serde(rename = "message_delta")]
    MessageDelta { delta: StopDelta },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TextDelta {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct StopDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

fn build_request<'a>(
    system: &'a Option<String>,
    turns: &'a [ChatMessage],
    model: &'a str,
    max_tokens: u32,
) -> MessagesRequest<'a> {
    MessagesRequest {
        model,
        max_tokens,
        system: system.clone(),
        messages: turns
            .iter()
            .map(|m| WireMessage {
                role: role_str(m.role),
                content: &m.content,
            })
            .collect(),
        stream: false,
    }
}

#[async_trait]
impl ChatClient for AnthropicClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatMessage, LbpError> {
        validate_chat_turns(messages)?;
        let (system, turns) = hoist_leading_system(messages);
        let req = build_request(&system, &turns, &self.model, self.max_tokens);
        let resp = self
            .request(&req, false)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let body: MessagesResponse = resp.json().await.map_err(map_decode_err)?;
        let content = body
            .content
            .into_iter()
            .find(|b| b.kind == "text")
            .map(|b| b.text)
            .unwrap_or_default();
        resolve_finish_reason(map_stop_reason(body.stop_reason.as_deref()), content.is_empty())?;
        Ok(ChatMessage::new(Role::Assistant, content))
    }
}

#[async_trait]
impl PromptClient for AnthropicClient {
    async fn prompt(&self, input: &str) -> Result<String, LbpError> {
        let reply = self.chat(&[ChatMessage::new(Role::User, input)]).await?;
        Ok(reply.content)
    }
}

#[async_trait]
impl StreamClient for AnthropicClient {
    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, LbpError> {
        validate_chat_turns(messages)?;
        let (system, turns) = hoist_leading_system(messages);
        let req = build_request(&system, &turns, &self.model, self.max_tokens);
        let resp = self
            .request(&req, true)
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
            let event: StreamEvent = serde_json::from_str(&frame)
                .map_err(|e| LbpError::new(ErrorCode::UpstreamInvalidResponse, e.to_string()))?;
            match event {
                StreamEvent::ContentBlockDelta { delta } => Ok(delta.text),
                StreamEvent::MessageDelta { delta } => {
                    if delta.stop_reason.is_some() {
                        resolve_finish_reason(map_stop_reason(delta.stop_reason.as_deref()), false)?;
                    }
                    Ok(String::new())
                }
                StreamEvent::Other => Ok(String::new()),
            }
        });
        Ok(Box::pin(tokens.filter(|r| {
            let keep = !matches!(r, Ok(s) if s.is_empty());
            async move { keep }
        })))
    }
}
