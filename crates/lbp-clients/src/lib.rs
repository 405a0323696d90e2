// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared LLM client capability surface.
//!
//! Capability is invariant; only request/response shapes vary by vendor.
//! This crate defines that invariant surface — the four capability traits, the
//! finish-reason mapping every vendor's chat/prompt response is normalized
//! through, and chat-turn validation — so that `lbp-client-ollama`,
//! `lbp-client-vllm`, `lbp-client-anthropic`, and `lbp-client-openai` differ
//! only in wire format, never in contract.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use futures_core::Stream;
use lbp_core::{ChatMessage, FinishReason};
use lbp_error::{ErrorCode, LbpError};
use std::pin::Pin;

/// A boxed, owned stream of text chunks or errors, as returned by
/// [`StreamClient::stream`].
///
/// Per "a lazy sequence of chunks (or an error) terminated by
/// a vendor-specific end marker; restartable only by issuing a new call" —
/// there is no seek/replay, only `Stream::next`.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LbpError>> + Send>>;

/// Multi-turn chat completion.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Complete a chat turn. `messages` must satisfy
    /// [`validate_chat_turns`]; implementations validate before sending.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatMessage, LbpError>;
}

/// Single-string prompt completion.
#[async_trait]
pub trait PromptClient: Send + Sync {
    /// Complete a single prompt string.
    async fn prompt(&self, input: &str) -> Result<String, LbpError>;
}

/// Text embedding.
#[async_trait]
pub trait EmbedClient: Send + Sync {
    /// Embed `input` into a dense vector.
    async fn embed(&self, input: &str) -> Result<Vec<f32>, LbpError>;
}

/// Streamed token generation.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Start a streamed completion over `messages`.
    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, LbpError>;
}

/// One remote model as reported by a self-hosted backend's listing
/// endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteModel {
    /// Model name, matching the catalog's [`lbp_core::Model::name`].
    pub name: String,
    /// Content digest, if the backend reports one.
    pub digest: Option<String>,
    /// Size in bytes, if the backend reports one.
    pub bytes: Option<u64>,
}

/// Model lifecycle management on a self-hosted backend: probe for the
/// currently loaded model list, enqueue pull/delete tasks. Cloud backends
/// have no counterpart — there is
/// nothing to pull.
#[async_trait]
pub trait ModelManagementClient: Send + Sync {
    /// List models currently loaded (or loading) on the backend.
    async fn list_models(&self) -> Result<Vec<RemoteModel>, LbpError>;
    /// Pull `name` onto the backend. Idempotent: pulling an
    /// already-present model succeeds without re-downloading.
    async fn pull_model(&self, name: &str) -> Result<(), LbpError>;
    /// Delete `name` from the backend. A delete of an absent model is a
    /// no-op, never an error.
    async fn delete_model(&self, name: &str) -> Result<(), LbpError>;
}

/// Validate a chat turn list before sending it upstream: the final message
/// must be from `user` or `system`.
pub fn validate_chat_turns(messages: &[ChatMessage]) -> Result<(), LbpError> {
    let Some(last) = messages.last() else {
        return Err(LbpError::new(
            ErrorCode::InvalidInput,
            "chat turn list must not be empty",
        ));
    };
    if !last.role.valid_as_final_message() {
        return Err(LbpError::new(
            ErrorCode::InvalidInput,
            format!("final message must be user or system, got {:?}", last.role),
        ));
    }
    Ok(())
}

/// Normalize a vendor finish-reason plus the response content into either
/// success or a mapped failure:
/// - `stop` with non-empty content: success.
/// - `stop` with empty content: [`ErrorCode::UnexpectedCompletion`].
/// - `length`: [`ErrorCode::TokenLimitReached`].
/// - `content_filter`: [`ErrorCode::ContentFiltered`].
/// - anything else: [`ErrorCode::UnexpectedCompletion`].
pub fn resolve_finish_reason(reason: FinishReason, content_is_empty: bool) -> Result<(), LbpError> {
    match reason {
        FinishReason::Stop if content_is_empty => Err(LbpError::new(
            ErrorCode::UnexpectedCompletion,
            "finish reason was stop but the response content was empty",
        )),
        FinishReason::Stop => Ok(()),
        FinishReason::Length => Err(LbpError::new(
            ErrorCode::TokenLimitReached,
            "upstream exhausted its token budget before finishing",
        )),
        FinishReason::ContentFilter => Err(LbpError::new(
            ErrorCode::ContentFiltered,
            "upstream withheld the response via content filtering",
        )),
        FinishReason::Other => Err(LbpError::new(
            ErrorCode::UnexpectedCompletion,
            "upstream reported an unrecognized finish reason",
        )),
    }
}

/// Split a system instruction out of a chat turn list, for vendors (e.g.
/// Anthropic) whose wire format hoists it to a dedicated top-level field
/// instead of carrying it as a turn.
///
/// Only a leading run of [`lbp_core::Role::System`] messages is hoisted and
/// joined with `"\n"`; a system message appearing after a non-system turn
/// is left in place (some vendors do support interleaved system turns, and
/// silently dropping them would lose content).
#[must_use]
pub fn hoist_leading_system(messages: &[ChatMessage]) -> (Option<String>, Vec<ChatMessage>) {
    use lbp_core::Role;

    let split_at = messages.iter().take_while(|m| m.role == Role::System).count();
    if split_at == 0 {
        return (None, messages.to_vec());
    }
    let system = messages[..split_at]
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    (Some(system), messages[split_at..].to_vec())
}

/// Byte offset of the first SSE event terminator (`"\n\n"`) in `buf`, if any.
fn find_event_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Turn a stream of raw byte chunks (an HTTP response body, typically from
/// `reqwest::Response::bytes_stream`) into a stream of SSE `data:` payloads,
/// stopping at a `[DONE]` marker.
///
/// Blank events, comment lines (`:`-prefixed), and non-`data:` fields are
/// skipped. This is the shared framing every vendor's [`StreamClient`]
/// streams through before parsing its own chunk JSON shape.
pub fn sse_data_frames<S>(byte_stream: S) -> impl Stream<Item = Result<String, LbpError>> + Send
where
    S: Stream<Item = Result<Vec<u8>, LbpError>> + Send + Unpin + 'static,
{
    use futures::stream::{self, StreamExt};

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
                if st.finished {
                    return None;
                }
                if let Some(pos) = find_event_terminator(&st.buf) {
                    let raw: Vec<u8> = st.buf.drain(..pos + 2).collect();
                    let text = String::from_utf8_lossy(&raw).into_owned();
                    let data_line = text
                        .lines()
                        .filter_map(|l| l.strip_prefix("data:"))
                        .map(str::trim)
                        .find(|d| !d.is_empty());
                    match data_line {
                        Some("[DONE]") => {
                            st.finished = true;
                            continue;
                        }
                        Some(d) => return Some((Ok(d.to_string()), st)),
                        None => continue,
                    }
                }
                match st.inner.next().await {
                    Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e), st)),
                    None => {
                        st.finished = true;
                        continue;
                    }
                }
            }
        },
    )
}
