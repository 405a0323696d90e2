// SPDX-License-Identifier: MIT OR Apache-2.0
//! External tokenizer capability.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Reserved tokenizer name used when no base model is given
///.
pub const TINY_TOKENIZER: &str = "tiny";

/// Errors a [`Tokenizer`] call may fail with.
#[derive(Debug, thiserror::Error)]
pub enum TokenizerError {
    /// The tokenizer service could not be reached.
    #[error("tokenizer unreachable: {0}")]
    Unreachable(String),
    /// The tokenizer service returned a malformed response.
    #[error("malformed tokenizer response: {0}")]
    MalformedResponse(String),
    /// The tokenizer does not recognize the given model name.
    #[error("unknown model: {0}")]
    UnknownModel(String),
}

/// An external token-counting service, used by `lbp-chat` to estimate
/// context size.
#[async_trait]
pub trait Tokenizer: Send + Sync {
    /// Return the tokenizer's preferred model name for counting tokens
    /// against `base_model`.
    async fn optimal_model(&self, base_model: &str) -> Result<String, TokenizerError>;

    /// Count tokens in `text` as `model` would encode it.
    async fn count_tokens(&self, model: &str, text: &str) -> Result<u64, TokenizerError>;
}

#[derive(Debug, Serialize)]
struct OptimalModelRequest<'a> {
    base_model: &'a str,
}

#[derive(Debug, Deserialize)]
struct OptimalModelResponse {
    optimal_model: String,
}

#[derive(Debug, Serialize)]
struct CountTokensRequest<'a> {
    model: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct CountTokensResponse {
    count: u64,
}

/// HTTP-backed [`Tokenizer`] calling an external tokenizer service.
pub struct HttpTokenizer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTokenizer {
    /// Construct a client bound to `base_url` (e.g.
    /// `http://tokenizer.internal:9000`).
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Tokenizer for HttpTokenizer {
    async fn optimal_model(&self, base_model: &str) -> Result<String, TokenizerError> {
        let resp = self
            .client
            .post(format!("{}/optimal-model", self.base_url))
            .json(&OptimalModelRequest { base_model })
            .send()
            .await
            .map_err(|e| TokenizerError::Unreachable(e.to_string()))?;
        let body: OptimalModelResponse = resp
            .json()
            .await
            .map_err(|e| TokenizerError::MalformedResponse(e.to_string()))?;
        Ok(body.optimal_model)
    }

    async fn count_tokens(&self, model: &str, text: &str) -> Result<u64, TokenizerError> {
        let resp = self
            .client
            .post(format!("{}/count-tokens", self.base_url))
            .json(&CountTokensRequest { model, text })
            .send()
            .await
            .map_err(|e| TokenizerError::Unreachable(e.to_string()))?;
        let body: CountTokensResponse = resp
            .json()
            .await
            .map_err(|e| TokenizerError::MalformedResponse(e.to_string()))?;
        Ok(body.count)
    }
}

/// Reserved fallback tokenizer used when no base model is given. Not a real
/// tokenizer: it estimates token count as `ceil(bytes / 4)`, a placeholder
/// for wiring an external service before one is configured.
pub struct TinyTokenizer;

#[async_trait]
impl Tokenizer for TinyTokenizer {
    async fn optimal_model(&self, _base_model: &str) -> Result<String, TokenizerError> {
        Ok(TINY_TOKENIZER.to_string())
    }

    async fn count_tokens(&self, _model: &str, text: &str) -> Result<u64, TokenizerError> {
        Ok(text.len().div_ceil(4) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn tiny_tokenizer_estimates_bytes_over_four() {
        let t = TinyTokenizer;
        assert_eq!(t.count_tokens("tiny", "1234567890").await.unwrap(), 3);
        assert_eq!(t.optimal_model("gpt-4o-mini").await.unwrap(), TINY_TOKENIZER);
    }

    #[tokio::test]
    async fn tiny_tokenizer_empty_text_is_zero_tokens() {
        let t = TinyTokenizer;
        assert_eq!(t.count_tokens("tiny", "").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn http_tokenizer_queries_optimal_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/optimal-model"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"optimal_model": "cl100k_base"})),
            )
            .mount(&server)
            .await;

        let tokenizer = HttpTokenizer::new(reqwest::Client::new(), server.uri());
        let model = tokenizer.optimal_model("gpt-4o-mini").await.unwrap();
        assert_eq!(model, "cl100k_base");
    }

    #[tokio::test]
    async fn http_tokenizer_counts_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/count-tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"count": 42})))
            .mount(&server)
            .await;

        let tokenizer = HttpTokenizer::new(reqwest::Client::new(), server.uri());
        let count = tokenizer.count_tokens("cl100k_base", "hello world").await.unwrap();
        assert_eq!(count, 42);
    }

    #[tokio::test]
    async fn http_tokenizer_unreachable_surfaces_as_unreachable_error() {
        let tokenizer = HttpTokenizer::new(reqwest::Client::new(), "http://127.0.0.1:1".to_string());
        let err = tokenizer.count_tokens("m", "x").await.unwrap_err();
        assert!(matches!(err, TokenizerError::Unreachable(_)));
    }
}
