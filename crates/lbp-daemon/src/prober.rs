//! [`lbp_reconciler::BackendProber`] adapters binding a concrete vendor
//! client to each self-hosted [`lbp_core::BackendKind`], probing for the
//! currently loaded model list.
//!
//! A fresh client is constructed per call, bound to the probed backend's
//! own `base_url`/`api_key` — cheap, since these are thin `reqwest::Client`
//! wrappers sharing one connection pool underneath.

use async_trait::async_trait;
use lbp_clients::ModelManagementClient;
use lbp_core::Backend;
use lbp_error::LbpError;
use lbp_reconciler::{BackendProber, ProbedModel};

fn to_probed(models: Vec<lbp_clients::RemoteModel>) -> Vec<ProbedModel> {
    models
        .into_iter()
        .map(|m| ProbedModel {
            name: m.name,
            digest: m.digest,
            bytes: m.bytes,
        })
        .collect()
}

/// Probes [`lbp_core::BackendKind::SelfHostedGeneric`] backends via
/// [`lbp_client_ollama::OllamaClient`].
pub struct OllamaProber {
    client: reqwest::Client,
}

impl OllamaProber {
    /// Construct a prober sharing `client`'s connection pool.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BackendProber for OllamaProber {
    async fn list_models(&self, backend: &Backend) -> Result<Vec<ProbedModel>, LbpError> {
        let client = lbp_client_ollama::OllamaClient::new(self.client.clone(), &backend.base_url, "");
        Ok(to_probed(client.list_models().await?))
    }

    async fn pull_model(&self, backend: &Backend, name: &str) -> Result<(), LbpError> {
        let client = lbp_client_ollama::OllamaClient::new(self.client.clone(), &backend.base_url, "");
        client.pull_model(name).await
    }

    async fn delete_model(&self, backend: &Backend, name: &str) -> Result<(), LbpError> {
        let client = lbp_client_ollama::OllamaClient::new(self.client.clone(), &backend.base_url, "");
        client.delete_model(name).await
    }
}

/// Probes [`lbp_core::BackendKind::SelfHostedOpenAiCompatible`] backends
/// via [`lbp_client_vllm::VllmClient`].
pub struct VllmProber {
    client: reqwest::Client,
}

impl VllmProber {
    /// Construct a prober sharing `client`'s connection pool.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BackendProber for VllmProber {
    async fn list_models(&self, backend: &Backend) -> Result<Vec<ProbedModel>, LbpError> {
        let client = lbp_client_vllm::VllmClient::new(self.client.clone(), &backend.base_url, "");
        Ok(to_probed(client.list_models().await?))
    }

    async fn pull_model(&self, backend: &Backend, name: &str) -> Result<(), LbpError> {
        let client = lbp_client_vllm::VllmClient::new(self.client.clone(), &backend.base_url, "");
        client.pull_model(name).await
    }

    async fn delete_model(&self, backend: &Backend, name: &str) -> Result<(), LbpError> {
        let client = lbp_client_vllm::VllmClient::new(self.client.clone(), &backend.base_url, "");
        client.delete_model(name).await
    }
}

/// Register [`OllamaProber`] and [`VllmProber`] under their respective
/// kinds on `composite`, sharing one `reqwest::Client` connection pool.
pub fn register_default(composite: &mut lbp_reconciler::CompositeProber, client: reqwest::Client) {
    let ollama_client = client.clone();
    composite.register(lbp_core::BackendKind::SelfHostedGeneric, move || {
        std::sync::Arc::new(OllamaProber::new(ollama_client.clone())) as std::sync::Arc<dyn BackendProber>
    });
    let vllm_client = client;
    composite.register(lbp_core::BackendKind::SelfHostedOpenAiCompatible, move || {
        std::sync::Arc::new(VllmProber::new(vllm_client.clone())) as std::sync::Arc<dyn BackendProber>
    });
}
