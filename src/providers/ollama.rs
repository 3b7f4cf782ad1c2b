//! Ollama adapter
//!
//! Uses Ollama's native API:
//! - GET /api/tags - List local models with their on-disk size
//! - POST /api/generate {model, prompt, stream: false} - Responsiveness probe, and with an
//!   empty prompt, loads the model into memory
//! - POST /api/pull {name, stream: false} - Make sure the weights are present before loading
//! - POST /api/generate {model, keep_alive: 0} - Unload
use super::ProviderAdapter;
use super::http::{HyperProviderClient, ProviderHttpClient, endpoint};
use crate::catalog::ModelDescriptor;
use crate::errors::AdapterError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    size: u64,
}

pub struct OllamaAdapter<C: ProviderHttpClient = HyperProviderClient> {
    name: String,
    base_url: Url,
    client: Arc<C>,
    default_footprint: u64,
}

impl OllamaAdapter<HyperProviderClient> {
    pub fn new(name: impl Into<String>, base_url: Url) -> Self {
        Self::with_client(
            name,
            base_url,
            Arc::new(HyperProviderClient::new(Duration::from_secs(3))),
        )
    }
}

impl<C: ProviderHttpClient> OllamaAdapter<C> {
    pub fn with_client(name: impl Into<String>, base_url: Url, client: Arc<C>) -> Self {
        Self {
            name: name.into(),
            base_url,
            client,
            default_footprint: 0,
        }
    }

    /// Footprint for models whose listing reports no size
    pub fn with_default_footprint(mut self, bytes: u64) -> Self {
        self.default_footprint = bytes;
        self
    }

    async fn post_ok(&self, path: &str, body: serde_json::Value) -> Result<(), AdapterError> {
        let url = endpoint(&self.base_url, path);
        let response = self
            .client
            .post(&url, Some(&body))
            .await
            .map_err(|reason| AdapterError::Request {
                url: url.clone(),
                reason,
            })?;
        if response.status == 404 {
            let model = body
                .get("model")
                .or_else(|| body.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            return Err(AdapterError::ModelNotFound(model.to_string()));
        }
        if !response.is_success() {
            return Err(AdapterError::Status {
                url,
                status: response.status,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<C: ProviderHttpClient + 'static> ProviderAdapter for OllamaAdapter<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<ModelDescriptor>, AdapterError> {
        let url = endpoint(&self.base_url, "/api/tags");
        let response = self
            .client
            .get(&url)
            .await
            .map_err(|reason| AdapterError::Request {
                url: url.clone(),
                reason,
            })?;
        if !response.is_success() {
            return Err(AdapterError::Status {
                url,
                status: response.status,
            });
        }

        let tags: TagsResponse =
            serde_json::from_str(&response.body).map_err(|e| AdapterError::Decode {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        debug!(provider = %self.name, count = tags.models.len(), "Discovered Ollama models");
        Ok(tags
            .models
            .into_iter()
            .map(|entry| {
                let footprint = if entry.size > 0 {
                    entry.size
                } else {
                    self.default_footprint
                };
                ModelDescriptor::builder()
                    .provider(self.name.clone())
                    .model_id(entry.name)
                    .estimated_footprint(footprint)
                    .build()
            })
            .collect())
    }

    async fn probe(&self, model_id: &str) -> bool {
        let url = endpoint(&self.base_url, "/api/generate");
        let body = json!({"model": model_id, "prompt": "ping", "stream": false});
        match self.client.post(&url, Some(&body)).await {
            Ok(response) => response.is_success(),
            Err(e) => {
                debug!(provider = %self.name, model = %model_id, error = %e, "Probe failed");
                false
            }
        }
    }

    async fn load(&self, model_id: &str) -> Result<(), AdapterError> {
        info!(provider = %self.name, model = %model_id, "Loading Ollama model");
        self.post_ok("/api/pull", json!({"name": model_id, "stream": false}))
            .await?;
        self.post_ok(
            "/api/generate",
            json!({"model": model_id, "prompt": "", "stream": false}),
        )
        .await
    }

    async fn unload(&self, model_id: &str) -> Result<(), AdapterError> {
        info!(provider = %self.name, model = %model_id, "Unloading Ollama model");
        self.post_ok(
            "/api/generate",
            json!({"model": model_id, "keep_alive": 0, "stream": false}),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::http::mock::MockProviderClient;

    fn adapter(client: MockProviderClient) -> (OllamaAdapter<MockProviderClient>, Arc<MockProviderClient>) {
        let client = Arc::new(client);
        let adapter = OllamaAdapter::with_client(
            "ollama",
            "http://localhost:11434".parse().unwrap(),
            Arc::clone(&client),
        )
        .with_default_footprint(1234);
        (adapter, client)
    }

    #[tokio::test]
    async fn test_discover_parses_tags() {
        let (adapter, _) = adapter(MockProviderClient::new().route(
            "/api/tags",
            200,
            r#"{"models":[{"name":"llama3:8b","size":4661224676},{"name":"tiny"}]}"#,
        ));

        let models = adapter.discover().await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].model_id, "llama3:8b");
        assert_eq!(models[0].provider, "ollama");
        assert_eq!(models[0].estimated_footprint, 4661224676);
        assert_eq!(models[1].estimated_footprint, 1234);
    }

    #[tokio::test]
    async fn test_discover_bad_json_is_decode_error() {
        let (adapter, _) = adapter(MockProviderClient::new().route("/api/tags", 200, "not json"));
        assert!(matches!(
            adapter.discover().await,
            Err(AdapterError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_pulls_then_generates() {
        let (adapter, client) = adapter(
            MockProviderClient::new()
                .route("/api/pull", 200, "{}")
                .route("/api/generate", 200, "{}"),
        );

        adapter.load("llama3:8b").await.unwrap();

        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].1.ends_with("/api/pull"));
        assert_eq!(requests[0].2.as_ref().unwrap()["name"], "llama3:8b");
        assert!(requests[1].1.ends_with("/api/generate"));
        assert_eq!(requests[1].2.as_ref().unwrap()["prompt"], "");
    }

    #[tokio::test]
    async fn test_unload_sets_keep_alive_zero() {
        let (adapter, client) = adapter(MockProviderClient::new().route("/api/generate", 200, "{}"));
        adapter.unload("llama3:8b").await.unwrap();
        let requests = client.requests();
        assert_eq!(requests[0].2.as_ref().unwrap()["keep_alive"], 0);
    }

    #[tokio::test]
    async fn test_missing_model_maps_to_not_found() {
        let (adapter, _) = adapter(MockProviderClient::new().route("/api/pull", 404, "{}"));
        assert!(matches!(
            adapter.load("ghost").await,
            Err(AdapterError::ModelNotFound(m)) if m == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_probe_false_when_unreachable() {
        let (adapter, _) = adapter(MockProviderClient::unreachable());
        assert!(!adapter.probe("llama3:8b").await);
    }

    #[tokio::test]
    async fn test_probe_true_on_success() {
        let (adapter, client) = adapter(MockProviderClient::new().route("/api/generate", 200, "{}"));
        assert!(adapter.probe("llama3:8b").await);
        assert_eq!(client.requests()[0].2.as_ref().unwrap()["stream"], false);
    }
}
