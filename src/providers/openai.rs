//! Adapter for OpenAI-compatible servers (vLLM, LM Studio)
//!
//! Discovery and probing use the OpenAI surface:
//! - GET /v1/models - List served model ids
//! - POST /v1/chat/completions {model, messages, max_tokens: 1} - Responsiveness probe
//!
//! Residency control differs per server:
//! - vLLM with `--enable-sleep-mode`: POST /wake_up to load, POST /sleep?level={1,2} to unload.
//!   For level 2, waking also reloads weights via /collective_rpc and resets the prefix cache.
//! - LM Studio: models load just in time on their first request, so loading is a probe.
//!   There is no unload call on the OpenAI surface; unloading reports `Unsupported`.
use super::ProviderAdapter;
use super::http::{HyperProviderClient, ProviderHttpClient, endpoint};
use crate::catalog::ModelDescriptor;
use crate::errors::AdapterError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// How the server brings models in and out of memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiFlavor {
    /// vLLM sleep-mode API
    VllmSleepMode { sleep_level: u8 },
    /// Load on first request, no explicit unload
    JustInTime,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

pub struct OpenAiAdapter<C: ProviderHttpClient = HyperProviderClient> {
    name: String,
    base_url: Url,
    flavor: OpenAiFlavor,
    client: Arc<C>,
    default_footprint: u64,
}

impl OpenAiAdapter<HyperProviderClient> {
    pub fn new(name: impl Into<String>, base_url: Url, flavor: OpenAiFlavor) -> Self {
        Self::with_client(
            name,
            base_url,
            flavor,
            Arc::new(HyperProviderClient::new(Duration::from_secs(3))),
        )
    }
}

impl<C: ProviderHttpClient> OpenAiAdapter<C> {
    pub fn with_client(
        name: impl Into<String>,
        base_url: Url,
        flavor: OpenAiFlavor,
        client: Arc<C>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url,
            flavor,
            client,
            default_footprint: 0,
        }
    }

    /// The OpenAI model listing carries no sizes, so every discovered model gets this footprint
    pub fn with_default_footprint(mut self, bytes: u64) -> Self {
        self.default_footprint = bytes;
        self
    }

    async fn post_ok(
        &self,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(), AdapterError> {
        let url = endpoint(&self.base_url, path);
        let response = self
            .client
            .post(&url, body.as_ref())
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
        Ok(())
    }

    fn probe_body(model_id: &str) -> serde_json::Value {
        json!({
            "model": model_id,
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1,
        })
    }
}

#[async_trait]
impl<C: ProviderHttpClient + 'static> ProviderAdapter for OpenAiAdapter<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<ModelDescriptor>, AdapterError> {
        let url = endpoint(&self.base_url, "/v1/models");
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
        let list: ModelList =
            serde_json::from_str(&response.body).map_err(|e| AdapterError::Decode {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        debug!(provider = %self.name, count = list.data.len(), "Discovered models");
        Ok(list
            .data
            .into_iter()
            .map(|entry| {
                ModelDescriptor::builder()
                    .provider(self.name.clone())
                    .model_id(entry.id)
                    .estimated_footprint(self.default_footprint)
                    .build()
            })
            .collect())
    }

    async fn probe(&self, model_id: &str) -> bool {
        let url = endpoint(&self.base_url, "/v1/chat/completions");
        match self.client.post(&url, Some(&Self::probe_body(model_id))).await {
            Ok(response) => response.is_success(),
            Err(e) => {
                debug!(provider = %self.name, model = %model_id, error = %e, "Probe failed");
                false
            }
        }
    }

    async fn load(&self, model_id: &str) -> Result<(), AdapterError> {
        info!(provider = %self.name, model = %model_id, "Loading model");
        match self.flavor {
            OpenAiFlavor::VllmSleepMode { sleep_level } => {
                self.post_ok("/wake_up", None).await?;
                if sleep_level >= 2 {
                    debug!(model = %model_id, "L2 sleep: reloading weights");
                    self.post_ok(
                        "/collective_rpc",
                        Some(json!({"method": "reload_weights"})),
                    )
                    .await?;
                    // A stale prefix cache only costs performance
                    if let Err(e) = self.post_ok("/reset_prefix_cache", None).await {
                        warn!(model = %model_id, error = %e, "Failed to reset prefix cache");
                    }
                }
                Ok(())
            }
            OpenAiFlavor::JustInTime => {
                self.post_ok("/v1/chat/completions", Some(Self::probe_body(model_id)))
                    .await
            }
        }
    }

    async fn unload(&self, model_id: &str) -> Result<(), AdapterError> {
        match self.flavor {
            OpenAiFlavor::VllmSleepMode { sleep_level } => {
                info!(provider = %self.name, model = %model_id, level = sleep_level, "Putting model to sleep");
                self.post_ok(&format!("/sleep?level={}", sleep_level.clamp(1, 2)), None)
                    .await
            }
            OpenAiFlavor::JustInTime => Err(AdapterError::Unsupported {
                operation: "unload",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::http::mock::MockProviderClient;

    fn adapter(
        flavor: OpenAiFlavor,
        client: MockProviderClient,
    ) -> (OpenAiAdapter<MockProviderClient>, Arc<MockProviderClient>) {
        let client = Arc::new(client);
        let adapter = OpenAiAdapter::with_client(
            "vllm",
            "http://localhost:8001".parse().unwrap(),
            flavor,
            Arc::clone(&client),
        )
        .with_default_footprint(16_000);
        (adapter, client)
    }

    #[tokio::test]
    async fn test_discover_uses_default_footprint() {
        let (adapter, _) = adapter(
            OpenAiFlavor::JustInTime,
            MockProviderClient::new().route(
                "/v1/models",
                200,
                r#"{"object":"list","data":[{"id":"qwen2.5-7b"},{"id":"llama-3.1-8b"}]}"#,
            ),
        );
        let models = adapter.discover().await.unwrap();
        assert_eq!(models.len(), 2);
        assert!(models.iter().all(|m| m.estimated_footprint == 16_000));
        assert_eq!(models[0].model_id, "qwen2.5-7b");
    }

    #[tokio::test]
    async fn test_probe_sends_single_token_request() {
        let (adapter, client) = adapter(
            OpenAiFlavor::JustInTime,
            MockProviderClient::new().route("/v1/chat/completions", 200, "{}"),
        );
        assert!(adapter.probe("qwen2.5-7b").await);
        let body = client.requests()[0].2.clone().unwrap();
        assert_eq!(body["max_tokens"], 1);
        assert_eq!(body["model"], "qwen2.5-7b");
    }

    #[tokio::test]
    async fn test_vllm_l1_load_and_unload() {
        let (adapter, client) = adapter(
            OpenAiFlavor::VllmSleepMode { sleep_level: 1 },
            MockProviderClient::new()
                .route("/wake_up", 200, "")
                .route("/sleep", 200, ""),
        );
        adapter.load("model-a").await.unwrap();
        adapter.unload("model-a").await.unwrap();

        let urls: Vec<String> = client.requests().into_iter().map(|r| r.1).collect();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].ends_with("/wake_up"));
        assert!(urls[1].ends_with("/sleep?level=1"));
    }

    #[tokio::test]
    async fn test_vllm_l2_load_reloads_weights() {
        let (adapter, client) = adapter(
            OpenAiFlavor::VllmSleepMode { sleep_level: 2 },
            MockProviderClient::new()
                .route("/wake_up", 200, "")
                .route("/collective_rpc", 200, "")
                .route("/reset_prefix_cache", 500, ""),
        );
        // Prefix cache reset failure does not fail the load
        adapter.load("model-a").await.unwrap();
        let requests = client.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].2.as_ref().unwrap()["method"], "reload_weights");
    }

    #[tokio::test]
    async fn test_wake_failure_is_status_error() {
        let (adapter, _) = adapter(
            OpenAiFlavor::VllmSleepMode { sleep_level: 1 },
            MockProviderClient::new().route("/wake_up", 503, ""),
        );
        assert!(matches!(
            adapter.load("model-a").await,
            Err(AdapterError::Status { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_just_in_time_unload_unsupported() {
        let (adapter, client) = adapter(OpenAiFlavor::JustInTime, MockProviderClient::new());
        assert!(matches!(
            adapter.unload("model-a").await,
            Err(AdapterError::Unsupported { .. })
        ));
        assert!(client.requests().is_empty());
    }
}
