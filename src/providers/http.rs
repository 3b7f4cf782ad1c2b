//! HTTP client abstraction used by the provider adapters
//!
//! Adapters talk to providers through [`ProviderHttpClient`] so tests can swap in a mock. The
//! default implementation is a pooled hyper client with TLS support.
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Uri};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use std::time::Duration;
use tracing::trace;

pub type HyperClient = Client<
    hyper_tls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    Full<Bytes>,
>;

/// Status and body of a provider response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client trait for talking to providers
///
/// This trait allows for easy mocking in tests.
#[async_trait]
pub trait ProviderHttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, String>;
    /// POST, with a JSON body if one is given
    async fn post(&self, url: &str, body: Option<&serde_json::Value>)
    -> Result<HttpResponse, String>;
}

#[derive(Clone)]
pub struct HyperProviderClient {
    client: HyperClient,
    timeout: Duration,
}

impl HyperProviderClient {
    pub fn new(timeout: Duration) -> Self {
        let https = hyper_tls::HttpsConnector::new();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .pool_timer(hyper_util::rt::TokioTimer::new())
            .build(https);
        Self { client, timeout }
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<HttpResponse, String> {
        let uri: Uri = url.parse().map_err(|e| format!("Invalid URL: {}", e))?;
        let mut builder = Request::builder().method(method.clone()).uri(uri);

        let payload = match body {
            Some(value) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Bytes::from(
                    serde_json::to_vec(value).map_err(|e| format!("Failed to encode body: {}", e))?,
                )
            }
            None => Bytes::new(),
        };

        let request = builder
            .body(Full::new(payload))
            .map_err(|e| format!("Failed to build request: {}", e))?;

        trace!(%method, url, "Provider request");
        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| "Request timeout".to_string())?
            .map_err(|e| format!("Request failed: {}", e))?;

        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| format!("Failed to read body: {}", e))?
            .to_bytes();

        Ok(HttpResponse {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

impl std::fmt::Debug for HyperProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperProviderClient")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl ProviderHttpClient for HyperProviderClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, String> {
        self.send(Method::GET, url, None).await
    }

    async fn post(
        &self,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<HttpResponse, String> {
        self.send(Method::POST, url, body).await
    }
}

/// Join a path onto a provider base URL without doubling slashes
pub(crate) fn endpoint(base: &url::Url, path: &str) -> String {
    format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Records every request and answers from a list of (url fragment, status, body) routes.
    /// The first route whose fragment appears in the URL wins; unmatched URLs get a 404.
    pub struct MockProviderClient {
        routes: Vec<(String, u16, String)>,
        pub requests: Mutex<Vec<(String, String, Option<serde_json::Value>)>>,
        fail_transport: bool,
    }

    impl MockProviderClient {
        pub fn new() -> Self {
            Self {
                routes: Vec::new(),
                requests: Mutex::new(Vec::new()),
                fail_transport: false,
            }
        }

        pub fn route(mut self, fragment: &str, status: u16, body: &str) -> Self {
            self.routes
                .push((fragment.to_string(), status, body.to_string()));
            self
        }

        pub fn unreachable() -> Self {
            Self {
                fail_transport: true,
                ..Self::new()
            }
        }

        pub fn requests(&self) -> Vec<(String, String, Option<serde_json::Value>)> {
            self.requests.lock().unwrap().clone()
        }

        fn answer(
            &self,
            method: &str,
            url: &str,
            body: Option<&serde_json::Value>,
        ) -> Result<HttpResponse, String> {
            self.requests
                .lock()
                .unwrap()
                .push((method.to_string(), url.to_string(), body.cloned()));
            if self.fail_transport {
                return Err("connection refused".to_string());
            }
            let (status, body) = self
                .routes
                .iter()
                .find(|(fragment, _, _)| url.contains(fragment.as_str()))
                .map(|(_, status, body)| (*status, body.clone()))
                .unwrap_or((404, String::new()));
            Ok(HttpResponse { status, body })
        }
    }

    #[async_trait]
    impl ProviderHttpClient for MockProviderClient {
        async fn get(&self, url: &str) -> Result<HttpResponse, String> {
            self.answer("GET", url, None)
        }

        async fn post(
            &self,
            url: &str,
            body: Option<&serde_json::Value>,
        ) -> Result<HttpResponse, String> {
            self.answer("POST", url, body)
        }
    }
}
