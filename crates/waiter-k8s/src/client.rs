//! Orchestrator HTTP client
//!
//! Thin wrapper over the Kubernetes API server adding bearer-token
//! auth with cooperative refresh, JSON (de)serialization, streaming
//! watch-body consumption, and typed error mapping.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use waiter_core::config::{AuthenticationKind, KubernetesConfig};
use waiter_core::{Error, Result};

/// Content type for regular API bodies
const CONTENT_TYPE_JSON: &str = "application/json";

/// Source of the orchestrator auth token
pub trait TokenSource: Send + Sync {
    /// Produce the current token, or `None` when no auth is configured
    fn fetch(&self) -> Result<Option<String>>;
}

/// Fixed token from configuration
pub struct StaticToken(pub String);

impl TokenSource for StaticToken {
    fn fetch(&self) -> Result<Option<String>> {
        Ok(Some(self.0.clone()))
    }
}

/// Token re-read from a file on every refresh
pub struct FileToken(pub PathBuf);

impl TokenSource for FileToken {
    fn fetch(&self) -> Result<Option<String>> {
        let token = std::fs::read_to_string(&self.0)
            .map_err(|e| Error::auth_failed(format!("cannot read token file: {}", e)))?;
        Ok(Some(token.trim().to_string()))
    }
}

/// Build the token source selected by configuration; `None` when no
/// authentication is configured at all
pub fn token_source_for(kind: &AuthenticationKind) -> Option<Box<dyn TokenSource>> {
    match kind {
        AuthenticationKind::None => None,
        AuthenticationKind::Static { token } => Some(Box::new(StaticToken(token.clone()))),
        AuthenticationKind::TokenFile { path } => Some(Box::new(FileToken(path.clone()))),
    }
}

/// The mutating/query surface scheduler operations need from the
/// orchestrator. Split out as a trait so operation logic can be
/// exercised against a recording fake.
#[async_trait]
pub trait OrchestratorApi: Send + Sync {
    /// GET a JSON payload
    async fn get(&self, path: &str) -> Result<Value>;

    /// POST a JSON payload
    async fn post(&self, path: &str, body: &Value) -> Result<Value>;

    /// PATCH with an explicit content type (JSON-Patch for scaling)
    async fn patch(&self, path: &str, content_type: &str, body: &Value) -> Result<Value>;

    /// DELETE, optionally with a DeleteOptions body
    async fn delete(&self, path: &str, body: Option<&Value>) -> Result<Value>;
}

/// HTTP client for one Kubernetes API server
pub struct ApiClient {
    base_url: Url,
    http: reqwest::Client,
    /// Applied per regular request; watch streams run without a total
    /// timeout because they are expected to run indefinitely
    request_timeout: Duration,
    token: Arc<RwLock<Option<String>>>,
}

impl ApiClient {
    /// Build a client from scheduler configuration, fetching the
    /// initial token synchronously
    pub fn from_config(config: &KubernetesConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| Error::malformed(format!("invalid orchestrator url: {}", e)))?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.http_options.conn_timeout_secs))
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {}", e)))?;

        let token = match token_source_for(&config.authentication.kind) {
            Some(source) => source.fetch()?,
            None => None,
        };

        Ok(Self {
            base_url,
            http,
            request_timeout: Duration::from_secs(config.http_options.socket_timeout_secs),
            token: Arc::new(RwLock::new(token)),
        })
    }

    /// The underlying HTTP client, for callers that talk to other
    /// endpoints (the fileserver sidecar)
    pub fn http(&self) -> reqwest::Client {
        self.http.clone()
    }

    /// Replace the auth token
    pub fn store_token(&self, token: Option<String>) {
        *self.token.write().expect("token cell poisoned") = token;
    }

    fn current_token(&self) -> Option<String> {
        self.token.read().expect("token cell poisoned").clone()
    }

    /// Spawn the cooperative token refresh worker
    pub fn spawn_token_refresh(
        self: &Arc<Self>,
        source: Box<dyn TokenSource>,
        refresh_delay: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresh_delay);
            // The immediate first tick re-reads the token at startup
            loop {
                interval.tick().await;
                match source.fetch() {
                    Ok(token) => {
                        debug!("refreshed orchestrator auth token");
                        client.store_token(token);
                    }
                    Err(e) => warn!("auth token refresh failed: {}", e),
                }
            }
        })
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::malformed(format!("invalid request path {}: {}", path, e)))
    }

    /// Issue a request and parse the JSON response.
    ///
    /// Non-2xx statuses are classified into the error taxonomy with the
    /// response body attached as detail; empty bodies parse to null.
    pub async fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        content_type: Option<&str>,
    ) -> Result<Value> {
        let url = self.join(path)?;
        debug!("{} {}", method, url);

        let mut builder = self.http.request(method, url).timeout(self.request_timeout);
        if let Some(token) = self.current_token() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder
                .header("Content-Type", content_type.unwrap_or(CONTENT_TYPE_JSON))
                .body(serde_json::to_vec(body)?);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(Error::from_status(status.as_u16(), text));
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Open a watch request and return a lazy stream of the JSON
    /// objects it delivers
    pub async fn stream(&self, path: &str) -> Result<JsonStream> {
        let url = self.join(path)?;
        info!("opening watch stream {}", url);

        let mut builder = self.http.get(url);
        if let Some(token) = self.current_token() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::from_status(status.as_u16(), text));
        }

        Ok(JsonStream {
            response,
            buffer: Vec::new(),
            done: false,
        })
    }
}

#[async_trait]
impl OrchestratorApi for ApiClient {
    async fn get(&self, path: &str) -> Result<Value> {
        self.request_json(Method::GET, path, None, None).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.request_json(Method::POST, path, Some(body), None).await
    }

    async fn patch(&self, path: &str, content_type: &str, body: &Value) -> Result<Value> {
        self.request_json(Method::PATCH, path, Some(body), Some(content_type))
            .await
    }

    async fn delete(&self, path: &str, body: Option<&Value>) -> Result<Value> {
        self.request_json(Method::DELETE, path, body, None).await
    }
}

/// Lazy sequence of newline-delimited JSON objects from a watch
/// response body. Terminates on EOF; transport failures surface as
/// errors for the watch worker to recover from.
pub struct JsonStream {
    response: reqwest::Response,
    buffer: Vec<u8>,
    done: bool,
}

impl JsonStream {
    /// The next object, or `None` on a clean EOF
    pub async fn next(&mut self) -> Result<Option<Value>> {
        loop {
            if let Some(line) = self.take_line()? {
                return Ok(Some(line));
            }
            if self.done {
                return self.drain_tail();
            }
            match self.response.chunk().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => self.done = true,
            }
        }
    }

    fn take_line(&mut self) -> Result<Option<Value>> {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_slice(line)?));
        }
        Ok(None)
    }

    fn drain_tail(&mut self) -> Result<Option<Value>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let tail = std::mem::take(&mut self.buffer);
        Ok(Some(serde_json::from_slice(&tail)?))
    }
}
