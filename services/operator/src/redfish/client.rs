//! Redfish API client.
//!
//! Provides the request/response capability the engines consume:
//! - `RedfishApi`: object-safe raw request interface
//! - `RedfishApiExt`: verb helpers and typed decoding
//! - `HttpRedfishClient`: reqwest implementation with Basic or Session auth
//! - `BmcConnector`: direct clients for individual BMC addresses

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::types::{Collection, ODataRef, SESSIONS};

/// Errors from Redfish calls.
#[derive(Debug, Error)]
pub enum RedfishError {
    /// The request never produced an HTTP response.
    #[error("transport error calling {path}: {message}")]
    Transport { path: String, message: String },

    /// The service answered with an unexpected status.
    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: Method,
        path: String,
        status: u16,
        body: String,
    },

    /// The response body did not match the expected document.
    #[error("failed to decode response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Authentication could not be established.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The client could not be built.
    #[error("client configuration error: {0}")]
    Config(String),
}

/// HTTP verbs used against the aggregation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Patch => write!(f, "PATCH"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A parsed response.
///
/// Non-2xx statuses are not errors at this level: the task monitor needs
/// the raw code to decide the outcome of an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    /// `Location` header, set on 202 responses that start a task.
    pub location: Option<String>,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            location: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Fail with `RedfishError::Status` unless the status is 2xx.
    pub fn ensure_success(&self, method: Method, path: &str) -> Result<&Self, RedfishError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RedfishError::Status {
                method,
                path: path.to_string(),
                status: self.status,
                body: self.body.to_string(),
            })
        }
    }

    /// Decode the body into a typed document.
    pub fn decode<T: DeserializeOwned>(&self, path: &str) -> Result<T, RedfishError> {
        serde_json::from_value(self.body.clone()).map_err(|source| RedfishError::Decode {
            path: path.to_string(),
            source,
        })
    }

    /// The `@odata.id` of the created or returned resource, falling back to
    /// the `Location` header.
    pub fn resource_path(&self) -> Option<String> {
        self.body
            .get("@odata.id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.location.clone())
    }
}

/// Synchronous request/response access to a Redfish service.
#[async_trait]
pub trait RedfishApi: Send + Sync {
    /// Issue a request. `path` may be service-relative or an absolute URL.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse, RedfishError>;
}

/// Verb helpers and typed decoding for any `RedfishApi`.
#[async_trait]
pub trait RedfishApiExt: RedfishApi {
    async fn get(&self, path: &str) -> Result<ApiResponse, RedfishError> {
        self.request(Method::Get, path, None).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<ApiResponse, RedfishError> {
        self.request(Method::Post, path, Some(body)).await
    }

    async fn patch(&self, path: &str, body: &Value) -> Result<ApiResponse, RedfishError> {
        self.request(Method::Patch, path, Some(body)).await
    }

    async fn delete(&self, path: &str) -> Result<ApiResponse, RedfishError> {
        self.request(Method::Delete, path, None).await
    }

    /// GET a resource and decode it, failing on non-2xx.
    async fn get_as<T>(&self, path: &str) -> Result<T, RedfishError>
    where
        T: DeserializeOwned + Send,
    {
        let response = self.get(path).await?;
        response.ensure_success(Method::Get, path)?;
        response.decode(path)
    }

    /// GET a collection and return its member links.
    async fn list_members(&self, path: &str) -> Result<Vec<ODataRef>, RedfishError> {
        let collection: Collection = self.get_as(path).await?;
        Ok(collection.members)
    }
}

impl<T: RedfishApi + ?Sized> RedfishApiExt for T {}

/// Authentication scheme against the aggregation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Basic,
    Session,
}

impl std::str::FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "session" => Ok(Self::Session),
            other => Err(format!("unknown auth mode: {other}")),
        }
    }
}

/// Settings for an HTTP client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub auth: AuthMode,
    pub insecure_skip_verify: bool,
    pub timeout: Duration,
}

/// reqwest-backed Redfish client.
pub struct HttpRedfishClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    auth: AuthMode,
    session_token: RwLock<Option<String>>,
}

impl HttpRedfishClient {
    /// Create a new client.
    pub fn new(settings: ClientSettings) -> Result<Self, RedfishError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(settings.insecure_skip_verify)
            .build()
            .map_err(|e| RedfishError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            username: settings.username,
            password: settings.password,
            auth: settings.auth,
            session_token: RwLock::new(None),
        })
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    /// Create a session and remember its token.
    async fn login(&self) -> Result<String, RedfishError> {
        let url = self.url_for(SESSIONS);
        debug!(url = %url, "Creating Redfish session");

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "UserName": self.username,
                "Password": self.password,
            }))
            .send()
            .await
            .map_err(|e| RedfishError::Transport {
                path: SESSIONS.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(RedfishError::Auth(format!(
                "session creation returned {}",
                response.status()
            )));
        }

        let token = response
            .headers()
            .get("X-Auth-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RedfishError::Auth("session response had no X-Auth-Token".into()))?;

        *self.session_token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<ApiResponse, RedfishError> {
        let url = self.url_for(path);
        let mut request = self.client.request(method.into(), &url);

        request = match token {
            Some(token) => request.header("X-Auth-Token", token),
            None => request.basic_auth(&self.username, Some(&self.password)),
        };

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| RedfishError::Transport {
            path: path.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let text = response.text().await.map_err(|e| RedfishError::Transport {
            path: path.to_string(),
            message: e.to_string(),
        })?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        debug!(method = %method, path = %path, status, "Redfish call");

        Ok(ApiResponse {
            status,
            body,
            location,
        })
    }
}

#[async_trait]
impl RedfishApi for HttpRedfishClient {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse, RedfishError> {
        match self.auth {
            AuthMode::Basic => self.send_once(method, path, body, None).await,
            AuthMode::Session => {
                let cached = self.session_token.read().await.clone();
                let token = match cached {
                    Some(token) => token,
                    None => self.login().await?,
                };

                let response = self.send_once(method, path, body, Some(&token)).await?;
                if response.status != 401 {
                    return Ok(response);
                }

                warn!(path = %path, "Session expired, re-authenticating once");
                let token = self.login().await?;
                self.send_once(method, path, body, Some(&token)).await
            }
        }
    }
}

/// Builds clients that talk to one BMC directly.
pub trait BmcConnector: Send + Sync {
    fn connect(
        &self,
        address: &str,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn RedfishApi>, RedfishError>;
}

/// Direct HTTPS connections with Basic auth.
pub struct HttpConnector {
    insecure_skip_verify: bool,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(insecure_skip_verify: bool, timeout: Duration) -> Self {
        Self {
            insecure_skip_verify,
            timeout,
        }
    }
}

impl BmcConnector for HttpConnector {
    fn connect(
        &self,
        address: &str,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn RedfishApi>, RedfishError> {
        let base_url = if address.contains("://") {
            address.to_string()
        } else {
            format!("https://{address}")
        };

        let client = HttpRedfishClient::new(ClientSettings {
            base_url,
            username: username.to_string(),
            password: password.to_string(),
            auth: AuthMode::Basic,
            insecure_skip_verify: self.insecure_skip_verify,
            timeout: self.timeout,
        })?;

        Ok(Arc::new(client))
    }
}
