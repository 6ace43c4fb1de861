//! JSON/REST plumbing shared by the registry and campaign manager clients
//!
//! - Basic auth when a client id and secret are configured, bearer token otherwise
//! - Every request carries an `X-Request-ID`; `X-Force-Trace` when configured
//! - 404 is reported as `Ok(None)`; any other status above 204 is an error
//! - Connect errors and 502/503 are retried with exponential backoff. Non-idempotent
//!   methods are only retried when the connection could not be established.

use crate::infra::config::ServiceConfig;
use anyhow::{anyhow, bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(1);

/// Connection settings for one REST collaborator
#[derive(Debug, Clone)]
pub struct RestSettings {
    pub endpoint: String,
    pub user_agent: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub access_token: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub force_trace: Option<String>,
}

impl RestSettings {
    pub fn from_service(
        service: &ServiceConfig,
        user_agent: &str,
        timeout: Duration,
        max_retries: u32,
        force_trace: Option<&str>,
    ) -> Self {
        Self {
            endpoint: service.endpoint.trim_end_matches('/').to_string(),
            user_agent: user_agent.to_string(),
            client_id: service.client_id.clone(),
            client_secret: service.client_secret.clone(),
            access_token: service.access_token.clone(),
            timeout,
            max_retries,
            force_trace: force_trace.map(str::to_string),
        }
    }

    /// Authorization header value, if any credentials are configured
    fn authorization(&self) -> Option<String> {
        if let Some(token) = &self.access_token {
            return Some(format!("Bearer {}", token));
        }
        match (&self.client_id, &self.client_secret) {
            (Some(user), Some(secret)) => {
                let encoded = STANDARD.encode(format!("{}:{}", user, secret).as_bytes());
                Some(format!("Basic {}", encoded))
            }
            (None, Some(secret)) => Some(format!("Bearer {}", secret)),
            _ => None,
        }
    }
}

/// Delay before retry number `attempt` (0-based)
fn retry_delay(attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    RETRY_BASE_DELAY.saturating_mul(factor).min(RETRY_MAX_DELAY)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::BAD_GATEWAY || status == StatusCode::SERVICE_UNAVAILABLE
}

/// Methods that may be resent after the server possibly saw the request
fn is_idempotent(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::PUT | Method::DELETE)
}

/// Thin wrapper around a pooled `reqwest::Client`
pub struct RestClient {
    http: reqwest::Client,
    settings: RestSettings,
}

impl RestClient {
    pub fn new(settings: RestSettings) -> anyhow::Result<Self> {
        if settings.endpoint.is_empty() {
            bail!("missing endpoint for {}", settings.user_agent);
        }
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(settings.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, settings })
    }

    pub fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    /// GET a JSON resource. `Ok(None)` when it does not exist.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<Option<T>> {
        match self.send(Method::GET, path, None).await? {
            Some(body) => {
                let value = serde_json::from_slice(&body)
                    .with_context(|| format!("Failed to decode response of GET {}", path))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// PUT a JSON body. `Ok(false)` when the target does not exist.
    pub async fn put<B: Serialize>(&self, path: &str, body: &B) -> anyhow::Result<bool> {
        let payload = serde_json::to_vec(body).context("Failed to encode request body")?;
        Ok(self.send(Method::PUT, path, Some(payload)).await?.is_some())
    }

    /// POST without a body. `Ok(false)` when the target does not exist.
    pub async fn post_empty(&self, path: &str) -> anyhow::Result<bool> {
        Ok(self.send(Method::POST, path, None).await?.is_some())
    }

    /// Send with retries. Returns the body of a successful response,
    /// `None` for 404.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> anyhow::Result<Option<bytes::Bytes>> {
        let url = format!("{}{}", self.settings.endpoint, path);
        let request_id = Uuid::now_v7().to_string();
        let idempotent = is_idempotent(&method);
        let mut attempt = 0;

        loop {
            let start = Instant::now();
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("Content-Type", "application/json; charset=utf-8")
                .header("X-Request-ID", &request_id);
            if let Some(auth) = self.settings.authorization() {
                request = request.header("Authorization", auth);
            }
            if let Some(trace) = &self.settings.force_trace {
                request = request.header("X-Force-Trace", trace);
            }
            if let Some(payload) = &body {
                request = request.body(payload.clone());
            }

            debug!(m = %method, r = %path, uid = %request_id, attempt = %attempt, "REQ");

            let result = request.send().await;
            let retry_reason = match result {
                Ok(response) => {
                    let status = response.status();
                    debug!(
                        r = %path,
                        status = %status.as_u16(),
                        d_ms = %start.elapsed().as_millis(),
                        uid = %request_id,
                        "RESP"
                    );

                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if status.is_success() && status.as_u16() <= 204 {
                        let bytes = response
                            .bytes()
                            .await
                            .with_context(|| format!("Failed to read response of {} {}", method, path))?;
                        return Ok(Some(bytes));
                    }
                    if !idempotent || !is_retryable_status(status) {
                        return Err(anyhow!("{} {} failed with status {}", method, path, status));
                    }
                    format!("status {}", status)
                }
                Err(e) if e.is_connect() || (idempotent && e.is_timeout()) => e.to_string(),
                Err(e) => {
                    return Err(anyhow!(e).context(format!("{} {} failed", method, path)));
                }
            };

            if attempt >= self.settings.max_retries {
                return Err(anyhow!(
                    "{} {} failed after {} attempts: {}",
                    method,
                    path,
                    attempt + 1,
                    retry_reason
                ));
            }

            let delay = retry_delay(attempt);
            warn!(
                m = %method,
                r = %path,
                uid = %request_id,
                reason = %retry_reason,
                delay_ms = %delay.as_millis(),
                "rest_request_retry"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn settings() -> RestSettings {
        RestSettings {
            endpoint: "http://localhost:8080".to_string(),
            user_agent: "test".to_string(),
            client_id: None,
            client_secret: None,
            access_token: None,
            timeout: Duration::from_secs(1),
            max_retries: 3,
            force_trace: None,
        }
    }

    #[test]
    fn test_no_credentials() {
        assert_eq!(settings().authorization(), None);
    }

    #[test]
    fn test_basic_auth() {
        let mut s = settings();
        s.client_id = Some("admin".to_string());
        s.client_secret = Some("secret".to_string());
        // base64("admin:secret")
        assert_eq!(s.authorization(), Some("Basic YWRtaW46c2VjcmV0".to_string()));
    }

    #[test]
    fn test_access_token_takes_precedence() {
        let mut s = settings();
        s.client_id = Some("admin".to_string());
        s.client_secret = Some("secret".to_string());
        s.access_token = Some("tok".to_string());
        assert_eq!(s.authorization(), Some("Bearer tok".to_string()));
    }

    #[test]
    fn test_retry_delay_backoff_capped() {
        assert_eq!(retry_delay(0), Duration::from_millis(100));
        assert_eq!(retry_delay(1), Duration::from_millis(200));
        assert_eq!(retry_delay(3), Duration::from_millis(800));
        assert_eq!(retry_delay(4), Duration::from_secs(1));
        assert_eq!(retry_delay(40), Duration::from_secs(1));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let service = ServiceConfig {
            endpoint: "http://registry/".to_string(),
            ..Default::default()
        };
        let s = RestSettings::from_service(&service, "ua", Duration::from_secs(1), 0, None);
        assert_eq!(s.endpoint, "http://registry");
    }

    #[test]
    fn test_empty_endpoint_rejected() {
        let mut s = settings();
        s.endpoint = String::new();
        assert!(RestClient::new(s).is_err());
    }

    /// Accepts connections and never answers; returns the address and an accept counter
    async fn silent_server() -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                open.push(stream);
            }
        });
        (format!("http://{addr}"), accepted)
    }

    #[test]
    fn test_idempotent_methods() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::PUT));
        assert!(!is_idempotent(&Method::POST));
    }

    #[tokio::test]
    async fn test_post_not_resent_after_timeout() {
        let (endpoint, accepted) = silent_server().await;
        let mut s = settings();
        s.endpoint = endpoint;
        s.timeout = Duration::from_millis(200);
        s.max_retries = 3;
        let client = RestClient::new(s).unwrap();

        let result = client.post_empty("/campaign/C1/execute").await;
        assert!(result.is_err());
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_resent_after_timeout() {
        let (endpoint, accepted) = silent_server().await;
        let mut s = settings();
        s.endpoint = endpoint;
        s.timeout = Duration::from_millis(200);
        s.max_retries = 2;
        let client = RestClient::new(s).unwrap();

        let result: anyhow::Result<Option<serde_json::Value>> = client.get("/campaign/C1").await;
        assert!(result.is_err());
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connection_refused_is_error() {
        let mut s = settings();
        // Reserved port with nothing listening
        s.endpoint = "http://127.0.0.1:9".to_string();
        s.max_retries = 1;
        let client = RestClient::new(s).unwrap();
        let result: anyhow::Result<Option<serde_json::Value>> = client.get("/campaign/C1").await;
        assert!(result.is_err());
    }
}
