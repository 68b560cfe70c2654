//! Proxy-aware HTTP client.
//!
//! Each worker owns exactly one `WorkerClient`, built once and reused for
//! that worker's lifetime, bound to the worker's own upstream proxy so auth
//! state, proxy credentials, and cookie jar never cross identities.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection_pool::PoolConfig;
use crate::errors::ErrorCategory;
use crate::models::ProxyConfig;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("authentication failed (401/403)")]
    Auth,
    #[error("rate limited after exhausting retries")]
    RateLimitExhausted,
    #[error("request timed out after exhausting retries")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum ClientResponse {
    Empty,
    Json(Value),
}

/// One worker's dedicated HTTP client.
pub struct WorkerClient {
    http: reqwest::Client,
    /// Caps concurrent in-flight requests at `PoolConfig.pool_max_connections`.
    /// reqwest's builder has no direct knob for a hard connection ceiling
    /// (`pool_max_idle_per_host` only bounds idle keep-alives), so the limit
    /// is enforced here instead.
    connection_permits: Arc<Semaphore>,
}

impl WorkerClient {
    /// Builds the client: TLS verification disabled (proxies frequently
    /// terminate TLS with untrusted leaves), HTTP/2 disabled, 5 transport
    /// retries, proxy-routed, with a freshly randomized pool configuration.
    pub fn build(proxy: &ProxyConfig) -> Result<Self, ClientError> {
        let pool_config = PoolConfig::randomized();
        let proxy_url = proxy
            .to_validated_url()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .http1_only()
            .proxy(
                reqwest::Proxy::all(proxy_url.as_str())
                    .map_err(|e| ClientError::Transport(e.to_string()))?,
            );
        let connection_permits = Arc::new(Semaphore::new(pool_config.pool_max_connections));
        builder = pool_config.apply_to_builder(builder);

        let http = builder
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        Ok(Self { http, connection_permits })
    }

    /// Builds a client with the same retry/rate-limit/classification policy
    /// as [`build`](Self::build) but no proxy, for exercising that policy
    /// against a local mock server in tests that have no forward proxy to
    /// route through.
    pub fn build_without_proxy() -> Result<Self, ClientError> {
        let pool_config = PoolConfig::randomized();
        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(true).http1_only();
        let connection_permits = Arc::new(Semaphore::new(pool_config.pool_max_connections));
        builder = pool_config.apply_to_builder(builder);
        let http = builder.build().map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self { http, connection_permits })
    }

    /// Issues one request with the client's retry/rate-limit/backoff policy.
    /// `rate_limit_cooldown` is the 900s wait, overridable for tests.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        mut headers: HeaderMap,
        body: Option<Value>,
        rate_limit_cooldown: Duration,
        cancel: &CancellationToken,
    ) -> Result<ClientResponse, ClientError> {
        headers.insert(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_str(&Uuid::new_v4().to_string()).unwrap(),
        );
        if !headers.contains_key(reqwest::header::ACCEPT_LANGUAGE) {
            headers.insert(
                reqwest::header::ACCEPT_LANGUAGE,
                HeaderValue::from_static("en-US,en;q=0.9"),
            );
        }

        let mut rate_limit_attempts = 0u32;
        let mut timeout_attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            jittered_pre_request_delay(cancel).await;

            let mut request = self.http.request(method.clone(), url).headers(headers.clone());
            if let Some(ref payload) = body {
                request = request.json(payload);
            }

            let _permit = tokio::select! {
                permit = self.connection_permits.acquire() => permit.expect("semaphore is never closed"),
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            };

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(ClientError::Auth);
                    }

                    if status.as_u16() == 429 {
                        rate_limit_attempts += 1;
                        if rate_limit_attempts > 3 {
                            return Err(ClientError::RateLimitExhausted);
                        }
                        warn!(attempt = rate_limit_attempts, "rate limited, cooling down");
                        if !sleep_cancellable(rate_limit_cooldown, cancel).await {
                            return Err(ClientError::Cancelled);
                        }
                        continue;
                    }

                    if status.as_u16() == 204 {
                        return Ok(ClientResponse::Empty);
                    }

                    let json = response.json::<Value>().await.unwrap_or(Value::Null);
                    return Ok(ClientResponse::Json(json));
                }
                Err(e) => {
                    let category = ErrorCategory::from_reqwest_error(&e);
                    if e.is_timeout() {
                        timeout_attempts += 1;
                        if timeout_attempts > 3 {
                            return Err(ClientError::Timeout);
                        }
                        let backoff = Duration::from_secs(2u64.pow(timeout_attempts));
                        debug!(attempt = timeout_attempts, ?backoff, "timeout, backing off");
                        if !sleep_cancellable(backoff, cancel).await {
                            return Err(ClientError::Cancelled);
                        }
                        continue;
                    }
                    warn!(category = category.label(), error = %e, "transport error");
                    return Err(ClientError::Transport(e.to_string()));
                }
            }
        }
    }
}

/// A small random inter-request delay in [0.5, 2.0)s to blunt bursts.
async fn jittered_pre_request_delay(cancel: &CancellationToken) {
    let millis = rand::thread_rng().gen_range(500..2000);
    let _ = sleep_cancellable(Duration::from_millis(millis), cancel).await;
}

/// Sleeps for `duration`, returning `false` if cancelled first.
async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}
