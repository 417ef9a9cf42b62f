//! Rate-limit aware REST client
//!
//! Requests are grouped into [`Bucket`]s by normalized route. Each bucket
//! admits one request at a time, waits out exhausted windows, and retries
//! `429 Too Many Requests` responses in place so later requests on the same
//! route keep their order.

use crate::bucket::{route_key, Bucket, RequestEntry, HEADER_RESET_AFTER};
use crate::config::RestConfig;
use crate::error::Error;
use crate::protocol::GatewayBot;
use crate::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
use crate::Result;
use http::header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// Wait applied to a 429 that carries no retry hint
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

const EVENT_BUFFER: usize = 64;

/// Raised when a request has to wait for its bucket to reset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitEvent {
    /// Bucket route key
    pub route: String,
    /// Endpoint of the waiting request
    pub endpoint: String,
    pub method: Method,
    /// Time until the bucket resets
    pub reset_after: Duration,
}

/// REST client owning the per-route bucket map
pub struct RestClient<T: Transport = ReqwestTransport> {
    transport: T,
    token: String,
    config: RestConfig,
    buckets: Mutex<HashMap<String, Arc<Bucket>>>,
    events: broadcast::Sender<RateLimitEvent>,
}

impl RestClient<ReqwestTransport> {
    /// Create a client backed by `reqwest`
    pub fn new(token: impl Into<String>, config: RestConfig) -> Self {
        Self::with_transport(ReqwestTransport::new(), token, config)
    }
}

impl<T: Transport> RestClient<T> {
    /// Create a client over a custom transport
    pub fn with_transport(transport: T, token: impl Into<String>, config: RestConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            transport,
            token: token.into(),
            config,
            buckets: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to rate-limit notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RateLimitEvent> {
        self.events.subscribe()
    }

    /// Look up the bucket for a route key (`METHOD:path`)
    pub fn bucket(&self, route: &str) -> Option<Arc<Bucket>> {
        self.buckets.lock().get(route).cloned()
    }

    fn bucket_for(&self, route: &str) -> Arc<Bucket> {
        let mut buckets = self.buckets.lock();
        Arc::clone(
            buckets
                .entry(route.to_string())
                .or_insert_with(|| Arc::new(Bucket::new(route))),
        )
    }

    pub async fn get(&self, endpoint: &str) -> Result<Value> {
        self.add_request(Method::GET, endpoint, None).await
    }

    pub async fn post(&self, endpoint: &str, body: Value) -> Result<Value> {
        self.add_request(Method::POST, endpoint, Some(body)).await
    }

    pub async fn put(&self, endpoint: &str, body: Value) -> Result<Value> {
        self.add_request(Method::PUT, endpoint, Some(body)).await
    }

    pub async fn patch(&self, endpoint: &str, body: Value) -> Result<Value> {
        self.add_request(Method::PATCH, endpoint, Some(body)).await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<Value> {
        self.add_request(Method::DELETE, endpoint, None).await
    }

    /// Fetch the gateway URL, recommended shard count and identify budget
    pub async fn gateway_bot(&self) -> Result<GatewayBot> {
        let value = self.get("/gateway/bot").await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Queue a request on its route's bucket and run it once admitted.
    ///
    /// Returns the decoded JSON body, or `Value::Null` for an empty body.
    pub async fn add_request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let route = route_key(&method, endpoint);
        let bucket = self.bucket_for(&route);
        let mut entry = bucket.queue().add(RequestEntry {
            method,
            endpoint: endpoint.to_string(),
            body,
        });

        loop {
            entry.wait().await?;

            if let Some(reset_after) = bucket.reset_after(Instant::now()) {
                let request = entry.value();
                debug!(
                    "[REST] {} exhausted, waiting {:?} before {} {}",
                    route, reset_after, request.method, request.endpoint
                );
                let _ = self.events.send(RateLimitEvent {
                    route: route.clone(),
                    endpoint: request.endpoint.clone(),
                    method: request.method.clone(),
                    reset_after,
                });
                tokio::time::sleep(reset_after).await;
            }

            let request = self.build_request(entry.value())?;
            let response = self.transport.execute(request).await?;
            let now = Instant::now();
            bucket.update(&response.headers, now);

            if response.status.is_success() {
                entry.release();
                return decode_body(&response.body);
            }

            if response.status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = retry_after(&response);
                warn!("[REST] 429 on {}, retrying in {:?}", route, retry_after);
                bucket.mark_exhausted(retry_after, now);
                continue;
            }

            // Dropping the entry advances the bucket
            let status = response.status;
            debug!("[REST] {} failed with {}", route, status);
            return Err(Error::Http {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }
    }

    fn build_request(&self, entry: &RequestEntry) -> Result<HttpRequest> {
        let mut headers = HeaderMap::new();
        let mut authorization = HeaderValue::from_str(&format!("Bot {}", self.token))?;
        authorization.set_sensitive(true);
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(USER_AGENT, HeaderValue::from_str(&self.config.user_agent)?);

        let body = match &entry.body {
            Some(body) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                Some(serde_json::to_vec(body)?)
            }
            None => None,
        };

        let base = self.config.base_url.trim_end_matches('/');
        let url = if entry.endpoint.starts_with('/') {
            format!("{}{}", base, entry.endpoint)
        } else {
            format!("{}/{}", base, entry.endpoint)
        };

        Ok(HttpRequest {
            method: entry.method.clone(),
            url,
            headers,
            body,
        })
    }
}

fn decode_body(body: &[u8]) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(body)?)
}

/// Wait requested by a 429: `Retry-After`, then the bucket reset, then the body
fn retry_after(response: &HttpResponse) -> Duration {
    let from_header = |name: &str| {
        response
            .header(name)
            .and_then(|value| value.trim().parse::<f64>().ok())
    };

    from_header(RETRY_AFTER.as_str())
        .or_else(|| from_header(HEADER_RESET_AFTER))
        .or_else(|| {
            serde_json::from_slice::<Value>(&response.body)
                .ok()
                .and_then(|body| body.get("retry_after").and_then(Value::as_f64))
        })
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(DEFAULT_RETRY_AFTER)
}
