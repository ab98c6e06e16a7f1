//! Upstream HTTP transport.
//!
//! [`HyperTransport`] talks to the network through a pooled hyper-util
//! client. [`RetryTransport`] wraps any [`Transport`] and re-sends idempotent
//! GET requests with exponential backoff.

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Response};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// Response body handed back to clients: either a streamed upstream body or
/// a locally generated one.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const BASE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request. HTTP error statuses are returned as responses.
    async fn round_trip(&self, req: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, GatewayError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn round_trip(&self, req: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, GatewayError> {
        (**self).round_trip(req).await
    }
}

/// Wraps a locally built body so it can share the upstream body type.
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HyperTransport {
    pub fn new(config: &GatewayConfig) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        if config.connect_timeout_secs > 0 {
            http.set_connect_timeout(Some(Duration::from_secs(config.connect_timeout_secs)));
        }

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .build(HttpsConnector::new_with_connector(http));

        Self { client }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn round_trip(&self, req: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, GatewayError> {
        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;
        Ok(response.map(|body| body.boxed()))
    }
}

/// Delay before attempt `attempt` (zero-based): none for the first attempt,
/// then 100ms doubling per attempt, capped at one second.
pub fn backoff_delay(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    BASE_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
}

pub struct RetryTransport<T> {
    inner: T,
    retries: u32,
}

impl<T: Transport> RetryTransport<T> {
    pub fn new(inner: T, retries: u32) -> Self {
        Self { inner, retries }
    }
}

fn rebuild(
    method: &Method,
    uri: &hyper::Uri,
    version: hyper::Version,
    headers: &hyper::HeaderMap,
    body: &Bytes,
) -> Result<Request<Full<Bytes>>, GatewayError> {
    let mut builder = Request::builder().method(method.clone()).uri(uri.clone()).version(version);
    if let Some(h) = builder.headers_mut() {
        *h = headers.clone();
    }
    Ok(builder.body(Full::new(body.clone()))?)
}

#[async_trait]
impl<T: Transport> Transport for RetryTransport<T> {
    async fn round_trip(&self, req: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, GatewayError> {
        let attempts = if req.method().as_str().eq_ignore_ascii_case("GET") {
            self.retries.saturating_add(1)
        } else {
            1
        };

        let (parts, body) = req.into_parts();
        let body = body.collect().await.map(|c| c.to_bytes()).unwrap_or_else(|never| match never {});

        let mut last_error = None;
        for attempt in 0..attempts {
            let delay = backoff_delay(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let req = rebuild(&parts.method, &parts.uri, parts.version, &parts.headers, &body)?;
            match self.inner.round_trip(req).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!("Attempt {}/{} to {} failed: {}", attempt + 1, attempts, parts.uri, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::Upstream("no attempts made".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then answers 200.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        seen: Mutex<Vec<(Method, String, Bytes)>>,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn round_trip(&self, req: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, GatewayError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let (parts, body) = req.into_parts();
            let body = body.collect().await.unwrap().to_bytes();
            let token = parts.headers.get("x-token").map(|v| v.to_str().unwrap().to_string());
            self.seen
                .lock()
                .unwrap()
                .push((parts.method, token.unwrap_or_default(), body));
            if call < self.failures {
                return Err(GatewayError::Upstream("connection refused".to_string()));
            }
            Ok(Response::builder().status(StatusCode::OK).body(full_body("ok")).unwrap())
        }
    }

    fn request(method: Method, body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri("http://hotel:8081/hotels")
            .header("x-token", "abc")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(0), Duration::ZERO);
        assert_eq!(backoff_delay(1), Duration::from_millis(100));
        assert_eq!(backoff_delay(2), Duration::from_millis(200));
        assert_eq!(backoff_delay(4), Duration::from_millis(800));
        assert_eq!(backoff_delay(5), MAX_BACKOFF);
        assert_eq!(backoff_delay(40), MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_retried_with_backoff() {
        let flaky = Arc::new(Flaky::new(2));
        let transport = RetryTransport::new(flaky.clone(), 2);

        let started = tokio::time::Instant::now();
        let response = transport.round_trip(request(Method::GET, "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(350), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_error_returned_when_exhausted() {
        let flaky = Arc::new(Flaky::new(10));
        let transport = RetryTransport::new(flaky.clone(), 1);

        let err = transport.round_trip(request(Method::GET, "")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Upstream(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_post_is_not_retried() {
        let flaky = Arc::new(Flaky::new(1));
        let transport = RetryTransport::new(flaky.clone(), 3);

        assert!(transport.round_trip(request(Method::POST, "{}")).await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_attempt_carries_the_original_request() {
        let flaky = Arc::new(Flaky::new(1));
        let transport = RetryTransport::new(flaky.clone(), 1);

        transport.round_trip(request(Method::GET, "payload")).await.unwrap();
        let seen = flaky.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        for (method, token, body) in seen.iter() {
            assert_eq!(method, Method::GET);
            assert_eq!(token, "abc");
            assert_eq!(&body[..], b"payload");
        }
    }

    #[tokio::test]
    async fn test_success_returns_immediately() {
        let flaky = Arc::new(Flaky::new(0));
        let transport = RetryTransport::new(flaky.clone(), 5);
        transport.round_trip(request(Method::GET, "")).await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }
}
