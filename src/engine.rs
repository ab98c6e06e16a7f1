//! The proxy engine: request dispatch, forwarding and diagnostics.

use crate::auth::{TokenValidator, ensure_auth};
use crate::common::{ResponseBuilder, remote_ip, user_agent};
use crate::config::{GatewayConfig, GatewayMode};
use crate::error::{ApiError, ErrorCode, GatewayError};
use crate::lifecycle::{HealthProber, ReadyGate};
use crate::metrics::{self, GatewayMetrics};
use crate::router::{Route, RouteTable};
use crate::routes::{RouteDefinition, load_route_definitions};
use crate::transport::{HyperTransport, ProxyBody, RetryTransport, Transport};
use crate::upstream::UpstreamStatusDoc;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, StatusCode};
use log::{info, warn};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

pub const METRICS_PATH: &str = "/metrics";
pub const DEBUG_ROUTES_PATH: &str = "/debug/routes";
pub const HEALTHZ_PATH: &str = "/healthz";

#[derive(Debug, Serialize)]
pub struct RouteInfo {
    pub name: String,
    pub prefix: String,
    pub upstream: String,
    pub require_auth: bool,
    pub auth_strategy: &'static str,
    pub status: UpstreamStatusDoc,
}

#[derive(Debug, Serialize)]
pub struct UpstreamHealth {
    pub upstream: String,
    pub status: UpstreamStatusDoc,
}

pub struct ProxyEngine {
    mode: GatewayMode,
    pub(crate) table: RouteTable,
    metrics: GatewayMetrics,
    validator: TokenValidator,
    pub(crate) prober: Arc<HealthProber>,
    pub(crate) ready: ReadyGate,
    pub(crate) started: AtomicBool,
    pub(crate) health_interval: Duration,
    circuit_window: Duration,
    circuit_threshold: f64,
    circuit_cooldown: Duration,
    max_body_bytes: usize,
    tls: bool,
}

impl ProxyEngine {
    /// Builds the engine from the gateway configuration, loading the routes
    /// file. Loader failures are fatal only in `proxy_all` mode.
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let loaded = match config.routes_file.as_deref() {
            Some(path) => load_route_definitions(path),
            None => Err(GatewayError::Config("routes file path is empty".to_string())),
        };

        let definitions = match loaded {
            Ok(defs) => defs,
            Err(e) if config.mode == GatewayMode::ProxyAll => {
                return Err(GatewayError::Config(format!(
                    "proxy mode requires routes configuration: {}",
                    e
                )));
            }
            Err(e) => {
                warn!("Unable to load routes file, proxy_all disabled: {}", e);
                Vec::new()
            }
        };

        let transport: Arc<dyn Transport> = Arc::new(RetryTransport::new(
            HyperTransport::new(config),
            config.upstream_retries,
        ));
        Self::from_definitions(config, definitions, transport)
    }

    /// Builds the engine from already loaded definitions and a transport.
    pub fn from_definitions(
        config: &GatewayConfig,
        definitions: Vec<RouteDefinition>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, GatewayError> {
        let table = RouteTable::build(definitions, transport, config.upstream_timeout())?;
        info!(
            "Proxy engine in {} mode with {} routes over {} upstreams",
            config.mode,
            table.routes().len(),
            table.upstream_count()
        );

        Ok(Self {
            mode: config.mode,
            table,
            metrics: GatewayMetrics::new(),
            validator: TokenValidator::new(config.jwt_secret()),
            prober: Arc::new(HealthProber::new()),
            ready: ReadyGate::new(),
            started: AtomicBool::new(false),
            health_interval: config.health_interval(),
            circuit_window: config.circuit_window(),
            circuit_threshold: config.circuit_threshold,
            circuit_cooldown: config.circuit_cooldown(),
            max_body_bytes: config.max_body_bytes,
            tls: config.private_key.is_some() && config.certificate.is_some(),
        })
    }

    pub fn mode(&self) -> GatewayMode {
        self.mode
    }

    pub fn routes(&self) -> &RouteTable {
        &self.table
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Entry point for the listener: the engine's own endpoints first, then
    /// the proxy.
    pub async fn handle<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if req.method() == Method::GET {
            match req.uri().path() {
                METRICS_PATH => return self.metrics_response(),
                DEBUG_ROUTES_PATH => return self.debug_routes(),
                HEALTHZ_PATH => return self.healthz(),
                _ => {}
            }
        }
        self.serve(req, remote_addr).await
    }

    /// Routes one request. Every local check runs before any upstream I/O.
    pub async fn serve<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if self.mode != GatewayMode::ProxyAll {
            return ResponseBuilder::api_error(&ApiError::not_found("proxy mode disabled (whitelist)"));
        }

        let Some(route) = self.table.match_route(req.uri().path()) else {
            return ResponseBuilder::api_error(&ApiError::not_found("no upstream mapping"));
        };

        if !route.allows(req.method()) {
            return ResponseBuilder::api_error(&ApiError::new(ErrorCode::MethodNotAllowed, "method not allowed"));
        }

        if let Err(reason) = route.target.is_available(Utc::now()) {
            self.metrics.observe(&route.name, StatusCode::SERVICE_UNAVAILABLE.as_u16(), Duration::ZERO);
            return ResponseBuilder::api_error(&ApiError::service_unavailable(reason));
        }

        if let Err(err) = ensure_auth(req.headers(), route.require_auth, route.auth_strategy, &self.validator) {
            self.metrics.observe(&route.name, err.status().as_u16(), Duration::ZERO);
            return ResponseBuilder::api_error(&err);
        }

        // The body read and the upstream exchange share one deadline.
        let deadline = tokio::time::Instant::now() + route.timeout;
        let (parts, body) = req.into_parts();
        let limited = Limited::new(body, self.max_body_bytes).collect();
        let body = match tokio::time::timeout_at(deadline, limited).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(e)) if e.downcast_ref::<LengthLimitError>().is_some() => {
                let err = ApiError::new(
                    ErrorCode::PayloadTooLarge,
                    format!("request body exceeds {} bytes", self.max_body_bytes),
                );
                return self.reject_body(route, &parts, err);
            }
            Ok(Err(e)) => {
                let err = ApiError::new(ErrorCode::BadRequest, format!("failed to read request body: {}", e));
                return self.reject_body(route, &parts, err);
            }
            Err(_) => {
                let err = ApiError::new(
                    ErrorCode::RequestTimeout,
                    format!("request body not received within {:?}", route.timeout),
                );
                return self.reject_body(route, &parts, err);
            }
        };

        self.forward(route, parts, body, remote_addr, deadline).await
    }

    fn reject_body(&self, route: &Route, parts: &Parts, err: ApiError) -> Response<ProxyBody> {
        warn!(
            "proxy request body rejected method={} path={} route={} status={} error={}",
            parts.method,
            parts.uri.path(),
            route.prefix,
            err.status().as_u16(),
            err.message
        );
        self.metrics.observe(&route.name, err.status().as_u16(), Duration::ZERO);
        ResponseBuilder::api_error(&err)
    }

    async fn forward(
        &self,
        route: &Route,
        parts: Parts,
        body: Bytes,
        remote_addr: SocketAddr,
        deadline: tokio::time::Instant,
    ) -> Response<ProxyBody> {
        let start = Instant::now();
        let path = route.rewrite_path(parts.uri.path());

        let result = match route.proxy.prepare_request(&parts, body, &path, remote_addr.ip(), self.tls) {
            Ok(outbound) => match tokio::time::timeout_at(deadline, route.proxy.forward(outbound)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout(route.timeout)),
            },
            Err(e) => Err(e),
        };
        let elapsed = start.elapsed();

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "proxy upstream error route={} path={} error={}",
                    route.prefix,
                    parts.uri.path(),
                    e
                );
                ResponseBuilder::api_error(&ApiError::bad_gateway(e.to_string()))
            }
        };

        let status = response.status().as_u16();
        self.metrics.observe(&route.name, status, elapsed);
        let tripped = route.target.record_result(
            status < 500,
            Utc::now(),
            self.circuit_window,
            self.circuit_threshold,
            self.circuit_cooldown,
        );
        if tripped {
            warn!("Circuit opened for upstream {}", route.target.name());
            self.spawn_probe(Arc::clone(&route.target));
        }

        info!(
            "proxy request method={} path={} route={} upstream={} status={} latency_ms={} remote_ip={} user_agent={:?}",
            parts.method,
            parts.uri.path(),
            route.prefix,
            route.target.name(),
            status,
            elapsed.as_millis(),
            remote_ip(&parts.headers, remote_addr),
            user_agent(&parts.headers),
        );

        response
    }

    pub fn metrics_response(&self) -> Response<ProxyBody> {
        ResponseBuilder::with_content_type(StatusCode::OK, metrics::CONTENT_TYPE, self.metrics.encode())
    }

    pub fn route_infos(&self) -> Vec<RouteInfo> {
        self.table
            .routes()
            .iter()
            .map(|route| RouteInfo {
                name: route.name.clone(),
                prefix: route.prefix.clone(),
                upstream: route.target.url().to_string(),
                require_auth: route.require_auth,
                auth_strategy: route.auth_strategy.as_str(),
                status: route.target.snapshot().to_doc(),
            })
            .collect()
    }

    pub fn debug_routes(&self) -> Response<ProxyBody> {
        ResponseBuilder::json(StatusCode::OK, &self.route_infos())
    }

    /// Per-upstream status; 503 when any upstream is unhealthy.
    pub fn healthz(&self) -> Response<ProxyBody> {
        let mut healthy = true;
        let payload: Vec<UpstreamHealth> = self
            .table
            .upstreams()
            .map(|target| {
                let status = target.snapshot();
                healthy &= status.healthy;
                UpstreamHealth {
                    upstream: target.url().to_string(),
                    status: status.to_doc(),
                }
            })
            .collect();

        let status = if healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        ResponseBuilder::json(status, &payload)
    }
}
