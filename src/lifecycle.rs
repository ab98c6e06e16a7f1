//! Readiness and the background health loop.

use crate::engine::ProxyEngine;
use crate::error::GatewayError;
use crate::upstream::UpstreamTarget;
use bytes::Bytes;
use futures::future::join_all;
use http_body_util::Empty;
use hyper::Request;
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);

/// One-shot readiness signal. Closing is idempotent and wakes every waiter.
pub struct ReadyGate {
    tx: watch::Sender<bool>,
}

impl ReadyGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Active health checker with its own client and a fixed timeout.
pub struct HealthProber {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    timeout: Duration,
}

impl HealthProber {
    pub fn new() -> Self {
        Self::with_timeout(PROBE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        Self {
            client: Client::builder(TokioExecutor::new()).build(HttpsConnector::new_with_connector(http)),
            timeout,
        }
    }

    /// Probes `target` once and records the outcome on it. Never fails.
    pub async fn check(&self, target: &UpstreamTarget) {
        let url = target.health_url();
        let request = match Request::get(url.as_str()).body(Empty::<Bytes>::new()) {
            Ok(request) => request,
            Err(e) => {
                warn!("Health check for {} skipped, bad url {}: {}", target.name(), url, e);
                return;
            }
        };

        match tokio::time::timeout(self.timeout, self.client.request(request)).await {
            Err(_) => {
                warn!("Health check for {} timed out after {:?}", target.name(), self.timeout);
                target.mark_unhealthy(GatewayError::Timeout(self.timeout));
            }
            Ok(Err(e)) => {
                warn!("Health check for {} failed: {}", target.name(), e);
                target.mark_unhealthy(e);
            }
            Ok(Ok(response)) if response.status().as_u16() >= 400 => {
                let status = response.status().as_u16();
                warn!("Health check for {} returned {}", target.name(), status);
                target.mark_unhealthy(format!("health check status {}", status));
            }
            Ok(Ok(_)) => {
                debug!("Health check for {} ok", target.name());
                target.mark_healthy();
            }
        }
    }
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyEngine {
    /// Starts the health loop. Only the first call per engine has an effect.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Proxy engine already started");
            return;
        }

        if self.table.upstream_count() == 0 {
            info!("No upstreams configured, gateway ready");
            self.ready.close();
            return;
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_health_checks().await;
            engine.ready.close();
            info!("Initial health checks complete, gateway ready");

            let interval = if engine.health_interval.is_zero() {
                DEFAULT_HEALTH_INTERVAL
            } else {
                engine.health_interval
            };
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Health loop stopped");
                        return;
                    }
                    _ = ticker.tick() => engine.run_health_checks().await,
                }
            }
        });
    }

    /// Resolves once the first probe round finished, or errors when `cancel`
    /// fires first.
    pub async fn wait_until_ready(&self, cancel: &CancellationToken) -> Result<(), GatewayError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            _ = self.ready.wait() => Ok(()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_closed()
    }

    /// Probes every distinct upstream concurrently.
    pub async fn run_health_checks(&self) {
        join_all(self.table.upstreams().map(|target| self.prober.check(target))).await;
    }

    /// Fire-and-forget re-probe after the circuit opened.
    pub(crate) fn spawn_probe(&self, target: Arc<UpstreamTarget>) {
        let prober = Arc::clone(&self.prober);
        tokio::spawn(async move {
            prober.check(&target).await;
        });
    }
}
