//! Per-upstream health and circuit state.
//!
//! Two orthogonal flags live on one record: health, driven by the active
//! probe loop, and the circuit, driven by passive request outcomes. Each
//! target owns its lock so unrelated upstreams never contend.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use url::Url;

pub const CIRCUIT_OPEN_REASON: &str = "circuit_open";
pub const CIRCUIT_OPENED_ERROR: &str = "circuit opened due to error ratio";

const DEFAULT_WINDOW: Duration = Duration::from_secs(30);
const DEFAULT_THRESHOLD: f64 = 0.5;
/// Fewer samples than this never trip the breaker.
const MIN_SAMPLES: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamStatus {
    pub healthy: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: String,
    pub circuit_open_until: Option<DateTime<Utc>>,
    pub requests_in_window: u32,
    pub failures_in_window: u32,
    pub window_started_at: DateTime<Utc>,
    pub unhealthy_since: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
}

impl UpstreamStatus {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            healthy: true,
            last_checked: None,
            last_error: String::new(),
            circuit_open_until: None,
            requests_in_window: 0,
            failures_in_window: 0,
            window_started_at: now,
            unhealthy_since: None,
            consecutive_errors: 0,
        }
    }

    pub fn to_doc(&self) -> UpstreamStatusDoc {
        UpstreamStatusDoc {
            healthy: self.healthy,
            last_checked: self.last_checked.map(rfc3339),
            last_error: Some(self.last_error.clone()).filter(|e| !e.is_empty()),
            circuit_open_until: self.circuit_open_until.map(rfc3339),
            requests_in_window: self.requests_in_window,
            failures_in_window: self.failures_in_window,
            window_started_at: rfc3339(self.window_started_at),
            unhealthy_since: self.unhealthy_since.map(rfc3339),
            consecutive_errors: self.consecutive_errors,
        }
    }
}

/// JSON view of [`UpstreamStatus`] used by the diagnostics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatusDoc {
    pub healthy: bool,
    pub last_checked: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_open_until: Option<String>,
    pub requests_in_window: u32,
    pub failures_in_window: u32,
    pub window_started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unhealthy_since: Option<String>,
    pub consecutive_errors: u32,
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

#[derive(Debug)]
pub struct UpstreamTarget {
    name: String,
    url: Url,
    health_path: String,
    status: RwLock<UpstreamStatus>,
}

impl UpstreamTarget {
    pub fn new(url: Url, health_path: impl Into<String>) -> Self {
        let name = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => url.as_str().to_string(),
        };
        Self {
            name,
            url,
            health_path: health_path.into(),
            status: RwLock::new(UpstreamStatus::new(Utc::now())),
        }
    }

    /// Host (and port) of the upstream, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn health_path(&self) -> &str {
        &self.health_path
    }

    /// Probe URL: the target origin plus the health path. The target's own
    /// base path is not part of it.
    pub fn health_url(&self) -> String {
        let path = if self.health_path.starts_with('/') {
            self.health_path.clone()
        } else {
            format!("/{}", self.health_path)
        };
        format!("{}{}", self.url.origin().ascii_serialization(), path)
    }

    fn read(&self) -> RwLockReadGuard<'_, UpstreamStatus> {
        self.status.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, UpstreamStatus> {
        self.status.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> UpstreamStatus {
        self.read().clone()
    }

    pub fn mark_healthy(&self) {
        let now = Utc::now();
        let mut status = self.write();
        status.healthy = true;
        status.last_checked = Some(now);
        status.last_error.clear();
        status.unhealthy_since = None;
        status.consecutive_errors = 0;
        if status.circuit_open_until.is_some_and(|until| now > until) {
            status.circuit_open_until = None;
        }
    }

    pub fn mark_unhealthy(&self, err: impl std::fmt::Display) {
        let now = Utc::now();
        let mut status = self.write();
        status.healthy = false;
        status.last_checked = Some(now);
        status.last_error = err.to_string();
        if status.unhealthy_since.is_none() {
            status.unhealthy_since = Some(now);
        }
        status.consecutive_errors += 1;
    }

    /// `Err(reason)` when the circuit is open at `now` or the last probe failed.
    pub fn is_available(&self, now: DateTime<Utc>) -> Result<(), String> {
        let status = self.read();
        if status.circuit_open_until.is_some_and(|until| now < until) {
            return Err(CIRCUIT_OPEN_REASON.to_string());
        }
        if !status.healthy {
            return Err(status.last_error.clone());
        }
        Ok(())
    }

    /// Feeds one forwarded request into the sliding window. Returns true when
    /// this call opened the circuit.
    pub fn record_result(
        &self,
        success: bool,
        now: DateTime<Utc>,
        window: Duration,
        threshold: f64,
        cooldown: Duration,
    ) -> bool {
        let window = if window.is_zero() { DEFAULT_WINDOW } else { window };
        let threshold = if threshold <= 0.0 { DEFAULT_THRESHOLD } else { threshold };

        let mut status = self.write();

        if now.signed_duration_since(status.window_started_at) > to_delta(window) {
            status.window_started_at = now;
            status.requests_in_window = 0;
            status.failures_in_window = 0;
        }

        status.requests_in_window += 1;
        if success {
            status.consecutive_errors = 0;
            return false;
        }

        status.failures_in_window += 1;
        status.consecutive_errors += 1;

        if status.requests_in_window >= MIN_SAMPLES {
            let ratio = f64::from(status.failures_in_window) / f64::from(status.requests_in_window);
            if ratio >= threshold {
                status.circuit_open_until =
                    Some(now.checked_add_signed(to_delta(cooldown)).unwrap_or(DateTime::<Utc>::MAX_UTC));
                status.last_error = CIRCUIT_OPENED_ERROR.to_string();
                return true;
            }
        }
        false
    }
}
