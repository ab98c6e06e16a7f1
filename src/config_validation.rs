//! Startup validation of the gateway configuration.
//!
//! Errors abort startup; warnings are logged and the gateway continues.

use crate::config::{GatewayConfig, GatewayMode};

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

pub fn validate(config: &GatewayConfig) -> ValidationResult {
    let mut result = ValidationResult::success();

    validate_listen_addr(config, &mut result);
    validate_routes(config, &mut result);
    validate_circuit(config, &mut result);
    validate_timeouts(config, &mut result);
    validate_tls(config, &mut result);
    validate_auth(config, &mut result);

    result
}

fn validate_listen_addr(config: &GatewayConfig, result: &mut ValidationResult) {
    let port = config.listen_addr.port();
    if port == 0 {
        result.add_error("Port 0 is reserved and cannot be used".to_string());
    } else if port < 1024 {
        result.add_warning(format!(
            "Using privileged port {} - may require elevated privileges",
            port
        ));
    }
}

fn validate_routes(config: &GatewayConfig, result: &mut ValidationResult) {
    match (&config.routes_file, config.mode) {
        (None, GatewayMode::ProxyAll) => {
            result.add_error("proxy_all mode requires routes_file".to_string());
        }
        (Some(path), GatewayMode::ProxyAll) if !path.exists() => {
            result.add_error(format!("Routes file not found: {}", path.display()));
        }
        (Some(path), GatewayMode::Whitelist) if !path.exists() => {
            result.add_warning(format!(
                "Routes file not found: {}; dynamic routing disabled",
                path.display()
            ));
        }
        _ => {}
    }
}

fn validate_circuit(config: &GatewayConfig, result: &mut ValidationResult) {
    let threshold = config.circuit_threshold;
    if threshold.is_nan() || threshold > 1.0 {
        result.add_error(format!("circuit_threshold must not exceed 1, got {}", threshold));
    } else if threshold <= 0.0 {
        result.add_warning(format!("circuit_threshold is {}; the 0.5 default applies", threshold));
    }
    if config.circuit_window_secs == 0 {
        result.add_warning("circuit_window_secs is 0; the 30s default applies".to_string());
    }
    if config.circuit_cooldown_secs == 0 {
        result.add_warning("circuit_cooldown_secs is 0; a tripped circuit closes immediately".to_string());
    }
}

fn validate_timeouts(config: &GatewayConfig, result: &mut ValidationResult) {
    if config.upstream_timeout_secs == 0 {
        result.add_error("upstream_timeout_secs must be greater than 0".to_string());
    }
    if config.health_interval_secs == 0 {
        result.add_warning("health_interval_secs is 0; the 10s default applies".to_string());
    }
    if config.max_body_bytes == 0 {
        result.add_error("max_body_bytes must be greater than 0".to_string());
    }
    if config.upstream_retries > 5 {
        result.add_warning(format!(
            "upstream_retries = {} may multiply load on failing upstreams",
            config.upstream_retries
        ));
    }
}

fn validate_tls(config: &GatewayConfig, result: &mut ValidationResult) {
    match (&config.private_key, &config.certificate) {
        (Some(key), Some(cert)) => {
            for (label, path) in [("Private key", key), ("Certificate", cert)] {
                if let Err(e) = std::fs::metadata(path) {
                    result.add_error(format!("{} file not accessible: {}", label, e));
                }
            }
        }
        (Some(_), None) | (None, Some(_)) => {
            result.add_error("TLS requires both private_key and certificate".to_string());
        }
        (None, None) => {}
    }
}

fn validate_auth(config: &GatewayConfig, result: &mut ValidationResult) {
    if config.mode == GatewayMode::ProxyAll && config.jwt_secret().is_none() {
        result.add_warning(
            "jwt_secret is not set; routes using the validate strategy will reject every request".to_string(),
        );
    }
}
