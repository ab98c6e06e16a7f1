//! Routing document loader.
//!
//! The document carries an explicit `routes` list and an optional `fallback`
//! block that maps service keys under a shared base path. Both are flattened
//! into [`RouteDefinition`]s here; validation of individual entries (empty
//! prefix or upstream) happens later when the route table is built.

use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_HEALTH_PATH: &str = "/healthz";
const DEFAULT_FALLBACK_BASE: &str = "/api";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteDefinition {
    pub name: String,
    pub prefix: String,
    pub upstream: String,
    pub strip_prefix: bool,
    pub rewrite: String,
    pub require_auth: bool,
    pub auth_strategy: String,
    pub health_path: String,
    pub methods: Vec<String>,
    /// Route-local forwarding timeout; the gateway default applies when unset.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackRoute {
    pub upstream: String,
    pub strip_prefix: bool,
    pub require_auth: bool,
    pub auth_strategy: String,
    pub health_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackDefinition {
    pub base_path: String,
    pub strip_base: bool,
    pub health_path: String,
    pub mapping: BTreeMap<String, FallbackRoute>,
}

impl FallbackDefinition {
    fn is_active(&self) -> bool {
        !self.base_path.is_empty() && !self.mapping.is_empty()
    }

    fn expand(&self) -> Vec<RouteDefinition> {
        let trimmed = self.base_path.trim_end_matches('/');
        let base = if trimmed.is_empty() { DEFAULT_FALLBACK_BASE } else { trimmed };

        self.mapping
            .iter()
            .map(|(key, mapping)| RouteDefinition {
                name: format!("fallback-{}", key),
                prefix: format!("{}/{}", base, key),
                upstream: mapping.upstream.clone(),
                strip_prefix: self.strip_base || mapping.strip_prefix,
                require_auth: mapping.require_auth,
                auth_strategy: mapping.auth_strategy.clone(),
                health_path: first_non_empty(&[
                    mapping.health_path.as_str(),
                    self.health_path.as_str(),
                    DEFAULT_HEALTH_PATH,
                ])
                .to_string(),
                ..RouteDefinition::default()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteFile {
    pub routes: Vec<RouteDefinition>,
    pub fallback: Option<FallbackDefinition>,
}

impl RouteFile {
    /// Explicit routes first, then fallback expansions in key order.
    pub fn into_definitions(self) -> Vec<RouteDefinition> {
        let mut defs = self.routes;
        if let Some(fallback) = self.fallback.as_ref().filter(|fb| fb.is_active()) {
            defs.extend(fallback.expand());
        }
        defs
    }
}

pub fn parse_route_definitions(document: &str) -> Result<Vec<RouteDefinition>, GatewayError> {
    if document.trim().is_empty() {
        return Ok(Vec::new());
    }
    let file: RouteFile = serde_yaml::from_str(document)?;
    Ok(file.into_definitions())
}

pub fn load_route_definitions(path: &Path) -> Result<Vec<RouteDefinition>, GatewayError> {
    if path.as_os_str().is_empty() {
        return Err(GatewayError::Config("routes file path is empty".to_string()));
    }
    let content = std::fs::read_to_string(path)?;
    let defs = parse_route_definitions(&content)?;
    log::debug!("Loaded {} route definitions from {}", defs.len(), path.display());
    Ok(defs)
}

fn first_non_empty<'a>(values: &[&'a str]) -> &'a str {
    values.iter().copied().find(|v| !v.is_empty()).unwrap_or("")
}
