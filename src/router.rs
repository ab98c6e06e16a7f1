//! Route table built once from route definitions.

use crate::auth::AuthStrategy;
use crate::error::GatewayError;
use crate::reverse_proxy::ReverseProxy;
use crate::routes::{DEFAULT_HEALTH_PATH, RouteDefinition};
use crate::transport::Transport;
use crate::upstream::UpstreamTarget;
use hyper::Method;
use log::{debug, warn};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub struct Route {
    pub name: String,
    pub prefix: String,
    pub strip_prefix: bool,
    pub rewrite: String,
    pub require_auth: bool,
    pub auth_strategy: AuthStrategy,
    /// Empty means every method is allowed.
    pub methods: HashSet<Method>,
    pub timeout: Duration,
    pub target: Arc<UpstreamTarget>,
    pub proxy: ReverseProxy,
}

impl Route {
    /// True when the prefix equals `path` or is a `/`-bounded ancestor of it.
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    pub fn allows(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    /// Path sent upstream. Rewrite wins over strip; the root prefix never
    /// changes the path.
    pub fn rewrite_path(&self, path: &str) -> String {
        if self.prefix == "/" {
            return path.to_string();
        }

        if !self.rewrite.is_empty() {
            let suffix = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);
            return clean_path(&format!("{}{}", self.rewrite, suffix));
        }

        if self.strip_prefix {
            if let Some(rest) = path.strip_prefix(self.prefix.as_str()) {
                return if rest.starts_with('/') {
                    rest.to_string()
                } else {
                    format!("/{}", rest)
                };
            }
        }

        path.to_string()
    }
}

pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        return "/".to_string();
    }
    let mut prefix = if prefix.starts_with('/') {
        prefix.to_string()
    } else {
        format!("/{}", prefix)
    };
    if prefix.len() > 1 {
        let trimmed = prefix.trim_end_matches('/').len();
        prefix.truncate(trimmed.max(1));
    }
    prefix
}

/// Ensures a leading `/` and collapses repeated slashes.
pub fn clean_path(path: &str) -> String {
    let mut cleaned = String::with_capacity(path.len() + 1);
    cleaned.push('/');
    for c in path.chars() {
        if c == '/' && cleaned.ends_with('/') {
            continue;
        }
        cleaned.push(c);
    }
    cleaned
}

/// Routes ordered by prefix length, longest first, plus the distinct
/// upstream targets they share.
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Route>,
    upstreams: BTreeMap<String, Arc<UpstreamTarget>>,
}

impl RouteTable {
    pub fn build(
        defs: Vec<RouteDefinition>,
        transport: Arc<dyn Transport>,
        default_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let mut routes: Vec<Route> = Vec::with_capacity(defs.len());
        let mut upstreams: BTreeMap<String, Arc<UpstreamTarget>> = BTreeMap::new();

        for def in defs {
            if def.prefix.is_empty() || def.upstream.is_empty() {
                debug!("Skipping route definition without prefix or upstream: {:?}", def.name);
                continue;
            }

            let url = Url::parse(&def.upstream).map_err(|e| {
                GatewayError::Config(format!("invalid upstream for prefix {}: {}", def.prefix, e))
            })?;

            let target = upstreams
                .entry(url.as_str().to_string())
                .or_insert_with(|| {
                    let health_path = if def.health_path.is_empty() {
                        DEFAULT_HEALTH_PATH
                    } else {
                        def.health_path.as_str()
                    };
                    Arc::new(UpstreamTarget::new(url.clone(), health_path))
                })
                .clone();

            let prefix = normalize_prefix(&def.prefix);
            if let Some(existing) = routes.iter().find(|r| r.prefix == prefix) {
                warn!(
                    "Route {:?} shadowed: prefix {} is already served by route {:?}",
                    def.name, prefix, existing.name
                );
            }

            let methods = def
                .methods
                .iter()
                .map(|m| {
                    Method::from_bytes(m.trim().to_uppercase().as_bytes()).map_err(|_| {
                        GatewayError::Config(format!("invalid method {:?} for prefix {}", m, prefix))
                    })
                })
                .collect::<Result<HashSet<_>, _>>()?;

            routes.push(Route {
                name: if def.name.is_empty() { prefix.clone() } else { def.name },
                prefix,
                strip_prefix: def.strip_prefix,
                rewrite: def.rewrite,
                require_auth: def.require_auth,
                auth_strategy: AuthStrategy::parse(&def.auth_strategy),
                methods,
                timeout: def.timeout_secs.map(Duration::from_secs).unwrap_or(default_timeout),
                target,
                proxy: ReverseProxy::new(url, transport.clone()),
            });
        }

        // Stable: equal lengths keep definition order.
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(Self { routes, upstreams })
    }

    pub fn match_route(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(path))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Distinct targets in URL order.
    pub fn upstreams(&self) -> impl Iterator<Item = &Arc<UpstreamTarget>> {
        self.upstreams.values()
    }

    pub fn upstream_count(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ProxyBody, full_body};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::{Request, Response};

    struct NoopTransport;

    #[async_trait]
    impl Transport for NoopTransport {
        async fn round_trip(&self, _req: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, GatewayError> {
            Ok(Response::new(full_body("")))
        }
    }

    fn def(name: &str, prefix: &str, upstream: &str) -> RouteDefinition {
        RouteDefinition {
            name: name.to_string(),
            prefix: prefix.to_string(),
            upstream: upstream.to_string(),
            ..RouteDefinition::default()
        }
    }

    fn build(defs: Vec<RouteDefinition>) -> RouteTable {
        RouteTable::build(defs, Arc::new(NoopTransport), Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(""), "/");
        assert_eq!(normalize_prefix("/"), "/");
        assert_eq!(normalize_prefix("api"), "/api");
        assert_eq!(normalize_prefix("/api/"), "/api");
        assert_eq!(normalize_prefix("/api///"), "/api");
        assert_eq!(normalize_prefix("///"), "/");
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("v2//users"), "/v2/users");
        assert_eq!(clean_path("/v2/"), "/v2/");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = build(vec![
            def("short", "/api", "http://a:1"),
            def("long", "/api/v1/auth", "http://b:2"),
            def("mid", "/api/v1", "http://c:3"),
        ]);

        let prefixes: Vec<&str> = table.routes().iter().map(|r| r.prefix.as_str()).collect();
        assert_eq!(prefixes, vec!["/api/v1/auth", "/api/v1", "/api"]);

        assert_eq!(table.match_route("/api/v1/auth/login").unwrap().name, "long");
        assert_eq!(table.match_route("/api/v1/hotels").unwrap().name, "mid");
        assert_eq!(table.match_route("/api/other").unwrap().name, "short");
        assert!(table.match_route("/health").is_none());
    }

    #[test]
    fn test_prefix_boundary() {
        let table = build(vec![def("x", "/x", "http://a:1")]);
        assert!(table.match_route("/x").is_some());
        assert!(table.match_route("/x/y").is_some());
        assert!(table.match_route("/xy").is_none());
    }

    #[test]
    fn test_root_prefix_matches_everything() {
        let table = build(vec![def("root", "/", "http://a:1"), def("api", "/api", "http://b:2")]);
        assert_eq!(table.match_route("/api/x").unwrap().name, "api");
        assert_eq!(table.match_route("/anything").unwrap().name, "root");
        assert_eq!(table.match_route("/anything").unwrap().rewrite_path("/anything"), "/anything");
    }

    #[test]
    fn test_invalid_entries() {
        let table = build(vec![
            def("no-prefix", "", "http://a:1"),
            def("no-upstream", "/b", ""),
            def("", "/c/", "http://c:3"),
        ]);
        assert_eq!(table.routes().len(), 1);
        assert_eq!(table.routes()[0].name, "/c");

        let result = RouteTable::build(
            vec![def("bad", "/bad", "::not a url")],
            Arc::new(NoopTransport),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_shared_upstream_is_deduplicated() {
        let mut first = def("a", "/a", "http://hotel:8081");
        first.health_path = "/ready".to_string();
        let mut second = def("b", "/b", "http://hotel:8081");
        second.health_path = "/ignored".to_string();
        let table = build(vec![first, second, def("c", "/c", "http://payment:8083")]);

        assert_eq!(table.upstream_count(), 2);
        let a = &table.match_route("/a").unwrap().target;
        let b = &table.match_route("/b").unwrap().target;
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(a.health_path(), "/ready");
    }

    #[test]
    fn test_duplicate_prefix_first_definition_wins() {
        let table = build(vec![def("explicit", "/api/hotels", "http://a:1"), def("fallback-hotels", "/api/hotels/", "http://b:2")]);
        assert_eq!(table.match_route("/api/hotels/1").unwrap().name, "explicit");
    }

    #[test]
    fn test_rewrite_and_strip() {
        let mut strip = def("strip", "/api/hotels", "http://a:1");
        strip.strip_prefix = true;
        let mut rewrite = def("rewrite", "/api/v1/pay", "http://b:2");
        rewrite.rewrite = "/v2/".to_string();
        rewrite.strip_prefix = true;
        let table = build(vec![strip, rewrite, def("plain", "/plain", "http://c:3")]);

        let strip = table.match_route("/api/hotels").unwrap();
        assert_eq!(strip.rewrite_path("/api/hotels"), "/");
        assert_eq!(strip.rewrite_path("/api/hotels/42"), "/42");

        let rewrite = table.match_route("/api/v1/pay/charge").unwrap();
        assert_eq!(rewrite.rewrite_path("/api/v1/pay/charge"), "/v2/charge");

        let plain = table.match_route("/plain/x").unwrap();
        assert_eq!(plain.rewrite_path("/plain/x"), "/plain/x");
    }

    #[test]
    fn test_methods_and_timeouts() {
        let mut limited = def("limited", "/limited", "http://a:1");
        limited.methods = vec!["get".to_string(), " Post ".to_string()];
        limited.timeout_secs = Some(2);
        let table = build(vec![limited, def("open", "/open", "http://a:1")]);

        let limited = table.match_route("/limited").unwrap();
        assert!(limited.allows(&Method::GET));
        assert!(limited.allows(&Method::POST));
        assert!(!limited.allows(&Method::DELETE));
        assert_eq!(limited.timeout, Duration::from_secs(2));

        let open = table.match_route("/open").unwrap();
        assert!(open.allows(&Method::DELETE));
        assert_eq!(open.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_unparseable_method_rejects_the_table() {
        for bad in ["GET POST", ""] {
            let mut restricted = def("restricted", "/restricted", "http://a:1");
            restricted.methods = vec![bad.to_string()];
            let result = RouteTable::build(vec![restricted], Arc::new(NoopTransport), Duration::from_secs(1));
            match result {
                Err(GatewayError::Config(message)) => assert!(message.contains("/restricted"), "{}", message),
                Err(other) => panic!("unexpected error: {}", other),
                Ok(_) => panic!("methods {:?} accepted", bad),
            }
        }
    }
}
