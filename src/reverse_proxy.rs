use crate::error::GatewayError;
use crate::transport::{ProxyBody, Transport};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONNECTION, HOST, HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::{HeaderMap, Request, Response, Uri};
use std::net::IpAddr;
use std::sync::Arc;
use url::Url;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Forwards requests to one upstream through the shared transport.
pub struct ReverseProxy {
    transport: Arc<dyn Transport>,
    target_url: Url,
}

impl ReverseProxy {
    pub fn new(target_url: Url, transport: Arc<dyn Transport>) -> Self {
        Self { transport, target_url }
    }

    /// Joins the target base path with an already rewritten request path.
    pub fn build_target_uri(&self, path: &str, query: Option<&str>) -> Result<Uri, GatewayError> {
        let mut target = format!("{}{}", self.target_url.as_str().trim_end_matches('/'), path);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            target.push('?');
            target.push_str(query);
        }

        target
            .parse::<Uri>()
            .map_err(|e| GatewayError::Upstream(format!("invalid upstream uri {}: {}", target, e)))
    }

    /// Builds the outbound request from the inbound parts.
    pub fn prepare_request(
        &self,
        parts: &Parts,
        body: Bytes,
        path: &str,
        client_ip: IpAddr,
        tls: bool,
    ) -> Result<Request<Full<Bytes>>, GatewayError> {
        let uri = self.build_target_uri(path, parts.uri.query())?;

        let mut headers = parts.headers.clone();
        let original_host = headers.remove(HOST);
        strip_hop_by_hop(&mut headers);

        let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) if !prior.trim().is_empty() => format!("{}, {}", prior, client_ip),
            _ => client_ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR.clone(), value);
        }
        headers.insert(
            X_FORWARDED_PROTO.clone(),
            HeaderValue::from_static(if tls { "https" } else { "http" }),
        );
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST.clone(), host);
        }

        let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
        if let Some(h) = builder.headers_mut() {
            *h = headers;
        }
        Ok(builder.body(Full::new(body))?)
    }

    pub async fn forward(&self, req: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, GatewayError> {
        let mut response = self.transport.round_trip(req).await?;
        strip_hop_by_hop(response.headers_mut());
        Ok(response)
    }
}
