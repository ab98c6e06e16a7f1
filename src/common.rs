use crate::error::ApiError;
use crate::transport::{ProxyBody, full_body};
use hyper::header::{CONTENT_TYPE, HeaderMap, USER_AGENT};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;

/// Response builders shared by the engine endpoints and error paths.
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Serializes `payload` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(status: StatusCode, payload: &T) -> Response<ProxyBody> {
        match serde_json::to_vec(payload) {
            Ok(body) => Self::with_content_type(status, "application/json", body),
            Err(e) => {
                log::error!("Failed to serialize response body: {}", e);
                Self::internal_server_error()
            }
        }
    }

    /// `{"code": ..., "message": ...}` with the status derived from the code.
    pub fn api_error(err: &ApiError) -> Response<ProxyBody> {
        Self::json(err.status(), err)
    }

    pub fn with_content_type(status: StatusCode, content_type: &'static str, body: impl Into<bytes::Bytes>) -> Response<ProxyBody> {
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, content_type)
            .body(full_body(body))
            .unwrap()
    }

    pub fn internal_server_error() -> Response<ProxyBody> {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(full_body("Internal Server Error"))
            .unwrap()
    }
}

/// Client address for logging: first `X-Forwarded-For` entry, else the socket IP.
pub fn remote_ip(headers: &HeaderMap, remote_addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| remote_addr.ip().to_string())
}

pub fn user_agent(headers: &HeaderMap) -> &str {
    headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}
