pub mod auth;
pub mod common;
pub mod config;
pub mod config_validation;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod reverse_proxy;
pub mod router;
pub mod routes;
pub mod server;
pub mod transport;
pub mod upstream;

pub use config::{GatewayConfig, GatewayMode};
pub use engine::ProxyEngine;
pub use error::{ApiError, ErrorCode, GatewayError};
