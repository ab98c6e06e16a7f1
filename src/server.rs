use crate::engine::ProxyEngine;
use crate::error::GatewayError;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use rustls::ServerConfig;
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Create TLS server configuration from certificate and private key files
pub fn create_tls_config(private_key_path: &str, cert_path: &str) -> Result<ServerConfig, GatewayError> {
    let mut private_key_file = BufReader::new(
        File::open(private_key_path)
            .map_err(|e| GatewayError::Tls(format!("Failed to open private key file: {}", e)))?,
    );
    let mut cert_file = BufReader::new(
        File::open(cert_path).map_err(|e| GatewayError::Tls(format!("Failed to open certificate file: {}", e)))?,
    );

    let certs = rustls_pemfile::certs(&mut cert_file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Tls(format!("Failed to read certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(GatewayError::Tls("No valid certificate found".to_string()));
    }

    let private_key = rustls_pemfile::private_key(&mut private_key_file)
        .map_err(|e| GatewayError::Tls(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| GatewayError::Tls("No valid private key found".to_string()))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(|e| GatewayError::Tls(format!("Failed to create TLS config: {}", e)))
}

/// Accepts connections on `listener` and hands each request to the engine
/// until `shutdown` is cancelled. In-flight connections finish on their own.
pub async fn serve(
    engine: Arc<ProxyEngine>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) -> Result<(), GatewayError> {
    let local_addr = listener.local_addr()?;
    match tls {
        Some(_) => info!("Gateway listening on https://{}", local_addr),
        None => info!("Gateway listening on http://{}", local_addr),
    }

    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Listener on {} shutting down", local_addr);
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);

        let engine = engine.clone();
        match tls.clone() {
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve_connection(engine, tls_stream, remote_addr).await,
                        Err(e) => warn!("Error establishing TLS connection from {}: {}", remote_addr, e),
                    }
                });
            }
            None => {
                tokio::spawn(serve_connection(engine, stream, remote_addr));
            }
        }
    }
}

async fn serve_connection<S>(engine: Arc<ProxyEngine>, stream: S, remote_addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!("Accepted connection from {}", remote_addr);
    let service = service_fn(move |req| {
        let engine = engine.clone();
        async move { Ok::<_, Infallible>(engine.handle(req, remote_addr).await) }
    });

    if let Err(e) = ServerBuilder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        error!("Error serving connection from {}: {}", remote_addr, e);
    }
}

/// Binds the configured address and serves until `shutdown` fires.
pub async fn run(
    engine: Arc<ProxyEngine>,
    addr: SocketAddr,
    private_key: Option<&str>,
    certificate: Option<&str>,
    shutdown: CancellationToken,
) -> Result<(), GatewayError> {
    let tls = match (private_key, certificate) {
        (Some(key), Some(cert)) => {
            debug!("Loading TLS certificate from: {}", cert);
            debug!("Loading TLS private key from: {}", key);
            Some(TlsAcceptor::from(Arc::new(create_tls_config(key, cert)?)))
        }
        _ => None,
    };

    info!("Binding listener to: {}", addr);
    let listener = TcpListener::bind(addr).await?;
    serve(engine, listener, tls, shutdown).await
}
