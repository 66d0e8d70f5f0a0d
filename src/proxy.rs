//! The gated proxy server
//!
//! One listener, two behaviors: `POST /api/map/reload` stamps the cooldown
//! gate and runs the reload pipeline while holding the gate lock; every
//! other request either gets the bundled placeholder page (gate Cooling) or
//! is relayed to the upstream (gate Fresh).

use crate::error::{json_error_response, ProxyErrorCode};
use crate::gate::Gate;
use crate::reload::ReloadPipeline;
use crate::upstream::UpstreamClient;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Administrative endpoint that triggers a reload
pub const RELOAD_PATH: &str = "/api/map/reload";

/// Placeholder page served while the gate is Cooling, baked into the binary
const PLACEHOLDER: &str = include_str!("../refresh.html");

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Shared wiring handed to every connection task
pub struct ProxyContext {
    pub gate: Arc<Gate>,
    pub pipeline: Arc<ReloadPipeline>,
    pub upstream: Arc<UpstreamClient>,
    pub request_timeout: Duration,
}

/// The gated reverse proxy server
pub struct GatedProxy {
    bind_addr: SocketAddr,
    context: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatedProxy {
    pub fn new(bind_addr: SocketAddr, context: ProxyContext, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            context: Arc::new(context),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, upstream = %self.context.upstream.authority(), "Gated proxy listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gated proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    context: Arc<ProxyContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&context);
        async move { handle_request(req, ctx, addr).await }
    });

    // Use auto::Builder to support both HTTP/1.1 and HTTP/2 (h2c)
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    context: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Only POST on the reload path is administrative; anything else falls
    // through to the gated forwarder like a normal request.
    if req.method() == Method::POST && req.uri().path() == RELOAD_PATH {
        return handle_reload(&context).await;
    }

    handle_forward(req, &context, client_addr).await
}

/// The administrative reload entry point.
///
/// Stamps the gate first so the cooldown window covers the entire pipeline
/// run, then executes the steps while still holding the gate lock. The lock
/// is released on every exit path when the guard drops.
async fn handle_reload(
    context: &ProxyContext,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let _guard = context.gate.begin_reload().await;
    info!(steps = context.pipeline.len(), "Reload requested, cooldown window opened");

    match context.pipeline.run().await {
        Ok(()) => {
            info!("Reload pipeline completed");
            Ok(text_response(StatusCode::OK, "OK"))
        }
        Err(e) => {
            // Gate stays Cooling: the window was already stamped and no
            // attempt is made to revert to a prior known-good state.
            error!(error = %e, "Reload pipeline failed");
            Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
            ))
        }
    }
}

/// The gated forwarder: placeholder while Cooling, upstream relay otherwise.
async fn handle_forward(
    mut req: Request<Incoming>,
    context: &ProxyContext,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Blocks here while a reload holds the gate, so no forwarding decision
    // can interleave with an in-progress reload.
    if context.gate.check_gated().await {
        debug!(method = %req.method(), uri = %req.uri(), "Gate is cooling, serving placeholder");
        return Ok(placeholder_response());
    }

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Set proxy headers. X-Forwarded-* are overwritten rather than appended
    // to prevent client spoofing; this proxy is the first trusted hop.
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Forwarding request to upstream");

    let timeout = context.request_timeout;
    let result = tokio::time::timeout(timeout, context.upstream.send_request(req)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(upstream = %context.upstream.authority(), error = %e, "Failed to forward request to upstream");
            Ok(json_error_response(
                ProxyErrorCode::UpstreamUnreachable,
                "Failed to connect to upstream",
            ))
        }
        Err(_) => {
            warn!(
                upstream = %context.upstream.authority(),
                timeout_secs = timeout.as_secs(),
                "Upstream request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Upstream did not respond within {} seconds", timeout.as_secs()),
            ))
        }
    }
}

/// The fixed placeholder page, served verbatim with a success status.
fn placeholder_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(
            Full::new(Bytes::from_static(PLACEHOLDER.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}

/// Helper to create a plain-text response
fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_response() {
        let response = placeholder_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
    }

    #[test]
    fn test_placeholder_is_html() {
        assert!(PLACEHOLDER.contains("<html"));
    }

    #[test]
    fn test_text_response() {
        let response = text_response(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
