//! Integration tests for reloadgate

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use reloadgate::gate::Gate;
use reloadgate::proxy::{GatedProxy, ProxyContext, RELOAD_PATH};
use reloadgate::reload::ReloadPipeline;
use reloadgate::upstream::{PoolConfig, UpstreamClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const UPSTREAM_BODY: &str = "upstream response";

/// Spawn a minimal upstream that answers every request with a fixed body.
async fn spawn_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(|_req: Request<Incoming>| async {
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from_static(
                        UPSTREAM_BODY.as_bytes(),
                    ))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    port
}

/// Pick a free port by briefly binding port 0.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Start a gated proxy with the given cooldown and pipeline; returns its port
/// and the shutdown sender keeping the server alive.
async fn start_proxy(
    cooldown: Duration,
    pipeline: ReloadPipeline,
    upstream_port: u16,
) -> (u16, watch::Sender<bool>) {
    let port = free_port();
    let bind_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let context = ProxyContext {
        gate: Arc::new(Gate::new(cooldown)),
        pipeline: Arc::new(pipeline),
        upstream: Arc::new(UpstreamClient::new(
            format!("127.0.0.1:{}", upstream_port),
            PoolConfig::default(),
        )),
        request_timeout: Duration::from_secs(30),
    };

    let proxy = GatedProxy::new(bind_addr, context, shutdown_rx);
    tokio::spawn(async move {
        let _ = proxy.run().await;
    });

    assert!(
        wait_for_port(port, Duration::from_secs(5)).await,
        "proxy did not start listening on port {}",
        port
    );

    (port, shutdown_tx)
}

/// Send a raw HTTP request and return the full response text.
async fn http_request(port: u16, method: &str, path: &str) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();

    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        method, path, port
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn http_get(port: u16, path: &str) -> String {
    http_request(port, "GET", path).await
}

async fn http_post(port: u16, path: &str) -> String {
    http_request(port, "POST", path).await
}

/// Extract the body of a Connection: close response.
fn body_of(response: &str) -> &str {
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("")
}

#[tokio::test]
async fn placeholder_served_during_initial_cooldown() {
    let upstream_port = spawn_upstream().await;
    let (port, _shutdown) = start_proxy(
        Duration::from_secs(60),
        ReloadPipeline::from_steps(Vec::new()),
        upstream_port,
    )
    .await;

    let response = http_get(port, "/").await;
    assert!(response.contains("200 OK"), "got: {}", response);
    assert!(response.contains("Service is updating"), "got: {}", response);
    assert!(!response.contains(UPSTREAM_BODY));
}

#[tokio::test]
async fn forwards_after_cooldown_expires() {
    let upstream_port = spawn_upstream().await;
    let (port, _shutdown) = start_proxy(
        Duration::from_secs(1),
        ReloadPipeline::from_steps(Vec::new()),
        upstream_port,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(1300)).await;

    let response = http_get(port, "/some/path").await;
    assert!(response.contains("200 OK"), "got: {}", response);
    assert!(response.contains(UPSTREAM_BODY), "got: {}", response);
}

#[tokio::test]
async fn reload_success_rearms_the_gate() {
    let upstream_port = spawn_upstream().await;
    let (port, _shutdown) = start_proxy(
        Duration::from_secs(1),
        ReloadPipeline::from_steps(Vec::new()),
        upstream_port,
    )
    .await;

    // Let the startup window expire so traffic flows
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let response = http_get(port, "/").await;
    assert!(response.contains(UPSTREAM_BODY), "got: {}", response);

    // Reload succeeds (empty pipeline) and immediately re-arms the window
    let response = http_post(port, RELOAD_PATH).await;
    assert!(response.contains("200 OK"), "got: {}", response);
    assert_eq!(body_of(&response), "OK");

    let response = http_get(port, "/").await;
    assert!(response.contains("Service is updating"), "got: {}", response);
}

#[cfg(unix)]
#[tokio::test]
async fn reload_failure_returns_500_and_stays_gated() {
    let upstream_port = spawn_upstream().await;
    // Second step fails; the proxy reports the failure diagnostic
    let pipeline = ReloadPipeline::from_json(
        r#"{"cmd_list": [{"cmd": "true"}, {"cmd": "false"}]}"#,
    );
    let (port, _shutdown) = start_proxy(Duration::from_secs(60), pipeline, upstream_port).await;

    let response = http_post(port, RELOAD_PATH).await;
    assert!(
        response.contains("500 Internal Server Error"),
        "got: {}",
        response
    );
    assert!(body_of(&response).contains("'false'"), "got: {}", response);

    // The window was stamped before the pipeline ran, so the gate stays
    // Cooling and the placeholder keeps being served
    let response = http_get(port, "/").await;
    assert!(response.contains("Service is updating"), "got: {}", response);
}

#[cfg(unix)]
#[tokio::test]
async fn reload_with_succeeding_steps_returns_ok() {
    let upstream_port = spawn_upstream().await;
    let pipeline = ReloadPipeline::from_json(
        r#"{"cmd_list": [{"cmd": "echo", "args": ["regenerated"]}, {"cmd": "true"}]}"#,
    );
    let (port, _shutdown) = start_proxy(Duration::from_secs(60), pipeline, upstream_port).await;

    let response = http_post(port, RELOAD_PATH).await;
    assert!(response.contains("200 OK"), "got: {}", response);
    assert_eq!(body_of(&response), "OK");
}

#[tokio::test]
async fn other_methods_on_reload_path_are_forwarded() {
    let upstream_port = spawn_upstream().await;
    let (port, _shutdown) = start_proxy(
        Duration::from_secs(1),
        ReloadPipeline::from_steps(Vec::new()),
        upstream_port,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(1300)).await;

    // GET on the reload path is not administrative; it goes to the upstream
    // and does not re-arm the gate
    let response = http_get(port, RELOAD_PATH).await;
    assert!(response.contains(UPSTREAM_BODY), "got: {}", response);

    let response = http_get(port, "/").await;
    assert!(response.contains(UPSTREAM_BODY), "got: {}", response);
}

#[tokio::test]
async fn upstream_unreachable_yields_bad_gateway() {
    // Point the proxy at a port nothing listens on
    let dead_port = free_port();
    let (port, _shutdown) = start_proxy(
        Duration::from_millis(0),
        ReloadPipeline::from_steps(Vec::new()),
        dead_port,
    )
    .await;

    let response = http_get(port, "/").await;
    assert!(response.contains("502 Bad Gateway"), "got: {}", response);
    assert!(
        response.contains("UPSTREAM_UNREACHABLE"),
        "got: {}",
        response
    );
}
