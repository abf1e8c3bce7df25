//! Reverse proxy with lazy backend wake
//!
//! A single listener serves three surfaces: the administrative API under
//! `/api/`, the `/healthz` liveness endpoint, and everything else is
//! routed by Host header to a managed service. When a request lands on a
//! sleeping service the handler wakes its containers, waits for
//! readiness, and only then forwards.

use crate::api;
use crate::app::App;
use crate::config::Mode;
use crate::error::{full_body, json_error_response, BoxError, Error, ProxyBody, ProxyErrorCode};
use crate::healthcheck::{wait_http, wait_tcp};
use crate::registry::SharedService;
use crate::runtime::SharedRuntime;
use chrono::Local;
use futures::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;

/// Inbound header probes use to suppress waking a sleeping service.
pub const PROBE_ALLOW_WAKE_HEADER: &str = "x-conslee-probe-allow-wake";
/// Outbound header identifying which service answered.
pub const SERVICE_SIGNATURE_HEADER: &str = "x-conslee-service";

/// Default startup budget when a service configures none.
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
/// Dial timeout for upstream connections.
const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// The main proxy server: one listener for API, health and proxied traffic.
pub struct Server {
    listener: TcpListener,
    app: Arc<App>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Bind the listener. Splitting bind from run lets callers learn the
    /// actual address when binding port 0.
    pub async fn bind(
        addr: &str,
        app: Arc<App>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("bind {}: {}", addr, e))?;
        Ok(Self {
            listener,
            app,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "conslee listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let app = Arc::clone(&self.app);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, app).await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    app: Arc<App>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let app = Arc::clone(&app);
        async move { Ok::<_, Infallible>(handle_request(req, app, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    app: Arc<App>,
    client_addr: SocketAddr,
) -> Response<ProxyBody> {
    let path = req.uri().path();

    if path == "/healthz" {
        return Response::builder()
            .status(StatusCode::OK)
            .body(full_body("ok"))
            .expect("valid response");
    }

    if path == "/api" || path.starts_with("/api/") {
        return api::handle_api(req, &app).await;
    }

    handle_proxy(req, &app, client_addr).await
}

/// Route an inbound request by Host header, apply the wake policy, and
/// forward to the backend.
async fn handle_proxy(
    req: Request<Incoming>,
    app: &Arc<App>,
    client_addr: SocketAddr,
) -> Response<ProxyBody> {
    let host = request_host(&req).unwrap_or_default();

    let Some(service) = app.registry.get_by_host(&host) else {
        let path = req.uri().path();
        if path == "/" || path.is_empty() {
            return Response::builder()
                .status(StatusCode::FOUND)
                .header(hyper::header::LOCATION, "/ui/")
                .body(full_body(""))
                .expect("valid response");
        }
        warn!(host = %host, "unknown host");
        return json_error_response(ProxyErrorCode::UnknownHost, "unknown host");
    };

    let (name, disabled, mode, schedule, target) = {
        let state = service.lock();
        (
            state.config.name.clone(),
            state.config.disabled,
            state.config.mode,
            state.schedule.clone(),
            state.target.clone(),
        )
    };

    if disabled {
        return json_error_response(ProxyErrorCode::ServiceDisabled, "service is disabled");
    }

    let wake_suppressed = is_wake_suppressed(req.headers());

    // A service without a parsed schedule behaves as on-demand whatever
    // its configured mode says.
    let (mode, should_be_up) = match &schedule {
        Some(schedule) => (mode, schedule.should_be_up(&Local::now())),
        None => (Mode::OnDemand, false),
    };

    if mode == Mode::ScheduleOnly && !should_be_up {
        return json_error_response(
            ProxyErrorCode::DisabledBySchedule,
            "service is disabled by schedule",
        );
    }

    if wake_suppressed {
        // Alive-without-waking ack: the probe learns which service owns
        // the host without touching the backend or the activity clock.
        let mut response = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(full_body(""))
            .expect("valid response");
        if let Ok(value) = HeaderValue::from_str(&name) {
            response
                .headers_mut()
                .insert(SERVICE_SIGNATURE_HEADER, value);
        }
        return response;
    }

    if let Err(e) = ensure_running(app.runtime(), app.probe_client(), &service).await {
        error!(service = %name, error = %e, "ensure running failed");
        return json_error_response(ProxyErrorCode::WakeFailed, "backend unavailable");
    }

    let Some(target) = target else {
        return json_error_response(
            ProxyErrorCode::NoTargetConfigured,
            "service has no target configured",
        );
    };

    service.lock().touch();

    if is_upgrade_request(&req) {
        return handle_upgrade(req, &name, &target, client_addr).await;
    }

    forward_request(app.forward_client(), &name, &target, req, client_addr).await
}

/// Drive all of a service's containers to running and, when a target is
/// configured, wait for TCP and HTTP readiness.
///
/// Safe to call concurrently for one service: container starts and the
/// probes are idempotent against the runtime, so overlapping calls cost
/// duplicate probes at worst.
pub async fn ensure_running(
    runtime: &SharedRuntime,
    probe_client: &reqwest::Client,
    service: &SharedService,
) -> Result<(), Error> {
    let (name, containers, startup_timeout, target, health_path) = {
        let state = service.lock();
        (
            state.config.name.clone(),
            state.container_names(),
            state.config.startup_timeout,
            state.target.clone(),
            state.config.health_path.clone(),
        )
    };

    if containers.is_empty() {
        return Err(Error::NoContainers(name));
    }

    let startup_timeout = if startup_timeout.is_zero() {
        DEFAULT_STARTUP_TIMEOUT
    } else {
        startup_timeout
    };

    let mut needs_wait = false;
    for container in &containers {
        let state = runtime.inspect(container).await?;
        if state.running {
            continue;
        }
        info!(container = %container, service = %name, "starting container");
        runtime.start(container).await?;
        needs_wait = true;
    }

    if !needs_wait {
        return Ok(());
    }

    let Some(target) = target else {
        debug!(service = %name, "no target url, skipping readiness probes");
        return Ok(());
    };
    let Some(host_port) = target_host_port(&target) else {
        debug!(service = %name, "target has no host, skipping readiness probes");
        return Ok(());
    };

    wait_tcp(&host_port, startup_timeout).await?;
    wait_http(probe_client, &target, &health_path, startup_timeout).await?;

    Ok(())
}

/// Forward a plain request to the backend, streaming the response back.
async fn forward_request(
    client: &reqwest::Client,
    service_name: &str,
    target: &Url,
    req: Request<Incoming>,
    client_addr: SocketAddr,
) -> Response<ProxyBody> {
    let inbound_host = request_host(&req).unwrap_or_default();
    let method = req.method().clone();
    let path = single_joining_slash(target.path(), req.uri().path());
    let query = req.uri().query().map(str::to_string);

    let mut url = target.clone();
    url.set_path(&path);
    url.set_query(query.as_deref());

    let headers = build_upstream_headers(req.headers(), &inbound_host, client_addr);

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(service = %service_name, error = %e, "failed to read request body");
            return json_error_response(ProxyErrorCode::UpstreamFailed, "proxy error");
        }
    };

    let mut builder = client.request(method, url.clone()).headers(headers);
    if !body.is_empty() {
        builder = builder.body(body);
    }

    match builder.send().await {
        Ok(upstream) => {
            let mut response = Response::builder().status(upstream.status());
            if let Some(headers) = response.headers_mut() {
                for (hname, value) in upstream.headers() {
                    if is_hop_by_hop(hname) {
                        continue;
                    }
                    headers.append(hname.clone(), value.clone());
                }
                if let Ok(value) = HeaderValue::from_str(service_name) {
                    headers.insert(SERVICE_SIGNATURE_HEADER, value);
                }
            }

            let stream = upstream.bytes_stream().map(|chunk| {
                chunk
                    .map(Frame::data)
                    .map_err(|e| Box::new(e) as BoxError)
            });
            response
                .body(StreamBody::new(stream).boxed_unsync())
                .expect("valid response")
        }
        Err(e) => {
            error!(service = %service_name, url = %url, error = %e, "upstream request failed");
            json_error_response(ProxyErrorCode::UpstreamFailed, "proxy error")
        }
    }
}

/// Host the client asked for: Host header first, then the URI authority
/// (HTTP/2 requests carry it there).
fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
    {
        if !host.is_empty() {
            return Some(host.to_string());
        }
    }
    req.uri().authority().map(|a| a.to_string())
}

/// Whether the caller is a probe that must not cause a wake.
fn is_wake_suppressed(headers: &HeaderMap) -> bool {
    headers
        .get(PROBE_ALLOW_WAKE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            matches!(
                v.trim().to_lowercase().as_str(),
                "false" | "0" | "no"
            )
        })
        .unwrap_or(false)
}

/// `host:port` of a target URL, using the scheme default when the URL
/// carries no explicit port.
fn target_host_port(target: &Url) -> Option<String> {
    let host = target.host_str()?;
    let port = target.port_or_known_default()?;
    Some(format!("{}:{}", host, port))
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Join URL paths with exactly one slash between them.
fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// Headers for the upstream request: hop-by-hop headers dropped,
/// Connection/Upgrade re-added for WebSocket pass-through, forwarding
/// headers applied, client-observed Host preserved.
fn build_upstream_headers(
    inbound: &HeaderMap,
    inbound_host: &str,
    client_addr: SocketAddr,
) -> HeaderMap {
    let mut out = HeaderMap::new();

    for (name, value) in inbound {
        if is_hop_by_hop(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    // Re-copy Connection and Upgrade so upgrade negotiation survives the
    // hop-by-hop filter.
    if let Some(value) = inbound.get(CONNECTION) {
        out.insert(CONNECTION, value.clone());
    }
    if let Some(value) = inbound.get(UPGRADE) {
        out.insert(UPGRADE, value.clone());
    }

    let client_ip = client_addr.ip().to_string();

    // X-Real-IP: keep the inbound value, else the peer address
    if !out.contains_key("x-real-ip") {
        if let Ok(value) = HeaderValue::from_str(&client_ip) {
            out.insert("x-real-ip", value);
        }
    }

    // X-Forwarded-For: append the peer to any inbound chain
    let forwarded_for = match inbound
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        out.insert("x-forwarded-for", value);
    }

    // X-Forwarded-Host: inbound value, else the client-observed Host
    if !out.contains_key("x-forwarded-host") {
        if let Ok(value) = HeaderValue::from_str(inbound_host) {
            out.insert("x-forwarded-host", value);
        }
    }

    // X-Forwarded-Proto: inbound value, else the listener scheme
    if !out.contains_key("x-forwarded-proto") {
        out.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    }

    // Preserve the client-observed Host upstream; backends doing
    // virtual-host routing of their own depend on it.
    if let Ok(value) = HeaderValue::from_str(inbound_host) {
        out.insert(HOST, value);
    }

    out
}

/// Check if a request negotiates a protocol upgrade (WebSocket etc.)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let wants_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    wants_upgrade && req.headers().contains_key(UPGRADE)
}

/// Render the raw HTTP/1.1 request that opens the upgrade with the backend
fn build_upgrade_request(
    req: &Request<Incoming>,
    target: &Url,
    inbound_host: &str,
    client_addr: SocketAddr,
) -> Vec<u8> {
    let path = single_joining_slash(target.path(), req.uri().path());
    let path_and_query = match req.uri().query() {
        Some(q) => format!("{}?{}", path, q),
        None => path,
    };

    let mut raw = format!("{} {} HTTP/1.1\r\n", req.method(), path_and_query);
    let upstream_headers = build_upstream_headers(req.headers(), inbound_host, client_addr);
    for (name, value) in upstream_headers.iter() {
        if let Ok(value) = value.to_str() {
            raw.push_str(&format!("{}: {}\r\n", name, value));
        }
    }
    raw.push_str("\r\n");
    raw.into_bytes()
}

/// Parse the backend's response head to an upgrade request
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let head = std::str::from_utf8(data).ok()?;
    let mut lines = head.lines();

    // status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let code = status_line.split_whitespace().nth(1)?;
    let status = StatusCode::from_u16(code.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Tunnel an upgrade request: open a raw connection to the backend,
/// relay the handshake, then splice bytes both ways.
async fn handle_upgrade(
    req: Request<Incoming>,
    service_name: &str,
    target: &Url,
    client_addr: SocketAddr,
) -> Response<ProxyBody> {
    let inbound_host = request_host(&req).unwrap_or_default();
    let Some(host_port) = target_host_port(target) else {
        return json_error_response(ProxyErrorCode::NoTargetConfigured, "target has no host");
    };

    debug!(service = %service_name, target = %host_port, "handling upgrade request");

    let raw_request = build_upgrade_request(&req, target, &inbound_host, client_addr);

    let mut backend =
        match tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(&host_port)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!(service = %service_name, target = %host_port, error = %e, "upgrade dial failed");
                return json_error_response(ProxyErrorCode::UpstreamFailed, "proxy error");
            }
            Err(_) => {
                error!(service = %service_name, target = %host_port, "upgrade dial timed out");
                return json_error_response(ProxyErrorCode::UpstreamFailed, "proxy error");
            }
        };

    if let Err(e) = backend.write_all(&raw_request).await {
        error!(service = %service_name, error = %e, "failed to send upgrade request");
        return json_error_response(ProxyErrorCode::UpstreamFailed, "proxy error");
    }

    // Read the response head; whatever follows it already belongs to the
    // upgraded stream and must reach the client.
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 2048];
    let head_len = loop {
        let n = match backend.read(&mut chunk).await {
            Ok(0) => {
                error!(service = %service_name, "backend closed during upgrade handshake");
                return json_error_response(ProxyErrorCode::UpstreamFailed, "proxy error");
            }
            Ok(n) => n,
            Err(e) => {
                error!(service = %service_name, error = %e, "failed to read upgrade response");
                return json_error_response(ProxyErrorCode::UpstreamFailed, "proxy error");
            }
        };
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 16 * 1024 {
            error!(service = %service_name, "upgrade response head too large");
            return json_error_response(ProxyErrorCode::UpstreamFailed, "proxy error");
        }
    };

    let Some((status, backend_headers)) = parse_upgrade_response(&buf[..head_len]) else {
        error!(service = %service_name, "invalid upgrade response from backend");
        return json_error_response(ProxyErrorCode::UpstreamFailed, "proxy error");
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &backend_headers {
        let lowered = name.to_lowercase();
        if status == StatusCode::SWITCHING_PROTOCOLS
            && (lowered == "content-length" || lowered == "transfer-encoding")
        {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), value);
        }
    }
    response = response.header(SERVICE_SIGNATURE_HEADER, service_name);

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(service = %service_name, status = %status, "backend rejected upgrade");
        return response.body(full_body("")).unwrap_or_else(|_| {
            json_error_response(ProxyErrorCode::UpstreamFailed, "proxy error")
        });
    }

    info!(service = %service_name, "upgrade handshake complete");

    let leftover = buf.split_off(head_len);
    let service_name = service_name.to_string();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                tunnel(upgraded, backend, leftover, &service_name).await;
            }
            Err(e) => {
                error!(service = %service_name, error = %e, "client upgrade failed");
            }
        }
    });

    response.body(full_body("")).unwrap_or_else(|_| {
        json_error_response(ProxyErrorCode::UpstreamFailed, "proxy error")
    })
}

/// Splice bytes between the upgraded client connection and the backend.
async fn tunnel(client: Upgraded, mut backend: TcpStream, leftover: Vec<u8>, service_name: &str) {
    let mut client = TokioIo::new(client);

    if !leftover.is_empty() {
        if let Err(e) = client.write_all(&leftover).await {
            debug!(service = %service_name, error = %e, "failed to flush buffered upgrade bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((to_backend, to_client)) => {
            debug!(
                service = %service_name,
                to_backend,
                to_client,
                "upgrade tunnel closed"
            );
        }
        Err(e) => {
            debug!(service = %service_name, error = %e, "upgrade tunnel closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;
    use hyper::body::Bytes;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_single_joining_slash() {
        assert_eq!(single_joining_slash("/", "/foo"), "/foo");
        assert_eq!(single_joining_slash("/base", "/foo"), "/base/foo");
        assert_eq!(single_joining_slash("/base/", "/foo"), "/base/foo");
        assert_eq!(single_joining_slash("/base", "foo"), "/base/foo");
    }

    #[test]
    fn test_hop_by_hop_headers() {
        for name in [
            "connection",
            "keep-alive",
            "proxy-authenticate",
            "proxy-authorization",
            "te",
            "trailers",
            "transfer-encoding",
            "upgrade",
        ] {
            assert!(is_hop_by_hop(&HeaderName::from_static(name)), "{}", name);
        }
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("host")));
    }

    #[test]
    fn test_wake_suppression_values() {
        for value in ["false", "0", "no", "FALSE", " No "] {
            let mut headers = HeaderMap::new();
            headers.insert(
                PROBE_ALLOW_WAKE_HEADER,
                HeaderValue::from_str(value).unwrap(),
            );
            assert!(is_wake_suppressed(&headers), "{:?}", value);
        }
        for value in ["true", "1", "yes", "anything"] {
            let mut headers = HeaderMap::new();
            headers.insert(
                PROBE_ALLOW_WAKE_HEADER,
                HeaderValue::from_str(value).unwrap(),
            );
            assert!(!is_wake_suppressed(&headers), "{:?}", value);
        }
        assert!(!is_wake_suppressed(&HeaderMap::new()));
    }

    #[test]
    fn test_forwarded_headers_fresh_chain() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-custom", HeaderValue::from_static("kept"));
        inbound.insert("transfer-encoding", HeaderValue::from_static("chunked"));

        let out = build_upstream_headers(&inbound, "app.local", addr("10.0.0.9:41000"));

        assert_eq!(out.get("x-real-ip").unwrap(), "10.0.0.9");
        assert_eq!(out.get("x-forwarded-for").unwrap(), "10.0.0.9");
        assert_eq!(out.get("x-forwarded-host").unwrap(), "app.local");
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(out.get(HOST).unwrap(), "app.local");
        assert_eq!(out.get("x-custom").unwrap(), "kept");
        assert!(out.get("transfer-encoding").is_none());
    }

    #[test]
    fn test_forwarded_headers_existing_chain_preserved() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-real-ip", HeaderValue::from_static("203.0.113.7"));
        inbound.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 198.51.100.2"),
        );
        inbound.insert("x-forwarded-host", HeaderValue::from_static("outer.example"));
        inbound.insert("x-forwarded-proto", HeaderValue::from_static("https"));

        let out = build_upstream_headers(&inbound, "app.local", addr("10.0.0.9:41000"));

        assert_eq!(out.get("x-real-ip").unwrap(), "203.0.113.7");
        assert_eq!(
            out.get("x-forwarded-for").unwrap(),
            "203.0.113.7, 198.51.100.2, 10.0.0.9"
        );
        assert_eq!(out.get("x-forwarded-host").unwrap(), "outer.example");
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "https");
    }

    #[test]
    fn test_connection_and_upgrade_survive_filter() {
        let mut inbound = HeaderMap::new();
        inbound.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        inbound.insert(UPGRADE, HeaderValue::from_static("websocket"));

        let out = build_upstream_headers(&inbound, "app.local", addr("10.0.0.9:41000"));

        assert_eq!(out.get(CONNECTION).unwrap(), "Upgrade");
        assert_eq!(out.get(UPGRADE).unwrap(), "websocket");
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder()
            .header(CONNECTION, "keep-alive")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(!is_upgrade_request(&req));

        let req = Request::builder()
            .header(UPGRADE, "websocket")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers
            .iter()
            .any(|(n, v)| n == "Upgrade" && v == "websocket"));

        assert!(parse_upgrade_response(b"garbage").is_none());
    }

    #[test]
    fn test_target_host_port() {
        let url = Url::parse("http://127.0.0.1:9000/").unwrap();
        assert_eq!(target_host_port(&url).unwrap(), "127.0.0.1:9000");

        let url = Url::parse("https://backend.internal/").unwrap();
        assert_eq!(target_host_port(&url).unwrap(), "backend.internal:443");

        let url = Url::parse("http://backend.internal/").unwrap();
        assert_eq!(target_host_port(&url).unwrap(), "backend.internal:80");
    }

    #[test]
    fn test_request_host_prefers_header() {
        let req = Request::builder()
            .uri("http://authority.example/path")
            .header(HOST, "header.example")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert_eq!(request_host(&req).unwrap(), "header.example");

        let req = Request::builder()
            .uri("http://authority.example/path")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert_eq!(request_host(&req).unwrap(), "authority.example");
    }
}
