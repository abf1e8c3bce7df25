//! Backend readiness probing
//!
//! Readiness is checked in two stages: first a raw TCP connect proves
//! the listener is up, then an optional HTTP poll of the health path
//! proves the application answers. Splitting the two keeps the error
//! message meaningful when a container starts but the app inside never
//! binds its port.

use crate::error::Error;
use hyper::StatusCode;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

/// Per-attempt timeout for TCP dials.
const TCP_DIAL_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause between probe attempts.
const PROBE_PACING: Duration = Duration::from_secs(1);

/// Dial `host_port` until it accepts a connection or `timeout` elapses.
pub async fn wait_tcp(host_port: &str, timeout: Duration) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;

    loop {
        let last_error = match tokio::time::timeout(TCP_DIAL_TIMEOUT, TcpStream::connect(host_port))
            .await
        {
            Ok(Ok(_stream)) => {
                debug!(target = host_port, "tcp readiness check passed");
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connect timed out".to_string(),
        };

        if Instant::now() >= deadline {
            return Err(Error::ReadinessTimeout {
                target: host_port.to_string(),
                timeout,
                detail: last_error,
            });
        }

        tokio::time::sleep(PROBE_PACING).await;
    }
}

/// Poll `GET {target}{health_path}` until the backend answers with a
/// status in `[200, 500)` or `timeout` elapses. An empty health path
/// short-circuits as success.
///
/// The client is expected to carry a per-attempt timeout and to accept
/// invalid backend certificates; services behind the proxy live on
/// trusted internal addresses.
pub async fn wait_http(
    client: &reqwest::Client,
    target: &Url,
    health_path: &str,
    timeout: Duration,
) -> Result<(), Error> {
    if health_path.is_empty() {
        return Ok(());
    }

    let mut url = target.clone();
    url.set_path(health_path);
    let deadline = Instant::now() + timeout;

    loop {
        let last_error = match client.get(url.clone()).send().await {
            Ok(response) => {
                let status = response.status();
                if acceptable_health_status(status) {
                    debug!(url = %url, status = %status, "http readiness check passed");
                    return Ok(());
                }
                format!("last status {}", status)
            }
            Err(e) => e.to_string(),
        };

        if Instant::now() >= deadline {
            return Err(Error::ReadinessTimeout {
                target: url.to_string(),
                timeout,
                detail: last_error,
            });
        }

        tokio::time::sleep(PROBE_PACING).await;
    }
}

/// Anything that is not a server error counts as ready; apps that
/// return 3xx or 4xx on their health path are still answering.
fn acceptable_health_status(status: StatusCode) -> bool {
    status.as_u16() >= 200 && status.as_u16() < 500
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn probe_client() -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .danger_accept_invalid_certs(true)
            .build()
            .expect("probe client")
    }

    async fn serve_status(listener: TcpListener, status_line: &'static str) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!("HTTP/1.1 {}\r\nContent-Length: 0\r\n\r\n", status_line);
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    }

    #[test]
    fn test_acceptable_health_statuses() {
        assert!(acceptable_health_status(StatusCode::OK));
        assert!(acceptable_health_status(StatusCode::NO_CONTENT));
        assert!(acceptable_health_status(StatusCode::MOVED_PERMANENTLY));
        assert!(acceptable_health_status(StatusCode::NOT_FOUND));
        assert!(!acceptable_health_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!acceptable_health_status(StatusCode::BAD_GATEWAY));
    }

    #[tokio::test]
    async fn test_wait_tcp_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        wait_tcp(&addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_tcp_timeout() {
        // bind then drop so the port is very likely unused
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let err = wait_tcp(&addr.to_string(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadinessTimeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_http_empty_path_short_circuits() {
        let target = Url::parse("http://127.0.0.1:1/").unwrap();
        wait_http(&probe_client(), &target, "", Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_http_accepts_4xx() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_status(listener, "404 Not Found"));

        let target = Url::parse(&format!("http://{}/", addr)).unwrap();
        wait_http(&probe_client(), &target, "/healthz", Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_http_rejects_5xx_until_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_status(listener, "500 Internal Server Error"));

        let target = Url::parse(&format!("http://{}/", addr)).unwrap();
        let err = wait_http(
            &probe_client(),
            &target,
            "/healthz",
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();

        match err {
            Error::ReadinessTimeout { detail, .. } => {
                assert!(detail.contains("500"), "detail was {:?}", detail)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
