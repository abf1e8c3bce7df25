//! Administrative HTTP API
//!
//! JSON CRUD over services and system settings, a container listing
//! passthrough, and the probe helper. Served from the same listener as
//! the proxy, under `/api/`.

use crate::app::App;
use crate::error::{full_body, Error, ProxyBody};
use crate::proxy::{PROBE_ALLOW_WAKE_HEADER, SERVICE_SIGNATURE_HEADER};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

// Request types

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServiceRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub containers: Vec<String>,
    #[serde(default)]
    pub target_url: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub idle_timeout: String,
    #[serde(default)]
    pub startup_timeout: String,
    #[serde(default)]
    pub health_path: String,
    #[serde(default)]
    pub schedule: Option<ScheduleRequest>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScheduleRequest {
    #[serde(default)]
    pub days: Vec<String>,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub stop: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateServiceRequest {
    pub mode: Option<String>,
    pub idle_timeout: Option<String>,
    pub schedule: Option<ScheduleUpdateRequest>,
    pub containers: Option<Vec<String>>,
    pub target_url: Option<String>,
    pub health_path: Option<String>,
    pub startup_timeout: Option<String>,
    pub host: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScheduleUpdateRequest {
    pub days: Option<Vec<String>>,
    pub start: Option<String>,
    pub stop: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSystemRequest {
    pub listen_addr: Option<String>,
    pub idle_reaper_interval: Option<String>,
}

// Response types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDto {
    pub mode: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub days: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub start: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stop: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusDto {
    pub name: String,
    pub host: String,
    pub containers: Vec<String>,
    pub mode: String,
    pub enabled: bool,
    pub running: bool,
    pub last_activity: DateTime<Utc>,
    pub idle_timeout: String,
    pub startup_timeout: String,
    pub target_url: String,
    pub health_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatusDto {
    pub listen_addr: String,
    pub idle_reaper_interval: String,
}

#[derive(Debug, Serialize)]
pub struct PortDto {
    pub ip: String,
    pub private: u16,
    pub public: u16,
    #[serde(rename = "type")]
    pub proto: String,
}

#[derive(Debug, Serialize)]
pub struct ContainerDto {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub ports: Vec<PortDto>,
    pub stack: String,
}

#[derive(Debug, Serialize)]
struct CheckPortDto {
    available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// Probe types

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub expect_host: String,
    #[serde(default)]
    pub allow_wake: bool,
    #[serde(default, rename = "requireSignature")]
    pub require_signature: bool,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub final_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

// Response helpers

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(full_body(body))
        .expect("valid response with StatusCode enum")
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    let body = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

fn error_response(err: Error) -> Response<ProxyBody> {
    response(err.status_code(), err.to_string())
}

fn result_response(result: Result<(), Error>, success: StatusCode) -> Response<ProxyBody> {
    match result {
        Ok(()) => response(success, ""),
        Err(e) => error_response(e),
    }
}

async fn read_json<T: DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<T, Response<ProxyBody>> {
    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return Err(response(StatusCode::BAD_REQUEST, "invalid body")),
    };
    serde_json::from_slice(&bytes).map_err(|_| response(StatusCode::BAD_REQUEST, "invalid json"))
}

/// Service name from paths like `/api/services/{name}/start`.
fn extract_service_name(path: &str, suffix: &str) -> String {
    let name = path.strip_prefix("/api/services/").unwrap_or(path);
    let name = name.strip_suffix(suffix).unwrap_or(name);
    name.trim_matches('/').to_string()
}

fn query_param(req: &Request<Incoming>, key: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

// Routing

pub async fn handle_api(req: Request<Incoming>, app: &Arc<App>) -> Response<ProxyBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(method = %method, path = %path, "admin API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/api/services") => {
            let services = app.list_services().await;
            json_response(StatusCode::OK, &services)
        }

        (&Method::POST, "/api/services") => match read_json::<CreateServiceRequest>(req).await {
            Ok(create) => result_response(app.create_service(create), StatusCode::CREATED),
            Err(resp) => resp,
        },

        (&Method::GET, "/api/docker/containers") => handle_list_containers(app).await,

        (&Method::GET, "/api/system") => json_response(StatusCode::OK, &app.system_status()),

        (&Method::POST, "/api/system") => match read_json::<UpdateSystemRequest>(req).await {
            Ok(update) => result_response(app.update_system(update), StatusCode::NO_CONTENT),
            Err(resp) => resp,
        },

        (&Method::GET, "/api/system/check-port") => {
            let listen_addr = query_param(&req, "listenAddr").unwrap_or_default();
            match app.check_port(&listen_addr).await {
                Ok(error) => json_response(
                    StatusCode::OK,
                    &CheckPortDto {
                        available: error.is_none(),
                        error,
                    },
                ),
                Err(e) => error_response(e),
            }
        }

        (&Method::POST, "/api/probes") => match read_json::<ProbeRequest>(req).await {
            Ok(probe) => {
                let url = probe.url.trim();
                if url.is_empty() {
                    return response(StatusCode::BAD_REQUEST, "url is required");
                }
                json_response(StatusCode::OK, &perform_probe(&probe).await)
            }
            Err(resp) => resp,
        },

        _ if path.starts_with("/api/services/") => handle_service_item(req, app, &path).await,

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn handle_service_item(
    req: Request<Incoming>,
    app: &Arc<App>,
    path: &str,
) -> Response<ProxyBody> {
    let method = req.method().clone();

    if path.ends_with("/start") && method == Method::POST {
        let name = extract_service_name(path, "/start");
        if name.is_empty() {
            return response(StatusCode::BAD_REQUEST, "service name required");
        }
        return match app.start_service(&name).await {
            Ok(()) => response(StatusCode::NO_CONTENT, ""),
            Err(e @ Error::NotFound(_)) => error_response(e),
            Err(e) => {
                error!(service = %name, error = %e, "start service failed");
                response(StatusCode::INTERNAL_SERVER_ERROR, "cannot start service")
            }
        };
    }

    if path.ends_with("/stop") && method == Method::POST {
        let name = extract_service_name(path, "/stop");
        if name.is_empty() {
            return response(StatusCode::BAD_REQUEST, "service name required");
        }
        return result_response(app.stop_service(&name).await, StatusCode::NO_CONTENT);
    }

    if path.ends_with("/settings") && method == Method::POST {
        let name = extract_service_name(path, "/settings");
        if name.is_empty() {
            return response(StatusCode::BAD_REQUEST, "service name required");
        }
        return match read_json::<UpdateServiceRequest>(req).await {
            Ok(update) => result_response(app.update_service(&name, update), StatusCode::NO_CONTENT),
            Err(resp) => resp,
        };
    }

    if method == Method::DELETE {
        let name = extract_service_name(path, "");
        if name.is_empty() {
            return response(StatusCode::BAD_REQUEST, "service name required");
        }
        return result_response(app.delete_service(&name), StatusCode::NO_CONTENT);
    }

    response(StatusCode::NOT_FOUND, "not found")
}

async fn handle_list_containers(app: &Arc<App>) -> Response<ProxyBody> {
    match app.runtime().list(true).await {
        Ok(containers) => {
            let out: Vec<ContainerDto> = containers
                .into_iter()
                .map(|c| ContainerDto {
                    id: c.id,
                    name: c.name,
                    image: c.image,
                    state: c.state,
                    status: c.status,
                    ports: c
                        .ports
                        .into_iter()
                        .map(|p| PortDto {
                            ip: p.ip,
                            private: p.private_port,
                            public: p.public_port,
                            proto: p.proto,
                        })
                        .collect(),
                    stack: c.stack,
                })
                .collect();
            json_response(StatusCode::OK, &out)
        }
        Err(e) => {
            error!(error = %e, "container list failed");
            response(StatusCode::INTERNAL_SERVER_ERROR, "container runtime error")
        }
    }
}

// Probe helper

/// Probe a URL the way an uptime checker would: HEAD first, falling
/// back to GET, honouring the allow-wake suppression so checking a
/// service does not wake it.
pub async fn perform_probe(req: &ProbeRequest) -> ProbeResponse {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            return ProbeResponse {
                status: "unhealthy".into(),
                error: e.to_string(),
                ..Default::default()
            }
        }
    };

    let head_error = match probe_once(&client, Method::HEAD, req).await {
        Ok(result) if result.status == "healthy" => return result,
        Ok(_) => None,
        Err(e) => Some(e),
    };

    match probe_once(&client, Method::GET, req).await {
        Ok(result) => result,
        Err(get_error) => ProbeResponse {
            status: "unhealthy".into(),
            error: head_error.unwrap_or(get_error),
            ..Default::default()
        },
    }
}

async fn probe_once(
    client: &reqwest::Client,
    method: Method,
    req: &ProbeRequest,
) -> Result<ProbeResponse, String> {
    let mut builder = client.request(method, req.url.trim());
    if !req.allow_wake {
        builder = builder.header(PROBE_ALLOW_WAKE_HEADER, "false");
    }

    let resp = builder.send().await.map_err(|e| e.to_string())?;

    let status_code = resp.status().as_u16();
    let final_url = resp.url().to_string();
    let final_host = resp.url().host_str().map(|h| {
        match resp.url().port() {
            Some(port) => format!("{}:{}", h, port),
            None => h.to_string(),
        }
    });
    let has_signature = resp.headers().contains_key(SERVICE_SIGNATURE_HEADER);
    let canonical_status = resp
        .status()
        .canonical_reason()
        .map(|reason| format!("{} {}", status_code, reason))
        .unwrap_or_else(|| status_code.to_string());

    // Drain the body so the connection can be reused.
    let _ = resp.bytes().await;

    let mut result = ProbeResponse {
        status: "unhealthy".into(),
        status_code: Some(status_code),
        final_url,
        ..Default::default()
    };

    if (200..400).contains(&status_code) {
        if req.require_signature && !has_signature {
            result.error = "missing conslee signature".into();
            return Ok(result);
        }
        if !req.expect_host.is_empty() {
            let expected = req.expect_host.to_lowercase();
            let actual = final_host.unwrap_or_default().to_lowercase();
            if actual != expected {
                result.error = format!("redirected to {}", actual);
                return Ok(result);
            }
        }
        result.status = "healthy".into();
        return Ok(result);
    }

    result.error = canonical_status;
    Ok(result)
}
