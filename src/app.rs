//! Application core: registry + runtime + persisted configuration
//!
//! `App` owns everything the request handlers and the background loops
//! share, and exposes the semantic operations the administrative API is
//! translated into. Validation of admin input happens here, before
//! anything reaches the registry.

use crate::api::{
    CreateServiceRequest, ScheduleDto, ServiceStatusDto, SystemStatusDto, UpdateServiceRequest,
    UpdateSystemRequest,
};
use crate::config::{normalize_listen_addr, Config, Mode, ScheduleConfig, ServiceConfig};
use crate::error::Error;
use crate::proxy::ensure_running;
use crate::registry::{ServiceRegistry, ServiceState, SharedService};
use crate::runtime::SharedRuntime;
use crate::schedule::ServiceSchedule;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};
use url::Url;

/// Budget for stopping a service's containers on explicit admin stop.
const STOP_BUDGET: Duration = Duration::from_secs(30);

/// Shared application state.
pub struct App {
    runtime: SharedRuntime,
    pub registry: ServiceRegistry,
    /// Server/reaper settings; service entries live in the registry and
    /// are merged back in at persist time.
    config: Mutex<Config>,
    config_path: PathBuf,
    probe_client: reqwest::Client,
    forward_client: reqwest::Client,
    restart: Notify,
}

impl App {
    /// Build the application state from a loaded config.
    pub fn new(
        config: Config,
        config_path: PathBuf,
        runtime: SharedRuntime,
    ) -> anyhow::Result<Arc<Self>> {
        let registry = ServiceRegistry::new();
        for service_config in &config.services {
            let state = ServiceState::from_config(service_config.clone())
                .map_err(|e| anyhow::anyhow!("service {:?}: {}", service_config.name, e))?;
            registry.add(state);
        }

        // Backend TLS is accepted unverified on purpose: proxied services
        // live on trusted internal addresses.
        let probe_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| anyhow::anyhow!("build probe client: {}", e))?;

        let forward_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(0)
            .http1_only()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow::anyhow!("build forward client: {}", e))?;

        Ok(Arc::new(Self {
            runtime,
            registry,
            config: Mutex::new(config),
            config_path,
            probe_client,
            forward_client,
            restart: Notify::new(),
        }))
    }

    pub fn runtime(&self) -> &SharedRuntime {
        &self.runtime
    }

    /// Client used for readiness probes (per-attempt timeout baked in).
    pub fn probe_client(&self) -> &reqwest::Client {
        &self.probe_client
    }

    /// Client used for forwarding proxied requests (no keep-alive, no
    /// redirects, no overall timeout so long responses can stream).
    pub fn forward_client(&self) -> &reqwest::Client {
        &self.forward_client
    }

    /// Listen address from the active config.
    pub fn listen_addr(&self) -> String {
        self.config.lock().server.listen_addr.clone()
    }

    pub fn reaper_interval(&self) -> Duration {
        self.config.lock().idle_reaper.interval
    }

    // Config persistence

    fn snapshot_config(&self) -> Config {
        let mut config = self.config.lock().clone();
        config.services = self
            .registry
            .all()
            .iter()
            .map(|service| service.lock().config.clone())
            .collect();
        config.services.sort_by(|a, b| a.name.cmp(&b.name));
        config
    }

    /// Persist the current configuration. An empty config path disables
    /// persistence (used by tests).
    pub fn persist(&self) -> Result<(), Error> {
        if self.config_path.as_os_str().is_empty() {
            return Ok(());
        }
        let snapshot = self.snapshot_config();
        snapshot
            .save(&self.config_path)
            .map_err(|e| Error::Persist(e.to_string()))
    }

    fn persist_logged(&self, context: &str) {
        if let Err(e) = self.persist() {
            warn!(error = %e, context, "config save failed");
        }
    }

    // Restart signalling

    /// Ask the main loop to restart the process. The loop treats this
    /// like SIGHUP: graceful shutdown, then exit 0 so a supervisor
    /// brings the process back with the new settings.
    pub fn request_restart(&self) {
        self.restart.notify_one();
    }

    pub async fn restart_requested(&self) {
        self.restart.notified().await;
    }

    // Administrative operations

    pub fn create_service(&self, req: CreateServiceRequest) -> Result<(), Error> {
        let mode = parse_mode_or_default(&req.mode)?;
        let host = req.host.trim().to_string();

        if req.name.is_empty() {
            return Err(Error::InvalidInput("name is required".into()));
        }
        if mode != Mode::ScheduleOnly && host.is_empty() {
            return Err(Error::InvalidInput(
                "host is required unless mode is schedule_only".into(),
            ));
        }
        if mode != Mode::ScheduleOnly && req.target_url.is_empty() {
            return Err(Error::InvalidInput(
                "targetUrl is required unless mode is schedule_only".into(),
            ));
        }

        if self.registry.get_by_name(&req.name).is_some() {
            return Err(Error::Conflict(
                "service with this name already exists".into(),
            ));
        }
        if !host.is_empty() && self.registry.get_by_host(&host).is_some() {
            return Err(Error::Conflict("host already used".into()));
        }
        if let Some((service, container)) = self.registry.find_container_conflict(&req.containers, "")
        {
            return Err(Error::Conflict(format!(
                "container {:?} already used by service {:?}",
                container, service
            )));
        }

        let idle_timeout = parse_duration_field(&req.idle_timeout, Duration::ZERO, "idleTimeout")?;
        let startup_timeout = parse_duration_field(
            &req.startup_timeout,
            Duration::from_secs(30),
            "startupTimeout",
        )?;

        let config = ServiceConfig {
            name: req.name.clone(),
            host,
            container_name: None,
            containers: req.containers,
            target_url: req.target_url,
            mode,
            disabled: false,
            idle_timeout,
            startup_timeout,
            health_path: req.health_path,
            schedule: req.schedule.map(|s| ScheduleConfig {
                days: s.days,
                start: s.start,
                stop: s.stop,
            }),
        };

        let state = ServiceState::from_config(config)?;
        self.registry.add(state);
        info!(service = %req.name, "service created");

        self.persist_logged("create service");
        Ok(())
    }

    pub fn delete_service(&self, name: &str) -> Result<(), Error> {
        if self.registry.remove_by_name(name).is_none() {
            return Err(Error::NotFound("service not found".into()));
        }
        info!(service = %name, "service deleted");
        self.persist_logged("delete service");
        Ok(())
    }

    pub fn update_service(&self, name: &str, req: UpdateServiceRequest) -> Result<(), Error> {
        let service = self
            .registry
            .get_by_name(name)
            .ok_or_else(|| Error::NotFound("service not found".into()))?;

        let current_mode = service.lock().config.mode;
        let mut desired_mode = current_mode;
        let mut mode_changed = false;
        if let Some(mode) = req.mode.as_deref().filter(|m| !m.is_empty()) {
            desired_mode = parse_mode(mode)?;
            mode_changed = true;
        }

        if let Some(host) = &req.host {
            let new_host = host.trim().to_string();
            if desired_mode != Mode::ScheduleOnly && new_host.is_empty() {
                return Err(Error::InvalidInput(
                    "host is required unless mode is schedule_only".into(),
                ));
            }
            let current_host = service.lock().config.host.clone();
            if new_host != current_host {
                if !new_host.is_empty() {
                    if let Some(other) = self.registry.get_by_host(&new_host) {
                        if !Arc::ptr_eq(&other, &service) {
                            return Err(Error::Conflict("host already used".into()));
                        }
                    }
                }
                self.registry.update_host(&service, &new_host);
            }
        }

        if let Some(enabled) = req.enabled {
            let mut state = service.lock();
            let previously_disabled = state.config.disabled;
            state.config.disabled = !enabled;
            // Re-enabling resets the idle clock so the reaper doesn't
            // stop the service on the very next tick.
            if enabled && previously_disabled {
                state.touch();
            }
        }

        if mode_changed {
            service.lock().config.mode = desired_mode;
        }

        if let Some(raw) = req.idle_timeout.as_deref().filter(|v| !v.is_empty()) {
            let idle = parse_duration_field(raw, Duration::ZERO, "idleTimeout")?;
            service.lock().config.idle_timeout = idle;
        }

        if let Some(update) = &req.schedule {
            // Validate the merged schedule before committing anything.
            let mut merged = service
                .lock()
                .config
                .schedule
                .clone()
                .unwrap_or_default();
            if let Some(days) = &update.days {
                merged.days = days.clone();
            }
            if let Some(start) = &update.start {
                merged.start = start.clone();
            }
            if let Some(stop) = &update.stop {
                merged.stop = stop.clone();
            }
            let parsed = ServiceSchedule::parse(&merged)?;

            let mut state = service.lock();
            state.config.schedule = Some(merged);
            state.schedule = Some(parsed);
        }

        if let Some(containers) = &req.containers {
            if let Some((owner, container)) =
                self.registry.find_container_conflict(containers, name)
            {
                return Err(Error::Conflict(format!(
                    "container {:?} already used by service {:?}",
                    container, owner
                )));
            }
            service.lock().config.containers = containers.clone();
        }

        if let Some(target) = req.target_url.as_deref().filter(|v| !v.is_empty()) {
            let url = Url::parse(target)
                .map_err(|_| Error::InvalidInput("invalid targetUrl".into()))?;
            let mut state = service.lock();
            state.config.target_url = target.to_string();
            state.target = Some(url);
        }

        if let Some(health_path) = &req.health_path {
            service.lock().config.health_path = health_path.clone();
        }

        if let Some(raw) = req.startup_timeout.as_deref().filter(|v| !v.is_empty()) {
            let startup =
                parse_duration_field(raw, Duration::from_secs(30), "startupTimeout")?;
            service.lock().config.startup_timeout = startup;
        }

        self.persist_logged("update service");
        Ok(())
    }

    /// Explicit admin start: wake the backend and reset the idle clock.
    pub async fn start_service(&self, name: &str) -> Result<(), Error> {
        let service = self
            .registry
            .get_by_name(name)
            .ok_or_else(|| Error::NotFound("service not found".into()))?;

        ensure_running(&self.runtime, &self.probe_client, &service).await?;
        service.lock().touch();
        Ok(())
    }

    /// Explicit admin stop: best-effort stop of every container.
    pub async fn stop_service(&self, name: &str) -> Result<(), Error> {
        let service = self
            .registry
            .get_by_name(name)
            .ok_or_else(|| Error::NotFound("service not found".into()))?;

        let containers = service.lock().container_names();
        let stop_all = async {
            for container in &containers {
                if let Err(e) = self.runtime.stop(container, Duration::ZERO).await {
                    warn!(container = %container, error = %e, "stop failed");
                }
            }
        };
        if tokio::time::timeout(STOP_BUDGET, stop_all).await.is_err() {
            warn!(service = %name, error = %Error::Cancelled, "stopping containers ran out of budget");
        }

        self.persist_logged("stop service");
        Ok(())
    }

    /// Status snapshot of one service; `running` aggregates container
    /// inspects with OR.
    pub async fn service_status(&self, service: &SharedService) -> ServiceStatusDto {
        let (config, last_activity) = {
            let state = service.lock();
            (state.config.clone(), state.last_activity)
        };
        let containers = config.container_names();

        let mut running = false;
        for container in &containers {
            match self.runtime.inspect(container).await {
                Ok(state) if state.running => {
                    running = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(container = %container, error = %e, "inspect failed in service status");
                }
            }
        }

        let schedule = config.schedule.as_ref().map(|s| ScheduleDto {
            mode: config.mode.as_str().to_string(),
            days: s.days.clone(),
            start: s.start.clone(),
            stop: s.stop.clone(),
        });

        ServiceStatusDto {
            name: config.name,
            host: config.host,
            containers,
            mode: config.mode.as_str().to_string(),
            enabled: !config.disabled,
            running,
            last_activity,
            idle_timeout: humantime::format_duration(config.idle_timeout).to_string(),
            startup_timeout: humantime::format_duration(config.startup_timeout).to_string(),
            target_url: config.target_url,
            health_path: config.health_path,
            schedule,
        }
    }

    pub async fn list_services(&self) -> Vec<ServiceStatusDto> {
        let mut out = Vec::new();
        for service in self.registry.all() {
            out.push(self.service_status(&service).await);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    // System operations

    pub fn system_status(&self) -> SystemStatusDto {
        let config = self.config.lock();
        SystemStatusDto {
            listen_addr: config.server.listen_addr.clone(),
            idle_reaper_interval: humantime::format_duration(config.idle_reaper.interval)
                .to_string(),
        }
    }

    pub fn update_system(self: &Arc<Self>, req: UpdateSystemRequest) -> Result<(), Error> {
        let mut addr_changed = false;
        {
            let mut config = self.config.lock();
            if let Some(addr) = req.listen_addr.as_deref().filter(|v| !v.is_empty()) {
                if !addr.starts_with(':') && !addr.contains(':') {
                    return Err(Error::InvalidInput("invalid listenAddr format".into()));
                }
                if config.server.listen_addr != addr {
                    config.server.listen_addr = addr.to_string();
                    addr_changed = true;
                }
            }
            if let Some(raw) = req.idle_reaper_interval.as_deref().filter(|v| !v.is_empty()) {
                let interval = humantime::parse_duration(raw)
                    .map_err(|_| Error::InvalidInput("invalid idleReaperInterval".into()))?;
                config.idle_reaper.interval = interval;
            }
        }

        // System updates surface persistence failures to the caller.
        self.persist()?;

        if addr_changed {
            let app = Arc::clone(self);
            tokio::spawn(async move {
                // Give the response time to reach the client first.
                tokio::time::sleep(Duration::from_millis(500)).await;
                info!("listen address changed, requesting restart");
                app.request_restart();
            });
        }

        Ok(())
    }

    /// Check whether a listen address can be bound right now. The
    /// currently bound address reports available.
    pub async fn check_port(&self, listen_addr: &str) -> Result<Option<String>, Error> {
        if listen_addr.is_empty() {
            return Err(Error::InvalidInput("listenAddr parameter required".into()));
        }
        if !listen_addr.starts_with(':') && !listen_addr.contains(':') {
            return Err(Error::InvalidInput("invalid listenAddr format".into()));
        }

        if self.config.lock().server.listen_addr == listen_addr {
            return Ok(None);
        }

        match tokio::net::TcpListener::bind(normalize_listen_addr(listen_addr)).await {
            Ok(_listener) => Ok(None),
            Err(e) => Ok(Some(e.to_string())),
        }
    }
}

fn parse_mode(raw: &str) -> Result<Mode, Error> {
    match raw {
        "on_demand" => Ok(Mode::OnDemand),
        "schedule_only" => Ok(Mode::ScheduleOnly),
        "both" => Ok(Mode::Both),
        _ => Err(Error::InvalidInput("invalid mode".into())),
    }
}

fn parse_mode_or_default(raw: &str) -> Result<Mode, Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Mode::OnDemand);
    }
    parse_mode(trimmed)
}

fn parse_duration_field(raw: &str, default: Duration, field: &str) -> Result<Duration, Error> {
    if raw.is_empty() {
        return Ok(default);
    }
    humantime::parse_duration(raw)
        .map_err(|_| Error::InvalidInput(format!("invalid {}", field)))
}
