//! Idle reaper and schedule enforcement
//!
//! One periodic tick drives two passes: stop services that have sat
//! idle past their timeout, then reconcile schedules — stop
//! schedule-only services outside their window, warm up services whose
//! window is open. Errors are logged and swallowed; the loop must keep
//! ticking whatever the runtime does.

use crate::app::App;
use crate::config::Mode;
use crate::proxy::ensure_running;
use chrono::{Local, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Periodic reaper/scheduler driver.
pub struct Scheduler {
    app: Arc<App>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(app: Arc<App>, interval: Duration, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            app,
            interval,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "idle reaper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.reap_idle().await;
                    self.run_schedule().await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("idle reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Stop containers of services that have been idle past their timeout.
    pub async fn reap_idle(&self) {
        let now = Utc::now();

        for service in self.app.registry.all() {
            let (name, disabled, idle_timeout, last_activity, containers) = {
                let state = service.lock();
                (
                    state.config.name.clone(),
                    state.config.disabled,
                    state.config.idle_timeout,
                    state.last_activity,
                    state.container_names(),
                )
            };

            if disabled || idle_timeout.is_zero() {
                continue;
            }

            let idle = (now - last_activity).to_std().unwrap_or_default();
            if idle < idle_timeout {
                continue;
            }

            for container in &containers {
                let state = match self.app.runtime().inspect(container).await {
                    Ok(state) => state,
                    Err(e) => {
                        warn!(container = %container, error = %e, "inspect failed in idle reaper");
                        continue;
                    }
                };
                if !state.running {
                    continue;
                }
                info!(
                    container = %container,
                    service = %name,
                    idle_secs = idle.as_secs(),
                    timeout_secs = idle_timeout.as_secs(),
                    "stopping idle container"
                );
                if let Err(e) = self.app.runtime().stop(container, Duration::ZERO).await {
                    warn!(container = %container, error = %e, "stop failed in idle reaper");
                }
            }
        }
    }

    /// Enforce schedule windows: stop schedule-only services outside
    /// their window, warm up services inside it. `both` is never
    /// stopped here; idling is its only stop condition.
    pub async fn run_schedule(&self) {
        let now = Local::now();

        for service in self.app.registry.all() {
            let (name, disabled, mode, schedule, containers) = {
                let state = service.lock();
                (
                    state.config.name.clone(),
                    state.config.disabled,
                    state.config.mode,
                    state.schedule.clone(),
                    state.container_names(),
                )
            };

            if disabled {
                continue;
            }
            let Some(schedule) = schedule else {
                continue;
            };

            if !schedule.should_be_up(&now) {
                if mode == Mode::ScheduleOnly {
                    for container in &containers {
                        if let Err(e) = self.app.runtime().stop(container, Duration::ZERO).await {
                            debug!(container = %container, error = %e, "scheduled stop failed");
                        }
                    }
                }
                continue;
            }

            if mode == Mode::ScheduleOnly || mode == Mode::Both {
                let runtime = Arc::clone(self.app.runtime());
                let probe_client = self.app.probe_client().clone();
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    if let Err(e) = ensure_running(&runtime, &probe_client, &service).await {
                        error!(service = %name, error = %e, "scheduled start failed");
                    }
                });
            }
        }
    }
}
