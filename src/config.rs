use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Idle reaper configuration
    #[serde(default)]
    pub idle_reaper: IdleReaperConfig,

    /// Managed services
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Listen address (default: ":8800"). A bare ":port" binds all interfaces.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IdleReaperConfig {
    /// Interval between reaper ticks (default: 1m)
    #[serde(default = "default_reaper_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for IdleReaperConfig {
    fn default() -> Self {
        Self {
            interval: default_reaper_interval(),
        }
    }
}

/// How a service is brought up and down
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Wake on inbound traffic, stop on idle (default)
    #[default]
    OnDemand,
    /// Up only inside the schedule window; requests outside are refused
    ScheduleOnly,
    /// Schedule warms it up, traffic can also wake it; idle stops it
    Both,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::OnDemand => "on_demand",
            Mode::ScheduleOnly => "schedule_only",
            Mode::Both => "both",
        }
    }
}

/// Weekly schedule window in config form
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct ScheduleConfig {
    /// Days of the week: ["mon","tue",...,"sun"]. Empty means any day.
    #[serde(default)]
    pub days: Vec<String>,
    /// Window start as "HH:MM". Empty means 00:00.
    #[serde(default)]
    pub start: String,
    /// Window stop as "HH:MM". Empty means 00:00.
    #[serde(default)]
    pub stop: String,
}

/// Configuration for a single service
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ServiceConfig {
    /// Unique service name
    pub name: String,

    /// Virtual host this service answers on. May be empty only for
    /// schedule-only services.
    #[serde(default)]
    pub host: String,

    /// Legacy single-container field, promoted into `containers` at load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    /// Containers backing this service
    #[serde(default)]
    pub containers: Vec<String>,

    /// Backend URL requests are forwarded to
    #[serde(default)]
    pub target_url: String,

    /// Lifecycle mode: "on_demand" (default), "schedule_only" or "both"
    #[serde(default)]
    pub mode: Mode,

    /// Administrative off-switch
    #[serde(default)]
    pub disabled: bool,

    /// Stop the service after this much inactivity. Zero disables reaping.
    #[serde(default, with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Budget for container start plus readiness probing (default: 30s)
    #[serde(default = "default_startup_timeout", with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// Health check path polled after start. Empty skips the HTTP probe.
    #[serde(default)]
    pub health_path: String,

    /// Optional weekly window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleConfig>,
}

impl ServiceConfig {
    /// The containers backing this service, falling back to the legacy
    /// single `container_name` field.
    pub fn container_names(&self) -> Vec<String> {
        if !self.containers.is_empty() {
            return self.containers.clone();
        }
        match &self.container_name {
            Some(name) if !name.is_empty() => vec![name.clone()],
            _ => Vec::new(),
        }
    }
}

// Default value functions
fn default_listen_addr() -> String {
    ":8800".to_string()
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Expand a bare ":port" listen address to one that binds all interfaces.
pub fn normalize_listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        addr.to_string()
    }
}

impl Config {
    /// Load configuration from `path`. A missing file is replaced with a
    /// default config which is written back so the operator has something
    /// to edit.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Config::default();
                config.save(path)?;
                return Ok(config);
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {}", path.display(), e)),
        };

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parse config {}: {}", path.display(), e))?;

        if config.server.listen_addr.is_empty() {
            config.server.listen_addr = default_listen_addr();
        }

        for service in &mut config.services {
            if service.containers.is_empty() {
                if let Some(name) = service.container_name.take() {
                    if !name.is_empty() {
                        service.containers = vec![name];
                    }
                }
            }
        }

        Ok(config)
    }

    /// Save configuration to `path` atomically (write temp file, rename).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let data = toml::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("serialize config: {}", e))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| anyhow::anyhow!("create config directory: {}", e))?;
            }
        }

        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, data)
            .map_err(|e| anyhow::anyhow!("write temp config file: {}", e))?;
        std::fs::rename(&tmp, path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            anyhow::anyhow!("rename config file: {}", e)
        })?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            idle_reaper: IdleReaperConfig::default(),
            services: Vec::new(),
        }
    }
}

/// Serde glue for human-readable durations ("30s", "5m", "1h 30m").
pub mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
listen_addr = ":9100"

[idle_reaper]
interval = "30s"

[[services]]
name = "app"
host = "app.local"
containers = ["app-c"]
target_url = "http://127.0.0.1:9000"
mode = "on_demand"
idle_timeout = "5m"
startup_timeout = "10s"
health_path = "/healthz"

[[services]]
name = "nightly"
mode = "schedule_only"
containers = ["batch"]

[services.schedule]
days = ["mon", "tue"]
start = "22:00"
stop = "06:00"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_addr, ":9100");
        assert_eq!(config.idle_reaper.interval, Duration::from_secs(30));
        assert_eq!(config.services.len(), 2);

        let app = &config.services[0];
        assert_eq!(app.name, "app");
        assert_eq!(app.mode, Mode::OnDemand);
        assert_eq!(app.idle_timeout, Duration::from_secs(300));
        assert_eq!(app.startup_timeout, Duration::from_secs(10));

        let nightly = &config.services[1];
        assert_eq!(nightly.mode, Mode::ScheduleOnly);
        assert_eq!(nightly.host, "");
        let schedule = nightly.schedule.as_ref().unwrap();
        assert_eq!(schedule.days, vec!["mon", "tue"]);
        assert_eq!(schedule.start, "22:00");
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen_addr, ":8800");
        assert_eq!(config.idle_reaper.interval, Duration::from_secs(60));
        assert!(config.services.is_empty());

        let service: ServiceConfig = toml::from_str(r#"name = "x""#).unwrap();
        assert_eq!(service.mode, Mode::OnDemand);
        assert_eq!(service.idle_timeout, Duration::ZERO);
        assert_eq!(service.startup_timeout, Duration::from_secs(30));
        assert!(!service.disabled);
    }

    #[test]
    fn test_legacy_container_name_promoted() {
        let toml = r#"
[[services]]
name = "old"
host = "old.local"
container_name = "old-c"
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conslee.toml");
        std::fs::write(&path, toml).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.services[0].containers, vec!["old-c"]);
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conslee.toml");

        let mut config = Config::default();
        config.services.push(ServiceConfig {
            name: "app".to_string(),
            host: "app.local".to_string(),
            containers: vec!["app-c".to_string()],
            target_url: "http://127.0.0.1:9000".to_string(),
            idle_timeout: Duration::from_secs(90),
            schedule: Some(ScheduleConfig {
                days: vec!["fri".to_string()],
                start: "09:00".to_string(),
                stop: "17:00".to_string(),
            }),
            ..Default::default()
        });

        config.save(&path).unwrap();
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.services.len(), 1);
        assert_eq!(reloaded.services[0].name, "app");
        assert_eq!(reloaded.services[0].idle_timeout, Duration::from_secs(90));
        assert_eq!(
            reloaded.services[0].schedule.as_ref().unwrap().start,
            "09:00"
        );
    }

    #[test]
    fn test_missing_file_creates_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.toml");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr, ":8800");
        assert!(path.exists());
    }

    #[test]
    fn test_normalize_listen_addr() {
        assert_eq!(normalize_listen_addr(":8800"), "0.0.0.0:8800");
        assert_eq!(normalize_listen_addr("127.0.0.1:80"), "127.0.0.1:80");
    }

    #[test]
    fn test_container_names_fallback() {
        let service = ServiceConfig {
            name: "a".into(),
            container_name: Some("legacy".into()),
            ..Default::default()
        };
        assert_eq!(service.container_names(), vec!["legacy"]);

        let service = ServiceConfig {
            name: "b".into(),
            container_name: Some("legacy".into()),
            containers: vec!["one".into(), "two".into()],
            ..Default::default()
        };
        assert_eq!(service.container_names(), vec!["one", "two"]);
    }
}
