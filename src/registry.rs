//! Service registry
//!
//! Indexed store of service states keyed by unique name and, when set,
//! unique host. All mutations of the indexes are serialized under a
//! single write lock; readers take shared locks and `all()` hands out a
//! snapshot so callers can iterate without holding the registry lock.
//!
//! Uniqueness is enforced by the administrative facade before entries
//! reach the registry; the registry supplies the conflict check it uses.

use crate::config::ServiceConfig;
use crate::error::Error;
use crate::schedule::ServiceSchedule;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// Shared handle to a service's runtime state.
///
/// Lock ordering: when the registry lock and a service mutex are both
/// needed, take the registry lock first. Never hold either across an
/// `.await`.
pub type SharedService = Arc<Mutex<ServiceState>>;

/// Runtime twin of a [`ServiceConfig`]: the parsed target URL and
/// schedule, plus the activity timestamp the idle reaper works from.
#[derive(Debug)]
pub struct ServiceState {
    pub config: ServiceConfig,
    pub target: Option<Url>,
    pub schedule: Option<ServiceSchedule>,
    /// Wall-clock time of the last forwarded request or explicit start.
    pub last_activity: DateTime<Utc>,
}

impl ServiceState {
    /// Build runtime state from a config entry, parsing the target URL
    /// and schedule.
    pub fn from_config(config: ServiceConfig) -> Result<Self, Error> {
        let target = if config.target_url.is_empty() {
            None
        } else {
            Some(Url::parse(&config.target_url).map_err(|e| {
                Error::InvalidInput(format!("invalid target_url {:?}: {}", config.target_url, e))
            })?)
        };

        let schedule = match &config.schedule {
            Some(sc) => Some(ServiceSchedule::parse(sc)?),
            None => None,
        };

        Ok(Self {
            config,
            target,
            schedule,
            last_activity: Utc::now(),
        })
    }

    /// The containers backing this service (legacy fallback included).
    pub fn container_names(&self) -> Vec<String> {
        self.config.container_names()
    }

    /// Record activity now.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

#[derive(Default)]
struct Indexes {
    by_name: HashMap<String, SharedService>,
    by_host: HashMap<String, SharedService>,
}

/// Store of all known services.
#[derive(Default)]
pub struct ServiceRegistry {
    inner: RwLock<Indexes>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a service, indexing it by name and (when non-empty) host.
    /// The caller has already checked uniqueness.
    pub fn add(&self, state: ServiceState) -> SharedService {
        let name = state.config.name.clone();
        let host = state.config.host.clone();
        let shared = Arc::new(Mutex::new(state));

        let mut inner = self.inner.write();
        if !host.is_empty() {
            inner.by_host.insert(host, Arc::clone(&shared));
        }
        inner.by_name.insert(name, Arc::clone(&shared));
        shared
    }

    /// Move a service to a new host, updating the host index and the
    /// service's own config in one critical section.
    pub fn update_host(&self, service: &SharedService, new_host: &str) {
        let mut inner = self.inner.write();
        let old_host =
            std::mem::replace(&mut service.lock().config.host, new_host.to_string());
        if !old_host.is_empty() {
            inner.by_host.remove(&old_host);
        }
        if !new_host.is_empty() {
            inner.by_host.insert(new_host.to_string(), Arc::clone(service));
        }
    }

    /// Remove a service, dropping both index entries atomically.
    pub fn remove_by_name(&self, name: &str) -> Option<SharedService> {
        let mut inner = self.inner.write();
        let service = inner.by_name.remove(name)?;
        let host = service.lock().config.host.clone();
        if !host.is_empty() {
            inner.by_host.remove(&host);
        }
        Some(service)
    }

    pub fn get_by_name(&self, name: &str) -> Option<SharedService> {
        self.inner.read().by_name.get(name).cloned()
    }

    pub fn get_by_host(&self, host: &str) -> Option<SharedService> {
        self.inner.read().by_host.get(host).cloned()
    }

    /// Snapshot of all services. Safe to iterate without the lock.
    pub fn all(&self) -> Vec<SharedService> {
        self.inner.read().by_name.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find a container from `names` already claimed by another service.
    /// Returns `(service name, container name)` for the first conflict.
    /// `except` excludes the service being edited from the scan.
    pub fn find_container_conflict(
        &self,
        names: &[String],
        except: &str,
    ) -> Option<(String, String)> {
        let wanted: Vec<&str> = names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .collect();
        if wanted.is_empty() {
            return None;
        }

        for service in self.all() {
            let state = service.lock();
            if state.config.name == except {
                continue;
            }
            for owned in state.container_names() {
                if wanted.contains(&owned.as_str()) {
                    return Some((state.config.name.clone(), owned));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, ScheduleConfig};

    fn service(name: &str, host: &str, containers: &[&str]) -> ServiceState {
        ServiceState::from_config(ServiceConfig {
            name: name.to_string(),
            host: host.to_string(),
            containers: containers.iter().map(|c| c.to_string()).collect(),
            target_url: "http://127.0.0.1:9000".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_lookup_by_name_and_host() {
        let registry = ServiceRegistry::new();
        let added = registry.add(service("app", "app.local", &["app-c"]));

        let by_name = registry.get_by_name("app").unwrap();
        let by_host = registry.get_by_host("app.local").unwrap();
        assert!(Arc::ptr_eq(&added, &by_name));
        assert!(Arc::ptr_eq(&added, &by_host));
        assert!(registry.get_by_name("other").is_none());
        assert!(registry.get_by_host("other.local").is_none());
    }

    #[test]
    fn test_empty_host_not_indexed() {
        let registry = ServiceRegistry::new();
        registry.add(service("batch", "", &["batch-c"]));

        assert!(registry.get_by_name("batch").is_some());
        assert!(registry.get_by_host("").is_none());
    }

    #[test]
    fn test_remove_drops_both_indexes() {
        let registry = ServiceRegistry::new();
        registry.add(service("app", "app.local", &["app-c"]));

        assert!(registry.remove_by_name("app").is_some());
        assert!(registry.get_by_name("app").is_none());
        assert!(registry.get_by_host("app.local").is_none());
        assert!(registry.remove_by_name("app").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_update_host_moves_index_entry() {
        let registry = ServiceRegistry::new();
        let svc = registry.add(service("app", "app.local", &["app-c"]));

        registry.update_host(&svc, "new.local");

        assert!(registry.get_by_host("app.local").is_none());
        let moved = registry.get_by_host("new.local").unwrap();
        assert!(Arc::ptr_eq(&moved, &svc));
        assert_eq!(svc.lock().config.host, "new.local");

        // clearing the host drops the index entry entirely
        registry.update_host(&svc, "");
        assert!(registry.get_by_host("new.local").is_none());
        assert!(registry.get_by_name("app").is_some());
    }

    #[test]
    fn test_container_conflict() {
        let registry = ServiceRegistry::new();
        registry.add(service("a", "a.local", &["shared-c", "a-c"]));
        registry.add(service("b", "b.local", &["b-c"]));

        let conflict = registry
            .find_container_conflict(&["shared-c".to_string()], "")
            .unwrap();
        assert_eq!(conflict, ("a".to_string(), "shared-c".to_string()));

        // the service being edited does not conflict with itself
        assert!(registry
            .find_container_conflict(&["a-c".to_string()], "a")
            .is_none());

        // whitespace and empties are ignored
        assert!(registry
            .find_container_conflict(&["  ".to_string(), String::new()], "")
            .is_none());

        assert!(registry
            .find_container_conflict(&["fresh-c".to_string()], "")
            .is_none());
    }

    #[test]
    fn test_legacy_container_name_conflicts() {
        let registry = ServiceRegistry::new();
        registry.add(
            ServiceState::from_config(ServiceConfig {
                name: "legacy".to_string(),
                host: "legacy.local".to_string(),
                container_name: Some("old-c".to_string()),
                target_url: "http://127.0.0.1:9000".to_string(),
                ..Default::default()
            })
            .unwrap(),
        );

        let conflict = registry
            .find_container_conflict(&["old-c".to_string()], "")
            .unwrap();
        assert_eq!(conflict.0, "legacy");
    }

    #[test]
    fn test_from_config_parses_target_and_schedule() {
        let state = ServiceState::from_config(ServiceConfig {
            name: "app".to_string(),
            host: "app.local".to_string(),
            target_url: "http://127.0.0.1:9000/base".to_string(),
            schedule: Some(ScheduleConfig {
                days: vec!["mon".to_string()],
                start: "09:00".to_string(),
                stop: "17:00".to_string(),
            }),
            mode: Mode::Both,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(state.target.as_ref().unwrap().port(), Some(9000));
        assert_eq!(state.schedule.as_ref().unwrap().start_minutes, 540);
    }

    #[test]
    fn test_from_config_rejects_bad_input() {
        assert!(ServiceState::from_config(ServiceConfig {
            name: "bad".to_string(),
            target_url: "not a url".to_string(),
            ..Default::default()
        })
        .is_err());

        assert!(ServiceState::from_config(ServiceConfig {
            name: "bad".to_string(),
            schedule: Some(ScheduleConfig {
                start: "25:00".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .is_err());
    }
}
