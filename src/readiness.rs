//! Service identities and log-based readiness detection.
//!
//! A service is ready the first time any of its markers shows up in output
//! attributed to it. Readiness is monotonic: nothing ever marks a service
//! not-ready again.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Logical services of the local stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Service {
    WebServer,
    ApiServer,
    SyncServer,
    Postgres,
    Redis,
    Cron,
}

impl Service {
    pub const ALL: [Service; 6] = [
        Service::WebServer,
        Service::ApiServer,
        Service::SyncServer,
        Service::Postgres,
        Service::Redis,
        Service::Cron,
    ];

    /// Key used in `devstack.toml`.
    pub fn key(&self) -> &'static str {
        match self {
            Service::WebServer => "web-server",
            Service::ApiServer => "api-server",
            Service::SyncServer => "sync-server",
            Service::Postgres => "postgres",
            Service::Redis => "redis",
            Service::Cron => "cron",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Service::WebServer => "Web server",
            Service::ApiServer => "Analytics API",
            Service::SyncServer => "Sync server",
            Service::Postgres => "Postgres",
            Service::Redis => "Redis",
            Service::Cron => "Cron",
        }
    }

    /// Built-in markers that prove the service is serving.
    pub fn default_markers(&self) -> &'static [&'static str] {
        match self {
            Service::WebServer => &["ready started server on", "Ready in"],
            Service::ApiServer => &["analytics_server entered RUNNING state"],
            Service::SyncServer => &["sync_server entered RUNNING state"],
            Service::Postgres => &["database system is ready to accept connections"],
            Service::Redis => &["Ready to accept connections"],
            Service::Cron => &["cron entered RUNNING state"],
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl std::str::FromStr for Service {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Service::ALL
            .into_iter()
            .find(|service| service.key() == s.to_lowercase())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown service '{}'. Valid values: {}",
                    s,
                    Service::ALL.map(|s| s.key()).join(", ")
                )
            })
    }
}

/// Service → ready markers.
#[derive(Debug, Clone)]
pub struct ReadinessTable {
    markers: BTreeMap<Service, Vec<String>>,
}

impl Default for ReadinessTable {
    fn default() -> Self {
        let markers = Service::ALL
            .into_iter()
            .map(|service| {
                let list = service
                    .default_markers()
                    .iter()
                    .map(|m| m.to_string())
                    .collect();
                (service, list)
            })
            .collect();
        Self { markers }
    }
}

impl ReadinessTable {
    /// Add extra markers for a service. Built-in markers are always kept.
    pub fn extend(&mut self, service: Service, extra: impl IntoIterator<Item = String>) {
        let list = self.markers.entry(service).or_default();
        for marker in extra {
            if !marker.is_empty() && !list.contains(&marker) {
                list.push(marker);
            }
        }
    }

    pub fn markers(&self, service: Service) -> &[String] {
        self.markers.get(&service).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `text` contains any ready marker of `service`.
    pub fn matches(&self, service: Service, text: &str) -> bool {
        self.markers(service)
            .iter()
            .any(|marker| text.contains(marker.as_str()))
    }
}

/// Tracks which services have been observed ready.
#[derive(Debug, Clone)]
pub struct ReadinessTracker {
    table: ReadinessTable,
    ready: BTreeSet<Service>,
}

impl ReadinessTracker {
    pub fn new(table: ReadinessTable) -> Self {
        Self {
            table,
            ready: BTreeSet::new(),
        }
    }

    /// Scan a chunk of output attributed to `candidates`.
    ///
    /// Returns the services that became ready because of this chunk.
    pub fn observe(&mut self, candidates: &[Service], text: &str) -> Vec<Service> {
        let mut newly_ready = Vec::new();
        for &service in candidates {
            if self.ready.contains(&service) {
                continue;
            }
            if self.table.matches(service, text) {
                self.ready.insert(service);
                newly_ready.push(service);
            }
        }
        newly_ready
    }

    pub fn is_ready(&self, service: Service) -> bool {
        self.ready.contains(&service)
    }

    pub fn ready_set(&self) -> &BTreeSet<Service> {
        &self.ready
    }

    /// Whether every service in `required` is ready.
    pub fn covers(&self, required: &BTreeSet<Service>) -> bool {
        required.is_subset(&self.ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_marker_marks_ready() {
        let mut tracker = ReadinessTracker::new(ReadinessTable::default());
        let newly = tracker.observe(
            &Service::ALL,
            "LOG:  database system is ready to accept connections",
        );
        assert_eq!(newly, vec![Service::Postgres]);
        assert!(tracker.is_ready(Service::Postgres));
        assert!(!tracker.is_ready(Service::Redis));
    }

    #[test]
    fn test_readiness_is_monotonic() {
        let mut tracker = ReadinessTracker::new(ReadinessTable::default());
        tracker.observe(&[Service::Redis], "* Ready to accept connections tcp");
        let newly = tracker.observe(&[Service::Redis], "# User requested shutdown...");
        assert!(newly.is_empty());
        assert!(tracker.is_ready(Service::Redis));
    }

    #[test]
    fn test_newly_ready_reported_once() {
        let mut tracker = ReadinessTracker::new(ReadinessTable::default());
        let line = "Ready to accept connections";
        assert_eq!(tracker.observe(&[Service::Redis], line), vec![Service::Redis]);
        assert!(tracker.observe(&[Service::Redis], line).is_empty());
    }

    #[test]
    fn test_only_candidates_are_considered() {
        let mut tracker = ReadinessTracker::new(ReadinessTable::default());
        let newly = tracker.observe(
            &[Service::Redis],
            "database system is ready to accept connections",
        );
        assert!(newly.is_empty());
        assert!(!tracker.is_ready(Service::Postgres));
    }

    #[test]
    fn test_covers_required_set() {
        let mut tracker = ReadinessTracker::new(ReadinessTable::default());
        let required: BTreeSet<_> = [Service::Postgres, Service::Redis].into_iter().collect();
        tracker.observe(&Service::ALL, "Ready to accept connections");
        assert!(!tracker.covers(&required));
        tracker.observe(&Service::ALL, "database system is ready to accept connections");
        assert!(tracker.covers(&required));
    }

    #[test]
    fn test_extend_keeps_builtin_markers() {
        let mut table = ReadinessTable::default();
        table.extend(Service::Cron, vec!["custom cron up".to_string(), String::new()]);
        assert!(table.matches(Service::Cron, "custom cron up"));
        assert!(table.matches(Service::Cron, "cron entered RUNNING state"));
        assert_eq!(table.markers(Service::Cron).len(), 2);
    }

    #[test]
    fn test_service_from_str_roundtrip() {
        for service in Service::ALL {
            assert_eq!(service.key().parse::<Service>().unwrap(), service);
        }
        assert!("mysql".parse::<Service>().is_err());
    }
}
