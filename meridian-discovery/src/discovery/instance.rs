//! Service instance records and the events describing their lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

const fn default_weight() -> u32 {
    1
}

/// Reachability status of an instance, owned by the health supervisor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Registered, not yet confirmed by probes
    #[default]
    Starting,
    Up,
    Down,
}

impl ServiceStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered, addressable service endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique within a registry, immutable after creation
    pub id: String,
    /// Logical service group used for resolution
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub endpoint: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub status: ServiceStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceInstance {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            version: String::new(),
            endpoint: endpoint.into(),
            weight: default_weight(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            status: ServiceStatus::Starting,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    /// Create an instance with a random id of the form `<name>-<nanoid>`
    #[must_use]
    pub fn with_generated_id(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let name = name.into();
        let id = format!("{name}-{}", nanoid::nanoid!(10));
        Self::new(id, name, endpoint)
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub const fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Check if the instance has been silent for longer than `timeout`
    #[must_use]
    pub fn is_stale(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_heartbeat)
            .to_std()
            .is_ok_and(|elapsed| elapsed > timeout)
    }

    /// Record a heartbeat. `last_heartbeat` never moves backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
    }
}

/// Kind of registry state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Registered,
    Deregistered,
    StatusChanged,
    /// Removed by the heartbeat sweep
    Expired,
}

impl EventKind {
    /// Whether the instance is gone after this event
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Deregistered | Self::Expired)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Registered => "registered",
            Self::Deregistered => "deregistered",
            Self::StatusChanged => "status_changed",
            Self::Expired => "expired",
        })
    }
}

/// Read-only notification of a single registry state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub kind: EventKind,
    /// Snapshot of the instance as of the transition
    pub instance: ServiceInstance,
    /// Status before a `StatusChanged` transition
    pub previous_status: Option<ServiceStatus>,
    pub timestamp: DateTime<Utc>,
}

impl ServiceEvent {
    #[must_use]
    pub fn new(kind: EventKind, instance: ServiceInstance) -> Self {
        Self {
            kind,
            instance,
            previous_status: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn status_changed(instance: ServiceInstance, previous: ServiceStatus) -> Self {
        Self {
            previous_status: Some(previous),
            ..Self::new(EventKind::StatusChanged, instance)
        }
    }

    /// Service name the event belongs to
    #[must_use]
    pub fn service(&self) -> &str {
        &self.instance.name
    }
}
