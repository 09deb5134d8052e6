//! Core type definitions for the Waiter scheduler
//!
//! Services and instances are the scheduler's uniform view over whatever
//! the backing orchestrator runs. Instance identity is deterministic:
//! every restart of a pod produces a fresh instance id derived from the
//! pod name and its restart count.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Unique identifier for a Waiter service (a content hash of its
/// description, opaque to the scheduler)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(String);

impl ServiceId {
    /// Create a new ServiceId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string representation of the ServiceId
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ServiceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Replica counters for a service, as observed on the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Replicas passing their readiness check
    pub healthy: u32,

    /// Replicas scheduled and running (task_count - staged)
    pub running: u32,

    /// Replicas created but not yet available
    pub staged: u32,

    /// Running replicas that are not healthy
    pub unhealthy: u32,
}

impl TaskStats {
    /// Derive stats from the orchestrator's raw replica counters.
    ///
    /// `unhealthy` can transiently compute negative while the
    /// orchestrator reconciles; it is clamped at zero rather than
    /// treated as an invariant violation.
    pub fn derive(task_count: u32, available: u32, ready: u32) -> Self {
        let staged = task_count.saturating_sub(available);
        let running = task_count - staged;
        let healthy = ready.min(task_count);
        let unhealthy = task_count.saturating_sub(healthy).saturating_sub(staged);
        Self {
            healthy,
            running,
            staged,
            unhealthy,
        }
    }
}

/// A logical Waiter workload as reified on the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// The Waiter service id
    pub id: ServiceId,

    /// Requested replica count (the orchestrator spec)
    pub instances: u32,

    /// Observed replica count (the orchestrator status)
    pub task_count: u32,

    /// Observed replica breakdown
    pub task_stats: TaskStats,

    /// The cluster-legal workload name backing this service
    pub app_name: String,

    /// The orchestrator namespace the workload lives in
    pub namespace: String,
}

/// Flags recorded on an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstanceFlag {
    /// The instance was terminated for exceeding its memory limit
    #[serde(rename = "memory-limit-exceeded")]
    MemoryLimitExceeded,
}

/// One incarnation of one replica of a service.
///
/// The id is unique per restart: `<service-id>.<pod-name>-<restart-count>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Instance id, unique per (service, pod, restart)
    pub id: String,

    /// The owning service
    pub service_id: ServiceId,

    /// IP the instance serves on
    pub host: String,

    /// Primary service port
    pub port: u16,

    /// Additional ports, allocated contiguously after `port`
    pub extra_ports: Vec<u16>,

    /// Backend protocol spoken by the instance (http, https, ...)
    pub protocol: String,

    /// When this incarnation started
    pub started_at: Option<DateTime<Utc>>,

    /// Whether the instance currently passes its readiness check
    pub healthy: bool,

    /// Directory instance logs are written to
    pub log_directory: String,

    /// Restart count of the backing pod at this incarnation
    pub restart_count: u32,

    /// Flags observed for this incarnation
    pub flags: BTreeSet<InstanceFlag>,

    /// Exit code of a terminated incarnation, absent when the
    /// orchestrator's own liveness probe killed it
    pub exit_code: Option<i32>,
}

/// A terminated incarnation retained by the failure store; same shape as
/// a live instance with `healthy` always false.
pub type FailedInstance = ServiceInstance;

impl ServiceInstance {
    /// Derive the deterministic instance id for a pod incarnation
    pub fn derive_id(service_id: &ServiceId, pod_name: &str, restart_count: u32) -> String {
        format!("{}.{}-{}", service_id, pod_name, restart_count)
    }

    /// Extract the pod name back out of an instance id.
    ///
    /// Returns `None` when the id was not produced by [`derive_id`] for
    /// the given service.
    pub fn pod_name_of(service_id: &ServiceId, instance_id: &str) -> Option<String> {
        let suffix = instance_id.strip_prefix(service_id.as_str())?;
        let suffix = suffix.strip_prefix('.')?;
        let (pod_name, restart) = suffix.rsplit_once('-')?;
        if pod_name.is_empty() || restart.parse::<u32>().is_err() {
            return None;
        }
        Some(pod_name.to_string())
    }

    /// Derive the contiguous extra port range after the primary port
    pub fn extra_ports_for(port: u16, port_count: u16) -> Vec<u16> {
        (1..port_count).map(|i| port + i).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_id_creation() {
        let id = ServiceId::new("waiter-myapp-e8b625cc83c411e8974c38d5474b213d");
        assert_eq!(id.as_str(), "waiter-myapp-e8b625cc83c411e8974c38d5474b213d");
        assert_eq!(id, ServiceId::from(id.as_str()));
    }

    #[test]
    fn test_task_stats_derivation() {
        let stats = TaskStats::derive(5, 3, 2);
        assert_eq!(stats.staged, 2);
        assert_eq!(stats.running, 3);
        assert_eq!(stats.healthy, 2);
        assert_eq!(stats.unhealthy, 1);
        assert_eq!(stats.running + stats.staged, 5);
    }

    #[test]
    fn test_task_stats_negative_unhealthy_clamps() {
        // ready > replicas - staged can happen transiently during reconcile
        let stats = TaskStats::derive(3, 1, 3);
        assert_eq!(stats.staged, 2);
        assert_eq!(stats.unhealthy, 0);
        assert_eq!(stats.running + stats.staged, 3);
    }

    #[test]
    fn test_task_stats_all_available() {
        let stats = TaskStats::derive(4, 4, 4);
        assert_eq!(stats.staged, 0);
        assert_eq!(stats.running, 4);
        assert_eq!(stats.healthy, 4);
        assert_eq!(stats.unhealthy, 0);
    }

    #[test]
    fn test_instance_id_derivation() {
        let service_id = ServiceId::new("waiter-app-1234");
        let id = ServiceInstance::derive_id(&service_id, "app-1234-abcde", 3);
        assert_eq!(id, "waiter-app-1234.app-1234-abcde-3");

        // Injective on (service-id, pod-name, restart-count): a different
        // restart yields a different id
        let id2 = ServiceInstance::derive_id(&service_id, "app-1234-abcde", 4);
        assert_ne!(id, id2);
    }

    #[test]
    fn test_pod_name_round_trip() {
        let service_id = ServiceId::new("waiter-app-1234");
        let id = ServiceInstance::derive_id(&service_id, "app-1234-abcde", 7);
        assert_eq!(
            ServiceInstance::pod_name_of(&service_id, &id).as_deref(),
            Some("app-1234-abcde")
        );
    }

    #[test]
    fn test_pod_name_of_rejects_foreign_ids() {
        let service_id = ServiceId::new("waiter-app-1234");
        assert_eq!(ServiceInstance::pod_name_of(&service_id, "other.pod-1"), None);
        assert_eq!(ServiceInstance::pod_name_of(&service_id, "waiter-app-1234.pod-x"), None);
        assert_eq!(ServiceInstance::pod_name_of(&service_id, "waiter-app-1234"), None);
    }

    #[test]
    fn test_extra_ports() {
        assert_eq!(ServiceInstance::extra_ports_for(8080, 1), Vec::<u16>::new());
        assert_eq!(ServiceInstance::extra_ports_for(8080, 3), vec![8081, 8082]);
    }
}
