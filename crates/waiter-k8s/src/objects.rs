//! Kubernetes wire objects
//!
//! Typed views over the ReplicaSet and Pod payloads the scheduler
//! reads, plus the conversions into the uniform service/instance model.
//! Only the fields the core consumes are modeled; everything else in
//! the payload is ignored on deserialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use waiter_core::{FailedInstance, InstanceFlag, Service, ServiceId, ServiceInstance, TaskStats};

/// Annotation carrying the owning Waiter service id
pub const SERVICE_ID_ANNOTATION: &str = "waiter/service-id";

/// Annotation carrying the backend protocol
pub const PROTOCOL_ANNOTATION: &str = "waiter/protocol";

/// Annotation carrying the number of ports the instance listens on
pub const PORT_COUNT_ANNOTATION: &str = "waiter/port-count";

/// Label marking objects owned by a scheduler deployment
pub const MANAGED_BY_LABEL: &str = "managed-by";

/// Label carrying the workload name
pub const APP_LABEL: &str = "app";

/// Name of the primary container in every Waiter pod
pub const PRIMARY_CONTAINER: &str = "waiter-app";

/// Name of the log fileserver sidecar container
pub const FILESERVER_CONTAINER: &str = "waiter-fileserver";

/// Exit code the kubelet reports for externally killed containers
const SIGKILL_EXIT_CODE: i32 = 137;

/// Object metadata (the slice the scheduler reads)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub annotations: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub resource_version: Option<String>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    fn service_id(&self) -> Option<ServiceId> {
        self.annotations
            .get(SERVICE_ID_ANNOTATION)
            .map(|id| ServiceId::new(id.clone()))
    }
}

/// List envelope metadata; the resource version is the watch bookmark
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListMeta {
    pub resource_version: Option<String>,
}

/// A typed list response (`ReplicaSetList`, `PodList`)
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectList<T> {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

/// ReplicaSet spec slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaSetSpec {
    pub replicas: u32,
}

/// ReplicaSet status slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplicaSetStatus {
    pub replicas: u32,
    pub available_replicas: u32,
    pub ready_replicas: u32,
    pub unavailable_replicas: u32,
}

/// A ReplicaSet as delivered by list and watch responses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaSet {
    pub metadata: ObjectMeta,
    pub spec: ReplicaSetSpec,
    pub status: ReplicaSetStatus,
}

impl ReplicaSet {
    /// The owning Waiter service id, when annotated
    pub fn service_id(&self) -> Option<ServiceId> {
        self.metadata.service_id()
    }

    /// Convert to the uniform service view. `None` when the object is
    /// not a convertible Waiter workload (missing annotation or name).
    pub fn to_service(&self) -> Option<Service> {
        let id = self.service_id()?;
        if self.metadata.name.is_empty() {
            return None;
        }
        Some(Service {
            id,
            instances: self.spec.replicas,
            task_count: self.status.replicas,
            task_stats: TaskStats::derive(
                self.status.replicas,
                self.status.available_replicas,
                self.status.ready_replicas,
            ),
            app_name: self.metadata.name.clone(),
            namespace: self.metadata.namespace.clone(),
        })
    }
}

/// Container port slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerPort {
    pub container_port: u16,
}

/// Container spec slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Container {
    pub name: String,
    pub ports: Vec<ContainerPort>,
}

/// Pod spec slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodSpec {
    pub containers: Vec<Container>,
}

/// `state`/`lastState` of a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerState {
    pub running: Option<RunningState>,
    pub terminated: Option<TerminatedState>,
}

/// Running container state slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunningState {
    pub started_at: Option<DateTime<Utc>>,
}

/// Terminated container state slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TerminatedState {
    pub exit_code: i32,
    pub reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl TerminatedState {
    /// Whether the orchestrator's own liveness handling killed the
    /// container (as opposed to the container exiting or OOMing)
    pub fn killed_by_orchestrator(&self) -> bool {
        self.exit_code == SIGKILL_EXIT_CODE && self.reason.as_deref() == Some("Error")
    }

    /// Whether the container was terminated for exceeding its memory
    /// limit
    pub fn oom_killed(&self) -> bool {
        self.reason.as_deref() == Some("OOMKilled")
    }
}

/// Container status slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerStatus {
    pub name: String,
    pub ready: bool,
    pub restart_count: u32,
    pub state: ContainerState,
    pub last_state: ContainerState,
}

/// Pod status slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodStatus {
    pub pod_ip: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub container_statuses: Vec<ContainerStatus>,
}

/// A Pod as delivered by list and watch responses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    pub status: PodStatus,
}

impl Pod {
    /// The owning Waiter service id, when annotated
    pub fn service_id(&self) -> Option<ServiceId> {
        self.metadata.service_id()
    }

    /// A pod is live iff it has an IP and is not being torn down
    pub fn is_live(&self) -> bool {
        self.status.pod_ip.is_some() && self.metadata.deletion_timestamp.is_none()
    }

    /// Status of the primary container, selected by name so sidecars
    /// can never shift incarnation identity; index 0 is the fallback
    /// for pods predating named selection
    pub fn primary_container_status(&self) -> Option<&ContainerStatus> {
        self.status
            .container_statuses
            .iter()
            .find(|cs| cs.name == PRIMARY_CONTAINER)
            .or_else(|| self.status.container_statuses.first())
    }

    /// Restart count of the primary container
    pub fn restart_count(&self) -> u32 {
        self.primary_container_status()
            .map(|cs| cs.restart_count)
            .unwrap_or(0)
    }

    /// Primary service port, from the primary container's first port
    pub fn primary_port(&self) -> Option<u16> {
        let container = self
            .spec
            .containers
            .iter()
            .find(|c| c.name == PRIMARY_CONTAINER)
            .or_else(|| self.spec.containers.first())?;
        container.ports.first().map(|p| p.container_port)
    }

    /// Annotated port count, defaulting to one
    pub fn port_count(&self) -> u16 {
        self.metadata
            .annotations
            .get(PORT_COUNT_ANNOTATION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1)
    }

    /// Annotated backend protocol, defaulting to http
    pub fn protocol(&self) -> String {
        self.metadata
            .annotations
            .get(PROTOCOL_ANNOTATION)
            .cloned()
            .unwrap_or_else(|| "http".to_string())
    }

    fn log_directory(&self, restart_count: u32) -> String {
        format!("/home/{}/r{}", self.metadata.namespace, restart_count)
    }

    /// Convert a live pod to the uniform instance view; `None` for pods
    /// that are not live or not convertible
    pub fn to_service_instance(&self) -> Option<ServiceInstance> {
        if !self.is_live() {
            return None;
        }
        let service_id = self.service_id()?;
        let host = self.status.pod_ip.clone()?;
        let port = self.primary_port()?;
        let restart_count = self.restart_count();
        let status = self.primary_container_status();

        let started_at = status
            .and_then(|cs| cs.state.running.as_ref())
            .and_then(|r| r.started_at)
            .or(self.status.start_time);

        Some(ServiceInstance {
            id: ServiceInstance::derive_id(&service_id, &self.metadata.name, restart_count),
            service_id,
            host,
            port,
            extra_ports: ServiceInstance::extra_ports_for(port, self.port_count()),
            protocol: self.protocol(),
            started_at,
            healthy: status.map(|cs| cs.ready).unwrap_or(false),
            log_directory: self.log_directory(restart_count),
            restart_count,
            flags: BTreeSet::new(),
            exit_code: None,
        })
    }

    /// Extract the previous incarnation of this pod as a failed
    /// instance, when the primary container reports a terminated last
    /// state.
    ///
    /// The record is keyed by `restart-count - 1`, which makes failure
    /// identity deterministic: re-observing the same pod yields the
    /// same record, and a further restart yields a distinct one. The
    /// exit code is suppressed when the orchestrator itself killed the
    /// container.
    pub fn terminated_incarnation(&self) -> Option<FailedInstance> {
        let service_id = self.service_id()?;
        let status = self.primary_container_status()?;
        let terminated = status.last_state.terminated.as_ref()?;
        let incarnation = status.restart_count.checked_sub(1)?;

        let mut flags = BTreeSet::new();
        if terminated.oom_killed() {
            flags.insert(InstanceFlag::MemoryLimitExceeded);
        }
        let exit_code = if terminated.killed_by_orchestrator() {
            None
        } else {
            Some(terminated.exit_code)
        };

        let port = self.primary_port().unwrap_or(0);
        Some(FailedInstance {
            id: ServiceInstance::derive_id(&service_id, &self.metadata.name, incarnation),
            service_id,
            host: self.status.pod_ip.clone().unwrap_or_default(),
            port,
            extra_ports: ServiceInstance::extra_ports_for(port, self.port_count()),
            protocol: self.protocol(),
            started_at: terminated.started_at,
            healthy: false,
            log_directory: self.log_directory(incarnation),
            restart_count: incarnation,
            flags,
            exit_code,
        })
    }
}

/// Watch event type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Error,
}

/// One event from a watch stream; the object payload is deserialized
/// by the stream's owner into the appropriate type
#[derive(Debug, Clone, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub object: serde_json::Value,
}

impl WatchEvent {
    /// The resource version carried by the event's object
    pub fn resource_version(&self) -> Option<String> {
        self.object
            .get("metadata")
            .and_then(|m| m.get("resourceVersion"))
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn replicaset_json() -> serde_json::Value {
        json!({
            "metadata": {
                "name": "myapp-e8b625cc474b213d",
                "namespace": "testuser",
                "resourceVersion": "1042",
                "annotations": {"waiter/service-id": "waiter-myapp-e8b625cc83c411e8974c38d5474b213d"},
                "labels": {"app": "myapp-e8b625cc474b213d", "managed-by": "waiter"}
            },
            "spec": {"replicas": 3},
            "status": {"replicas": 3, "availableReplicas": 2, "readyReplicas": 2, "unavailableReplicas": 1}
        })
    }

    fn pod_json(restart_count: u32, last_state: serde_json::Value) -> serde_json::Value {
        json!({
            "metadata": {
                "name": "myapp-e8b625cc474b213d-abcde",
                "namespace": "testuser",
                "annotations": {
                    "waiter/service-id": "waiter-myapp-e8b625cc83c411e8974c38d5474b213d",
                    "waiter/port-count": "2",
                    "waiter/protocol": "http"
                }
            },
            "spec": {
                "containers": [
                    {"name": "waiter-app", "ports": [{"containerPort": 8330}]},
                    {"name": "waiter-fileserver", "ports": [{"containerPort": 591}]}
                ]
            },
            "status": {
                "podIP": "10.0.0.5",
                "startTime": "2024-01-01T00:00:00Z",
                "containerStatuses": [{
                    "name": "waiter-app",
                    "ready": true,
                    "restartCount": restart_count,
                    "state": {"running": {"startedAt": "2024-01-01T00:05:00Z"}},
                    "lastState": last_state
                }]
            }
        })
    }

    #[test]
    fn test_replicaset_to_service() {
        let rs: ReplicaSet = serde_json::from_value(replicaset_json()).unwrap();
        let service = rs.to_service().unwrap();
        assert_eq!(
            service.id.as_str(),
            "waiter-myapp-e8b625cc83c411e8974c38d5474b213d"
        );
        assert_eq!(service.instances, 3);
        assert_eq!(service.task_count, 3);
        assert_eq!(service.task_stats.staged, 1);
        assert_eq!(service.task_stats.running, 2);
        assert_eq!(
            service.task_stats.running + service.task_stats.staged,
            service.task_count
        );
        assert_eq!(service.namespace, "testuser");
    }

    #[test]
    fn test_replicaset_without_annotation_skipped() {
        let mut value = replicaset_json();
        value["metadata"]["annotations"] = json!({});
        let rs: ReplicaSet = serde_json::from_value(value).unwrap();
        assert!(rs.to_service().is_none());
    }

    #[test]
    fn test_pod_to_instance() {
        let pod: Pod = serde_json::from_value(pod_json(0, json!({}))).unwrap();
        assert!(pod.is_live());

        let instance = pod.to_service_instance().unwrap();
        assert_eq!(
            instance.id,
            "waiter-myapp-e8b625cc83c411e8974c38d5474b213d.myapp-e8b625cc474b213d-abcde-0"
        );
        assert_eq!(instance.host, "10.0.0.5");
        assert_eq!(instance.port, 8330);
        assert_eq!(instance.extra_ports, vec![8331]);
        assert!(instance.healthy);
        assert_eq!(instance.log_directory, "/home/testuser/r0");
        // Running state wins over pod start time
        assert_eq!(
            instance.started_at.unwrap().to_rfc3339(),
            "2024-01-01T00:05:00+00:00"
        );
    }

    #[test]
    fn test_pod_liveness_filter() {
        let mut value = pod_json(0, json!({}));
        value["status"]["podIP"] = json!(null);
        let pod: Pod = serde_json::from_value(value).unwrap();
        assert!(!pod.is_live());
        assert!(pod.to_service_instance().is_none());

        let mut value = pod_json(0, json!({}));
        value["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:10:00Z");
        let pod: Pod = serde_json::from_value(value).unwrap();
        assert!(!pod.is_live());
    }

    #[test]
    fn test_primary_container_selected_by_name() {
        let mut value = pod_json(4, json!({}));
        // Sidecar status listed first must not shift identity
        value["status"]["containerStatuses"] = json!([
            {"name": "waiter-fileserver", "ready": true, "restartCount": 9},
            {"name": "waiter-app", "ready": true, "restartCount": 4}
        ]);
        let pod: Pod = serde_json::from_value(value).unwrap();
        assert_eq!(pod.restart_count(), 4);
    }

    #[test]
    fn test_terminated_incarnation_error_exit() {
        let last_state = json!({
            "terminated": {"exitCode": 137, "reason": "Error", "startedAt": "2024-01-01T00:00:00Z"}
        });
        let pod: Pod = serde_json::from_value(pod_json(3, last_state)).unwrap();
        let failed = pod.terminated_incarnation().unwrap();

        assert!(failed.id.ends_with("-2"));
        assert!(failed.flags.is_empty());
        // Killed by the orchestrator's own probe: no exit code surfaced
        assert_eq!(failed.exit_code, None);
        assert!(!failed.healthy);
        assert_eq!(
            failed.started_at.unwrap().to_rfc3339(),
            "2024-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn test_terminated_incarnation_oom() {
        let last_state = json!({
            "terminated": {"exitCode": 137, "reason": "OOMKilled", "startedAt": "2024-01-01T00:00:00Z"}
        });
        let pod: Pod = serde_json::from_value(pod_json(3, last_state)).unwrap();
        let failed = pod.terminated_incarnation().unwrap();

        assert!(failed.flags.contains(&InstanceFlag::MemoryLimitExceeded));
        assert_eq!(failed.exit_code, Some(137));
    }

    #[test]
    fn test_no_incarnation_without_termination() {
        let pod: Pod = serde_json::from_value(pod_json(0, json!({}))).unwrap();
        assert!(pod.terminated_incarnation().is_none());
    }

    #[test]
    fn test_watch_event_parsing() {
        let event: WatchEvent = serde_json::from_value(json!({
            "type": "MODIFIED",
            "object": replicaset_json()
        }))
        .unwrap();
        assert_eq!(event.event_type, WatchEventType::Modified);
        assert_eq!(event.resource_version().as_deref(), Some("1042"));
    }
}
