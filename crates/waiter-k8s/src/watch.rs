//! Watch-state maintenance
//!
//! In-memory mirror of cluster state fed by two long-lived watch
//! streams. Each worker runs snapshot → stream → on-error re-snapshot
//! forever; within a stream, events are applied in delivered order.
//!
//! The mirror is a pair of copy-on-write cells: readers clone an `Arc`
//! to the current map and never block, writers build the next map and
//! swap it in. Across the two streams no ordering is guaranteed, so
//! consumers tolerate a pod appearing before its owning service and
//! vice versa.

use crate::client::ApiClient;
use crate::failures::FailureStore;
use crate::objects::{ObjectList, Pod, ReplicaSet, WatchEvent, WatchEventType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use waiter_core::config::KubernetesConfig;
use waiter_core::{Result, Service, ServiceId, ServiceInstance};

type ServiceMap = HashMap<ServiceId, Service>;
type PodMap = HashMap<ServiceId, HashMap<String, Pod>>;

/// Snapshot/watch bookmarks for one stream
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamMetadata {
    /// When the last snapshot and watch event were applied
    pub timestamp: StreamTimestamps,
    /// Resource versions observed at snapshot and watch time (opaque
    /// bookmark tokens)
    pub version: StreamVersions,
}

/// Timestamps half of the stream metadata
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamTimestamps {
    pub snapshot: Option<DateTime<Utc>>,
    pub watch: Option<DateTime<Utc>>,
}

/// Resource-version half of the stream metadata
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamVersions {
    pub snapshot: Option<String>,
    pub watch: Option<String>,
}

/// The two streams feeding the mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    ReplicaSets,
    Pods,
}

/// In-memory mirror of `service-id → service` and
/// `service-id → pod-name → pod`
pub struct WatchState {
    services: RwLock<Arc<ServiceMap>>,
    pods: RwLock<Arc<PodMap>>,
    replicasets_meta: RwLock<StreamMetadata>,
    pods_meta: RwLock<StreamMetadata>,
}

impl Default for WatchState {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchState {
    /// Create an empty mirror
    pub fn new() -> Self {
        Self {
            services: RwLock::new(Arc::new(HashMap::new())),
            pods: RwLock::new(Arc::new(HashMap::new())),
            replicasets_meta: RwLock::new(StreamMetadata::default()),
            pods_meta: RwLock::new(StreamMetadata::default()),
        }
    }

    /// Snapshot of the service map
    pub fn services(&self) -> Arc<ServiceMap> {
        self.services.read().expect("watch state poisoned").clone()
    }

    /// Snapshot of the pod map
    pub fn pods(&self) -> Arc<PodMap> {
        self.pods.read().expect("watch state poisoned").clone()
    }

    /// One service, when mirrored
    pub fn service(&self, service_id: &ServiceId) -> Option<Service> {
        self.services().get(service_id).cloned()
    }

    /// All mirrored pods of one service
    pub fn service_pods(&self, service_id: &ServiceId) -> Vec<Pod> {
        self.pods()
            .get(service_id)
            .map(|pods| pods.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Live instances of one service
    pub fn active_instances(&self, service_id: &ServiceId) -> Vec<ServiceInstance> {
        let mut instances: Vec<ServiceInstance> = self
            .service_pods(service_id)
            .iter()
            .filter_map(|pod| pod.to_service_instance())
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    /// Replace the whole service slice from a fresh snapshot
    pub fn replace_services(&self, services: ServiceMap, version: Option<String>) {
        *self.services.write().expect("watch state poisoned") = Arc::new(services);
        self.record_snapshot(StreamKind::ReplicaSets, version);
    }

    /// Replace the whole pod slice from a fresh snapshot
    pub fn replace_pods(&self, pods: PodMap, version: Option<String>) {
        *self.pods.write().expect("watch state poisoned") = Arc::new(pods);
        self.record_snapshot(StreamKind::Pods, version);
    }

    /// Apply one ReplicaSet watch event
    pub fn apply_service_event(&self, event_type: WatchEventType, replicaset: &ReplicaSet) {
        let Some(service_id) = replicaset.service_id() else {
            debug!(
                "ignoring replicaset {} without a service-id annotation",
                replicaset.metadata.name
            );
            return;
        };

        let mut cell = self.services.write().expect("watch state poisoned");
        let mut next: ServiceMap = (**cell).clone();
        match event_type {
            WatchEventType::Deleted => {
                next.remove(&service_id);
            }
            WatchEventType::Added | WatchEventType::Modified => {
                match replicaset.to_service() {
                    Some(service) => {
                        next.insert(service_id, service);
                    }
                    // Conversion failures are skipped, never fatal
                    None => return,
                }
            }
            WatchEventType::Error => return,
        }
        *cell = Arc::new(next);
    }

    /// Apply one Pod watch event
    pub fn apply_pod_event(&self, event_type: WatchEventType, pod: &Pod) {
        let Some(service_id) = pod.service_id() else {
            debug!(
                "ignoring pod {} without a service-id annotation",
                pod.metadata.name
            );
            return;
        };
        let pod_name = pod.metadata.name.clone();
        if pod_name.is_empty() {
            return;
        }

        let mut cell = self.pods.write().expect("watch state poisoned");
        let mut next: PodMap = (**cell).clone();
        match event_type {
            WatchEventType::Deleted => {
                if let Some(group) = next.get_mut(&service_id) {
                    group.remove(&pod_name);
                    if group.is_empty() {
                        next.remove(&service_id);
                    }
                }
            }
            WatchEventType::Added | WatchEventType::Modified => {
                next.entry(service_id)
                    .or_default()
                    .insert(pod_name, pod.clone());
            }
            WatchEventType::Error => return,
        }
        *cell = Arc::new(next);
    }

    fn meta_cell(&self, stream: StreamKind) -> &RwLock<StreamMetadata> {
        match stream {
            StreamKind::ReplicaSets => &self.replicasets_meta,
            StreamKind::Pods => &self.pods_meta,
        }
    }

    fn record_snapshot(&self, stream: StreamKind, version: Option<String>) {
        let mut meta = self.meta_cell(stream).write().expect("watch state poisoned");
        meta.timestamp.snapshot = Some(Utc::now());
        meta.version.snapshot = version;
    }

    /// Record a watch-event bookmark
    pub fn record_watch(&self, stream: StreamKind, version: Option<String>) {
        let mut meta = self.meta_cell(stream).write().expect("watch state poisoned");
        meta.timestamp.watch = Some(Utc::now());
        if version.is_some() {
            meta.version.watch = version;
        }
    }

    /// Stream metadata snapshot
    pub fn metadata(&self, stream: StreamKind) -> StreamMetadata {
        self.meta_cell(stream)
            .read()
            .expect("watch state poisoned")
            .clone()
    }

    /// Diagnostic snapshot of the whole mirror
    pub fn to_json(&self) -> serde_json::Value {
        let services = self.services();
        let pods = self.pods();
        let pods_by_service: HashMap<&ServiceId, Vec<&String>> = pods
            .iter()
            .map(|(id, group)| (id, group.keys().collect()))
            .collect();
        json!({
            "service-id->service": &*services,
            "service-id->pods": pods_by_service,
            "replicasets-metadata": self.metadata(StreamKind::ReplicaSets),
            "pods-metadata": self.metadata(StreamKind::Pods),
        })
    }
}

/// Worker tunables shared by both watchers
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    list_path: String,
    retry_delay: Duration,
    failure_threshold: u32,
    exit_on_error: bool,
}

impl WatcherConfig {
    /// Worker configuration for the ReplicaSets stream
    pub fn replicasets(config: &KubernetesConfig) -> Self {
        Self {
            list_path: format!(
                "/apis/{}/replicasets?labelSelector={}",
                config.replicaset_api_version,
                label_selector(&config.orchestrator_name)
            ),
            retry_delay: Duration::from_secs(config.watch_retry_delay_secs),
            failure_threshold: config.watch_failure_threshold,
            exit_on_error: config.exit_on_error,
        }
    }

    /// Worker configuration for the Pods stream
    pub fn pods(config: &KubernetesConfig) -> Self {
        Self {
            list_path: format!(
                "/api/v1/pods?labelSelector={}",
                label_selector(&config.orchestrator_name)
            ),
            retry_delay: Duration::from_secs(config.watch_retry_delay_secs),
            failure_threshold: config.watch_failure_threshold,
            exit_on_error: config.exit_on_error,
        }
    }

    fn watch_path(&self, version: &Option<String>) -> String {
        match version {
            Some(version) => format!(
                "{}&watch=true&resourceVersion={}",
                self.list_path, version
            ),
            None => format!("{}&watch=true", self.list_path),
        }
    }
}

fn label_selector(orchestrator_name: &str) -> String {
    // '=' must be escaped inside the query value
    format!("managed-by%3D{}", orchestrator_name)
}

/// Run the ReplicaSets watcher forever
pub async fn run_replicaset_watcher(
    client: Arc<ApiClient>,
    state: Arc<WatchState>,
    config: WatcherConfig,
) {
    let mut snapshot_failures = 0u32;
    loop {
        let version = match snapshot_replicasets(&client, &state, &config).await {
            Ok(version) => {
                snapshot_failures = 0;
                version
            }
            Err(e) => {
                snapshot_failures += 1;
                warn!(
                    "replicaset snapshot failed ({} consecutive): {}",
                    snapshot_failures, e
                );
                escalate_or_wait(&config, snapshot_failures, "replicasets").await;
                continue;
            }
        };

        if let Err(e) = stream_replicasets(&client, &state, &config, &version).await {
            warn!("replicaset watch stream failed, re-snapshotting: {}", e);
            tokio::time::sleep(config.retry_delay).await;
        }
    }
}

/// Run the Pods watcher forever
pub async fn run_pod_watcher(
    client: Arc<ApiClient>,
    state: Arc<WatchState>,
    failures: Arc<FailureStore>,
    config: WatcherConfig,
) {
    let mut snapshot_failures = 0u32;
    loop {
        let version = match snapshot_pods(&client, &state, &failures, &config).await {
            Ok(version) => {
                snapshot_failures = 0;
                version
            }
            Err(e) => {
                snapshot_failures += 1;
                warn!(
                    "pod snapshot failed ({} consecutive): {}",
                    snapshot_failures, e
                );
                escalate_or_wait(&config, snapshot_failures, "pods").await;
                continue;
            }
        };

        if let Err(e) = stream_pods(&client, &state, &failures, &config, &version).await {
            warn!("pod watch stream failed, re-snapshotting: {}", e);
            tokio::time::sleep(config.retry_delay).await;
        }
    }
}

async fn escalate_or_wait(config: &WatcherConfig, consecutive: u32, stream: &str) {
    if config.exit_on_error && consecutive >= config.failure_threshold {
        error!(
            "{} watcher exhausted {} snapshot attempts, terminating",
            stream, consecutive
        );
        std::process::exit(1);
    }
    tokio::time::sleep(config.retry_delay).await;
}

async fn snapshot_replicasets(
    client: &ApiClient,
    state: &WatchState,
    config: &WatcherConfig,
) -> Result<Option<String>> {
    use crate::client::OrchestratorApi;

    let value = client.get(&config.list_path).await?;
    let list: ObjectList<ReplicaSet> = serde_json::from_value(value)?;
    let version = list.metadata.resource_version.clone();

    let mut services = ServiceMap::new();
    for replicaset in &list.items {
        // Objects that fail conversion are omitted from the mirror
        if let Some(service) = replicaset.to_service() {
            services.insert(service.id.clone(), service);
        }
    }
    info!(
        "replicaset snapshot applied: {} services at version {:?}",
        services.len(),
        version
    );
    state.replace_services(services, version.clone());
    Ok(version)
}

async fn snapshot_pods(
    client: &ApiClient,
    state: &WatchState,
    failures: &FailureStore,
    config: &WatcherConfig,
) -> Result<Option<String>> {
    use crate::client::OrchestratorApi;

    let value = client.get(&config.list_path).await?;
    let list: ObjectList<Pod> = serde_json::from_value(value)?;
    let version = list.metadata.resource_version.clone();

    let mut pods = PodMap::new();
    for pod in &list.items {
        let Some(service_id) = pod.service_id() else {
            continue;
        };
        if pod.metadata.name.is_empty() {
            continue;
        }
        failures.observe(pod);
        pods.entry(service_id)
            .or_default()
            .insert(pod.metadata.name.clone(), pod.clone());
    }
    info!(
        "pod snapshot applied: {} services at version {:?}",
        pods.len(),
        version
    );
    state.replace_pods(pods, version.clone());
    Ok(version)
}

async fn stream_replicasets(
    client: &ApiClient,
    state: &WatchState,
    config: &WatcherConfig,
    version: &Option<String>,
) -> Result<()> {
    let mut stream = client.stream(&config.watch_path(version)).await?;
    while let Some(value) = stream.next().await? {
        let event: WatchEvent = serde_json::from_value(value)?;
        if event.event_type == WatchEventType::Error {
            return Err(waiter_core::Error::internal(format!(
                "replicaset watch delivered an error object: {}",
                event.object
            )));
        }
        let version = event.resource_version();
        let replicaset: ReplicaSet = serde_json::from_value(event.object)?;
        state.apply_service_event(event.event_type, &replicaset);
        state.record_watch(StreamKind::ReplicaSets, version);
    }
    info!("replicaset watch stream ended");
    Ok(())
}

async fn stream_pods(
    client: &ApiClient,
    state: &WatchState,
    failures: &FailureStore,
    config: &WatcherConfig,
    version: &Option<String>,
) -> Result<()> {
    let mut stream = client.stream(&config.watch_path(version)).await?;
    while let Some(value) = stream.next().await? {
        let event: WatchEvent = serde_json::from_value(value)?;
        if event.event_type == WatchEventType::Error {
            return Err(waiter_core::Error::internal(format!(
                "pod watch delivered an error object: {}",
                event.object
            )));
        }
        let version = event.resource_version();
        let pod: Pod = serde_json::from_value(event.object)?;
        if event.event_type != WatchEventType::Deleted {
            failures.observe(&pod);
        }
        state.apply_pod_event(event.event_type, &pod);
        state.record_watch(StreamKind::Pods, version);
    }
    info!("pod watch stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn replicaset(service_id: &str, name: &str, spec: u32, status: (u32, u32, u32)) -> ReplicaSet {
        serde_json::from_value(json!({
            "metadata": {
                "name": name,
                "namespace": "testuser",
                "resourceVersion": "10",
                "annotations": {"waiter/service-id": service_id}
            },
            "spec": {"replicas": spec},
            "status": {
                "replicas": status.0,
                "availableReplicas": status.1,
                "readyReplicas": status.2
            }
        }))
        .unwrap()
    }

    fn pod(service_id: &str, name: &str, ip: Option<&str>) -> Pod {
        serde_json::from_value(json!({
            "metadata": {
                "name": name,
                "namespace": "testuser",
                "annotations": {"waiter/service-id": service_id}
            },
            "spec": {"containers": [{"name": "waiter-app", "ports": [{"containerPort": 8080}]}]},
            "status": {
                "podIP": ip,
                "containerStatuses": [{"name": "waiter-app", "ready": true, "restartCount": 0}]
            }
        }))
        .unwrap()
    }

    const SID: &str = "waiter-app-e8b625cc83c411e8974c38d5474b213d";

    #[test]
    fn test_snapshot_replaces_service_slice() {
        let state = WatchState::new();
        let rs = replicaset(SID, "app-1", 2, (2, 2, 2));
        let mut services = ServiceMap::new();
        let service = rs.to_service().unwrap();
        services.insert(service.id.clone(), service);

        state.replace_services(services, Some("100".to_string()));
        assert_eq!(state.services().len(), 1);

        let meta = state.metadata(StreamKind::ReplicaSets);
        assert_eq!(meta.version.snapshot.as_deref(), Some("100"));
        assert!(meta.timestamp.snapshot.is_some());
        assert!(meta.version.watch.is_none());

        // A later snapshot fully replaces the slice
        state.replace_services(ServiceMap::new(), Some("200".to_string()));
        assert!(state.services().is_empty());
    }

    #[test]
    fn test_service_events_upsert_and_remove() {
        let state = WatchState::new();
        let id = ServiceId::new(SID);

        state.apply_service_event(WatchEventType::Added, &replicaset(SID, "app-1", 2, (2, 2, 2)));
        assert_eq!(state.service(&id).unwrap().instances, 2);

        state.apply_service_event(
            WatchEventType::Modified,
            &replicaset(SID, "app-1", 5, (3, 2, 2)),
        );
        assert_eq!(state.service(&id).unwrap().instances, 5);

        state.apply_service_event(WatchEventType::Deleted, &replicaset(SID, "app-1", 5, (3, 2, 2)));
        assert!(state.service(&id).is_none());
    }

    #[test]
    fn test_unannotated_replicaset_ignored() {
        let state = WatchState::new();
        let mut rs = replicaset(SID, "app-1", 1, (1, 1, 1));
        rs.metadata.annotations.clear();
        state.apply_service_event(WatchEventType::Added, &rs);
        assert!(state.services().is_empty());
    }

    #[test]
    fn test_pod_events_group_by_service() {
        let state = WatchState::new();
        let id = ServiceId::new(SID);

        // Pods may arrive before their owning service is mirrored
        state.apply_pod_event(WatchEventType::Added, &pod(SID, "app-1-aaaaa", Some("10.0.0.1")));
        state.apply_pod_event(WatchEventType::Added, &pod(SID, "app-1-bbbbb", Some("10.0.0.2")));
        assert_eq!(state.service_pods(&id).len(), 2);
        assert!(state.service(&id).is_none());

        state.apply_pod_event(WatchEventType::Deleted, &pod(SID, "app-1-aaaaa", Some("10.0.0.1")));
        assert_eq!(state.service_pods(&id).len(), 1);

        state.apply_pod_event(WatchEventType::Deleted, &pod(SID, "app-1-bbbbb", Some("10.0.0.2")));
        assert!(state.pods().is_empty());
    }

    #[test]
    fn test_active_instances_apply_liveness_filter() {
        let state = WatchState::new();
        let id = ServiceId::new(SID);

        state.apply_pod_event(WatchEventType::Added, &pod(SID, "app-1-aaaaa", Some("10.0.0.1")));
        state.apply_pod_event(WatchEventType::Added, &pod(SID, "app-1-bbbbb", None));
        let instances = state.active_instances(&id);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].host, "10.0.0.1");
    }

    #[test]
    fn test_watch_bookmark_recorded() {
        let state = WatchState::new();
        state.record_watch(StreamKind::Pods, Some("42".to_string()));
        let meta = state.metadata(StreamKind::Pods);
        assert_eq!(meta.version.watch.as_deref(), Some("42"));
        assert!(meta.timestamp.watch.is_some());

        // A version-less event still bumps the timestamp
        state.record_watch(StreamKind::Pods, None);
        let meta = state.metadata(StreamKind::Pods);
        assert_eq!(meta.version.watch.as_deref(), Some("42"));
    }

    #[test]
    fn test_readers_hold_stable_snapshots() {
        let state = WatchState::new();
        state.apply_service_event(WatchEventType::Added, &replicaset(SID, "app-1", 1, (1, 1, 1)));

        let before = state.services();
        state.apply_service_event(WatchEventType::Deleted, &replicaset(SID, "app-1", 1, (1, 1, 1)));

        // The old snapshot is untouched by the write
        assert_eq!(before.len(), 1);
        assert!(state.services().is_empty());
    }

    #[test]
    fn test_watch_paths() {
        let config = KubernetesConfig::new("https://kube.example.com");
        let rs = WatcherConfig::replicasets(&config);
        assert_eq!(
            rs.list_path,
            "/apis/apps/v1/replicasets?labelSelector=managed-by%3Dwaiter"
        );
        assert_eq!(
            rs.watch_path(&Some("17".to_string())),
            "/apis/apps/v1/replicasets?labelSelector=managed-by%3Dwaiter&watch=true&resourceVersion=17"
        );

        let pods = WatcherConfig::pods(&config);
        assert_eq!(
            pods.list_path,
            "/api/v1/pods?labelSelector=managed-by%3Dwaiter"
        );
    }
}
