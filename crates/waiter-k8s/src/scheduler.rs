//! The Kubernetes scheduler backend
//!
//! Implements the scheduler facade against the API server: services are
//! ReplicaSets, instances are Pods. Reads come from the local watch
//! mirror; writes go to the orchestrator and flow back through the
//! watch streams.
//!
//! Scale-down is never expressed as a plain replica decrement because
//! the ReplicaSet controller, not Waiter, picks the victim. The
//! three-step safe-kill makes Waiter's chosen pod the controller's
//! preferred victim: a long-grace delete marks the pod terminating, the
//! -1 scale then cannot select a different pod, and a zero-grace delete
//! short-circuits the wait. Every step tolerates partial failure; the
//! grace period guarantees eventual reconciliation.

use crate::client::{token_source_for, ApiClient, OrchestratorApi};
use crate::failures::FailureStore;
use crate::fileserver;
use crate::objects::ReplicaSet;
use crate::spec::{spec_builder_for, spec_context, ReplicaSetSpecBuilder};
use crate::watch::{run_pod_watcher, run_replicaset_watcher, WatchState, WatcherConfig};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use waiter_core::config::AuthorizerKind;
use waiter_core::{
    Authorizer, DeleteOutcome, DeleteResult, DescriptorSource, DirectoryEntry, Error,
    KillResult, KubernetesConfig, PermissiveAuthorizer, Result, SanityCheckAuthorizer,
    ScaleOutcome, ScaleResult, SchedulerBackend, Service, ServiceDescription, ServiceId,
    ServiceInstance, ServiceState,
};

/// Grace period for the first (marking) delete of a safe-kill
const SAFE_KILL_GRACE_SECS: u32 = 300;

/// Pause between optimistic scale attempts while the mirror catches up
const SCALE_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Content type for JSON-Patch scale requests
const CONTENT_TYPE_JSON_PATCH: &str = "application/json-patch+json";

/// Kubernetes backend for the scheduler facade
pub struct KubernetesScheduler {
    config: KubernetesConfig,
    api: Arc<dyn OrchestratorApi>,
    client: Option<Arc<ApiClient>>,
    watch_state: Arc<WatchState>,
    failures: Arc<FailureStore>,
    spec_builder: Arc<dyn ReplicaSetSpecBuilder>,
    descriptors: Arc<dyn DescriptorSource>,
    authorizer: Arc<dyn Authorizer>,
    http: reqwest::Client,
}

impl KubernetesScheduler {
    /// Create a scheduler talking to a real API server
    pub fn new(config: KubernetesConfig, descriptors: Arc<dyn DescriptorSource>) -> Result<Self> {
        config.validate()?;
        let client = Arc::new(ApiClient::from_config(&config)?);
        let http = client.http();
        let api: Arc<dyn OrchestratorApi> = client.clone();
        Ok(Self {
            spec_builder: spec_builder_for(&config.replicaset_spec_builder.factory_fn)?,
            authorizer: authorizer_for(config.authorizer),
            watch_state: Arc::new(WatchState::new()),
            failures: Arc::new(FailureStore::new(config.max_failed_instances)),
            config,
            api,
            client: Some(client),
            descriptors,
            http,
        })
    }

    /// Assemble a scheduler from pre-built parts; used to exercise the
    /// operation logic against a fake orchestrator
    pub fn with_parts(
        config: KubernetesConfig,
        api: Arc<dyn OrchestratorApi>,
        descriptors: Arc<dyn DescriptorSource>,
        watch_state: Arc<WatchState>,
        failures: Arc<FailureStore>,
    ) -> Result<Self> {
        Ok(Self {
            spec_builder: spec_builder_for(&config.replicaset_spec_builder.factory_fn)?,
            authorizer: authorizer_for(config.authorizer),
            config,
            api,
            client: None,
            watch_state,
            failures,
            descriptors,
            http: reqwest::Client::new(),
        })
    }

    /// The watch mirror backing this scheduler
    pub fn watch_state(&self) -> Arc<WatchState> {
        self.watch_state.clone()
    }

    /// The failure store backing this scheduler
    pub fn failure_store(&self) -> Arc<FailureStore> {
        self.failures.clone()
    }

    /// Spawn the watch workers and, when configured, the auth refresh
    /// worker. The handles run for the scheduler's lifetime.
    pub fn start(&self) -> Result<Vec<JoinHandle<()>>> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| Error::internal("scheduler was built without an API client"))?;

        let mut handles = Vec::new();
        handles.push(tokio::spawn(run_replicaset_watcher(
            client.clone(),
            self.watch_state.clone(),
            WatcherConfig::replicasets(&self.config),
        )));
        handles.push(tokio::spawn(run_pod_watcher(
            client.clone(),
            self.watch_state.clone(),
            self.failures.clone(),
            WatcherConfig::pods(&self.config),
        )));

        if let Some(mins) = self.config.authentication.refresh_delay_mins {
            if let Some(source) = token_source_for(&self.config.authentication.kind) {
                handles.push(
                    client.spawn_token_refresh(source, Duration::from_secs(mins * 60)),
                );
            }
        }

        info!(
            "kubernetes scheduler started {} workers against {}",
            handles.len(),
            self.config.url
        );
        Ok(handles)
    }

    fn replicasets_path(&self, namespace: &str) -> String {
        format!(
            "/apis/{}/namespaces/{}/replicasets",
            self.config.replicaset_api_version, namespace
        )
    }

    fn replicaset_path(&self, namespace: &str, app_name: &str) -> String {
        format!("{}/{}", self.replicasets_path(namespace), app_name)
    }

    fn pod_path(namespace: &str, pod_name: &str) -> String {
        format!("/api/v1/namespaces/{}/pods/{}", namespace, pod_name)
    }

    async fn delete_pod(&self, namespace: &str, pod_name: &str, grace_secs: u32) -> Result<Value> {
        let body = json!({
            "kind": "DeleteOptions",
            "apiVersion": "v1",
            "gracePeriodSeconds": grace_secs
        });
        self.api
            .delete(&Self::pod_path(namespace, pod_name), Some(&body))
            .await
    }

    async fn patch_replicas(
        &self,
        namespace: &str,
        app_name: &str,
        current: u32,
        target: u32,
    ) -> Result<()> {
        let patch = json!([
            {"op": "test", "path": "/spec/replicas", "value": current},
            {"op": "replace", "path": "/spec/replicas", "value": target}
        ]);
        self.api
            .patch(
                &self.replicaset_path(namespace, app_name),
                CONTENT_TYPE_JSON_PATCH,
                &patch,
            )
            .await
            .map(|_| ())
    }

    /// Adjust the replica count by a signed delta with optimistic
    /// retries; the kill path uses this for its -1 step
    async fn scale_by(&self, service_id: &ServiceId, delta: i64) -> Result<()> {
        for attempt in 1..=self.config.max_patch_retries {
            let service = self
                .watch_state
                .service(service_id)
                .ok_or_else(|| Error::not_found(format!("service {} not mirrored", service_id)))?;
            let current = service.instances;
            let target = (current as i64 + delta).max(0) as u32;
            if target == current {
                return Ok(());
            }
            match self
                .patch_replicas(&service.namespace, &service.app_name, current, target)
                .await
            {
                Ok(()) => return Ok(()),
                Err(Error::Conflict(detail)) => {
                    debug!(
                        "replica patch for {} lost race (attempt {}): {}",
                        service_id, attempt, detail
                    );
                    tokio::time::sleep(SCALE_RETRY_PAUSE).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::conflict(format!(
            "replica patch for {} kept conflicting after {} attempts",
            service_id, self.config.max_patch_retries
        )))
    }
}

fn authorizer_for(kind: AuthorizerKind) -> Arc<dyn Authorizer> {
    match kind {
        AuthorizerKind::Permissive => Arc::new(PermissiveAuthorizer),
        AuthorizerKind::SanityCheck => Arc::new(SanityCheckAuthorizer),
    }
}

#[async_trait]
impl SchedulerBackend for KubernetesScheduler {
    async fn get_services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.watch_state.services().values().cloned().collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    async fn service_exists(&self, service_id: &ServiceId) -> bool {
        self.watch_state.service(service_id).is_some()
    }

    async fn create_service_if_new(
        &self,
        service_id: &ServiceId,
        descriptor: &ServiceDescription,
    ) -> Result<Option<Service>> {
        descriptor.ensure_launchable()?;

        let password = self.descriptors.service_password(service_id);
        let context = spec_context(&self.config, service_id, password)?;
        let spec = self.spec_builder.build(&context, service_id, descriptor)?;
        let path = self.replicasets_path(&descriptor.run_as_user);

        match self.api.post(&path, &spec).await {
            Ok(value) => match serde_json::from_value::<ReplicaSet>(value) {
                Ok(created) => {
                    info!("created replicaset {} for {}", context.app_name, service_id);
                    Ok(created.to_service())
                }
                Err(e) => {
                    warn!("created {} but the response was unparseable: {}", service_id, e);
                    Ok(None)
                }
            },
            Err(Error::Conflict(_)) => {
                debug!("replicaset for {} already exists", service_id);
                Ok(None)
            }
            Err(e) => {
                warn!("creating {} failed: {}", service_id, e);
                Ok(None)
            }
        }
    }

    async fn delete_service(&self, service_id: &ServiceId) -> DeleteResult {
        let Some(service) = self.watch_state.service(service_id) else {
            return DeleteResult {
                result: DeleteOutcome::NoSuchServiceExists,
                message: format!("service {} does not exist", service_id),
            };
        };

        // Pods are garbage-collected asynchronously behind the delete
        let body = json!({
            "kind": "DeleteOptions",
            "apiVersion": "v1",
            "propagationPolicy": "Background"
        });
        let path = self.replicaset_path(&service.namespace, &service.app_name);
        match self.api.delete(&path, Some(&body)).await {
            Ok(_) => {
                self.failures.remove_service(service_id);
                info!("deleted service {}", service_id);
                DeleteResult {
                    result: DeleteOutcome::Deleted,
                    message: format!("service {} deleted", service_id),
                }
            }
            Err(Error::NotFound(_)) => {
                self.failures.remove_service(service_id);
                DeleteResult {
                    result: DeleteOutcome::NoSuchServiceExists,
                    message: format!("service {} was already gone", service_id),
                }
            }
            Err(e) => {
                warn!("deleting {} failed: {}", service_id, e);
                DeleteResult {
                    result: DeleteOutcome::Error,
                    message: e.to_string(),
                }
            }
        }
    }

    async fn scale_service(&self, service_id: &ServiceId, target: u32) -> ScaleResult {
        for attempt in 1..=self.config.max_patch_retries {
            let Some(service) = self.watch_state.service(service_id) else {
                return ScaleResult {
                    success: false,
                    status: 404,
                    result: ScaleOutcome::NoSuchServiceExists,
                    message: format!("service {} does not exist", service_id),
                };
            };

            let current = service.instances;
            if target <= current {
                return ScaleResult {
                    success: true,
                    status: 200,
                    result: ScaleOutcome::ScalingNotNeeded,
                    message: format!("service already has {} instances", current),
                };
            }

            match self
                .patch_replicas(&service.namespace, &service.app_name, current, target)
                .await
            {
                Ok(()) => {
                    info!("scaled {} from {} to {}", service_id, current, target);
                    return ScaleResult {
                        success: true,
                        status: 200,
                        result: ScaleOutcome::Scaled,
                        message: format!("scaled to {} instances", target),
                    };
                }
                Err(Error::Conflict(detail)) => {
                    debug!(
                        "scale patch for {} lost race (attempt {}): {}",
                        service_id, attempt, detail
                    );
                    tokio::time::sleep(SCALE_RETRY_PAUSE).await;
                }
                Err(Error::NotFound(_)) => {
                    return ScaleResult {
                        success: false,
                        status: 404,
                        result: ScaleOutcome::NoSuchServiceExists,
                        message: format!("service {} disappeared mid-scale", service_id),
                    };
                }
                Err(e) => {
                    warn!("scaling {} failed: {}", service_id, e);
                    return ScaleResult {
                        success: false,
                        status: 500,
                        result: ScaleOutcome::Failed,
                        message: e.to_string(),
                    };
                }
            }
        }

        ScaleResult {
            success: false,
            status: 409,
            result: ScaleOutcome::Conflict,
            message: format!(
                "scale patch kept conflicting after {} attempts",
                self.config.max_patch_retries
            ),
        }
    }

    async fn kill_instance(&self, instance: &ServiceInstance) -> KillResult {
        let service_id = &instance.service_id;
        let Some(pod_name) = ServiceInstance::pod_name_of(service_id, &instance.id) else {
            return KillResult {
                killed: false,
                status: 400,
                message: format!("malformed instance id {}", instance.id),
            };
        };
        let Some(service) = self.watch_state.service(service_id) else {
            return KillResult {
                killed: false,
                status: 404,
                message: format!("service {} does not exist", service_id),
            };
        };
        let namespace = service.namespace.clone();

        // Step 1: mark the pod terminating under a long grace so the
        // controller will not pick a different victim
        match self
            .delete_pod(&namespace, &pod_name, SAFE_KILL_GRACE_SECS)
            .await
        {
            Ok(_) => {}
            Err(Error::NotFound(_)) => {
                return KillResult {
                    killed: false,
                    status: 404,
                    message: format!("instance {} not found", instance.id),
                };
            }
            Err(e) => {
                warn!("killing {} failed: {}", instance.id, e);
                return KillResult {
                    killed: false,
                    status: 500,
                    message: e.to_string(),
                };
            }
        }

        // Step 2: release the replica slot; a failure here only delays
        // reconciliation, it cannot resurrect the pod
        if let Err(e) = self.scale_by(service_id, -1).await {
            warn!(
                "scale-down after killing {} failed, relying on grace expiry: {}",
                instance.id, e
            );
        }

        // Step 3: short-circuit the grace wait; the pod being gone
        // already is success
        match self.delete_pod(&namespace, &pod_name, 0).await {
            Ok(_) | Err(Error::NotFound(_)) => {}
            Err(e) => warn!("final delete of {} failed: {}", instance.id, e),
        }

        KillResult {
            killed: true,
            status: 200,
            message: format!("killed {}", instance.id),
        }
    }

    async fn retrieve_directory_content(
        &self,
        _service_id: &ServiceId,
        _instance_id: &str,
        host: &str,
        path: &str,
    ) -> Option<Vec<DirectoryEntry>> {
        fileserver::retrieve_directory_content(&self.http, &self.config.fileserver, host, path)
            .await
    }

    async fn service_state(&self, service_id: &ServiceId) -> ServiceState {
        ServiceState {
            service: self.watch_state.service(service_id),
            active_instances: self.watch_state.active_instances(service_id),
            failed_instances: self.failures.failed_instances(service_id),
        }
    }

    async fn state(&self) -> Value {
        json!({
            "orchestrator-name": self.config.orchestrator_name,
            "api-version": self.config.replicaset_api_version,
            "watch-state": self.watch_state.to_json(),
            "failure-store": self.failures.to_json(),
        })
    }

    async fn validate_service(&self, service_id: &ServiceId) -> Result<()> {
        let descriptor = self
            .descriptors
            .descriptor(service_id)
            .ok_or_else(|| Error::not_found(format!("no descriptor for {}", service_id)))?;
        self.authorizer
            .check_user(&descriptor.run_as_user, service_id)
    }
}
