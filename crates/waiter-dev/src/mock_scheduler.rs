//! In-memory mock of the scheduler facade for testing
//!
//! Behaves like a tiny single-process backend: services live in a map,
//! scaling adjusts counters, kills remove seeded instances. Every
//! facade call is recorded so tests can assert operation sequences.
//! Deliberately deterministic: no randomness, no timing.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Mutex;
use tracing::debug;
use waiter_core::{
    DeleteOutcome, DeleteResult, DirectoryEntry, FailedInstance, KillResult, Result, ScaleOutcome,
    ScaleResult, SchedulerBackend, Service, ServiceDescription, ServiceId, ServiceInstance,
    ServiceState, TaskStats,
};

#[derive(Debug, Clone)]
struct MockEntry {
    service: Service,
    active: Vec<ServiceInstance>,
    failed: Vec<FailedInstance>,
}

/// Mock scheduler backend
#[derive(Default)]
pub struct MockScheduler {
    services: DashMap<ServiceId, MockEntry>,
    calls: Mutex<Vec<String>>,
}

impl MockScheduler {
    /// Create an empty mock backend
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().expect("call log poisoned").push(call.into());
    }

    /// Every facade call made so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("call log poisoned").clone()
    }

    /// Seed a live instance onto an existing service
    pub fn push_active_instance(&self, instance: ServiceInstance) {
        if let Some(mut entry) = self.services.get_mut(&instance.service_id) {
            entry.service.task_count += 1;
            entry.service.task_stats.running += 1;
            if instance.healthy {
                entry.service.task_stats.healthy += 1;
            } else {
                entry.service.task_stats.unhealthy += 1;
            }
            entry.active.push(instance);
        }
    }

    /// Seed a failed incarnation onto an existing service
    pub fn push_failed_instance(&self, failed: FailedInstance) {
        if let Some(mut entry) = self.services.get_mut(&failed.service_id) {
            entry.failed.push(failed);
        }
    }
}

#[async_trait]
impl SchedulerBackend for MockScheduler {
    async fn get_services(&self) -> Vec<Service> {
        self.record("get-services");
        let mut services: Vec<Service> = self
            .services
            .iter()
            .map(|entry| entry.service.clone())
            .collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    async fn service_exists(&self, service_id: &ServiceId) -> bool {
        self.record(format!("service-exists {}", service_id));
        self.services.contains_key(service_id)
    }

    async fn create_service_if_new(
        &self,
        service_id: &ServiceId,
        descriptor: &ServiceDescription,
    ) -> Result<Option<Service>> {
        self.record(format!("create-service-if-new {}", service_id));
        descriptor.ensure_launchable()?;

        if self.services.contains_key(service_id) {
            return Ok(None);
        }
        let service = Service {
            id: service_id.clone(),
            instances: descriptor.min_instances,
            task_count: 0,
            task_stats: TaskStats::default(),
            app_name: format!("mock-{}", service_id),
            namespace: descriptor.run_as_user.clone(),
        };
        self.services.insert(
            service_id.clone(),
            MockEntry {
                service: service.clone(),
                active: Vec::new(),
                failed: Vec::new(),
            },
        );
        debug!("mock created {}", service_id);
        Ok(Some(service))
    }

    async fn delete_service(&self, service_id: &ServiceId) -> DeleteResult {
        self.record(format!("delete-service {}", service_id));
        match self.services.remove(service_id) {
            Some(_) => DeleteResult {
                result: DeleteOutcome::Deleted,
                message: format!("service {} deleted", service_id),
            },
            None => DeleteResult {
                result: DeleteOutcome::NoSuchServiceExists,
                message: format!("service {} does not exist", service_id),
            },
        }
    }

    async fn scale_service(&self, service_id: &ServiceId, target: u32) -> ScaleResult {
        self.record(format!("scale-service {} {}", service_id, target));
        let Some(mut entry) = self.services.get_mut(service_id) else {
            return ScaleResult {
                success: false,
                status: 404,
                result: ScaleOutcome::NoSuchServiceExists,
                message: format!("service {} does not exist", service_id),
            };
        };
        if target <= entry.service.instances {
            return ScaleResult {
                success: true,
                status: 200,
                result: ScaleOutcome::ScalingNotNeeded,
                message: format!("service already has {} instances", entry.service.instances),
            };
        }
        entry.service.instances = target;
        ScaleResult {
            success: true,
            status: 200,
            result: ScaleOutcome::Scaled,
            message: format!("scaled to {} instances", target),
        }
    }

    async fn kill_instance(&self, instance: &ServiceInstance) -> KillResult {
        self.record(format!("kill-instance {}", instance.id));
        let Some(mut entry) = self.services.get_mut(&instance.service_id) else {
            return KillResult {
                killed: false,
                status: 404,
                message: format!("service {} does not exist", instance.service_id),
            };
        };
        let before = entry.active.len();
        entry.active.retain(|active| active.id != instance.id);
        if entry.active.len() == before {
            return KillResult {
                killed: false,
                status: 404,
                message: format!("instance {} not found", instance.id),
            };
        }
        entry.service.instances = entry.service.instances.saturating_sub(1);
        entry.service.task_count = entry.service.task_count.saturating_sub(1);
        entry.service.task_stats = TaskStats::derive(
            entry.service.task_count,
            entry.service.task_count,
            entry.active.iter().filter(|a| a.healthy).count() as u32,
        );
        KillResult {
            killed: true,
            status: 200,
            message: format!("killed {}", instance.id),
        }
    }

    async fn retrieve_directory_content(
        &self,
        _service_id: &ServiceId,
        instance_id: &str,
        _host: &str,
        _path: &str,
    ) -> Option<Vec<DirectoryEntry>> {
        self.record(format!("retrieve-directory-content {}", instance_id));
        None
    }

    async fn service_state(&self, service_id: &ServiceId) -> ServiceState {
        self.record(format!("service-state {}", service_id));
        match self.services.get(service_id) {
            Some(entry) => ServiceState {
                service: Some(entry.service.clone()),
                active_instances: entry.active.clone(),
                failed_instances: entry.failed.clone(),
            },
            None => ServiceState::default(),
        }
    }

    async fn state(&self) -> Value {
        self.record("state");
        json!({
            "backend": "mock",
            "service-count": self.services.len(),
            "call-count": self.calls.lock().expect("call log poisoned").len(),
        })
    }

    async fn validate_service(&self, service_id: &ServiceId) -> Result<()> {
        self.record(format!("validate-service {}", service_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{test_descriptor, test_instance};

    const SID: &str = "waiter-mock-e8b625cc83c411e8974c38d5474b213d";

    #[tokio::test]
    async fn test_create_scale_kill_delete_cycle() {
        let scheduler = MockScheduler::new();
        let service_id = ServiceId::new(SID);

        let service = scheduler
            .create_service_if_new(&service_id, &test_descriptor("testuser"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(service.instances, 1);

        // One-shot: a second create is a no-op
        assert!(scheduler
            .create_service_if_new(&service_id, &test_descriptor("testuser"))
            .await
            .unwrap()
            .is_none());

        let result = scheduler.scale_service(&service_id, 3).await;
        assert_eq!(result.result, ScaleOutcome::Scaled);

        let instance = test_instance(&service_id, "mock-pod-aaaaa", 0);
        scheduler.push_active_instance(instance.clone());
        assert_eq!(
            scheduler.service_state(&service_id).await.active_instances.len(),
            1
        );

        let result = scheduler.kill_instance(&instance).await;
        assert!(result.killed);
        assert!(scheduler
            .service_state(&service_id)
            .await
            .active_instances
            .is_empty());

        let result = scheduler.delete_service(&service_id).await;
        assert_eq!(result.result, DeleteOutcome::Deleted);
        assert!(!scheduler.service_exists(&service_id).await);
    }

    #[tokio::test]
    async fn test_call_recording() {
        let scheduler = MockScheduler::new();
        let service_id = ServiceId::new(SID);

        scheduler.get_services().await;
        scheduler.service_exists(&service_id).await;

        let calls = scheduler.calls();
        assert_eq!(calls[0], "get-services");
        assert!(calls[1].starts_with("service-exists"));
    }
}
