//! Composite scheduler
//!
//! Routes every service to one of several sub-schedulers using a
//! per-service tag from descriptor metadata, with a configured default.
//! Pure routing: the composite holds no state of its own.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use waiter_core::{
    DeleteResult, DescriptorSource, DirectoryEntry, Error, KillResult, Result, ScaleResult,
    SchedulerBackend, Service, ServiceDescription, ServiceId, ServiceInstance, ServiceState,
};

/// Descriptor metadata key selecting the sub-scheduler for a service
pub const SCHEDULER_TAG_KEY: &str = "scheduler";

/// Tag-routed multiplexer over several scheduler backends
pub struct CompositeScheduler {
    components: HashMap<String, Arc<dyn SchedulerBackend>>,
    default_tag: String,
    descriptors: Arc<dyn DescriptorSource>,
}

impl CompositeScheduler {
    /// Create a composite over the given components. The default tag
    /// must name one of them.
    pub fn new(
        components: HashMap<String, Arc<dyn SchedulerBackend>>,
        default_tag: impl Into<String>,
        descriptors: Arc<dyn DescriptorSource>,
    ) -> Result<Self> {
        let default_tag = default_tag.into();
        if components.is_empty() {
            return Err(Error::malformed("composite scheduler needs components"));
        }
        if !components.contains_key(&default_tag) {
            return Err(Error::malformed(format!(
                "default scheduler tag {:?} has no component",
                default_tag
            )));
        }
        Ok(Self {
            components,
            default_tag,
            descriptors,
        })
    }

    /// The routing tag for a service: its descriptor metadata entry, or
    /// the default
    fn tag_for(&self, service_id: &ServiceId) -> String {
        self.descriptors
            .descriptor(service_id)
            .and_then(|descriptor| descriptor.metadata.get(SCHEDULER_TAG_KEY).cloned())
            .unwrap_or_else(|| self.default_tag.clone())
    }

    fn component_for(&self, service_id: &ServiceId) -> &Arc<dyn SchedulerBackend> {
        let tag = self.tag_for(service_id);
        self.components.get(&tag).unwrap_or_else(|| {
            warn!(
                "service {} routed to unknown scheduler {:?}, using default",
                service_id, tag
            );
            &self.components[&self.default_tag]
        })
    }
}

#[async_trait]
impl SchedulerBackend for CompositeScheduler {
    async fn get_services(&self) -> Vec<Service> {
        // Deterministic order: components by tag, services as delivered
        let mut tags: Vec<&String> = self.components.keys().collect();
        tags.sort();

        let mut services = Vec::new();
        for tag in tags {
            services.extend(self.components[tag].get_services().await);
        }
        services
    }

    async fn service_exists(&self, service_id: &ServiceId) -> bool {
        self.component_for(service_id).service_exists(service_id).await
    }

    async fn create_service_if_new(
        &self,
        service_id: &ServiceId,
        descriptor: &ServiceDescription,
    ) -> Result<Option<Service>> {
        self.component_for(service_id)
            .create_service_if_new(service_id, descriptor)
            .await
    }

    async fn delete_service(&self, service_id: &ServiceId) -> DeleteResult {
        self.component_for(service_id).delete_service(service_id).await
    }

    async fn scale_service(&self, service_id: &ServiceId, target: u32) -> ScaleResult {
        self.component_for(service_id)
            .scale_service(service_id, target)
            .await
    }

    async fn kill_instance(&self, instance: &ServiceInstance) -> KillResult {
        self.component_for(&instance.service_id)
            .kill_instance(instance)
            .await
    }

    async fn retrieve_directory_content(
        &self,
        service_id: &ServiceId,
        instance_id: &str,
        host: &str,
        path: &str,
    ) -> Option<Vec<DirectoryEntry>> {
        self.component_for(service_id)
            .retrieve_directory_content(service_id, instance_id, host, path)
            .await
    }

    async fn service_state(&self, service_id: &ServiceId) -> ServiceState {
        self.component_for(service_id).service_state(service_id).await
    }

    async fn state(&self) -> Value {
        let mut merged = serde_json::Map::new();
        for (tag, component) in &self.components {
            merged.insert(tag.clone(), component.state().await);
        }
        json!({
            "default": self.default_tag,
            "components": Value::Object(merged),
        })
    }

    async fn validate_service(&self, service_id: &ServiceId) -> Result<()> {
        self.component_for(service_id).validate_service(service_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waiter_dev::{test_descriptor, MockScheduler};

    const PLAIN_SID: &str = "waiter-plain-e8b625cc83c411e8974c38d5474b213d";
    const TAGGED_SID: &str = "waiter-tagged-0123456789abcdef";

    struct TaggedDescriptors;

    impl DescriptorSource for TaggedDescriptors {
        fn descriptor(&self, service_id: &ServiceId) -> Option<ServiceDescription> {
            if service_id.as_str() == TAGGED_SID {
                Some(test_descriptor("testuser").with_metadata(SCHEDULER_TAG_KEY, "alt"))
            } else if service_id.as_str() == PLAIN_SID {
                Some(test_descriptor("testuser"))
            } else {
                None
            }
        }

        fn service_password(&self, _service_id: &ServiceId) -> String {
            "pw".to_string()
        }
    }

    fn composite() -> (CompositeScheduler, Arc<MockScheduler>, Arc<MockScheduler>) {
        let main = Arc::new(MockScheduler::new());
        let alt = Arc::new(MockScheduler::new());
        let components: HashMap<String, Arc<dyn SchedulerBackend>> = HashMap::from([
            ("main".to_string(), main.clone() as Arc<dyn SchedulerBackend>),
            ("alt".to_string(), alt.clone() as Arc<dyn SchedulerBackend>),
        ]);
        let composite =
            CompositeScheduler::new(components, "main", Arc::new(TaggedDescriptors)).unwrap();
        (composite, main, alt)
    }

    #[tokio::test]
    async fn test_routing_by_metadata_tag() {
        let (composite, main, alt) = composite();

        let descriptor = test_descriptor("testuser").with_metadata(SCHEDULER_TAG_KEY, "alt");
        composite
            .create_service_if_new(&ServiceId::new(TAGGED_SID), &descriptor)
            .await
            .unwrap();
        assert!(alt.calls().iter().any(|c| c.starts_with("create-service-if-new")));
        assert!(main.calls().is_empty());
    }

    #[tokio::test]
    async fn test_default_tag_routing() {
        let (composite, main, alt) = composite();

        composite.service_exists(&ServiceId::new(PLAIN_SID)).await;
        assert!(main.calls().iter().any(|c| c.starts_with("service-exists")));
        assert!(alt.calls().is_empty());

        // Unknown services (no descriptor) also fall back to the default
        composite
            .service_exists(&ServiceId::new("waiter-x-aaaabbbbccccdddd"))
            .await;
        assert_eq!(
            main.calls()
                .iter()
                .filter(|c| c.starts_with("service-exists"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_get_services_concatenates() {
        let (composite, _main, _alt) = composite();

        composite
            .create_service_if_new(
                &ServiceId::new(PLAIN_SID),
                &test_descriptor("testuser"),
            )
            .await
            .unwrap();
        composite
            .create_service_if_new(
                &ServiceId::new(TAGGED_SID),
                &test_descriptor("testuser").with_metadata(SCHEDULER_TAG_KEY, "alt"),
            )
            .await
            .unwrap();

        let services = composite.get_services().await;
        assert_eq!(services.len(), 2);
    }

    #[tokio::test]
    async fn test_state_merges_by_tag() {
        let (composite, _main, _alt) = composite();
        let state = composite.state().await;
        assert_eq!(state["default"], "main");
        assert!(state["components"]["main"].is_object());
        assert!(state["components"]["alt"].is_object());
    }

    #[test]
    fn test_default_tag_must_exist() {
        let components: HashMap<String, Arc<dyn SchedulerBackend>> = HashMap::from([(
            "main".to_string(),
            Arc::new(MockScheduler::new()) as Arc<dyn SchedulerBackend>,
        )]);
        assert!(
            CompositeScheduler::new(components, "missing", Arc::new(TaggedDescriptors)).is_err()
        );
    }
}
