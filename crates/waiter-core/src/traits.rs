//! Core traits for scheduler backends
//!
//! The `SchedulerBackend` facade is the stable interface the rest of
//! Waiter (router, autoscaler, UI) consumes; every backend (Kubernetes,
//! the composite multiplexer, the in-memory test backend) implements it.

use crate::descriptor::ServiceDescription;
use crate::error::Result;
use crate::types::{FailedInstance, Service, ServiceId, ServiceInstance};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome tag of a scale operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScaleOutcome {
    /// The replica target was applied
    Scaled,
    /// The service already met or exceeded the target
    ScalingNotNeeded,
    /// The service does not exist
    NoSuchServiceExists,
    /// The optimistic patch kept losing races and retries ran out
    Conflict,
    /// The operation failed for another reason
    Failed,
}

/// Result of a scale operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleResult {
    /// Whether the requested target is now in effect
    pub success: bool,
    /// HTTP-style status for the router layer
    pub status: u16,
    /// Domain-level outcome tag
    pub result: ScaleOutcome,
    /// Human-readable detail
    pub message: String,
}

/// Result of a kill operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillResult {
    /// Whether the instance is gone (or already was)
    pub killed: bool,
    /// HTTP-style status for the router layer
    pub status: u16,
    /// Human-readable detail
    pub message: String,
}

/// Outcome tag of a delete operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeleteOutcome {
    /// The service and its workload were deleted
    Deleted,
    /// There was nothing to delete
    NoSuchServiceExists,
    /// The delete failed
    Error,
}

/// Result of a delete operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    /// Domain-level outcome tag
    pub result: DeleteOutcome,
    /// Human-readable detail
    pub message: String,
}

/// One entry of an instance's log directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DirectoryEntry {
    /// A downloadable file
    File {
        /// File name
        name: String,
        /// Size in bytes when the fileserver reports it
        size: Option<u64>,
        /// Client-facing download URL
        url: String,
    },
    /// A navigable sub-directory
    Directory {
        /// Directory name
        name: String,
        /// Path to list the sub-directory with
        path: String,
    },
}

/// Per-service instance view returned by `service_state`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    /// The service as currently mirrored, when known
    pub service: Option<Service>,
    /// Live instances
    pub active_instances: Vec<ServiceInstance>,
    /// Retained terminated incarnations
    pub failed_instances: Vec<FailedInstance>,
}

/// The scheduler facade consumed by the rest of Waiter.
///
/// All operations are idempotent except `create_service_if_new`, which
/// is one-shot; failures are reported through the result payloads rather
/// than errors wherever the operation's intent is itself idempotent.
#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    /// All services currently mirrored from the orchestrator
    async fn get_services(&self) -> Vec<Service>;

    /// Whether a service exists; false covers not-found
    async fn service_exists(&self, service_id: &ServiceId) -> bool;

    /// Create the service unless it already exists.
    ///
    /// Returns the created service, `Ok(None)` when it already existed
    /// or creation failed recoverably (logged), and an error only when
    /// the descriptor itself is unacceptable.
    async fn create_service_if_new(
        &self,
        service_id: &ServiceId,
        descriptor: &ServiceDescription,
    ) -> Result<Option<Service>>;

    /// Delete the service and forget its failure history
    async fn delete_service(&self, service_id: &ServiceId) -> DeleteResult;

    /// Scale the service up to `target` replicas (scale-down is the kill
    /// path's job)
    async fn scale_service(&self, service_id: &ServiceId, target: u32) -> ScaleResult;

    /// Kill one specific instance
    async fn kill_instance(&self, instance: &ServiceInstance) -> KillResult;

    /// List an instance's log directory through the fileserver sidecar;
    /// `None` when the sidecar is unreachable or unconfigured
    async fn retrieve_directory_content(
        &self,
        service_id: &ServiceId,
        instance_id: &str,
        host: &str,
        path: &str,
    ) -> Option<Vec<DirectoryEntry>>;

    /// Active and failed instances of one service
    async fn service_state(&self, service_id: &ServiceId) -> ServiceState;

    /// Diagnostic snapshot of the backend's internal state
    async fn state(&self) -> serde_json::Value;

    /// Check that the service may be managed under the configured
    /// authorizer
    async fn validate_service(&self, service_id: &ServiceId) -> Result<()>;
}

/// Lookup of service descriptions (and derived secrets) by service id,
/// provided by the surrounding Waiter process
pub trait DescriptorSource: Send + Sync {
    /// The resolved description for a service, when known
    fn descriptor(&self, service_id: &ServiceId) -> Option<ServiceDescription>;

    /// Deterministic per-service password handed to instances
    fn service_password(&self, service_id: &ServiceId) -> String;
}

/// Capability check backing `validate_service`
pub trait Authorizer: Send + Sync {
    /// Check that `run_as_user` may own workloads for `service_id`
    fn check_user(&self, run_as_user: &str, service_id: &ServiceId) -> Result<()>;
}

/// Authorizer that admits everything
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveAuthorizer;

impl Authorizer for PermissiveAuthorizer {
    fn check_user(&self, _run_as_user: &str, _service_id: &ServiceId) -> Result<()> {
        Ok(())
    }
}

/// Authorizer that rejects obviously invalid run-as-users
#[derive(Debug, Clone, Copy, Default)]
pub struct SanityCheckAuthorizer;

impl Authorizer for SanityCheckAuthorizer {
    fn check_user(&self, run_as_user: &str, service_id: &ServiceId) -> Result<()> {
        let valid = !run_as_user.is_empty()
            && run_as_user
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if valid {
            Ok(())
        } else {
            Err(crate::Error::auth_failed(format!(
                "user {:?} may not run service {}",
                run_as_user, service_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_entry_wire_shape() {
        let file = DirectoryEntry::File {
            name: "stdout".to_string(),
            size: Some(4096),
            url: "http://10.0.0.5:591/r0/stdout".to_string(),
        };
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["name"], "stdout");
        assert_eq!(json["url"], "http://10.0.0.5:591/r0/stdout");

        let dir = DirectoryEntry::Directory {
            name: "r1".to_string(),
            path: "/r1/".to_string(),
        };
        let json = serde_json::to_value(&dir).unwrap();
        assert_eq!(json["type"], "directory");
        assert_eq!(json["path"], "/r1/");
    }

    #[test]
    fn test_scale_outcome_tags() {
        let json = serde_json::to_value(ScaleOutcome::NoSuchServiceExists).unwrap();
        assert_eq!(json, "no-such-service-exists");
        let json = serde_json::to_value(ScaleOutcome::ScalingNotNeeded).unwrap();
        assert_eq!(json, "scaling-not-needed");
    }

    #[test]
    fn test_sanity_check_authorizer() {
        let authorizer = SanityCheckAuthorizer;
        let service_id = ServiceId::new("waiter-app-1234");
        assert!(authorizer.check_user("alice", &service_id).is_ok());
        assert!(authorizer.check_user("test_user-1", &service_id).is_ok());
        assert!(authorizer.check_user("", &service_id).is_err());
        assert!(authorizer.check_user("Alice!", &service_id).is_err());
    }
}
