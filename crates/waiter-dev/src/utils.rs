//! Utility functions for development and testing

use chrono::{TimeZone, Utc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use waiter_core::{ServiceDescription, ServiceId, ServiceInstance};

/// Setup test logging with appropriate levels
pub fn setup_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "waiter_core=debug,waiter_k8s=debug,waiter_scheduler=debug,waiter_dev=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// A minimal launchable descriptor for tests
pub fn test_descriptor(run_as_user: &str) -> ServiceDescription {
    ServiceDescription::new("./run-service --port $PORT0", run_as_user, 0.5, 512)
}

/// A live instance for tests, with deterministic identity
pub fn test_instance(service_id: &ServiceId, pod_name: &str, restart_count: u32) -> ServiceInstance {
    ServiceInstance {
        id: ServiceInstance::derive_id(service_id, pod_name, restart_count),
        service_id: service_id.clone(),
        host: "10.0.0.5".to_string(),
        port: 8330,
        extra_ports: vec![],
        protocol: "http".to_string(),
        started_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        healthy: true,
        log_directory: format!("/home/testuser/r{}", restart_count),
        restart_count,
        flags: Default::default(),
        exit_code: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_identity_is_deterministic() {
        let service_id = ServiceId::new("waiter-app-0123456789abcdef");
        let a = test_instance(&service_id, "pod-aaaaa", 2);
        let b = test_instance(&service_id, "pod-aaaaa", 2);
        assert_eq!(a.id, b.id);
        assert!(a.id.ends_with("-2"));
    }
}
