//! ReplicaSet spec construction
//!
//! Pure translation from a service description to the workload template
//! POSTed at create time. Builders are pluggable through a small
//! factory so deployments can swap the template strategy by
//! configuration.

use crate::names::service_id_to_app_name;
use crate::objects::{
    APP_LABEL, FILESERVER_CONTAINER, MANAGED_BY_LABEL, PORT_COUNT_ANNOTATION, PRIMARY_CONTAINER,
    PROTOCOL_ANNOTATION, SERVICE_ID_ANNOTATION,
};
use serde_json::{json, Value};
use std::sync::Arc;
use waiter_core::{Error, KubernetesConfig, Result, ServiceDescription, ServiceId};

/// Ports are spread over this many distinct bases below `pod_base_port`
const PORT_SLOTS: u32 = 100;

/// Stride between adjacent port bases
const PORT_STRIDE: u32 = 10;

/// Everything a builder needs besides the descriptor itself
pub struct SpecContext<'a> {
    /// Scheduler configuration
    pub config: &'a KubernetesConfig,
    /// Derived workload name
    pub app_name: String,
    /// Per-service password handed to instances
    pub password: String,
}

/// Strategy producing the ReplicaSet template for a service
pub trait ReplicaSetSpecBuilder: Send + Sync {
    /// Build the workload spec to POST
    fn build(
        &self,
        context: &SpecContext<'_>,
        service_id: &ServiceId,
        descriptor: &ServiceDescription,
    ) -> Result<Value>;
}

/// Resolve the configured builder factory by name
pub fn spec_builder_for(factory_fn: &str) -> Result<Arc<dyn ReplicaSetSpecBuilder>> {
    match factory_fn {
        "default" => Ok(Arc::new(DefaultSpecBuilder)),
        other => Err(Error::malformed(format!(
            "unknown replicaset spec builder factory {:?}",
            other
        ))),
    }
}

/// Stable string hash (`h = 31*h + byte`), used to spread services over
/// the port range deterministically across restarts
fn stable_hash(input: &str) -> u32 {
    input
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32))
}

/// Primary port for a service: pseudo-random but stable per service-id
pub fn base_port(pod_base_port: u16, service_id: &ServiceId) -> u16 {
    let slot = stable_hash(service_id.as_str()) % PORT_SLOTS;
    pod_base_port + (slot * PORT_STRIDE) as u16
}

/// The stock builder
pub struct DefaultSpecBuilder;

impl DefaultSpecBuilder {
    fn environment(
        context: &SpecContext<'_>,
        service_id: &ServiceId,
        descriptor: &ServiceDescription,
        home_path: &str,
        port0: u16,
    ) -> Vec<Value> {
        let mut env = vec![
            ("HOME".to_string(), home_path.to_string()),
            ("LOGNAME".to_string(), descriptor.run_as_user.clone()),
            ("USER".to_string(), descriptor.run_as_user.clone()),
            // Sandbox variables kept for clients written against Mesos
            ("MESOS_DIRECTORY".to_string(), home_path.to_string()),
            ("MESOS_SANDBOX".to_string(), home_path.to_string()),
            ("WAITER_CPUS".to_string(), descriptor.cpus.to_string()),
            ("WAITER_MEM_MB".to_string(), descriptor.mem.to_string()),
            ("WAITER_PASSWORD".to_string(), context.password.clone()),
            ("WAITER_SERVICE_ID".to_string(), service_id.to_string()),
            ("WAITER_USERNAME".to_string(), "waiter".to_string()),
        ];
        for (key, value) in &descriptor.env {
            env.push((key.clone(), value.clone()));
        }
        for i in 0..descriptor.ports {
            env.push((format!("PORT{}", i), (port0 + i).to_string()));
        }
        env.into_iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect()
    }

    fn probe(descriptor: &ServiceDescription, port0: u16, failure_threshold: u32) -> Value {
        let scheme = if descriptor.backend_proto.eq_ignore_ascii_case("https") {
            "HTTPS"
        } else {
            "HTTP"
        };
        json!({
            "httpGet": {
                "path": descriptor.health_check_url,
                "port": port0,
                "scheme": scheme
            },
            "periodSeconds": descriptor.health_check_interval_secs,
            "initialDelaySeconds": descriptor.grace_period_secs,
            "failureThreshold": failure_threshold,
            "timeoutSeconds": 1
        })
    }

    fn primary_container(
        context: &SpecContext<'_>,
        service_id: &ServiceId,
        descriptor: &ServiceDescription,
        home_path: &str,
        port0: u16,
    ) -> Value {
        let ports: Vec<Value> = (0..descriptor.ports)
            .map(|i| json!({"containerPort": port0 + i}))
            .collect();
        let resources = json!({
            "cpu": descriptor.cpus.to_string(),
            "memory": format!("{}Mi", descriptor.mem)
        });
        json!({
            "name": PRIMARY_CONTAINER,
            "image": context.config.container_image,
            "command": ["/usr/bin/waiter-init", "/bin/sh", "-c", descriptor.cmd],
            "workingDir": home_path,
            "env": Self::environment(context, service_id, descriptor, home_path, port0),
            "ports": ports,
            "livenessProbe": Self::probe(
                descriptor,
                port0,
                descriptor.health_check_max_consecutive_failures
            ),
            "readinessProbe": Self::probe(descriptor, port0, 1),
            "resources": {"requests": resources, "limits": resources},
            "volumeMounts": [{"name": "user-home", "mountPath": home_path}]
        })
    }

    fn fileserver_container(
        context: &SpecContext<'_>,
        home_path: &str,
        port: u16,
    ) -> Value {
        json!({
            "name": FILESERVER_CONTAINER,
            "image": context.config.fileserver.image,
            "workingDir": home_path,
            "env": [{"name": "WAITER_FILESERVER_PORT", "value": port.to_string()}],
            "ports": [{"containerPort": port}],
            "volumeMounts": [{"name": "user-home", "mountPath": home_path}]
        })
    }
}

impl ReplicaSetSpecBuilder for DefaultSpecBuilder {
    fn build(
        &self,
        context: &SpecContext<'_>,
        service_id: &ServiceId,
        descriptor: &ServiceDescription,
    ) -> Result<Value> {
        let config = context.config;
        let home_path = format!("/home/{}", descriptor.run_as_user);
        let port0 = base_port(config.pod_base_port, service_id);

        let labels = json!({
            APP_LABEL: context.app_name,
            MANAGED_BY_LABEL: config.orchestrator_name
        });
        let annotations = json!({
            SERVICE_ID_ANNOTATION: service_id.to_string(),
            PROTOCOL_ANNOTATION: descriptor.backend_proto,
            PORT_COUNT_ANNOTATION: descriptor.ports.to_string()
        });

        let mut containers = vec![Self::primary_container(
            context, service_id, descriptor, &home_path, port0,
        )];
        if let Some(port) = config.fileserver.port {
            containers.push(Self::fileserver_container(context, &home_path, port));
        }

        Ok(json!({
            "kind": "ReplicaSet",
            "apiVersion": config.replicaset_api_version,
            "metadata": {
                "name": context.app_name,
                "namespace": descriptor.run_as_user,
                "labels": labels,
                "annotations": annotations
            },
            "spec": {
                "replicas": descriptor.min_instances,
                "selector": {"matchLabels": labels},
                "template": {
                    "metadata": {
                        "labels": labels,
                        "annotations": annotations
                    },
                    "spec": {
                        "terminationGracePeriodSeconds": 0,
                        "containers": containers,
                        "volumes": [{"name": "user-home", "emptyDir": {}}]
                    }
                }
            }
        }))
    }
}

/// Build the full spec context for a service (name derivation included)
pub fn spec_context<'a>(
    config: &'a KubernetesConfig,
    service_id: &ServiceId,
    password: String,
) -> Result<SpecContext<'a>> {
    let app_name =
        service_id_to_app_name(service_id, config.max_name_length, config.pod_suffix_length)?;
    Ok(SpecContext {
        config,
        app_name,
        password,
    })
}
