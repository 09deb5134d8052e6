//! Service descriptors
//!
//! A descriptor is the resolved description of a service as the rest of
//! Waiter hands it to the scheduler: the command to run, its resource
//! envelope, health checking parameters, and free-form metadata.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How the service command should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CmdType {
    /// A shell command launched under waiter-init
    Shell,
    /// A docker image reference; recognized but not runnable on this
    /// scheduler
    Docker,
}

impl Default for CmdType {
    fn default() -> Self {
        Self::Shell
    }
}

/// Resolved description of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceDescription {
    /// Command line launched for every instance
    pub cmd: String,

    /// Command interpretation
    #[serde(default)]
    pub cmd_type: CmdType,

    /// User the workload runs as; doubles as the orchestrator namespace
    pub run_as_user: String,

    /// Number of ports the service listens on
    #[serde(default = "default_ports")]
    pub ports: u16,

    /// Backend protocol instances speak
    #[serde(default = "default_protocol")]
    pub backend_proto: String,

    /// Relative URL probed for instance health
    #[serde(default = "default_health_check_url")]
    pub health_check_url: String,

    /// Seconds between health probes
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u32,

    /// Consecutive probe failures before an instance is restarted
    #[serde(default = "default_health_check_failures")]
    pub health_check_max_consecutive_failures: u32,

    /// Seconds a fresh instance may take before probing starts
    #[serde(default)]
    pub grace_period_secs: u32,

    /// CPU share requested per instance
    pub cpus: f64,

    /// Memory in MiB requested per instance
    pub mem: u64,

    /// Replica count a fresh service starts with
    #[serde(default = "default_min_instances")]
    pub min_instances: u32,

    /// Upper bound the autoscaler may scale to
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,

    /// Free-form service metadata (e.g. the scheduler routing tag)
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Extra environment passed to instances
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_ports() -> u16 {
    1
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_health_check_url() -> String {
    "/status".to_string()
}

fn default_health_check_interval() -> u32 {
    10
}

fn default_health_check_failures() -> u32 {
    5
}

fn default_min_instances() -> u32 {
    1
}

fn default_max_instances() -> u32 {
    500
}

impl ServiceDescription {
    /// Create a descriptor with required fields and defaults elsewhere
    pub fn new(cmd: impl Into<String>, run_as_user: impl Into<String>, cpus: f64, mem: u64) -> Self {
        Self {
            cmd: cmd.into(),
            cmd_type: CmdType::default(),
            run_as_user: run_as_user.into(),
            ports: default_ports(),
            backend_proto: default_protocol(),
            health_check_url: default_health_check_url(),
            health_check_interval_secs: default_health_check_interval(),
            health_check_max_consecutive_failures: default_health_check_failures(),
            grace_period_secs: 0,
            cpus,
            mem,
            min_instances: default_min_instances(),
            max_instances: default_max_instances(),
            metadata: HashMap::new(),
            env: HashMap::new(),
        }
    }

    /// Builder for the port count
    pub fn with_ports(mut self, ports: u16) -> Self {
        self.ports = ports;
        self
    }

    /// Builder for the starting replica count
    pub fn with_min_instances(mut self, min_instances: u32) -> Self {
        self.min_instances = min_instances;
        self
    }

    /// Builder for a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builder for the command type
    pub fn with_cmd_type(mut self, cmd_type: CmdType) -> Self {
        self.cmd_type = cmd_type;
        self
    }

    /// Reject descriptors this scheduler cannot launch
    pub fn ensure_launchable(&self) -> Result<()> {
        if self.cmd_type == CmdType::Docker {
            return Err(Error::unsupported(
                "command type docker is not supported by this scheduler",
            ));
        }
        if self.cmd.trim().is_empty() {
            return Err(Error::malformed("descriptor has an empty command"));
        }
        if self.run_as_user.is_empty() {
            return Err(Error::malformed("descriptor has no run-as-user"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_defaults() {
        let desc = ServiceDescription::new("./run-service", "testuser", 0.5, 512);
        assert_eq!(desc.ports, 1);
        assert_eq!(desc.backend_proto, "http");
        assert_eq!(desc.min_instances, 1);
        assert_eq!(desc.cmd_type, CmdType::Shell);
        assert!(desc.ensure_launchable().is_ok());
    }

    #[test]
    fn test_docker_cmd_type_is_unsupported() {
        let desc = ServiceDescription::new("image:tag", "testuser", 0.5, 512)
            .with_cmd_type(CmdType::Docker);
        let err = desc.ensure_launchable().unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_empty_cmd_rejected() {
        let desc = ServiceDescription::new("  ", "testuser", 0.5, 512);
        assert!(matches!(
            desc.ensure_launchable().unwrap_err(),
            Error::Malformed(_)
        ));
    }

    #[test]
    fn test_descriptor_deserializes_kebab_case() {
        let json = r#"{
            "cmd": "./run",
            "cmd-type": "shell",
            "run-as-user": "alice",
            "cpus": 1.0,
            "mem": 1024,
            "health-check-url": "/healthz",
            "min-instances": 2
        }"#;
        let desc: ServiceDescription = serde_json::from_str(json).unwrap();
        assert_eq!(desc.run_as_user, "alice");
        assert_eq!(desc.health_check_url, "/healthz");
        assert_eq!(desc.min_instances, 2);
    }
}
