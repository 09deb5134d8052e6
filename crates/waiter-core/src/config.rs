//! Configuration schema for the scheduler core
//!
//! Nested serde structs with defaults for every tunable, a `validate()`
//! pass for the values that must be present, and file loading through
//! the `config` crate.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// HTTP client tunables for the orchestrator connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpOptions {
    /// Connect timeout in seconds
    #[serde(default = "default_conn_timeout")]
    pub conn_timeout_secs: u64,

    /// Socket (request) timeout in seconds
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_secs: u64,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            conn_timeout_secs: default_conn_timeout(),
            socket_timeout_secs: default_socket_timeout(),
        }
    }
}

/// Fileserver sidecar configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileserverConfig {
    /// Port the sidecar serves logs on; the sidecar is omitted entirely
    /// when unset
    pub port: Option<u16>,

    /// Scheme used to reach the sidecar
    #[serde(default = "default_fileserver_scheme")]
    pub scheme: String,

    /// Sidecar container image
    #[serde(default = "default_fileserver_image")]
    pub image: String,
}

impl Default for FileserverConfig {
    fn default() -> Self {
        Self {
            port: None,
            scheme: default_fileserver_scheme(),
            image: default_fileserver_image(),
        }
    }
}

/// How the orchestrator auth token is obtained
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AuthenticationKind {
    /// No Authorization header is sent
    #[default]
    None,

    /// A fixed token provided in configuration
    Static {
        /// The bearer token value
        token: String,
    },

    /// A token re-read from a file on every refresh (e.g. a projected
    /// service-account token)
    TokenFile {
        /// Path to the token file
        path: PathBuf,
    },
}

/// Authentication configuration for the orchestrator client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthenticationConfig {
    /// Token source
    #[serde(flatten)]
    pub kind: AuthenticationKind,

    /// Minutes between token refreshes; no refresh worker runs when unset
    pub refresh_delay_mins: Option<u64>,
}

/// Authorizer backing `validate-service`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthorizerKind {
    /// Every check passes
    #[default]
    Permissive,

    /// Reject structurally invalid run-as-users
    SanityCheck,
}

/// Spec builder selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SpecBuilderConfig {
    /// Name of the registered builder factory
    #[serde(default = "default_factory_fn")]
    pub factory_fn: String,
}

impl Default for SpecBuilderConfig {
    fn default() -> Self {
        Self {
            factory_fn: default_factory_fn(),
        }
    }
}

/// Configuration for the Kubernetes scheduler backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KubernetesConfig {
    /// Base URL of the Kubernetes API server
    pub url: String,

    /// HTTP client tunables
    #[serde(default)]
    pub http_options: HttpOptions,

    /// Label value marking objects owned by this scheduler
    #[serde(default = "default_orchestrator_name")]
    pub orchestrator_name: String,

    /// Base port instance port ranges are derived from
    #[serde(default = "default_pod_base_port")]
    pub pod_base_port: u16,

    /// Length of the random pod-name suffix the orchestrator appends
    #[serde(default = "default_pod_suffix_length")]
    pub pod_suffix_length: usize,

    /// Maximum legal workload-name length on the cluster
    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,

    /// Attempts for the optimistic scale patch before surfacing conflict
    #[serde(default = "default_max_patch_retries")]
    pub max_patch_retries: u32,

    /// API group/version ReplicaSets are addressed under
    #[serde(default = "default_replicaset_api_version")]
    pub replicaset_api_version: String,

    /// Workload template builder selection
    #[serde(default)]
    pub replicaset_spec_builder: SpecBuilderConfig,

    /// Container image instances run in
    #[serde(default = "default_container_image")]
    pub container_image: String,

    /// Log fileserver sidecar
    #[serde(default)]
    pub fileserver: FileserverConfig,

    /// Orchestrator authentication
    #[serde(default)]
    pub authentication: AuthenticationConfig,

    /// Authorizer kind for validate-service
    #[serde(default)]
    pub authorizer: AuthorizerKind,

    /// Seconds to wait before re-snapshotting after a watch failure
    #[serde(default = "default_watch_retry_delay")]
    pub watch_retry_delay_secs: u64,

    /// Consecutive snapshot failures tolerated before `exit-on-error`
    /// escalates
    #[serde(default = "default_watch_failure_threshold")]
    pub watch_failure_threshold: u32,

    /// Terminate the process when a watch worker cannot recover
    #[serde(default)]
    pub exit_on_error: bool,

    /// Failed incarnations retained per service
    #[serde(default = "default_max_failed_instances")]
    pub max_failed_instances: usize,
}

/// Configuration for the periodic scheduler syncer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncerConfig {
    /// Seconds between snapshot publishes
    #[serde(default = "default_syncer_interval")]
    pub scheduler_syncer_interval_secs: u64,

    /// Capacity of the snapshot channel
    #[serde(default = "default_syncer_capacity")]
    pub channel_capacity: usize,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            scheduler_syncer_interval_secs: default_syncer_interval(),
            channel_capacity: default_syncer_capacity(),
        }
    }
}

fn default_conn_timeout() -> u64 {
    10
}

fn default_socket_timeout() -> u64 {
    30
}

fn default_fileserver_scheme() -> String {
    "http".to_string()
}

fn default_fileserver_image() -> String {
    "waiter/fileserver:latest".to_string()
}

fn default_factory_fn() -> String {
    "default".to_string()
}

fn default_orchestrator_name() -> String {
    "waiter".to_string()
}

fn default_pod_base_port() -> u16 {
    8080
}

fn default_pod_suffix_length() -> usize {
    5
}

fn default_max_name_length() -> usize {
    63
}

fn default_max_patch_retries() -> u32 {
    5
}

fn default_replicaset_api_version() -> String {
    "apps/v1".to_string()
}

fn default_container_image() -> String {
    "waiter/waiter-app:latest".to_string()
}

fn default_watch_retry_delay() -> u64 {
    2
}

fn default_watch_failure_threshold() -> u32 {
    10
}

fn default_max_failed_instances() -> usize {
    16
}

fn default_syncer_interval() -> u64 {
    5
}

fn default_syncer_capacity() -> usize {
    32
}

impl KubernetesConfig {
    /// Create a configuration with defaults for everything but the URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http_options: HttpOptions::default(),
            orchestrator_name: default_orchestrator_name(),
            pod_base_port: default_pod_base_port(),
            pod_suffix_length: default_pod_suffix_length(),
            max_name_length: default_max_name_length(),
            max_patch_retries: default_max_patch_retries(),
            replicaset_api_version: default_replicaset_api_version(),
            replicaset_spec_builder: SpecBuilderConfig::default(),
            container_image: default_container_image(),
            fileserver: FileserverConfig::default(),
            authentication: AuthenticationConfig::default(),
            authorizer: AuthorizerKind::default(),
            watch_retry_delay_secs: default_watch_retry_delay(),
            watch_failure_threshold: default_watch_failure_threshold(),
            exit_on_error: false,
            max_failed_instances: default_max_failed_instances(),
        }
    }

    /// Load configuration from a file (format inferred from extension)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?;
        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::malformed("kubernetes url must not be empty"));
        }
        if self.orchestrator_name.is_empty() {
            return Err(Error::malformed("orchestrator-name must not be empty"));
        }
        if self.max_name_length <= self.pod_suffix_length + 1 {
            return Err(Error::malformed(
                "max-name-length leaves no room for the pod suffix",
            ));
        }
        if self.max_patch_retries == 0 {
            return Err(Error::malformed("max-patch-retries must be at least 1"));
        }
        Ok(())
    }
}
