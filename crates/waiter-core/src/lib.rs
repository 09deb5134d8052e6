//! # waiter-core
//!
//! Core types, traits, and utilities for the Waiter scheduler: the
//! subsystem that reifies logical services as backend workloads on an
//! external orchestrator and exposes a uniform service/instance view to
//! the rest of Waiter.
//!
//! This crate provides the foundation shared by all scheduler backends:
//!
//! - Data structures for services, instances, and failed incarnations
//! - The `SchedulerBackend` facade every backend implements
//! - Service descriptors and their validation
//! - Configuration schema and parsing utilities
//! - Error handling types and utilities

pub mod config;
pub mod descriptor;
pub mod error;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{AuthenticationConfig, FileserverConfig, KubernetesConfig, SyncerConfig};
pub use descriptor::{CmdType, ServiceDescription};
pub use error::{Error, Result};
pub use traits::{
    Authorizer, DeleteOutcome, DeleteResult, DescriptorSource, DirectoryEntry, KillResult,
    PermissiveAuthorizer, SanityCheckAuthorizer, ScaleOutcome, ScaleResult, SchedulerBackend,
    ServiceState,
};
pub use types::{
    FailedInstance, InstanceFlag, Service, ServiceId, ServiceInstance, TaskStats,
};
