//! # waiter-k8s
//!
//! Kubernetes backend for the Waiter scheduler.
//!
//! Reifies each Waiter service as a ReplicaSet and each instance as a
//! Pod, keeps a local mirror of cluster state fed by long-lived watch
//! streams, retains a bounded history of failed incarnations, and
//! implements the scheduler facade with optimistic-concurrency scaling
//! and the three-step safe-kill protocol.
//!
//! The watch workers own all writes to the mirror; scheduler operations
//! read it without blocking and write only to the orchestrator.

pub mod client;
pub mod failures;
pub mod fileserver;
pub mod names;
pub mod objects;
pub mod scheduler;
pub mod spec;
pub mod watch;

pub use client::{ApiClient, JsonStream, OrchestratorApi, TokenSource};
pub use failures::FailureStore;
pub use names::service_id_to_app_name;
pub use objects::{Pod, ReplicaSet, WatchEvent, WatchEventType};
pub use scheduler::KubernetesScheduler;
pub use spec::{DefaultSpecBuilder, ReplicaSetSpecBuilder, SpecContext};
pub use watch::WatchState;
