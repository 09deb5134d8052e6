//! # waiter-scheduler
//!
//! Backend-independent scheduler plumbing:
//!
//! - The composite scheduler that multiplexes services over several
//!   sub-schedulers by a per-service routing tag
//! - The periodic syncer that publishes service → instances snapshots
//!   to the router and autoscaler

pub mod composite;
pub mod syncer;

pub use composite::CompositeScheduler;
pub use syncer::{SchedulerSnapshot, SchedulerSyncer, ServiceSnapshot};
