//! # waiter-dev
//!
//! Development and test utilities for the Waiter scheduler:
//!
//! - An in-memory mock scheduler backend that records every call, for
//!   exercising code built on the scheduler facade without a cluster
//! - Test logging bootstrap
//! - Builders for descriptors and instances used across test suites

pub mod mock_scheduler;
pub mod utils;

pub use mock_scheduler::MockScheduler;
pub use utils::{setup_test_logging, test_descriptor, test_instance};
