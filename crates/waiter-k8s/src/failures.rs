//! Failure store
//!
//! Bounded per-service history of terminated pod incarnations, keyed by
//! instance id. Identity is derived from `(pod-name, restart-count - 1)`,
//! so repeated observations of the same pod are no-ops and every new
//! restart produces one new, distinct record.

use crate::objects::Pod;
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use waiter_core::{FailedInstance, ServiceId};

/// In-memory store of failed instance incarnations
pub struct FailureStore {
    failures: DashMap<ServiceId, HashMap<String, FailedInstance>>,
    max_per_service: usize,
    inserts: AtomicU64,
    evictions: AtomicU64,
}

impl FailureStore {
    /// Create a store retaining at most `max_per_service` incarnations
    /// per service
    pub fn new(max_per_service: usize) -> Self {
        Self {
            failures: DashMap::new(),
            max_per_service: max_per_service.max(1),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Inspect one observed pod and record its previous incarnation if
    /// it terminated and is not already recorded. Returns whether a new
    /// record was added.
    pub fn observe(&self, pod: &Pod) -> bool {
        let Some(failed) = pod.terminated_incarnation() else {
            return false;
        };
        self.insert(failed)
    }

    /// Insert one failed incarnation, once per instance id
    pub fn insert(&self, failed: FailedInstance) -> bool {
        let mut entry = self.failures.entry(failed.service_id.clone()).or_default();
        if entry.contains_key(&failed.id) {
            return false;
        }

        if entry.len() >= self.max_per_service {
            // Evict the record with the oldest start to stay bounded
            let oldest = entry
                .iter()
                .min_by_key(|(_, record)| record.started_at)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                entry.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        debug!(
            "recording failed incarnation {} (exit code {:?})",
            failed.id, failed.exit_code
        );
        entry.insert(failed.id.clone(), failed);
        self.inserts.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Retained incarnations of one service, oldest first
    pub fn failed_instances(&self, service_id: &ServiceId) -> Vec<FailedInstance> {
        let mut records: Vec<FailedInstance> = self
            .failures
            .get(service_id)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        records
    }

    /// Drop all history for a deleted service
    pub fn remove_service(&self, service_id: &ServiceId) {
        if self.failures.remove(service_id).is_some() {
            info!("cleared failure history for {}", service_id);
        }
    }

    /// Number of services with retained failures
    pub fn service_count(&self) -> usize {
        self.failures.len()
    }

    /// Diagnostic snapshot
    pub fn to_json(&self) -> serde_json::Value {
        let per_service: HashMap<String, Vec<FailedInstance>> = self
            .failures
            .iter()
            .map(|entry| {
                let mut records: Vec<FailedInstance> = entry.value().values().cloned().collect();
                records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
                (entry.key().to_string(), records)
            })
            .collect();
        json!({
            "service-id->failed-instances": per_service,
            "inserts": self.inserts.load(Ordering::Relaxed),
            "evictions": self.evictions.load(Ordering::Relaxed),
        })
    }
}
