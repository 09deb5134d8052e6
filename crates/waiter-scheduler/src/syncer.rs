//! Scheduler syncer
//!
//! Periodic worker that snapshots the backend's service → instances
//! view and publishes it to a bounded channel the router and autoscaler
//! consume. Backend errors are logged and never propagate: every cycle
//! publishes, possibly an empty snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use waiter_core::{
    FailedInstance, SchedulerBackend, Service, ServiceId, ServiceInstance, SyncerConfig,
};

/// Instances of one service at snapshot time
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    /// The service as the backend reported it
    pub service: Service,
    /// Live instances
    pub active_instances: Vec<ServiceInstance>,
    /// Retained terminated incarnations
    pub failed_instances: Vec<FailedInstance>,
}

/// One published syncer snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// Per-service instance view
    pub services: HashMap<ServiceId, ServiceSnapshot>,
}

#[derive(Debug, Clone, Default)]
struct SyncerState {
    last_publish: Option<DateTime<Utc>>,
    last_snapshot_size: usize,
    cycles: u64,
}

/// Periodic snapshot publisher over one scheduler backend
pub struct SchedulerSyncer {
    backend: Arc<dyn SchedulerBackend>,
    config: SyncerConfig,
    state: Arc<RwLock<SyncerState>>,
    running: Arc<RwLock<bool>>,
}

impl SchedulerSyncer {
    /// Create a syncer over the given backend
    pub fn new(backend: Arc<dyn SchedulerBackend>, config: SyncerConfig) -> Self {
        Self {
            backend,
            config,
            state: Arc::new(RwLock::new(SyncerState::default())),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the publish loop and hand back the snapshot channel. The
    /// loop stops when `stop` is called or the receiver is dropped.
    pub fn start(&self) -> mpsc::Receiver<SchedulerSnapshot> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);

        *self.running.write().expect("syncer state poisoned") = true;
        info!(
            "starting scheduler syncer at {}s intervals",
            self.config.scheduler_syncer_interval_secs
        );

        let backend = self.backend.clone();
        let state = self.state.clone();
        let running = self.running.clone();
        let interval = Duration::from_secs(self.config.scheduler_syncer_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !*running.read().expect("syncer state poisoned") {
                    break;
                }

                let snapshot = build_snapshot(backend.as_ref()).await;
                {
                    let mut state = state.write().expect("syncer state poisoned");
                    state.last_publish = Some(snapshot.timestamp);
                    state.last_snapshot_size = snapshot.services.len();
                    state.cycles += 1;
                }
                debug!("publishing snapshot of {} services", snapshot.services.len());
                if tx.send(snapshot).await.is_err() {
                    warn!("syncer channel closed, stopping");
                    break;
                }
            }
            info!("scheduler syncer stopped");
        });

        rx
    }

    /// Stop the publish loop after its current cycle
    pub fn stop(&self) {
        *self.running.write().expect("syncer state poisoned") = false;
    }

    /// Observability snapshot: last publish time and size
    pub fn retrieve_syncer_state(&self) -> Value {
        let state = self.state.read().expect("syncer state poisoned").clone();
        json!({
            "last-publish": state.last_publish,
            "last-snapshot-size": state.last_snapshot_size,
            "cycles": state.cycles,
        })
    }

    /// Full diagnostic state: the backend's own snapshot plus this
    /// syncer's
    pub async fn state(&self) -> Value {
        json!({
            "scheduler": self.backend.state().await,
            "syncer": self.retrieve_syncer_state(),
        })
    }
}

/// Assemble the service → instances view from the backend
async fn build_snapshot(backend: &dyn SchedulerBackend) -> SchedulerSnapshot {
    let mut services = HashMap::new();
    for service in backend.get_services().await {
        let state = backend.service_state(&service.id).await;
        services.insert(
            service.id.clone(),
            ServiceSnapshot {
                service,
                active_instances: state.active_instances,
                failed_instances: state.failed_instances,
            },
        );
    }
    SchedulerSnapshot {
        timestamp: Utc::now(),
        services,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waiter_dev::{test_descriptor, test_instance, MockScheduler};

    const SID: &str = "waiter-app-e8b625cc83c411e8974c38d5474b213d";

    async fn seeded_backend() -> Arc<MockScheduler> {
        let backend = Arc::new(MockScheduler::new());
        let service_id = ServiceId::new(SID);
        backend
            .create_service_if_new(&service_id, &test_descriptor("testuser"))
            .await
            .unwrap();
        backend.push_active_instance(test_instance(&service_id, "pod-aaaaa", 0));
        backend
    }

    #[tokio::test]
    async fn test_build_snapshot_collects_instances() {
        let backend = seeded_backend().await;
        let snapshot = build_snapshot(backend.as_ref()).await;

        assert_eq!(snapshot.services.len(), 1);
        let entry = &snapshot.services[&ServiceId::new(SID)];
        assert_eq!(entry.active_instances.len(), 1);
        assert!(entry.failed_instances.is_empty());
    }

    #[tokio::test]
    async fn test_syncer_publishes_and_tracks_state() {
        let backend = seeded_backend().await;
        let syncer = SchedulerSyncer::new(backend, SyncerConfig::default());

        let mut rx = syncer.start();
        // The first interval tick is immediate
        let snapshot = rx.recv().await.expect("first snapshot");
        assert_eq!(snapshot.services.len(), 1);

        let state = syncer.retrieve_syncer_state();
        assert_eq!(state["last-snapshot-size"], 1);
        assert!(state["last-publish"].is_string());
        assert!(state["cycles"].as_u64().unwrap() >= 1);

        let merged = syncer.state().await;
        assert!(merged["scheduler"].is_object());
        assert_eq!(merged["syncer"]["last-snapshot-size"], 1);

        syncer.stop();
    }

    #[tokio::test]
    async fn test_empty_backend_still_publishes() {
        let backend = Arc::new(MockScheduler::new());
        let syncer = SchedulerSyncer::new(backend, SyncerConfig::default());

        let mut rx = syncer.start();
        let snapshot = rx.recv().await.expect("snapshot");
        assert!(snapshot.services.is_empty());
        syncer.stop();
    }
}
