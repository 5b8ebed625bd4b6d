//! Offline batch manager.
//!
//! Owns the per-device open-batch slot and the gateway's debounced
//! offline-mode flag.  The REST client is the source of truth for online
//! vs offline; this module derives from its transitions: a `Disconnected`
//! that survives `offline.trigger_delay_ms` of unreachability flips
//! offline mode on, and the next event per device opens that device's
//! batch.  `Connected` flips it off and closes every open batch, leaving
//! them `pending` for the sync service's reconciliation flush.
//!
//! Batch rotation: when a batch has already absorbed
//! `offline.max_events_per_batch` events, the event that would overflow it
//! lands in a freshly-opened successor instead.

use crate::cloud::rest::{ConnectivityEvent, RestClient};
use crate::model::{OfflineBatch, ReconciliationStatus};
use crate::storage::{Store, StoreResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

pub struct BatchManager {
    store: Arc<Mutex<Store>>,
    offline_mode: AtomicBool,
    trigger_delay: Duration,
    max_events_per_batch: u64,
    retention_days: u32,
}

impl BatchManager {
    pub fn new(
        store: Arc<Mutex<Store>>,
        trigger_delay_ms: u64,
        max_events_per_batch: u64,
        retention_days: u32,
    ) -> Self {
        BatchManager {
            store,
            offline_mode: AtomicBool::new(false),
            trigger_delay: Duration::from_millis(trigger_delay_ms),
            max_events_per_batch,
            retention_days,
        }
    }

    /// The debounced offline flag the event processor tags captures with.
    pub fn is_offline_mode(&self) -> bool {
        self.offline_mode.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Batch assignment
    // -----------------------------------------------------------------------

    /// Account one offline event against the device's open batch, opening
    /// or rotating as needed, and return the batch id the event belongs to.
    ///
    /// The whole sequence runs under one store lock, which is what makes
    /// the open-batch slot transition atomic.
    pub async fn assign_event(&self, device_id: &str, weight_grams: u32) -> StoreResult<Uuid> {
        let mut store = self.store.lock().await;
        let now = Utc::now();

        let batch_id = match store.open_batch_for_device(device_id)? {
            Some(batch) if batch.event_count < self.max_events_per_batch => batch.batch_id,
            Some(full) => {
                store.end_batch(full.batch_id, now)?;
                info!(
                    device_id,
                    batch_id = %full.batch_id,
                    events = full.event_count,
                    "offline batch reached capacity, rotating"
                );
                let successor = new_batch(device_id, now);
                store.insert_batch(&successor)?;
                successor.batch_id
            }
            None => {
                let batch = new_batch(device_id, now);
                store.insert_batch(&batch)?;
                info!(device_id, batch_id = %batch.batch_id, "opened offline batch");
                batch.batch_id
            }
        };

        store.add_event_to_batch(batch_id, weight_grams)?;
        Ok(batch_id)
    }

    /// Close every open batch.  Returns the closed ids.
    pub async fn end_open_batches(&self) -> StoreResult<Vec<Uuid>> {
        self.store.lock().await.end_all_open_batches(Utc::now())
    }

    /// Closed batches still awaiting reconciliation, oldest first.
    pub async fn closed_pending_batches(&self) -> StoreResult<Vec<OfflineBatch>> {
        self.store.lock().await.closed_pending_batches()
    }

    // -----------------------------------------------------------------------
    // Reconciliation mirror
    // -----------------------------------------------------------------------

    pub async fn mark_syncing(&self, batch_id: Uuid) -> StoreResult<bool> {
        self.store.lock().await.set_batch_reconciliation(
            batch_id,
            ReconciliationStatus::InProgress,
            None,
            None,
            None,
        )
    }

    pub async fn mark_synced(
        &self,
        batch_id: Uuid,
        cloud_session_id: Option<&str>,
    ) -> StoreResult<bool> {
        self.store.lock().await.set_batch_reconciliation(
            batch_id,
            ReconciliationStatus::Reconciled,
            cloud_session_id,
            Some(Utc::now()),
            None,
        )
    }

    pub async fn mark_failed(&self, batch_id: Uuid) -> StoreResult<bool> {
        self.store.lock().await.set_batch_reconciliation(
            batch_id,
            ReconciliationStatus::Failed,
            None,
            None,
            None,
        )
    }

    // -----------------------------------------------------------------------
    // Transition + retention tasks
    // -----------------------------------------------------------------------

    async fn handle_connected(&self) {
        self.offline_mode.store(false, Ordering::SeqCst);
        // Close any open batches, including ones inherited from a previous
        // run that crashed while offline.
        match self.end_open_batches().await {
            Ok(closed) if !closed.is_empty() => {
                info!(batches = closed.len(), "closed open offline batches on recovery");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to close open batches on recovery"),
        }
    }

    fn declare_offline(&self) {
        if !self.offline_mode.swap(true, Ordering::SeqCst) {
            info!(
                delay_ms = self.trigger_delay.as_millis() as u64,
                "offline mode engaged, next events will be batched"
            );
        }
    }
}

/// Spawn the transition task: debounces `Disconnected`, applies
/// `Connected` immediately.
pub fn spawn_transition_task(
    manager: Arc<BatchManager>,
    client: Arc<RestClient>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut connectivity = client.subscribe_connectivity();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                event = connectivity.recv() => match event {
                    Ok(ConnectivityEvent::Connected) => manager.handle_connected().await,
                    Ok(ConnectivityEvent::Disconnected) => {
                        // Debounce: only declare offline if the outage
                        // outlives the trigger delay.
                        let deadline = tokio::time::sleep(manager.trigger_delay);
                        tokio::pin!(deadline);
                        loop {
                            tokio::select! {
                                biased;
                                _ = shutdown.changed() => {
                                    if *shutdown.borrow() {
                                        return;
                                    }
                                }
                                _ = &mut deadline => {
                                    manager.declare_offline();
                                    break;
                                }
                                event = connectivity.recv() => match event {
                                    Ok(ConnectivityEvent::Connected) => {
                                        manager.handle_connected().await;
                                        break;
                                    }
                                    Ok(ConnectivityEvent::Disconnected) => {}
                                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                                    Err(broadcast::error::RecvError::Closed) => return,
                                },
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connectivity events lagged in batch manager");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    })
}

/// Spawn the daily retention sweep: reconciled batches older than
/// `offline.retention_days` are deleted (their events are kept).
pub fn spawn_retention_task(
    manager: Arc<BatchManager>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let cutoff = Utc::now()
                        - ChronoDuration::days(i64::from(manager.retention_days));
                    match manager.store.lock().await.prune_reconciled_batches(cutoff) {
                        Ok(0) => {}
                        Ok(n) => info!(pruned = n, "pruned reconciled offline batches"),
                        Err(e) => warn!(error = %e, "batch retention sweep failed"),
                    }
                }
            }
        }
    })
}

fn new_batch(device_id: &str, started_at: DateTime<Utc>) -> OfflineBatch {
    OfflineBatch {
        batch_id: Uuid::new_v4(),
        device_id: device_id.to_owned(),
        started_at,
        ended_at: None,
        event_count: 0,
        total_weight_grams: 0,
        reconciliation_status: ReconciliationStatus::Pending,
        cloud_session_id: None,
        reconciled_at: None,
        reconciled_by: None,
        notes: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Device;

    async fn manager_with_device(max_per_batch: u64) -> (Arc<BatchManager>, Arc<Mutex<Store>>) {
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        store
            .lock()
            .await
            .upsert_device(&Device::new("SCALE-02", "10.0.0.6", Utc::now()))
            .unwrap();
        let manager = Arc::new(BatchManager::new(
            Arc::clone(&store),
            5_000,
            max_per_batch,
            30,
        ));
        (manager, store)
    }

    #[tokio::test]
    async fn assign_event_opens_one_batch_per_device() {
        let (manager, store) = manager_with_device(1_000).await;

        let first = manager.assign_event("SCALE-02", 500).await.unwrap();
        let second = manager.assign_event("SCALE-02", 700).await.unwrap();
        assert_eq!(first, second);

        let batch = store.lock().await.get_batch(first).unwrap().unwrap();
        assert_eq!(batch.event_count, 2);
        assert_eq!(batch.total_weight_grams, 1_200);
        assert!(batch.ended_at.is_none());
        assert_eq!(batch.reconciliation_status, ReconciliationStatus::Pending);
    }

    #[tokio::test]
    async fn overflowing_event_lands_in_successor_batch() {
        let (manager, store) = manager_with_device(2).await;

        let b1 = manager.assign_event("SCALE-02", 100).await.unwrap();
        let b2 = manager.assign_event("SCALE-02", 100).await.unwrap();
        assert_eq!(b1, b2);
        // Third event overflows the cap of 2 and must land in a new batch.
        let b3 = manager.assign_event("SCALE-02", 100).await.unwrap();
        assert_ne!(b1, b3);

        let store = store.lock().await;
        let old = store.get_batch(b1).unwrap().unwrap();
        assert_eq!(old.event_count, 2);
        assert!(old.ended_at.is_some(), "full batch is closed on rotation");
        let fresh = store.get_batch(b3).unwrap().unwrap();
        assert_eq!(fresh.event_count, 1);
        assert!(fresh.ended_at.is_none());
    }

    #[tokio::test]
    async fn connected_closes_open_batches_and_clears_offline_mode() {
        let (manager, store) = manager_with_device(1_000).await;
        manager.declare_offline();
        assert!(manager.is_offline_mode());

        let batch_id = manager.assign_event("SCALE-02", 250).await.unwrap();
        manager.handle_connected().await;

        assert!(!manager.is_offline_mode());
        let batch = store.lock().await.get_batch(batch_id).unwrap().unwrap();
        assert!(batch.ended_at.is_some());
        assert_eq!(batch.reconciliation_status, ReconciliationStatus::Pending);
    }

    #[tokio::test]
    async fn reconciliation_mirror_progresses() {
        let (manager, store) = manager_with_device(1_000).await;
        let batch_id = manager.assign_event("SCALE-02", 250).await.unwrap();
        manager.end_open_batches().await.unwrap();

        assert!(manager.mark_syncing(batch_id).await.unwrap());
        assert!(manager.mark_synced(batch_id, Some("sess-9")).await.unwrap());

        let batch = store.lock().await.get_batch(batch_id).unwrap().unwrap();
        assert_eq!(batch.reconciliation_status, ReconciliationStatus::Reconciled);
        assert_eq!(batch.cloud_session_id.as_deref(), Some("sess-9"));
        assert!(batch.reconciled_at.is_some());
    }
}
