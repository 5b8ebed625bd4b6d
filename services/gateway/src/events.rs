//! Event processor: the single owner of weighing events.
//!
//! Capture path (per event, in order): generate the local id, tag with the
//! offline batch when offline mode is engaged, snapshot the device's
//! active Cloud session, persist with `sync_status = pending`, bump the
//! device counters, then announce on the `event:captured` channel.
//!
//! The sync-state machine lives in the store; this module is the only
//! writer and exposes the transitions the sync service drives.

use crate::batches::BatchManager;
use crate::model::{SyncStatus, WeighingEvent};
use crate::registry::DeviceRegistry;
use crate::storage::{Store, StoreError};
use chrono::{DateTime, Utc};
use scale_protocol::EventRecord;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

pub struct EventProcessor {
    store: Arc<Mutex<Store>>,
    registry: Arc<DeviceRegistry>,
    batches: Arc<BatchManager>,
    captured_tx: broadcast::Sender<WeighingEvent>,
}

impl EventProcessor {
    pub fn new(
        store: Arc<Mutex<Store>>,
        registry: Arc<DeviceRegistry>,
        batches: Arc<BatchManager>,
    ) -> Self {
        let (captured_tx, _) = broadcast::channel(1024);
        EventProcessor {
            store,
            registry,
            batches,
            captured_tx,
        }
    }

    /// Any collaborator may subscribe to `event:captured`.
    pub fn subscribe_captured(&self) -> broadcast::Receiver<WeighingEvent> {
        self.captured_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Capture
    // -----------------------------------------------------------------------

    /// Persist one parsed event arriving from a connection task.
    ///
    /// On a persistence failure the event is not recorded; the error
    /// propagates to the read loop, which logs it and keeps reading.
    pub async fn capture(
        &self,
        device_id: &str,
        source_ip: &str,
        record: &EventRecord,
        raw: &str,
    ) -> Result<WeighingEvent, EventError> {
        let offline = self.batches.is_offline_mode();
        let offline_batch_id = if offline {
            Some(
                self.batches
                    .assign_event(device_id, record.weight_grams)
                    .await?,
            )
        } else {
            None
        };

        // Session id is read fresh per event so a `session:updated` from
        // the cache is observed by every subsequent capture.
        let cloud_session_id = self
            .registry
            .get(device_id)
            .await
            .and_then(|d| d.active_cloud_session_id);

        let event = WeighingEvent {
            id: Uuid::new_v4(),
            device_id: device_id.to_owned(),
            cloud_session_id,
            offline_mode: offline,
            offline_batch_id,
            plu_code: record.plu_code.clone(),
            product_name: record.product_name.clone(),
            weight_grams: record.weight_grams,
            barcode: record.barcode.clone(),
            scale_timestamp: record.scale_timestamp.clone(),
            received_at: Utc::now(),
            source_ip: source_ip.to_owned(),
            raw_data: raw.to_owned(),
            sync_status: SyncStatus::Pending,
            rejected: false,
            cloud_id: None,
            synced_at: None,
            sync_attempts: 0,
            last_sync_error: None,
        };

        self.store.lock().await.insert_event(&event)?;
        self.registry.record_event(device_id).await?;

        debug!(
            device_id,
            event_id = %event.id,
            offline,
            weight_grams = event.weight_grams,
            "event captured"
        );
        let _ = self.captured_tx.send(event.clone());
        Ok(event)
    }

    // -----------------------------------------------------------------------
    // Sync-state machine
    // -----------------------------------------------------------------------

    /// Up to `limit` pending events, oldest first.
    pub async fn pending_events(&self, limit: usize) -> Result<Vec<WeighingEvent>, EventError> {
        Ok(self.store.lock().await.pending_events(limit)?)
    }

    /// pending → streaming.  False when the event already left `pending`.
    pub async fn mark_streaming(&self, id: Uuid) -> Result<bool, EventError> {
        Ok(self.store.lock().await.mark_event_streaming(id)?)
    }

    /// streaming → synced (terminal).  `accepted` and `duplicate` acks both
    /// land here.
    pub async fn mark_synced(
        &self,
        id: Uuid,
        cloud_id: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<bool, EventError> {
        Ok(self
            .store
            .lock()
            .await
            .mark_event_synced(id, cloud_id, synced_at)?)
    }

    /// streaming → failed.  `rejected` marks a terminal Cloud rejection.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        rejected: bool,
    ) -> Result<bool, EventError> {
        Ok(self.store.lock().await.mark_event_failed(id, error, rejected)?)
    }

    /// failed → pending for transport failures; the retry timer calls this.
    pub async fn requeue_transport_failures(&self) -> Result<usize, EventError> {
        Ok(self.store.lock().await.requeue_transport_failures()?)
    }

    /// Events of a batch still shy of `synced`.
    pub async fn count_unsynced_in_batch(&self, batch_id: Uuid) -> Result<i64, EventError> {
        Ok(self.store.lock().await.count_unsynced_events_in_batch(batch_id)?)
    }

    pub async fn get_event(&self, id: Uuid) -> Result<Option<WeighingEvent>, EventError> {
        Ok(self.store.lock().await.get_event(id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn processor() -> (EventProcessor, Arc<DeviceRegistry>) {
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let registry = Arc::new(DeviceRegistry::load(Arc::clone(&store)).await.unwrap());
        registry.register("SCALE-01", "10.0.0.5").await.unwrap();
        let batches = Arc::new(BatchManager::new(Arc::clone(&store), 5_000, 1_000, 30));
        (
            EventProcessor::new(store, Arc::clone(&registry), batches),
            registry,
        )
    }

    fn record() -> EventRecord {
        EventRecord {
            plu_code: "00001".to_owned(),
            product_name: "KIYMA".to_owned(),
            weight_grams: 1234,
            barcode: "00000012340".to_owned(),
            scale_timestamp: "2026-01-30T10:27:00Z".to_owned(),
        }
    }

    #[tokio::test]
    async fn capture_persists_pending_and_bumps_counters() {
        let (proc, registry) = processor().await;
        let mut captured_rx = proc.subscribe_captured();

        let event = proc
            .capture("SCALE-01", "10.0.0.5", &record(), "raw-line")
            .await
            .unwrap();
        assert_eq!(event.sync_status, SyncStatus::Pending);
        assert!(!event.offline_mode);
        assert!(event.offline_batch_id.is_none());
        assert_eq!(event.sync_attempts, 0);

        let announced = captured_rx.recv().await.unwrap();
        assert_eq!(announced.id, event.id);

        let device = registry.get("SCALE-01").await.unwrap();
        assert_eq!(device.event_count, 1);
        assert!(device.last_event_at.is_some());
    }

    #[tokio::test]
    async fn capture_snapshots_session_id_fresh_per_event() {
        let (proc, registry) = processor().await;

        let before = proc
            .capture("SCALE-01", "10.0.0.5", &record(), "raw")
            .await
            .unwrap();
        assert_eq!(before.cloud_session_id, None);

        registry
            .set_active_session("SCALE-01", Some("sess-42".to_owned()))
            .await
            .unwrap();
        let after = proc
            .capture("SCALE-01", "10.0.0.5", &record(), "raw")
            .await
            .unwrap();
        assert_eq!(after.cloud_session_id.as_deref(), Some("sess-42"));
    }

    #[tokio::test]
    async fn duplicate_ack_advances_exactly_like_accepted() {
        let (proc, _registry) = processor().await;
        let event = proc
            .capture("SCALE-01", "10.0.0.5", &record(), "raw")
            .await
            .unwrap();

        assert!(proc.mark_streaming(event.id).await.unwrap());
        // A "duplicate" ack carries a cloud id just like "accepted".
        assert!(proc.mark_synced(event.id, "c-7", Utc::now()).await.unwrap());

        let synced = proc.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        assert_eq!(synced.cloud_id.as_deref(), Some("c-7"));
        assert!(synced.synced_at.is_some());
    }
}
