//! Cloud sync service: drives events (and closed offline batches) to the
//! Cloud and applies the outcomes to the sync-state machine.
//!
//! - `event:captured` while online → stream the single event immediately.
//! - While offline → nothing extra; the event stays `pending` and the
//!   REST client's queue absorbs whatever was already in flight.
//! - `connected` → after a short debounce: fetch the edge config, announce
//!   closed offline batches, then drain pending events oldest-first
//!   (single event → `/events`, slice → `/events/batch`).
//! - A periodic retry timer lifts transport-failed events back to
//!   `pending` and runs the same drain.

use crate::batches::BatchManager;
use crate::cloud::rest::{ConnectivityEvent, RestClient, RestError};
use crate::cloud::types::{AckStatus, EventAck, EventPayload, OfflineBatchEndNotice};
use crate::events::EventProcessor;
use crate::model::WeighingEvent;
use crate::registry::DeviceRegistry;
use crate::config::SyncConfig;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct CloudSyncService {
    events: Arc<EventProcessor>,
    batches: Arc<BatchManager>,
    registry: Arc<DeviceRegistry>,
    client: Arc<RestClient>,
    cfg: SyncConfig,
}

impl CloudSyncService {
    pub fn new(
        events: Arc<EventProcessor>,
        batches: Arc<BatchManager>,
        registry: Arc<DeviceRegistry>,
        client: Arc<RestClient>,
        cfg: SyncConfig,
    ) -> Self {
        CloudSyncService {
            events,
            batches,
            registry,
            client,
            cfg,
        }
    }

    // -----------------------------------------------------------------------
    // Immediate streaming
    // -----------------------------------------------------------------------

    /// Stream one freshly-captured event.
    pub async fn stream_event(&self, event: &WeighingEvent) {
        match self.events.mark_streaming(event.id).await {
            Ok(true) => {}
            Ok(false) => return, // someone else took it, or it has synced
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "failed to mark event streaming");
                return;
            }
        }

        let payload = self.payload_for(event).await;
        match self.client.send_event(&payload).await {
            Ok(ack) => self.apply_ack(event, &ack).await,
            Err(e) => self.apply_send_error(event, &e).await,
        }
    }

    async fn apply_ack(&self, event: &WeighingEvent, ack: &EventAck) {
        match ack.status {
            // `duplicate` advances exactly as `accepted` does.
            AckStatus::Accepted | AckStatus::Duplicate => {
                let cloud_id = ack
                    .cloud_event_id
                    .clone()
                    .unwrap_or_else(|| event.id.to_string());
                if let Err(e) = self.events.mark_synced(event.id, &cloud_id, Utc::now()).await {
                    warn!(event_id = %event.id, error = %e, "failed to mark event synced");
                }
            }
            AckStatus::Failed => {
                let reason = ack.error.as_deref().unwrap_or("rejected by cloud");
                info!(event_id = %event.id, reason, "event rejected by cloud");
                if let Err(e) = self.events.mark_failed(event.id, reason, true).await {
                    warn!(event_id = %event.id, error = %e, "failed to mark event rejected");
                }
            }
        }
    }

    async fn apply_send_error(&self, event: &WeighingEvent, error: &RestError) {
        // A 4xx (other than 429, which never reaches here) is an explicit
        // rejection and terminal; everything else is transport and will be
        // retried by the timer.
        let rejected = matches!(error, RestError::Status { status, .. }
            if *status < 500 && *status != 429);
        if let Err(e) = self
            .events
            .mark_failed(event.id, &error.to_string(), rejected)
            .await
        {
            warn!(event_id = %event.id, error = %e, "failed to record sync failure");
        }
    }

    // -----------------------------------------------------------------------
    // Backlog drain
    // -----------------------------------------------------------------------

    /// Drain pending events until none remain or a round errors out.
    pub async fn flush_pending(&self) {
        loop {
            let pending = match self.events.pending_events(self.cfg.batch_size).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "failed to read pending events");
                    return;
                }
            };
            if pending.is_empty() {
                return;
            }

            if pending.len() == 1 {
                let event = &pending[0];
                self.stream_event(event).await;
                // A transport failure would spin this loop; stop and let
                // the retry timer take over.
                if !self.client.is_online() {
                    return;
                }
                continue;
            }

            if !self.flush_slice(pending).await {
                return;
            }
        }
    }

    /// Ship one slice via `/events/batch`.  Returns false when the round
    /// should end (request error).
    async fn flush_slice(&self, slice: Vec<WeighingEvent>) -> bool {
        let mut taken = Vec::with_capacity(slice.len());
        for event in slice {
            match self.events.mark_streaming(event.id).await {
                Ok(true) => taken.push(event),
                Ok(false) => {}
                Err(e) => warn!(event_id = %event.id, error = %e, "failed to mark streaming"),
            }
        }
        if taken.is_empty() {
            return true;
        }

        let mut payloads = Vec::with_capacity(taken.len());
        for event in &taken {
            payloads.push(self.payload_for(event).await);
        }

        debug!(events = taken.len(), "flushing event batch");
        match self.client.send_event_batch(payloads).await {
            Ok(response) => {
                for event in &taken {
                    let outcome = response
                        .results
                        .iter()
                        .find(|r| r.local_event_id == event.id);
                    match outcome {
                        Some(result) => {
                            let ack = EventAck {
                                cloud_event_id: result.cloud_event_id.clone(),
                                status: result.status,
                                error: result.error.clone(),
                            };
                            self.apply_ack(event, &ack).await;
                        }
                        None => {
                            // The Cloud did not account for this event;
                            // treat as transport so the timer retries it.
                            self.apply_send_error(
                                event,
                                &RestError::Transport(
                                    "event missing from batch response".to_owned(),
                                ),
                            )
                            .await;
                        }
                    }
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "event batch flush failed");
                for event in &taken {
                    self.apply_send_error(event, &e).await;
                }
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reconnect + retry rounds
    // -----------------------------------------------------------------------

    /// Everything that happens after an online transition.
    pub async fn on_reconnect(&self) {
        match self.client.fetch_edge_config().await {
            Ok(config) => debug!(config = %config, "edge config fetched"),
            Err(e) => debug!(error = %e, "edge config fetch failed"),
        }

        let closed = match self.batches.closed_pending_batches().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to list closed batches");
                Vec::new()
            }
        };

        for batch in &closed {
            let Some(ended_at) = batch.ended_at else {
                continue;
            };
            let notice = OfflineBatchEndNotice {
                batch_id: batch.batch_id,
                device_id: batch.device_id.clone(),
                started_at: batch.started_at,
                ended_at,
                event_count: batch.event_count,
                total_weight_grams: batch.total_weight_grams,
            };
            match self.client.notify_offline_batch_end(&notice).await {
                Ok(()) => {
                    info!(batch_id = %batch.batch_id, events = batch.event_count,
                        "offline batch announced for reconciliation");
                    if let Err(e) = self.batches.mark_syncing(batch.batch_id).await {
                        warn!(batch_id = %batch.batch_id, error = %e, "failed to mark batch syncing");
                    }
                }
                Err(e) => {
                    warn!(batch_id = %batch.batch_id, error = %e, "offline batch notification failed");
                }
            }
        }

        self.flush_pending().await;

        for batch in &closed {
            match self.events.count_unsynced_in_batch(batch.batch_id).await {
                Ok(0) => {
                    if let Err(e) = self.batches.mark_synced(batch.batch_id, None).await {
                        warn!(batch_id = %batch.batch_id, error = %e, "failed to mark batch synced");
                    }
                }
                Ok(remaining) => {
                    debug!(batch_id = %batch.batch_id, remaining, "batch still has unsynced events");
                }
                Err(e) => warn!(batch_id = %batch.batch_id, error = %e, "failed to count batch events"),
            }
        }
    }

    /// Offline probe: one cheap authenticated request per retry tick.  Its
    /// success path runs through the client's online tracking, so recovery
    /// is detected without any scale traffic.
    pub async fn probe(&self) {
        if let Err(e) = self.client.fetch_edge_config().await {
            debug!(error = %e, "connectivity probe failed, still offline");
        }
    }

    /// Periodic retry: lift transport failures back to `pending`, then
    /// drain.
    pub async fn retry_round(&self) {
        match self.events.requeue_transport_failures().await {
            Ok(0) => {}
            Ok(n) => info!(events = n, "requeued transport-failed events"),
            Err(e) => warn!(error = %e, "failed to requeue transport failures"),
        }
        self.flush_pending().await;
    }

    async fn payload_for(&self, event: &WeighingEvent) -> EventPayload {
        let global_device_id = self
            .registry
            .get(&event.device_id)
            .await
            .and_then(|d| d.global_device_id);
        EventPayload {
            local_event_id: event.id,
            device_id: event.device_id.clone(),
            global_device_id,
            cloud_session_id: event.cloud_session_id.clone(),
            offline_mode: event.offline_mode,
            offline_batch_id: event.offline_batch_id,
            plu_code: event.plu_code.clone(),
            product_name: event.product_name.clone(),
            weight_grams: event.weight_grams,
            barcode: event.barcode.clone(),
            scale_timestamp: event.scale_timestamp.clone(),
            received_at: event.received_at,
        }
    }
}

/// Spawn the sync loop: captured events, reconnect handling, retry timer.
pub fn spawn_sync_task(
    service: Arc<CloudSyncService>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut captured = service.events.subscribe_captured();
    let mut connectivity = service.client.subscribe_connectivity();
    tokio::spawn(async move {
        let mut retry_ticker =
            tokio::time::interval(Duration::from_millis(service.cfg.retry_interval_ms));
        retry_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The interval fires immediately; skip that first tick so boot
        // doesn't race the first connectivity check.
        retry_ticker.reset();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                event = captured.recv() => match event {
                    Ok(event) => {
                        if service.client.is_online() {
                            service.stream_event(&event).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "captured events lagged; backlog flush will cover them");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                transition = connectivity.recv() => match transition {
                    Ok(ConnectivityEvent::Connected) => {
                        tokio::time::sleep(Duration::from_millis(service.cfg.backlog_sync_delay_ms))
                            .await;
                        service.on_reconnect().await;
                    }
                    Ok(ConnectivityEvent::Disconnected) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = retry_ticker.tick() => {
                    if service.client.is_online() {
                        service.retry_round().await;
                    } else {
                        service.probe().await;
                    }
                }
            }
        }
    })
}
