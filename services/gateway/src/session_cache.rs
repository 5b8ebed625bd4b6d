//! Per-device projection of the Cloud's active sessions.
//!
//! The cache polls `GET /sessions` for the currently-connected devices on
//! a timer (and immediately after each reconnect), upserts entries for
//! sessions reported `active`/`paused`, and evicts everything else.  A
//! background sweep drops TTL-expired entries.  The Edge never invents
//! session ids — this is strictly a projection, and the device registry's
//! `active_cloud_session_id` follows it.

use crate::cloud::rest::{ConnectivityEvent, RestClient};
use crate::cloud::types::SessionsResponse;
use crate::config::SessionCacheConfig;
use crate::model::{CachedSession, SessionStatus};
use crate::registry::DeviceRegistry;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct SessionCache {
    entries: RwLock<HashMap<String, CachedSession>>,
    registry: Arc<DeviceRegistry>,
    client: Arc<RestClient>,
    cfg: SessionCacheConfig,
}

impl SessionCache {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        client: Arc<RestClient>,
        cfg: SessionCacheConfig,
    ) -> Self {
        SessionCache {
            entries: RwLock::new(HashMap::new()),
            registry,
            client,
            cfg,
        }
    }

    /// Non-expired entry for a device; an expired one reads as absent.
    pub async fn get(&self, device_id: &str) -> Option<CachedSession> {
        let entries = self.entries.read().await;
        entries
            .get(device_id)
            .filter(|s| Utc::now() < s.expires_at)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    /// One poll round: ask the Cloud about every connected device and
    /// apply the response.
    pub async fn poll_once(&self) {
        let device_ids = self.registry.connected_device_ids().await;
        if device_ids.is_empty() {
            return;
        }
        match self.client.fetch_sessions(&device_ids).await {
            Ok(response) => self.apply_sessions(&device_ids, response).await,
            Err(e) => debug!(error = %e, "session poll failed"),
        }
    }

    /// Apply one `GET /sessions` response for the queried devices.
    ///
    /// Present with status `active`/`paused` → upsert and refresh the TTL;
    /// absent, null, or any other status → evict and clear the device's
    /// active session id.
    pub async fn apply_sessions(&self, queried: &[String], response: SessionsResponse) {
        let now = Utc::now();
        for device_id in queried {
            let descriptor = response.sessions.get(device_id).and_then(|d| d.as_ref());
            let parsed = descriptor.and_then(|d| {
                SessionStatus::parse(&d.status).map(|status| (d.clone(), status))
            });

            match parsed {
                Some((descriptor, status)) => {
                    let session_id = descriptor.cloud_session_id.clone();
                    let expires_at = now + ChronoDuration::milliseconds(self.cfg.expiry_ms as i64);
                    {
                        let mut entries = self.entries.write().await;
                        match entries.get_mut(device_id) {
                            Some(entry) => {
                                entry.cloud_session_id = descriptor.cloud_session_id;
                                entry.animal_id = descriptor.animal_id;
                                entry.animal_tag = descriptor.animal_tag;
                                entry.animal_species = descriptor.animal_species;
                                entry.operator_id = descriptor.operator_id;
                                entry.status = status;
                                entry.last_updated_at = now;
                                entry.expires_at = expires_at;
                            }
                            None => {
                                entries.insert(
                                    device_id.clone(),
                                    CachedSession {
                                        device_id: device_id.clone(),
                                        cloud_session_id: descriptor.cloud_session_id,
                                        animal_id: descriptor.animal_id,
                                        animal_tag: descriptor.animal_tag,
                                        animal_species: descriptor.animal_species,
                                        operator_id: descriptor.operator_id,
                                        status,
                                        cached_at: now,
                                        last_updated_at: now,
                                        expires_at,
                                    },
                                );
                            }
                        }
                        debug!(device_id = %device_id, session_id = %session_id, "session cached");
                    }
                    if let Err(e) = self
                        .registry
                        .set_active_session(device_id, Some(session_id))
                        .await
                    {
                        warn!(device_id = %device_id, error = %e, "failed to persist session id");
                    }
                }
                None => {
                    let evicted = self.entries.write().await.remove(device_id);
                    if evicted.is_some() {
                        debug!(device_id = %device_id, "session evicted");
                    }
                    if let Err(e) = self.registry.set_active_session(device_id, None).await {
                        warn!(device_id = %device_id, error = %e, "failed to clear session id");
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Eviction sweep
    // -----------------------------------------------------------------------

    /// Drop TTL-expired entries and clear the devices' session ids.
    pub async fn evict_expired(&self) {
        let now = Utc::now();
        let expired: Vec<String> = {
            let entries = self.entries.read().await;
            entries
                .values()
                .filter(|s| now >= s.expires_at)
                .map(|s| s.device_id.clone())
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        {
            let mut entries = self.entries.write().await;
            for device_id in &expired {
                entries.remove(device_id);
            }
        }
        for device_id in &expired {
            debug!(device_id = %device_id, "session entry expired");
            if let Err(e) = self.registry.set_active_session(device_id, None).await {
                warn!(device_id = %device_id, error = %e, "failed to clear expired session id");
            }
        }
    }
}

/// Spawn the poll loop: every `poll_interval_ms` while online, plus an
/// immediate round on each reconnect.
pub fn spawn_poll_task(
    cache: Arc<SessionCache>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut connectivity = cache.client.subscribe_connectivity();
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(cache.cfg.poll_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                event = connectivity.recv() => match event {
                    Ok(ConnectivityEvent::Connected) => cache.poll_once().await,
                    Ok(ConnectivityEvent::Disconnected) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = ticker.tick() => {
                    if cache.client.is_online() {
                        cache.poll_once().await;
                    }
                }
            }
        }
    })
}

/// Spawn the TTL eviction sweep.
pub fn spawn_cleanup_task(
    cache: Arc<SessionCache>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(cache.cfg.cleanup_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => cache.evict_expired().await,
            }
        }
    })
}
