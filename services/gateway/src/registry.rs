//! Authoritative in-memory device registry with write-through persistence.
//!
//! The registry owns every `Device` record.  Connection tasks mutate the
//! connection fields, the activity monitor mutates status, the session
//! poller mutates the active session id, and the event processor bumps the
//! counters — all through the mutators here, which serialize access and
//! mirror every change into the durable store.
//!
//! Socket ownership: at most one connection task holds a device's socket.
//! `attach_socket` returns the displaced predecessor handle (if any) so the
//! caller can signal it closed — DHCP-reassigned scales re-register after a
//! silent drop and the newer socket always wins.

use crate::model::{Device, DeviceStatus};
use crate::storage::{Store, StoreResult};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Connection handles
// ---------------------------------------------------------------------------

/// Handle to the connection task currently bound to a device.
///
/// `conn_id` disambiguates detach races: a stale task can only clear the
/// slot it still owns.  `close` tells the owning task to shut its socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: u64,
    close: watch::Sender<bool>,
}

impl ConnectionHandle {
    /// Ask the owning connection task to close.  Lossy by design: if the
    /// task is already gone there is nobody left to signal.
    pub fn signal_close(&self) {
        let _ = self.close.send(true);
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct DeviceEntry {
    device: Device,
    socket: Option<ConnectionHandle>,
}

/// In-memory device map, keyed by `deviceId`, mirrored to the store.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceEntry>>,
    store: Arc<Mutex<Store>>,
    next_conn_id: AtomicU64,
}

impl DeviceRegistry {
    /// Warm the registry from the store.  Callers run the store's
    /// disconnect recovery before this, so every loaded device arrives
    /// with `tcp_connected = false` and no socket.
    pub async fn load(store: Arc<Mutex<Store>>) -> StoreResult<Self> {
        let devices = store.lock().await.load_devices()?;
        let mut map = HashMap::with_capacity(devices.len());
        for device in devices {
            map.insert(
                device.device_id.clone(),
                DeviceEntry {
                    device,
                    socket: None,
                },
            );
        }
        info!(devices = map.len(), "device registry loaded");
        Ok(DeviceRegistry {
            devices: RwLock::new(map),
            store,
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Mint a connection handle and the close signal its task listens on.
    pub fn new_connection_handle(&self) -> (ConnectionHandle, watch::Receiver<bool>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (close_tx, close_rx) = watch::channel(false);
        (
            ConnectionHandle {
                conn_id,
                close: close_tx,
            },
            close_rx,
        )
    }

    // -----------------------------------------------------------------------
    // Mutators
    // -----------------------------------------------------------------------

    /// Admit a device on a successful registration frame, creating the
    /// record on first sight.  Returns a snapshot of the updated device.
    pub async fn register(&self, device_id: &str, source_ip: &str) -> StoreResult<Device> {
        let now = Utc::now();
        let snapshot = {
            let mut map = self.devices.write().await;
            let entry = map
                .entry(device_id.to_owned())
                .or_insert_with(|| DeviceEntry {
                    device: Device::new(device_id, source_ip, now),
                    socket: None,
                });
            entry.device.tcp_connected = true;
            entry.device.connected_at = Some(now);
            entry.device.source_ip = Some(source_ip.to_owned());
            entry.device.status = DeviceStatus::Online;
            entry.device.clone()
        };
        self.persist(&snapshot).await?;
        Ok(snapshot)
    }

    /// Bind a socket to a device, displacing any predecessor.
    ///
    /// Returns the predecessor handle; the caller signals it closed.
    pub async fn attach_socket(
        &self,
        device_id: &str,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let mut map = self.devices.write().await;
        let entry = map.get_mut(device_id)?;
        let previous = entry.socket.replace(handle);
        if previous.is_some() {
            warn!(device_id, "replacing existing connection for device");
        }
        previous
    }

    /// Clear the socket slot if `conn_id` still owns it, marking the
    /// device disconnected.  A stale task (already displaced) is a no-op.
    pub async fn detach_socket(&self, device_id: &str, conn_id: u64) -> StoreResult<()> {
        let snapshot = {
            let mut map = self.devices.write().await;
            let Some(entry) = map.get_mut(device_id) else {
                return Ok(());
            };
            let owns_slot = entry
                .socket
                .as_ref()
                .is_some_and(|current| current.conn_id == conn_id);
            if owns_slot {
                entry.socket = None;
                entry.device.tcp_connected = false;
                entry.device.status = DeviceStatus::Disconnected;
                Some(entry.device.clone())
            } else {
                None
            }
        };
        if let Some(device) = snapshot {
            self.persist(&device).await?;
        }
        Ok(())
    }

    /// Signal the device's current connection (if any) to close.  Used by
    /// the activity monitor's ping-timeout path; teardown itself stays
    /// with the connection task.
    pub async fn signal_connection_close(&self, device_id: &str) {
        let map = self.devices.read().await;
        if let Some(handle) = map.get(device_id).and_then(|e| e.socket.as_ref()) {
            handle.signal_close();
        }
    }

    pub async fn record_heartbeat(&self, device_id: &str) -> StoreResult<()> {
        let snapshot = {
            let mut map = self.devices.write().await;
            let Some(entry) = map.get_mut(device_id) else {
                return Ok(());
            };
            entry.device.last_heartbeat_at = Some(Utc::now());
            entry.device.heartbeat_count += 1;
            entry.device.clone()
        };
        self.persist(&snapshot).await
    }

    pub async fn record_event(&self, device_id: &str) -> StoreResult<()> {
        let snapshot = {
            let mut map = self.devices.write().await;
            let Some(entry) = map.get_mut(device_id) else {
                return Ok(());
            };
            entry.device.last_event_at = Some(Utc::now());
            entry.device.event_count += 1;
            entry.device.clone()
        };
        self.persist(&snapshot).await
    }

    /// Status is owned by the activity monitor; nobody else calls this.
    pub async fn update_status(&self, device_id: &str, status: DeviceStatus) -> StoreResult<()> {
        let snapshot = {
            let mut map = self.devices.write().await;
            let Some(entry) = map.get_mut(device_id) else {
                return Ok(());
            };
            entry.device.status = status;
            entry.device.clone()
        };
        self.persist(&snapshot).await
    }

    /// Session id is owned by the session cache; `None` clears it.
    pub async fn set_active_session(
        &self,
        device_id: &str,
        session_id: Option<String>,
    ) -> StoreResult<()> {
        let snapshot = {
            let mut map = self.devices.write().await;
            let Some(entry) = map.get_mut(device_id) else {
                return Ok(());
            };
            if entry.device.active_cloud_session_id == session_id {
                return Ok(());
            }
            entry.device.active_cloud_session_id = session_id;
            entry.device.clone()
        };
        self.persist(&snapshot).await
    }

    // -----------------------------------------------------------------------
    // Readers
    // -----------------------------------------------------------------------

    pub async fn get(&self, device_id: &str) -> Option<Device> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|e| e.device.clone())
    }

    pub async fn list(&self) -> Vec<Device> {
        let map = self.devices.read().await;
        let mut devices: Vec<Device> = map.values().map(|e| e.device.clone()).collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    /// Device ids with a live TCP connection, for session polling.
    pub async fn connected_device_ids(&self) -> Vec<String> {
        let map = self.devices.read().await;
        let mut ids: Vec<String> = map
            .values()
            .filter(|e| e.device.tcp_connected)
            .map(|e| e.device.device_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// The conn_id currently bound to a device, if any.  Test seam for the
    /// socket-replacement invariant.
    pub async fn current_conn_id(&self, device_id: &str) -> Option<u64> {
        self.devices
            .read()
            .await
            .get(device_id)
            .and_then(|e| e.socket.as_ref().map(|h| h.conn_id))
    }

    async fn persist(&self, device: &Device) -> StoreResult<()> {
        self.store.lock().await.upsert_device(device)
    }
}
