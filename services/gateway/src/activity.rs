//! Heartbeat/activity monitor.
//!
//! A periodic sweep re-derives each device's status from its timestamps
//! and publishes transitions on a broadcast channel.  The monitor takes no
//! hard action on devices itself — connection teardown stays with the TCP
//! task — with one exception: a connected device whose heartbeat has
//! expired gets a ping-timeout signal so its task closes the socket.
//!
//! Status derivation:
//! - `disconnected` when not TCP-connected, or the last heartbeat is
//!   `heartbeat.timeout_ms` or older (expiry is inclusive).
//! - otherwise `online` / `idle` / `stale` by how recent the last event is
//!   against the idle/stale thresholds.
//! - `unknown` only for devices that have never connected.

use crate::cloud::rest::RestClient;
use crate::cloud::types::DeviceStatusReport;
use crate::config::{ActivityConfig, HeartbeatConfig};
use crate::model::{Device, DeviceStatus};
use crate::registry::DeviceRegistry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One observed status change, published for downstream observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub device_id: String,
    pub from: DeviceStatus,
    pub to: DeviceStatus,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Pure status derivation; the sweep applies it to every device.
pub fn derive_status(
    device: &Device,
    now: DateTime<Utc>,
    heartbeat: &HeartbeatConfig,
    activity: &ActivityConfig,
) -> DeviceStatus {
    let Some(connected_at) = device.connected_at else {
        return DeviceStatus::Unknown;
    };

    if !device.tcp_connected {
        return DeviceStatus::Disconnected;
    }

    // A device that has connected but not yet heartbeat is measured from
    // the connect instant.
    let heartbeat_ref = device.last_heartbeat_at.unwrap_or(connected_at);
    let heartbeat_age = now.signed_duration_since(heartbeat_ref);
    if heartbeat_age.num_milliseconds() >= heartbeat.timeout_ms as i64 {
        return DeviceStatus::Disconnected;
    }

    let activity_ref = device.last_event_at.unwrap_or(connected_at);
    let activity_age = now.signed_duration_since(activity_ref).num_milliseconds();
    if activity_age < activity.idle_threshold_ms as i64 {
        DeviceStatus::Online
    } else if activity_age < activity.stale_threshold_ms as i64 {
        DeviceStatus::Idle
    } else {
        DeviceStatus::Stale
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct ActivityMonitor {
    registry: Arc<DeviceRegistry>,
    heartbeat: HeartbeatConfig,
    activity: ActivityConfig,
    transitions_tx: broadcast::Sender<StatusTransition>,
}

impl ActivityMonitor {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        heartbeat: HeartbeatConfig,
        activity: ActivityConfig,
    ) -> Self {
        let (transitions_tx, _) = broadcast::channel(256);
        ActivityMonitor {
            registry,
            heartbeat,
            activity,
            transitions_tx,
        }
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StatusTransition> {
        self.transitions_tx.subscribe()
    }

    /// One sweep over the registry.  Exposed for tests; the timer task
    /// calls it every `heartbeat.check_interval_ms`.
    pub async fn sweep(&self) {
        let now = Utc::now();
        for device in self.registry.list().await {
            let derived = derive_status(&device, now, &self.heartbeat, &self.activity);
            if derived == device.status {
                continue;
            }

            // Heartbeat expiry on a live socket: tell the owning task to
            // close ("ping timeout"); the detach path marks the device.
            if derived == DeviceStatus::Disconnected && device.tcp_connected {
                info!(device_id = %device.device_id, "heartbeat expired, signalling connection close");
                self.registry.signal_connection_close(&device.device_id).await;
            }

            if let Err(e) = self.registry.update_status(&device.device_id, derived).await {
                warn!(device_id = %device.device_id, error = %e, "failed to persist status");
                continue;
            }
            debug!(
                device_id = %device.device_id,
                from = device.status.as_str(),
                to = derived.as_str(),
                "device status transition"
            );
            let _ = self.transitions_tx.send(StatusTransition {
                device_id: device.device_id.clone(),
                from: device.status,
                to: derived,
                at: now,
            });
        }
    }
}

/// Spawn the periodic sweep.
pub fn spawn_monitor_task(
    monitor: Arc<ActivityMonitor>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(monitor.heartbeat.check_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => monitor.sweep().await,
            }
        }
    })
}

/// Spawn the status reporter: forwards every transition to the Cloud.
/// These are event-class requests, so they queue while offline.
pub fn spawn_status_reporter_task(
    monitor: Arc<ActivityMonitor>,
    registry: Arc<DeviceRegistry>,
    client: Arc<RestClient>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut transitions = monitor.subscribe_transitions();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                transition = transitions.recv() => match transition {
                    Ok(t) => {
                        let Some(device) = registry.get(&t.device_id).await else {
                            continue;
                        };
                        let report = DeviceStatusReport {
                            device_id: device.device_id.clone(),
                            global_device_id: device.global_device_id.clone(),
                            status: t.to.as_str().to_owned(),
                            tcp_connected: device.tcp_connected,
                            last_heartbeat_at: device.last_heartbeat_at,
                            last_event_at: device.last_event_at,
                        };
                        if let Err(e) = client.post_device_status(&report).await {
                            debug!(device_id = %t.device_id, error = %e, "device status report not delivered");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "status transitions lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    })
}
