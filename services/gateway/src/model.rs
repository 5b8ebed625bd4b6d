//! Typed domain entities shared across the gateway.
//!
//! External JSON and SQLite TEXT columns are converted into these types at
//! the boundary; everything inward passes typed values.  Status enums have
//! a stable string codec (`as_str` / `parse`) used by both the store and
//! the cloud payload layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Functional role of a scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Disassembly,
    Retail,
    Receiving,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Disassembly => "disassembly",
            DeviceType::Retail => "retail",
            DeviceType::Receiving => "receiving",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disassembly" => Some(DeviceType::Disassembly),
            "retail" => Some(DeviceType::Retail),
            "receiving" => Some(DeviceType::Receiving),
            _ => None,
        }
    }
}

/// Health/activity status derived by the activity monitor.
///
/// `Unknown` is reserved for devices that have never connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Idle,
    Stale,
    Disconnected,
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Idle => "idle",
            DeviceStatus::Stale => "stale",
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(DeviceStatus::Online),
            "idle" => Some(DeviceStatus::Idle),
            "stale" => Some(DeviceStatus::Stale),
            "disconnected" => Some(DeviceStatus::Disconnected),
            "unknown" => Some(DeviceStatus::Unknown),
            _ => None,
        }
    }
}

/// One scale, keyed by the short id from its registration line.
///
/// Created on first successful registration and never destroyed; a
/// disconnect only flips `tcp_connected` and clears the socket handle
/// (which lives in the registry, not here — this is the persistable view).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub device_id: String,
    /// Site-qualified id assigned after registration (e.g. by the Cloud).
    pub global_device_id: Option<String>,
    pub display_name: Option<String>,
    pub location: Option<String>,
    pub device_type: DeviceType,
    pub status: DeviceStatus,
    pub tcp_connected: bool,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub heartbeat_count: u64,
    pub event_count: u64,
    pub connected_at: Option<DateTime<Utc>>,
    pub source_ip: Option<String>,
    pub active_cloud_session_id: Option<String>,
}

impl Device {
    /// A freshly-registered device, before any heartbeat or event.
    pub fn new(device_id: &str, source_ip: &str, now: DateTime<Utc>) -> Self {
        Device {
            device_id: device_id.to_owned(),
            global_device_id: None,
            display_name: None,
            location: None,
            device_type: DeviceType::Retail,
            status: DeviceStatus::Online,
            tcp_connected: true,
            last_heartbeat_at: None,
            last_event_at: None,
            heartbeat_count: 0,
            event_count: 0,
            connected_at: Some(now),
            source_ip: Some(source_ip.to_owned()),
            active_cloud_session_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Weighing events
// ---------------------------------------------------------------------------

/// Per-event delivery state machine.
///
/// `Synced` is terminal; the store refuses to downgrade it.  `Failed` is a
/// cool-down state for transport failures and terminal for explicit Cloud
/// rejections (see `WeighingEvent::rejected`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Streaming,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Streaming => "streaming",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "streaming" => Some(SyncStatus::Streaming),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// A captured weighing/print event.
///
/// Invariants (enforced by the event processor and the store):
/// - `offline_mode` ⇔ `offline_batch_id` is set
/// - `cloud_id` is set iff `sync_status == Synced`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeighingEvent {
    pub id: Uuid,
    pub device_id: String,
    pub cloud_session_id: Option<String>,
    pub offline_mode: bool,
    pub offline_batch_id: Option<Uuid>,
    pub plu_code: String,
    pub product_name: String,
    pub weight_grams: u32,
    pub barcode: String,
    pub scale_timestamp: String,
    pub received_at: DateTime<Utc>,
    pub source_ip: String,
    pub raw_data: String,
    pub sync_status: SyncStatus,
    /// True when the Cloud rejected this event with a terminal reason;
    /// such events never re-enter the retry pool.
    pub rejected: bool,
    pub cloud_id: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
    pub sync_attempts: u32,
    pub last_sync_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Offline batches
// ---------------------------------------------------------------------------

/// Cloud-side reconciliation progression, mirrored locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Pending,
    InProgress,
    Reconciled,
    Failed,
}

impl ReconciliationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconciliationStatus::Pending => "pending",
            ReconciliationStatus::InProgress => "in_progress",
            ReconciliationStatus::Reconciled => "reconciled",
            ReconciliationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReconciliationStatus::Pending),
            "in_progress" => Some(ReconciliationStatus::InProgress),
            "reconciled" => Some(ReconciliationStatus::Reconciled),
            "failed" => Some(ReconciliationStatus::Failed),
            _ => None,
        }
    }
}

/// A grouping of events captured while the Cloud was unreachable.
///
/// `ended_at` is set exactly when the batch closes; the batch then waits in
/// `Pending` until Cloud-side reconciliation assigns it a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineBatch {
    pub batch_id: Uuid,
    pub device_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub event_count: u64,
    pub total_weight_grams: u64,
    pub reconciliation_status: ReconciliationStatus,
    /// Assigned only at reconciliation; the Edge never invents this.
    pub cloud_session_id: Option<String>,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub reconciled_by: Option<String>,
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Cloud sessions
// ---------------------------------------------------------------------------

/// Cloud session state as cached on the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
}

impl SessionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "paused" => Some(SessionStatus::Paused),
            _ => None,
        }
    }
}

/// Per-device projection of the currently-active Cloud session.
///
/// Invariant: `expires_at > cached_at`; an expired entry reads as absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSession {
    pub device_id: String,
    pub cloud_session_id: String,
    pub animal_id: Option<String>,
    pub animal_tag: Option<String>,
    pub animal_species: Option<String>,
    pub operator_id: Option<String>,
    pub status: SessionStatus,
    pub cached_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Edge identity
// ---------------------------------------------------------------------------

/// The singleton credential record for authenticated Cloud requests.
///
/// `edge_id` is kept as raw text: a previous run may have persisted a
/// malformed value, and the REST client must be able to observe that and
/// treat it as missing rather than fail to load the record at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeIdentity {
    pub edge_id: String,
    pub site_id: Option<String>,
    pub site_name: Option<String>,
    pub registered_at: DateTime<Utc>,
}
