//! Typed payloads for the Cloud REST API.
//!
//! JSON is parsed once at this boundary; everything inward passes typed
//! values.  Field names are camelCase on the wire (the Cloud API contract),
//! snake_case in Rust.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Body of `POST /register`.
///
/// `edge_id` is sent when re-registering a known identity so the Cloud can
/// re-issue rather than mint; absent on first boot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    pub version: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub edge_id: Uuid,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub site_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// One entry of the `GET /sessions` response mapping.
///
/// `status` stays a string here: the cache layer decides which values it
/// projects (`active`/`paused`) and evicts on anything else, so an unknown
/// status must survive deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub cloud_session_id: String,
    #[serde(default)]
    pub animal_id: Option<String>,
    #[serde(default)]
    pub animal_tag: Option<String>,
    #[serde(default)]
    pub animal_species: Option<String>,
    #[serde(default)]
    pub operator_id: Option<String>,
    pub status: String,
}

/// Response of `GET /sessions?device_ids=…`.
///
/// A device missing from the map (or mapped to `null`) has no active
/// session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionsResponse {
    #[serde(default)]
    pub sessions: HashMap<String, Option<SessionDescriptor>>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// The event record as shipped to the Cloud (single and batch paths).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub local_event_id: Uuid,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_session_id: Option<String>,
    pub offline_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offline_batch_id: Option<Uuid>,
    pub plu_code: String,
    pub product_name: String,
    pub weight_grams: u32,
    pub barcode: String,
    pub scale_timestamp: String,
    pub received_at: DateTime<Utc>,
}

/// Per-event outcome as reported by the Cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accepted,
    Duplicate,
    Failed,
}

/// Response of `POST /events`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAck {
    #[serde(default)]
    pub cloud_event_id: Option<String>,
    pub status: AckStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// One entry of the `POST /events/batch` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub local_event_id: Uuid,
    #[serde(default)]
    pub cloud_event_id: Option<String>,
    pub status: AckStatus,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub results: Vec<BatchResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchRequest {
    pub events: Vec<EventPayload>,
}

// ---------------------------------------------------------------------------
// Device status
// ---------------------------------------------------------------------------

/// Body of `POST /devices/status`, one report per status transition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusReport {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_device_id: Option<String>,
    pub status: String,
    pub tcp_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Offline batches
// ---------------------------------------------------------------------------

/// Body of `POST /offline-batches/end` — closed-batch metadata announced
/// ahead of the batch's event flush so the Cloud can open reconciliation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineBatchEndNotice {
    pub batch_id: Uuid,
    pub device_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub event_count: u64,
    pub total_weight_grams: u64,
}
