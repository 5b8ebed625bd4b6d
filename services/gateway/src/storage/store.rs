//! Durable SQLite store for gateway state.
//!
//! # Schema
//! - `devices`: registry mirror, one row per scale, never deleted.
//! - `events`: captured weighing events with their sync-state machine.
//! - `offline_batches`: offline groupings awaiting reconciliation.
//! - `edge_identity`: singleton credential row (id = 1).
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000,
//! foreign_keys=ON.  PRAGMA integrity_check runs at open; returns error if
//! it fails.
//!
//! Writers are the device registry, the event processor, and the batch
//! manager; everything else reads through them.  The connection is shared
//! as `Arc<Mutex<Store>>`.

use crate::model::{
    Device, DeviceStatus, DeviceType, EdgeIdentity, OfflineBatch, ReconciliationStatus, SyncStatus,
    WeighingEvent,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Store struct
// ---------------------------------------------------------------------------

/// The durable store for a single gateway instance.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at the given path.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, and creates tables
    /// if needed.  Returns `Err` if integrity_check fails.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store { conn })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store { conn })
    }

    // -----------------------------------------------------------------------
    // Devices
    // -----------------------------------------------------------------------

    /// Insert or fully refresh the persisted mirror of a device record.
    pub fn upsert_device(&mut self, device: &Device) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO devices
                 (device_id, global_device_id, display_name, location, device_type,
                  status, tcp_connected, last_heartbeat_at, last_event_at,
                  heartbeat_count, event_count, connected_at, source_ip,
                  active_cloud_session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(device_id) DO UPDATE SET
                 global_device_id = excluded.global_device_id,
                 display_name = excluded.display_name,
                 location = excluded.location,
                 device_type = excluded.device_type,
                 status = excluded.status,
                 tcp_connected = excluded.tcp_connected,
                 last_heartbeat_at = excluded.last_heartbeat_at,
                 last_event_at = excluded.last_event_at,
                 heartbeat_count = excluded.heartbeat_count,
                 event_count = excluded.event_count,
                 connected_at = excluded.connected_at,
                 source_ip = excluded.source_ip,
                 active_cloud_session_id = excluded.active_cloud_session_id",
            params![
                device.device_id,
                device.global_device_id,
                device.display_name,
                device.location,
                device.device_type.as_str(),
                device.status.as_str(),
                device.tcp_connected,
                device.last_heartbeat_at.map(|t| t.to_rfc3339()),
                device.last_event_at.map(|t| t.to_rfc3339()),
                device.heartbeat_count as i64,
                device.event_count as i64,
                device.connected_at.map(|t| t.to_rfc3339()),
                device.source_ip,
                device.active_cloud_session_id,
            ],
        )?;
        Ok(())
    }

    /// All persisted devices, for registry warm-up at boot.
    pub fn load_devices(&self) -> StoreResult<Vec<Device>> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, global_device_id, display_name, location, device_type,
                    status, tcp_connected, last_heartbeat_at, last_event_at,
                    heartbeat_count, event_count, connected_at, source_ip,
                    active_cloud_session_id
             FROM devices ORDER BY device_id",
        )?;
        let rows = stmt.query_map([], map_device)?;
        let mut devices = Vec::new();
        for r in rows {
            devices.push(r?);
        }
        Ok(devices)
    }

    /// Startup recovery: no socket survives a restart.
    pub fn mark_all_devices_disconnected(&mut self) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE devices SET tcp_connected = 0,
                                status = CASE WHEN status = 'unknown' THEN 'unknown'
                                              ELSE 'disconnected' END",
            [],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Persist a freshly-captured event.
    ///
    /// Arrival order is preserved by SQLite's rowid; pending queries drain
    /// oldest-first on it.
    pub fn insert_event(&mut self, event: &WeighingEvent) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO events
                 (id, device_id, cloud_session_id, offline_mode, offline_batch_id,
                  plu_code, product_name, weight_grams, barcode, scale_timestamp,
                  received_at, source_ip, raw_data, sync_status, rejected,
                  cloud_id, synced_at, sync_attempts, last_sync_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                     ?15, ?16, ?17, ?18, ?19)",
            params![
                event.id.to_string(),
                event.device_id,
                event.cloud_session_id,
                event.offline_mode,
                event.offline_batch_id.map(|b| b.to_string()),
                event.plu_code,
                event.product_name,
                event.weight_grams,
                event.barcode,
                event.scale_timestamp,
                event.received_at.to_rfc3339(),
                event.source_ip,
                event.raw_data,
                event.sync_status.as_str(),
                event.rejected,
                event.cloud_id,
                event.synced_at.map(|t| t.to_rfc3339()),
                event.sync_attempts,
                event.last_sync_error,
            ],
        )?;
        Ok(())
    }

    pub fn get_event(&self, id: Uuid) -> StoreResult<Option<WeighingEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"
        ))?;
        Ok(stmt
            .query_row(params![id.to_string()], map_event)
            .optional()?)
    }

    /// All events of one device in arrival order.
    pub fn events_for_device(&self, device_id: &str) -> StoreResult<Vec<WeighingEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE device_id = ?1 ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map(params![device_id], map_event)?;
        let mut events = Vec::new();
        for r in rows {
            events.push(r?);
        }
        Ok(events)
    }

    /// Up to `limit` pending events, oldest first.
    pub fn pending_events(&self, limit: usize) -> StoreResult<Vec<WeighingEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE sync_status = 'pending'
             ORDER BY rowid ASC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], map_event)?;
        let mut events = Vec::new();
        for r in rows {
            events.push(r?);
        }
        Ok(events)
    }

    /// pending → streaming, bumping the attempt counter.
    ///
    /// Returns false when the event was not in `pending` (e.g. a concurrent
    /// round already took it, or it has synced in the meantime).
    pub fn mark_event_streaming(&mut self, id: Uuid) -> StoreResult<bool> {
        let n = self.conn.execute(
            "UPDATE events
             SET sync_status = 'streaming', sync_attempts = sync_attempts + 1
             WHERE id = ?1 AND sync_status = 'pending'",
            params![id.to_string()],
        )?;
        Ok(n > 0)
    }

    /// streaming (or pending, for queue-drained sends) → synced.
    ///
    /// `synced` is terminal: a row already synced is left untouched, which
    /// also keeps `cloud_id`/`synced_at` stable under duplicate acks.
    pub fn mark_event_synced(
        &mut self,
        id: Uuid,
        cloud_id: &str,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let n = self.conn.execute(
            "UPDATE events
             SET sync_status = 'synced', cloud_id = ?2, synced_at = ?3,
                 last_sync_error = NULL
             WHERE id = ?1 AND sync_status != 'synced'",
            params![id.to_string(), cloud_id, synced_at.to_rfc3339()],
        )?;
        Ok(n > 0)
    }

    /// streaming → failed.  `rejected` marks a terminal Cloud rejection;
    /// transport failures leave it false so the retry timer can lift the
    /// event back to `pending`.
    pub fn mark_event_failed(&mut self, id: Uuid, error: &str, rejected: bool) -> StoreResult<bool> {
        let n = self.conn.execute(
            "UPDATE events
             SET sync_status = 'failed', last_sync_error = ?2, rejected = ?3
             WHERE id = ?1 AND sync_status != 'synced'",
            params![id.to_string(), error, rejected],
        )?;
        Ok(n > 0)
    }

    /// failed → pending for every transport failure (rejections stay put).
    ///
    /// Returns the number of events lifted back into the retry pool.
    pub fn requeue_transport_failures(&mut self) -> StoreResult<usize> {
        let n = self.conn.execute(
            "UPDATE events SET sync_status = 'pending'
             WHERE sync_status = 'failed' AND rejected = 0",
            [],
        )?;
        Ok(n)
    }

    /// Startup recovery: an event caught mid-stream by a crash goes back to
    /// `pending`; the Cloud's duplicate detection absorbs any re-send.
    pub fn demote_streaming_events(&mut self) -> StoreResult<usize> {
        let n = self.conn.execute(
            "UPDATE events SET sync_status = 'pending' WHERE sync_status = 'streaming'",
            [],
        )?;
        Ok(n)
    }

    /// Events of a batch that are not yet synced (any state but `synced`).
    pub fn count_unsynced_events_in_batch(&self, batch_id: Uuid) -> StoreResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events
             WHERE offline_batch_id = ?1 AND sync_status != 'synced'",
            params![batch_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_events_in_batch(&self, batch_id: Uuid) -> StoreResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE offline_batch_id = ?1",
            params![batch_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Offline batches
    // -----------------------------------------------------------------------

    pub fn insert_batch(&mut self, batch: &OfflineBatch) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO offline_batches
                 (batch_id, device_id, started_at, ended_at, event_count,
                  total_weight_grams, reconciliation_status, cloud_session_id,
                  reconciled_at, reconciled_by, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                batch.batch_id.to_string(),
                batch.device_id,
                batch.started_at.to_rfc3339(),
                batch.ended_at.map(|t| t.to_rfc3339()),
                batch.event_count as i64,
                batch.total_weight_grams as i64,
                batch.reconciliation_status.as_str(),
                batch.cloud_session_id,
                batch.reconciled_at.map(|t| t.to_rfc3339()),
                batch.reconciled_by,
                batch.notes,
            ],
        )?;
        Ok(())
    }

    pub fn get_batch(&self, batch_id: Uuid) -> StoreResult<Option<OfflineBatch>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BATCH_COLUMNS} FROM offline_batches WHERE batch_id = ?1"
        ))?;
        Ok(stmt
            .query_row(params![batch_id.to_string()], map_batch)
            .optional()?)
    }

    /// The open batch for a device, if any.  The schema's partial unique
    /// index guarantees there is at most one.
    pub fn open_batch_for_device(&self, device_id: &str) -> StoreResult<Option<OfflineBatch>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BATCH_COLUMNS} FROM offline_batches
             WHERE device_id = ?1 AND ended_at IS NULL"
        ))?;
        Ok(stmt.query_row(params![device_id], map_batch).optional()?)
    }

    /// Atomically add one event's weight to an open batch.
    pub fn add_event_to_batch(&mut self, batch_id: Uuid, weight_grams: u32) -> StoreResult<bool> {
        let n = self.conn.execute(
            "UPDATE offline_batches
             SET event_count = event_count + 1,
                 total_weight_grams = total_weight_grams + ?2
             WHERE batch_id = ?1 AND ended_at IS NULL",
            params![batch_id.to_string(), weight_grams],
        )?;
        Ok(n > 0)
    }

    /// Close a batch.  Compare-and-set on "still open": a batch already
    /// closed by a concurrent transition is left untouched.
    pub fn end_batch(&mut self, batch_id: Uuid, ended_at: DateTime<Utc>) -> StoreResult<bool> {
        let n = self.conn.execute(
            "UPDATE offline_batches SET ended_at = ?2
             WHERE batch_id = ?1 AND ended_at IS NULL",
            params![batch_id.to_string(), ended_at.to_rfc3339()],
        )?;
        Ok(n > 0)
    }

    /// Close every open batch (offline → online transition).  Returns the
    /// ids of the batches that were closed.
    pub fn end_all_open_batches(&mut self, ended_at: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let mut stmt = self
            .conn
            .prepare("SELECT batch_id FROM offline_batches WHERE ended_at IS NULL")?;
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let mut closed = Vec::with_capacity(ids.len());
        for id in ids {
            self.conn.execute(
                "UPDATE offline_batches SET ended_at = ?2
                 WHERE batch_id = ?1 AND ended_at IS NULL",
                params![id, ended_at.to_rfc3339()],
            )?;
            let parsed = Uuid::parse_str(&id)
                .map_err(|e| StoreError::InvalidData(format!("batch_id '{id}': {e}")))?;
            closed.push(parsed);
        }
        Ok(closed)
    }

    /// Closed batches still awaiting reconciliation, oldest first.
    pub fn closed_pending_batches(&self) -> StoreResult<Vec<OfflineBatch>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BATCH_COLUMNS} FROM offline_batches
             WHERE ended_at IS NOT NULL AND reconciliation_status = 'pending'
             ORDER BY started_at ASC"
        ))?;
        let rows = stmt.query_map([], map_batch)?;
        let mut batches = Vec::new();
        for r in rows {
            batches.push(r?);
        }
        Ok(batches)
    }

    /// Mirror the Cloud's reconciliation progression.
    pub fn set_batch_reconciliation(
        &mut self,
        batch_id: Uuid,
        status: ReconciliationStatus,
        cloud_session_id: Option<&str>,
        reconciled_at: Option<DateTime<Utc>>,
        reconciled_by: Option<&str>,
    ) -> StoreResult<bool> {
        let n = self.conn.execute(
            "UPDATE offline_batches
             SET reconciliation_status = ?2,
                 cloud_session_id = COALESCE(?3, cloud_session_id),
                 reconciled_at = COALESCE(?4, reconciled_at),
                 reconciled_by = COALESCE(?5, reconciled_by)
             WHERE batch_id = ?1",
            params![
                batch_id.to_string(),
                status.as_str(),
                cloud_session_id,
                reconciled_at.map(|t| t.to_rfc3339()),
                reconciled_by,
            ],
        )?;
        Ok(n > 0)
    }

    /// Delete reconciled batches that closed before `cutoff`.  Events are
    /// never touched by retention; they keep the batch id as audit trail.
    pub fn prune_reconciled_batches(&mut self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let n = self.conn.execute(
            "DELETE FROM offline_batches
             WHERE ended_at IS NOT NULL
               AND reconciliation_status = 'reconciled'
               AND ended_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(n)
    }

    // -----------------------------------------------------------------------
    // Edge identity
    // -----------------------------------------------------------------------

    pub fn load_identity(&self) -> StoreResult<Option<EdgeIdentity>> {
        let mut stmt = self.conn.prepare(
            "SELECT edge_id, site_id, site_name, registered_at FROM edge_identity WHERE id = 1",
        )?;
        Ok(stmt
            .query_row([], |row| {
                Ok(EdgeIdentity {
                    edge_id: row.get(0)?,
                    site_id: row.get(1)?,
                    site_name: row.get(2)?,
                    registered_at: ts(row.get::<_, String>(3)?, 3)?,
                })
            })
            .optional()?)
    }

    pub fn save_identity(&mut self, identity: &EdgeIdentity) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO edge_identity (id, edge_id, site_id, site_name, registered_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 edge_id = excluded.edge_id,
                 site_id = excluded.site_id,
                 site_name = excluded.site_name,
                 registered_at = excluded.registered_at",
            params![
                identity.edge_id,
                identity.site_id,
                identity.site_name,
                identity.registered_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const EVENT_COLUMNS: &str = "id, device_id, cloud_session_id, offline_mode, offline_batch_id, \
     plu_code, product_name, weight_grams, barcode, scale_timestamp, received_at, \
     source_ip, raw_data, sync_status, rejected, cloud_id, synced_at, sync_attempts, \
     last_sync_error";

const BATCH_COLUMNS: &str = "batch_id, device_id, started_at, ended_at, event_count, \
     total_weight_grams, reconciliation_status, cloud_session_id, reconciled_at, \
     reconciled_by, notes";

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

/// Parse an RFC 3339 column value.
fn ts(raw: String, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, format!("timestamp '{raw}': {e}")))
}

fn ts_opt(raw: Option<String>, idx: usize) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    raw.map(|r| ts(r, idx)).transpose()
}

fn uuid_col(raw: String, idx: usize) -> Result<Uuid, rusqlite::Error> {
    Uuid::parse_str(&raw).map_err(|e| conversion_err(idx, format!("uuid '{raw}': {e}")))
}

fn map_device(row: &rusqlite::Row<'_>) -> Result<Device, rusqlite::Error> {
    let device_type_raw: String = row.get(4)?;
    let status_raw: String = row.get(5)?;
    Ok(Device {
        device_id: row.get(0)?,
        global_device_id: row.get(1)?,
        display_name: row.get(2)?,
        location: row.get(3)?,
        device_type: DeviceType::parse(&device_type_raw)
            .ok_or_else(|| conversion_err(4, format!("device_type '{device_type_raw}'")))?,
        status: DeviceStatus::parse(&status_raw)
            .ok_or_else(|| conversion_err(5, format!("status '{status_raw}'")))?,
        tcp_connected: row.get(6)?,
        last_heartbeat_at: ts_opt(row.get(7)?, 7)?,
        last_event_at: ts_opt(row.get(8)?, 8)?,
        heartbeat_count: row.get::<_, i64>(9)? as u64,
        event_count: row.get::<_, i64>(10)? as u64,
        connected_at: ts_opt(row.get(11)?, 11)?,
        source_ip: row.get(12)?,
        active_cloud_session_id: row.get(13)?,
    })
}

fn map_event(row: &rusqlite::Row<'_>) -> Result<WeighingEvent, rusqlite::Error> {
    let sync_raw: String = row.get(13)?;
    Ok(WeighingEvent {
        id: uuid_col(row.get(0)?, 0)?,
        device_id: row.get(1)?,
        cloud_session_id: row.get(2)?,
        offline_mode: row.get(3)?,
        offline_batch_id: row
            .get::<_, Option<String>>(4)?
            .map(|s| uuid_col(s, 4))
            .transpose()?,
        plu_code: row.get(5)?,
        product_name: row.get(6)?,
        weight_grams: row.get(7)?,
        barcode: row.get(8)?,
        scale_timestamp: row.get(9)?,
        received_at: ts(row.get::<_, String>(10)?, 10)?,
        source_ip: row.get(11)?,
        raw_data: row.get(12)?,
        sync_status: SyncStatus::parse(&sync_raw)
            .ok_or_else(|| conversion_err(13, format!("sync_status '{sync_raw}'")))?,
        rejected: row.get(14)?,
        cloud_id: row.get(15)?,
        synced_at: ts_opt(row.get(16)?, 16)?,
        sync_attempts: row.get(17)?,
        last_sync_error: row.get(18)?,
    })
}

fn map_batch(row: &rusqlite::Row<'_>) -> Result<OfflineBatch, rusqlite::Error> {
    let status_raw: String = row.get(6)?;
    Ok(OfflineBatch {
        batch_id: uuid_col(row.get(0)?, 0)?,
        device_id: row.get(1)?,
        started_at: ts(row.get::<_, String>(2)?, 2)?,
        ended_at: ts_opt(row.get(3)?, 3)?,
        event_count: row.get::<_, i64>(4)? as u64,
        total_weight_grams: row.get::<_, i64>(5)? as u64,
        reconciliation_status: ReconciliationStatus::parse(&status_raw)
            .ok_or_else(|| conversion_err(6, format!("reconciliation_status '{status_raw}'")))?,
        cloud_session_id: row.get(7)?,
        reconciled_at: ts_opt(row.get(8)?, 8)?,
        reconciled_by: row.get(9)?,
        notes: row.get(10)?,
    })
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> StoreResult<()> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_device(id: &str) -> Device {
        Device::new(id, "10.0.0.5", Utc::now())
    }

    fn sample_event(device_id: &str) -> WeighingEvent {
        WeighingEvent {
            id: Uuid::new_v4(),
            device_id: device_id.to_owned(),
            cloud_session_id: None,
            offline_mode: false,
            offline_batch_id: None,
            plu_code: "00001".to_owned(),
            product_name: "KIYMA".to_owned(),
            weight_grams: 1234,
            barcode: "00000012340".to_owned(),
            scale_timestamp: "2026-01-30T10:27:00Z".to_owned(),
            received_at: Utc::now(),
            source_ip: "10.0.0.5".to_owned(),
            raw_data: "00001|KIYMA|1234|00000012340|2026-01-30T10:27:00Z".to_owned(),
            sync_status: SyncStatus::Pending,
            rejected: false,
            cloud_id: None,
            synced_at: None,
            sync_attempts: 0,
            last_sync_error: None,
        }
    }

    fn open_batch(device_id: &str) -> OfflineBatch {
        OfflineBatch {
            batch_id: Uuid::new_v4(),
            device_id: device_id.to_owned(),
            started_at: Utc::now(),
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

    #[test]
    fn device_round_trips_through_upsert_and_load() {
        let mut store = Store::open_in_memory().unwrap();
        let mut device = sample_device("SCALE-01");
        device.heartbeat_count = 7;
        device.status = DeviceStatus::Idle;
        store.upsert_device(&device).unwrap();

        let loaded = store.load_devices().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].device_id, "SCALE-01");
        assert_eq!(loaded[0].heartbeat_count, 7);
        assert_eq!(loaded[0].status, DeviceStatus::Idle);
    }

    #[test]
    fn synced_is_terminal() {
        let mut store = Store::open_in_memory().unwrap();
        store.upsert_device(&sample_device("SCALE-01")).unwrap();
        let event = sample_event("SCALE-01");
        store.insert_event(&event).unwrap();

        assert!(store.mark_event_streaming(event.id).unwrap());
        assert!(store.mark_event_synced(event.id, "c-1", Utc::now()).unwrap());
        // A later failure report must not revert the state.
        assert!(!store.mark_event_failed(event.id, "boom", false).unwrap());
        // A duplicate ack must not overwrite the original cloud id.
        assert!(!store.mark_event_synced(event.id, "c-2", Utc::now()).unwrap());

        let loaded = store.get_event(event.id).unwrap().unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::Synced);
        assert_eq!(loaded.cloud_id.as_deref(), Some("c-1"));
        assert!(loaded.synced_at.is_some());
        assert_eq!(loaded.sync_attempts, 1);
    }

    #[test]
    fn requeue_skips_rejected_events() {
        let mut store = Store::open_in_memory().unwrap();
        store.upsert_device(&sample_device("SCALE-01")).unwrap();

        let transport = sample_event("SCALE-01");
        store.insert_event(&transport).unwrap();
        store.mark_event_streaming(transport.id).unwrap();
        store
            .mark_event_failed(transport.id, "connection reset", false)
            .unwrap();

        let rejected = sample_event("SCALE-01");
        store.insert_event(&rejected).unwrap();
        store.mark_event_streaming(rejected.id).unwrap();
        store
            .mark_event_failed(rejected.id, "unknown device", true)
            .unwrap();

        assert_eq!(store.requeue_transport_failures().unwrap(), 1);
        assert_eq!(
            store.get_event(transport.id).unwrap().unwrap().sync_status,
            SyncStatus::Pending
        );
        let still_failed = store.get_event(rejected.id).unwrap().unwrap();
        assert_eq!(still_failed.sync_status, SyncStatus::Failed);
        assert_eq!(still_failed.last_sync_error.as_deref(), Some("unknown device"));
    }

    #[test]
    fn pending_events_drain_oldest_first() {
        let mut store = Store::open_in_memory().unwrap();
        store.upsert_device(&sample_device("SCALE-01")).unwrap();
        let first = sample_event("SCALE-01");
        let second = sample_event("SCALE-01");
        store.insert_event(&first).unwrap();
        store.insert_event(&second).unwrap();

        let pending = store.pending_events(10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[1].id, second.id);

        let limited = store.pending_events(1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, first.id);
    }

    #[test]
    fn second_open_batch_for_same_device_is_rejected() {
        let mut store = Store::open_in_memory().unwrap();
        store.upsert_device(&sample_device("SCALE-02")).unwrap();
        store.insert_batch(&open_batch("SCALE-02")).unwrap();
        let err = store.insert_batch(&open_batch("SCALE-02"));
        assert!(err.is_err(), "partial unique index must reject a second open batch");
    }

    #[test]
    fn end_batch_is_a_one_shot_transition() {
        let mut store = Store::open_in_memory().unwrap();
        store.upsert_device(&sample_device("SCALE-02")).unwrap();
        let batch = open_batch("SCALE-02");
        store.insert_batch(&batch).unwrap();

        assert!(store.end_batch(batch.batch_id, Utc::now()).unwrap());
        assert!(!store.end_batch(batch.batch_id, Utc::now()).unwrap());
        assert!(!store.add_event_to_batch(batch.batch_id, 100).unwrap());
    }

    #[test]
    fn offline_mode_and_batch_id_must_agree() {
        let mut store = Store::open_in_memory().unwrap();
        store.upsert_device(&sample_device("SCALE-03")).unwrap();
        let mut event = sample_event("SCALE-03");
        event.offline_mode = true; // but no batch id
        assert!(store.insert_event(&event).is_err());
    }

    #[test]
    fn retention_prunes_only_old_reconciled_batches() {
        let mut store = Store::open_in_memory().unwrap();
        store.upsert_device(&sample_device("SCALE-04")).unwrap();

        let old = open_batch("SCALE-04");
        store.insert_batch(&old).unwrap();
        store
            .end_batch(old.batch_id, Utc::now() - Duration::days(60))
            .unwrap();
        store
            .set_batch_reconciliation(
                old.batch_id,
                ReconciliationStatus::Reconciled,
                Some("sess-1"),
                Some(Utc::now() - Duration::days(59)),
                Some("ops"),
            )
            .unwrap();

        let recent = open_batch("SCALE-04");
        store.insert_batch(&recent).unwrap();
        store.end_batch(recent.batch_id, Utc::now()).unwrap();

        let pruned = store
            .prune_reconciled_batches(Utc::now() - Duration::days(30))
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get_batch(old.batch_id).unwrap().is_none());
        assert!(store.get_batch(recent.batch_id).unwrap().is_some());
    }

    #[test]
    fn identity_upsert_replaces_singleton() {
        let mut store = Store::open_in_memory().unwrap();
        assert!(store.load_identity().unwrap().is_none());

        store
            .save_identity(&EdgeIdentity {
                edge_id: "not-a-uuid".to_owned(),
                site_id: None,
                site_name: None,
                registered_at: Utc::now(),
            })
            .unwrap();
        // Malformed values must still round-trip; the REST client decides
        // what to do with them.
        assert_eq!(store.load_identity().unwrap().unwrap().edge_id, "not-a-uuid");

        store
            .save_identity(&EdgeIdentity {
                edge_id: "4fd1f9cf-2bb5-4b50-9a40-1e03fca1df8e".to_owned(),
                site_id: Some("site-7".to_owned()),
                site_name: Some("Main plant".to_owned()),
                registered_at: Utc::now(),
            })
            .unwrap();
        let loaded = store.load_identity().unwrap().unwrap();
        assert_eq!(loaded.edge_id, "4fd1f9cf-2bb5-4b50-9a40-1e03fca1df8e");
        assert_eq!(loaded.site_id.as_deref(), Some("site-7"));
    }

    #[test]
    fn demote_streaming_recovers_crashed_sends() {
        let mut store = Store::open_in_memory().unwrap();
        store.upsert_device(&sample_device("SCALE-05")).unwrap();
        let event = sample_event("SCALE-05");
        store.insert_event(&event).unwrap();
        store.mark_event_streaming(event.id).unwrap();

        assert_eq!(store.demote_streaming_events().unwrap(), 1);
        assert_eq!(
            store.get_event(event.id).unwrap().unwrap().sync_status,
            SyncStatus::Pending
        );
    }
}
