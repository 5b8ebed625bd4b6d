//! End-to-end happy path: a scale registers over TCP, heartbeats, sends an
//! event, and the event streams to the Cloud and lands `synced`.

mod support;

use gateway::model::{DeviceStatus, SyncStatus};
use serde_json::json;
use support::{MockCloud, start_gateway, test_config, wait_until};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const EVENT_LINE: &[u8] = b"00001|KIYMA|1234|00000012340|2026-01-30T10:27:00Z\n";

#[tokio::test]
async fn online_event_streams_to_cloud_and_syncs() {
    let cloud = MockCloud::start().await;
    let harness = start_gateway(test_config(&cloud.url())).await;

    let mut scale = TcpStream::connect(harness.scale_addr).await.unwrap();
    scale.write_all(b"SCALE-01\r\n").await.unwrap();
    scale.write_all(b"HB\r\n").await.unwrap();
    scale.write_all(EVENT_LINE).await.unwrap();

    wait_until("event synced", || {
        let store = harness.store.clone();
        async move {
            store
                .lock()
                .await
                .events_for_device("SCALE-01")
                .unwrap()
                .first()
                .is_some_and(|e| e.sync_status == SyncStatus::Synced)
        }
    })
    .await;

    let device = harness.registry.get("SCALE-01").await.unwrap();
    assert_eq!(device.status, DeviceStatus::Online);
    assert!(device.tcp_connected);
    assert_eq!(device.heartbeat_count, 1);
    assert_eq!(device.event_count, 1);

    let events = harness.store.lock().await.events_for_device("SCALE-01").unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert!(!event.offline_mode);
    assert!(event.offline_batch_id.is_none());
    assert_eq!(event.plu_code, "00001");
    assert_eq!(event.product_name, "KIYMA");
    assert_eq!(event.weight_grams, 1234);
    assert_eq!(event.barcode, "00000012340");
    assert_eq!(event.cloud_id.as_deref(), Some("c-1"));
    assert!(event.synced_at.is_some());
    assert_eq!(event.sync_attempts, 1);

    // Every authenticated request carried the issued edge id (the identity
    // was minted through /register on first use).
    let issued = cloud.issued_edge_id().to_string();
    let posted = cloud.requests_to("/events");
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].edge_id.as_deref(), Some(issued.as_str()));
    assert_eq!(posted[0].body["localEventId"], json!(event.id.to_string()));
    assert_eq!(posted[0].body["offlineMode"], json!(false));
}

#[tokio::test]
async fn events_carry_the_cached_cloud_session() {
    let cloud = MockCloud::start().await;
    cloud.set_session(
        "SCALE-01",
        json!({
            "cloudSessionId": "sess-42",
            "animalId": "animal-9",
            "animalTag": "TAG-009",
            "animalSpecies": "bovine",
            "operatorId": "op-3",
            "status": "active",
        }),
    );
    let harness = start_gateway(test_config(&cloud.url())).await;

    let mut scale = TcpStream::connect(harness.scale_addr).await.unwrap();
    scale.write_all(b"SCALE-01\n").await.unwrap();

    // The session poller only asks about connected devices, so the cache
    // fills shortly after registration.
    wait_until("session cached", || {
        let sessions = harness.sessions.clone();
        async move { sessions.get("SCALE-01").await.is_some() }
    })
    .await;
    assert_eq!(
        harness
            .registry
            .get("SCALE-01")
            .await
            .unwrap()
            .active_cloud_session_id
            .as_deref(),
        Some("sess-42")
    );

    scale.write_all(EVENT_LINE).await.unwrap();
    wait_until("event synced", || {
        let store = harness.store.clone();
        async move {
            store
                .lock()
                .await
                .events_for_device("SCALE-01")
                .unwrap()
                .first()
                .is_some_and(|e| e.sync_status == SyncStatus::Synced)
        }
    })
    .await;

    let events = harness.store.lock().await.events_for_device("SCALE-01").unwrap();
    assert_eq!(events[0].cloud_session_id.as_deref(), Some("sess-42"));

    let posted = cloud.requests_to("/events");
    assert_eq!(posted[0].body["cloudSessionId"], json!("sess-42"));
}

#[tokio::test]
async fn malformed_event_lines_are_discarded_without_device_state_change() {
    let cloud = MockCloud::start().await;
    let harness = start_gateway(test_config(&cloud.url())).await;

    let mut scale = TcpStream::connect(harness.scale_addr).await.unwrap();
    scale.write_all(b"SCALE-05\n").await.unwrap();
    scale
        .write_all(b"00001|KIYMA|not-a-weight|00000012340|2026-01-30T10:27:00Z\n")
        .await
        .unwrap();
    scale.write_all(b"HB\n").await.unwrap();

    wait_until("heartbeat landed", || {
        let registry = harness.registry.clone();
        async move {
            registry
                .get("SCALE-05")
                .await
                .is_some_and(|d| d.heartbeat_count == 1)
        }
    })
    .await;

    let device = harness.registry.get("SCALE-05").await.unwrap();
    assert_eq!(device.event_count, 0, "malformed line must not count as an event");
    assert!(harness
        .store
        .lock()
        .await
        .events_for_device("SCALE-05")
        .unwrap()
        .is_empty());
}
