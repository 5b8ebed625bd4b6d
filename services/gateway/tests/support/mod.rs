//! Shared test support: an in-process mock Cloud and a fully-wired gateway
//! harness on ephemeral ports.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use gateway::activity::{self, ActivityMonitor};
use gateway::batches::{self, BatchManager};
use gateway::cloud::identity::EdgeRegistrar;
use gateway::cloud::rest::{self, RestClient};
use gateway::cloud::sync::{self, CloudSyncService};
use gateway::config::GatewayConfig;
use gateway::events::EventProcessor;
use gateway::registry::DeviceRegistry;
use gateway::server::ScaleServer;
use gateway::session_cache::{self, SessionCache};
use gateway::storage::Store;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Mock Cloud
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub edge_id: Option<String>,
    pub body: Value,
}

/// A scripted response: returned once, in order, before default behavior
/// resumes.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub status: u16,
    pub body: Value,
}

#[derive(Default)]
pub struct MockCloudState {
    pub requests: std::sync::Mutex<Vec<RecordedRequest>>,
    pub issued_edge_id: std::sync::Mutex<Option<Uuid>>,
    pub sessions: std::sync::Mutex<HashMap<String, Value>>,
    pub events_script: std::sync::Mutex<VecDeque<ScriptedResponse>>,
    pub down: AtomicBool,
    event_counter: AtomicU64,
}

impl MockCloudState {
    fn record(&self, method: &str, path: &str, headers: &HeaderMap, body: Value) {
        let edge_id = headers
            .get("x-edge-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        self.requests
            .lock()
            .unwrap()
            .push(RecordedRequest {
                method: method.to_owned(),
                path: path.to_owned(),
                edge_id,
                body,
            });
    }

    fn next_cloud_event_id(&self) -> String {
        let n = self.event_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("c-{n}")
    }
}

pub struct MockCloud {
    pub addr: SocketAddr,
    pub state: Arc<MockCloudState>,
}

impl MockCloud {
    pub async fn start() -> Self {
        let state = Arc::new(MockCloudState::default());
        *state.issued_edge_id.lock().unwrap() = Some(Uuid::new_v4());

        let app = Router::new()
            .route("/edge/register", post(handle_register))
            .route("/edge/sessions", get(handle_sessions))
            .route("/edge/events", post(handle_event))
            .route("/edge/events/batch", post(handle_event_batch))
            .route("/edge/devices/status", post(handle_device_status))
            .route("/edge/config", get(handle_config))
            .route("/edge/offline-batches/end", post(handle_batch_end))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockCloud { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Simulate an outage: every route answers 503 until lifted.
    pub fn set_down(&self, down: bool) {
        self.state.down.store(down, Ordering::SeqCst);
    }

    pub fn issued_edge_id(&self) -> Uuid {
        self.state.issued_edge_id.lock().unwrap().unwrap()
    }

    pub fn set_session(&self, device_id: &str, session: Value) {
        self.state
            .sessions
            .lock()
            .unwrap()
            .insert(device_id.to_owned(), session);
    }

    pub fn script_event_response(&self, status: u16, body: Value) {
        self.state
            .events_script
            .lock()
            .unwrap()
            .push_back(ScriptedResponse { status, body });
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }
}

fn service_unavailable() -> (StatusCode, Json<Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": "cloud down"})),
    )
}

async fn handle_register(
    State(state): State<Arc<MockCloudState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.record("POST", "/register", &headers, body);
    if state.down.load(Ordering::SeqCst) {
        return service_unavailable();
    }
    let edge_id = state.issued_edge_id.lock().unwrap().unwrap();
    (
        StatusCode::OK,
        Json(json!({"edgeId": edge_id, "siteId": "site-1", "siteName": "Test plant"})),
    )
}

async fn handle_sessions(
    State(state): State<Arc<MockCloudState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    state.record("GET", "/sessions", &headers, Value::Null);
    if state.down.load(Ordering::SeqCst) {
        return service_unavailable();
    }
    let sessions = state.sessions.lock().unwrap().clone();
    (StatusCode::OK, Json(json!({"sessions": sessions})))
}

async fn handle_event(
    State(state): State<Arc<MockCloudState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.record("POST", "/events", &headers, body);
    if state.down.load(Ordering::SeqCst) {
        return service_unavailable();
    }
    if let Some(scripted) = state.events_script.lock().unwrap().pop_front() {
        return (
            StatusCode::from_u16(scripted.status).unwrap(),
            Json(scripted.body),
        );
    }
    (
        StatusCode::OK,
        Json(json!({"cloudEventId": state.next_cloud_event_id(), "status": "accepted"})),
    )
}

async fn handle_event_batch(
    State(state): State<Arc<MockCloudState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.record("POST", "/events/batch", &headers, body.clone());
    if state.down.load(Ordering::SeqCst) {
        return service_unavailable();
    }
    let results: Vec<Value> = body["events"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .map(|event| {
            json!({
                "localEventId": event["localEventId"],
                "cloudEventId": state.next_cloud_event_id(),
                "status": "accepted",
            })
        })
        .collect();
    (StatusCode::OK, Json(json!({"results": results})))
}

async fn handle_device_status(
    State(state): State<Arc<MockCloudState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.record("POST", "/devices/status", &headers, body);
    if state.down.load(Ordering::SeqCst) {
        return service_unavailable();
    }
    (StatusCode::OK, Json(json!({})))
}

async fn handle_config(
    State(state): State<Arc<MockCloudState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    state.record("GET", "/config", &headers, Value::Null);
    if state.down.load(Ordering::SeqCst) {
        return service_unavailable();
    }
    (StatusCode::OK, Json(json!({"sessionPollIntervalMs": 5000})))
}

async fn handle_batch_end(
    State(state): State<Arc<MockCloudState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.record("POST", "/offline-batches/end", &headers, body);
    if state.down.load(Ordering::SeqCst) {
        return service_unavailable();
    }
    (StatusCode::OK, Json(json!({"reconciliationStatus": "in_progress"})))
}

// ---------------------------------------------------------------------------
// Gateway harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<Mutex<Store>>,
    pub registry: Arc<DeviceRegistry>,
    pub batch_manager: Arc<BatchManager>,
    pub events: Arc<EventProcessor>,
    pub client: Arc<RestClient>,
    pub sync_service: Arc<CloudSyncService>,
    pub sessions: Arc<SessionCache>,
    pub scale_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Test-paced config: production defaults compressed to test time.
pub fn test_config(api_url: &str) -> GatewayConfig {
    let mut cfg = gateway::config::load_config_from_str(&format!(
        "[cloud]\napi_url = \"{api_url}\"\n"
    ))
    .unwrap();
    cfg.cloud.event_send_timeout_ms = 2_000;
    cfg.cloud.max_retries = 1;
    cfg.cloud.retry_delay_ms = 20;
    cfg.cloud.max_retry_delay_ms = 100;
    cfg.heartbeat.check_interval_ms = 100;
    cfg.session_cache.poll_interval_ms = 200;
    cfg.session_cache.cleanup_interval_ms = 500;
    cfg.offline.trigger_delay_ms = 100;
    cfg.sync.backlog_sync_delay_ms = 50;
    cfg.sync.retry_interval_ms = 300;
    cfg
}

/// Wire the full service graph against the given Cloud URL and spawn all
/// the background tasks, exactly as `main` does, on ephemeral ports.
pub async fn start_gateway(cfg: GatewayConfig) -> Harness {
    let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));

    let client = Arc::new(RestClient::new(cfg.cloud.clone()).unwrap());
    if let Some(identity) = store.lock().await.load_identity().unwrap() {
        client.install_identity(identity);
    }
    client.set_identity_ensurer(Arc::new(EdgeRegistrar::new(Arc::clone(&store))));

    let registry = Arc::new(DeviceRegistry::load(Arc::clone(&store)).await.unwrap());
    let batch_manager = Arc::new(BatchManager::new(
        Arc::clone(&store),
        cfg.offline.trigger_delay_ms,
        cfg.offline.max_events_per_batch,
        cfg.offline.retention_days,
    ));
    let events = Arc::new(EventProcessor::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&batch_manager),
    ));
    let monitor = Arc::new(ActivityMonitor::new(
        Arc::clone(&registry),
        cfg.heartbeat.clone(),
        cfg.activity.clone(),
    ));
    let sessions = Arc::new(SessionCache::new(
        Arc::clone(&registry),
        Arc::clone(&client),
        cfg.session_cache.clone(),
    ));
    let sync_service = Arc::new(CloudSyncService::new(
        Arc::clone(&events),
        Arc::clone(&batch_manager),
        Arc::clone(&registry),
        Arc::clone(&client),
        cfg.sync.clone(),
    ));

    let scale_server = ScaleServer::bind(
        "127.0.0.1",
        0,
        Arc::clone(&registry),
        Arc::clone(&events),
    )
    .await
    .unwrap();
    let scale_addr = scale_server.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(scale_server.run(shutdown_rx.clone()));
    activity::spawn_monitor_task(Arc::clone(&monitor), shutdown_rx.clone());
    activity::spawn_status_reporter_task(
        monitor,
        Arc::clone(&registry),
        Arc::clone(&client),
        shutdown_rx.clone(),
    );
    session_cache::spawn_poll_task(Arc::clone(&sessions), shutdown_rx.clone());
    session_cache::spawn_cleanup_task(Arc::clone(&sessions), shutdown_rx.clone());
    batches::spawn_transition_task(
        Arc::clone(&batch_manager),
        Arc::clone(&client),
        shutdown_rx.clone(),
    );
    batches::spawn_retention_task(Arc::clone(&batch_manager), shutdown_rx.clone());
    rest::spawn_queue_flush_task(Arc::clone(&client), shutdown_rx.clone());
    sync::spawn_sync_task(Arc::clone(&sync_service), shutdown_rx.clone());

    Harness {
        store,
        registry,
        batch_manager,
        events,
        client,
        sync_service,
        sessions,
        scale_addr,
        shutdown_tx,
    }
}

/// Poll `check` until it holds or the timeout elapses.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for: {what}"));
}
