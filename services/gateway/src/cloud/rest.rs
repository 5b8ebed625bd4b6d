//! Authenticated Cloud REST client.
//!
//! # Responsibilities
//! - Base-URL normalization: exactly one `/edge` prefix for edge-scoped
//!   paths, idempotent across restarts.
//! - Headers: `X-Client-Type` / `X-Client-Version` on everything,
//!   `X-Edge-Id` (+ `X-Site-Id` when known) on authenticated paths.
//! - Identity resolution: a missing/malformed stored edge id triggers the
//!   injected ensurer before the request; a 401/404 whose body names the
//!   edge identity triggers one recovery + one retry, never more.
//! - Retry: 429/5xx/network/timeout retried with exponential backoff up to
//!   `max_retries`; other 4xx returned as-is so callers can inspect.
//! - Online tracking: a success inside 30 s wins over the stored flag;
//!   transitions fan out on a broadcast channel.
//! - Offline queue: event-class requests enqueue when offline, bounded
//!   drop-oldest, drained in insertion order on reconnect.

use crate::cloud::types::{
    BatchRequest, BatchResponse, DeviceStatusReport, EventAck, EventPayload,
    OfflineBatchEndNotice, RegisterRequest, RegisterResponse, SessionsResponse,
};
use crate::config::CloudConfig;
use crate::model::EdgeIdentity;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::{Uuid, Variant};

const CLIENT_TYPE: &str = "carnitrack-edge";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A success newer than this beats the stored online flag.
const ONLINE_WINDOW: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Online-state transitions, broadcast to the batch manager, the sync
/// service, the session poller, and the queue flush task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Connected,
    Disconnected,
}

/// Why identity recovery ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    /// Stored edge id absent or not a canonical UUID.
    MissingOrInvalid,
    /// The Cloud rejected the stored edge id on an authenticated request.
    AuthRecovery,
}

impl RecoveryReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryReason::MissingOrInvalid => "missing_or_invalid",
            RecoveryReason::AuthRecovery => "auth_recovery",
        }
    }
}

#[derive(Debug, Error)]
pub enum RestError {
    /// Non-2xx response outside the retry budget.  `register()` callers
    /// inspect `status`/`body` to distinguish rejection shapes.
    #[error("cloud returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("response body: {0}")]
    Body(String),
    #[error("queue full")]
    QueueFull,
    #[error("no identity handler installed")]
    NoIdentityHandler,
    #[error("identity recovery returned an invalid edge id: {0}")]
    InvalidRecoveredIdentity(String),
    #[error("identity persistence: {0}")]
    IdentityPersistence(String),
    #[error("gateway shutting down")]
    Teardown,
}

/// Installed by the startup wiring; invoked by the client whenever the
/// stored identity is missing, malformed, or rejected by the Cloud.
#[async_trait]
pub trait IdentityEnsurer: Send + Sync {
    async fn ensure_edge_identity(
        &self,
        client: &RestClient,
        reason: RecoveryReason,
    ) -> Result<EdgeIdentity, RestError>;
}

// ---------------------------------------------------------------------------
// URL + edge-id validation helpers
// ---------------------------------------------------------------------------

/// Normalize the configured API URL to end in exactly one `/edge` segment.
///
/// Idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.ends_with("/edge") {
        trimmed.to_owned()
    } else {
        format!("{trimmed}/edge")
    }
}

/// Strict edge-id check: canonical hyphenated RFC 4122 text, version 1–5.
///
/// The uuid crate accepts braced/simple/urn forms; headers must carry the
/// canonical 36-char form, so the shape is checked first.
pub fn is_valid_edge_id(s: &str) -> bool {
    if s.len() != 36 {
        return false;
    }
    let Ok(parsed) = Uuid::try_parse(s) else {
        return false;
    };
    matches!(parsed.get_version_num(), 1..=5) && parsed.get_variant() == Variant::RFC4122
}

/// True when a 401/404 body blames the edge identity.
fn mentions_edge_identity(body: &str) -> bool {
    let lower = body.to_lowercase();
    [
        "missing",
        "invalid edge",
        "unknown edge",
        "invalid_edge",
        "unknown_edge",
        "x-edge-id",
    ]
    .iter()
    .any(|marker| lower.contains(marker))
}

/// `delay = min(retry_delay · multiplier^attempt, max_retry_delay)`.
fn backoff_delay(cfg: &CloudConfig, attempt: u32) -> Duration {
    let base = cfg.retry_delay_ms as f64 * cfg.backoff_multiplier.powi(attempt as i32);
    Duration::from_millis(base.min(cfg.max_retry_delay_ms as f64) as u64)
}

// ---------------------------------------------------------------------------
// RestClient
// ---------------------------------------------------------------------------

struct QueuedRequest {
    path: String,
    body: Value,
    responder: oneshot::Sender<Result<Value, RestError>>,
}

/// The single Cloud-facing HTTP client.  Owns the edge identity record and
/// the offline request queue; is the sole authority on online vs offline.
pub struct RestClient {
    http: reqwest::Client,
    base: String,
    cfg: CloudConfig,
    identity: std::sync::RwLock<Option<EdgeIdentity>>,
    ensurer: std::sync::RwLock<Option<Arc<dyn IdentityEnsurer>>>,
    recovery_lock: Mutex<()>,
    online: AtomicBool,
    last_success: std::sync::Mutex<Option<Instant>>,
    connectivity_tx: broadcast::Sender<ConnectivityEvent>,
    queue: Mutex<VecDeque<QueuedRequest>>,
}

enum AttemptOutcome {
    Success(Value),
    Terminal(RestError),
    Retryable(RestError),
}

impl RestClient {
    pub fn new(cfg: CloudConfig) -> Result<Self, RestError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| RestError::Transport(e.to_string()))?;
        let (connectivity_tx, _) = broadcast::channel(64);
        Ok(RestClient {
            http,
            base: normalize_base_url(&cfg.api_url),
            cfg,
            identity: std::sync::RwLock::new(None),
            ensurer: std::sync::RwLock::new(None),
            recovery_lock: Mutex::new(()),
            // Optimistic until the first failure: a gateway that boots
            // while the Cloud is down must still observe an
            // online→offline transition to trigger offline batching.
            online: AtomicBool::new(true),
            last_success: std::sync::Mutex::new(None),
            connectivity_tx,
            queue: Mutex::new(VecDeque::new()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    /// Install the singleton identity record.  Called at boot (from the
    /// store) and by the ensurer after a successful (re-)registration.
    pub fn install_identity(&self, identity: EdgeIdentity) {
        *self.identity.write().expect("identity lock poisoned") = Some(identity);
    }

    pub fn current_identity(&self) -> Option<EdgeIdentity> {
        self.identity.read().expect("identity lock poisoned").clone()
    }

    pub fn set_identity_ensurer(&self, ensurer: Arc<dyn IdentityEnsurer>) {
        *self.ensurer.write().expect("ensurer lock poisoned") = Some(ensurer);
    }

    /// The stored edge id, only if it passes the canonical UUID grammar.
    fn valid_edge_id(&self) -> Option<String> {
        let guard = self.identity.read().expect("identity lock poisoned");
        guard
            .as_ref()
            .map(|i| i.edge_id.clone())
            .filter(|id| is_valid_edge_id(id))
    }

    fn site_id(&self) -> Option<String> {
        let guard = self.identity.read().expect("identity lock poisoned");
        guard.as_ref().and_then(|i| i.site_id.clone())
    }

    async fn recover_identity(&self, reason: RecoveryReason) -> Result<String, RestError> {
        let _guard = self.recovery_lock.lock().await;

        // Another request may have completed recovery while we waited.
        if reason == RecoveryReason::MissingOrInvalid {
            if let Some(id) = self.valid_edge_id() {
                return Ok(id);
            }
        }

        let ensurer = self
            .ensurer
            .read()
            .expect("ensurer lock poisoned")
            .clone()
            .ok_or(RestError::NoIdentityHandler)?;

        info!(reason = reason.as_str(), "recovering edge identity");
        let identity = ensurer.ensure_edge_identity(self, reason).await?;
        if !is_valid_edge_id(&identity.edge_id) {
            return Err(RestError::InvalidRecoveredIdentity(identity.edge_id));
        }
        let edge_id = identity.edge_id.clone();
        self.install_identity(identity);
        Ok(edge_id)
    }

    // -----------------------------------------------------------------------
    // Online / offline
    // -----------------------------------------------------------------------

    /// True when a request succeeded within the last 30 s; otherwise the
    /// stored flag (slight drift is acceptable by design).
    pub fn is_online(&self) -> bool {
        let recent = self
            .last_success
            .lock()
            .expect("last_success lock poisoned")
            .map(|t| t.elapsed() < ONLINE_WINDOW)
            .unwrap_or(false);
        recent || self.online.load(Ordering::SeqCst)
    }

    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.connectivity_tx.subscribe()
    }

    fn mark_online(&self) {
        *self
            .last_success
            .lock()
            .expect("last_success lock poisoned") = Some(Instant::now());
        if !self.online.swap(true, Ordering::SeqCst) {
            info!("cloud connection established");
            let _ = self.connectivity_tx.send(ConnectivityEvent::Connected);
        }
    }

    fn mark_offline(&self) {
        if self.online.swap(false, Ordering::SeqCst) {
            warn!("cloud unreachable, entering offline mode");
            let _ = self.connectivity_tx.send(ConnectivityEvent::Disconnected);
        }
    }

    // -----------------------------------------------------------------------
    // Typed API
    // -----------------------------------------------------------------------

    /// (Re-)register this edge.  Unauthenticated; non-2xx responses come
    /// back as `RestError::Status` with the raw status and body so
    /// identity-repair logic can distinguish rejection shapes.
    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, RestError> {
        let body = serde_json::to_value(request).map_err(|e| RestError::Body(e.to_string()))?;
        let value = self
            .execute_with_retry(Method::POST, "/register", Some(&body), None, None)
            .await?;
        serde_json::from_value(value).map_err(|e| RestError::Body(e.to_string()))
    }

    /// Active sessions for the given devices.
    pub async fn fetch_sessions(&self, device_ids: &[String]) -> Result<SessionsResponse, RestError> {
        let path = format!("/sessions?device_ids={}", device_ids.join(","));
        let value = self
            .authenticated_json(Method::GET, &path, None, None)
            .await?;
        serde_json::from_value(value).map_err(|e| RestError::Body(e.to_string()))
    }

    /// Stream one event.  Event-class: queues when offline.
    pub async fn send_event(&self, payload: &EventPayload) -> Result<EventAck, RestError> {
        let body = serde_json::to_value(payload).map_err(|e| RestError::Body(e.to_string()))?;
        let value = self.post_event_class("/events", body).await?;
        serde_json::from_value(value).map_err(|e| RestError::Body(e.to_string()))
    }

    /// Ship a slice of events.  Event-class: queues when offline.
    pub async fn send_event_batch(
        &self,
        events: Vec<EventPayload>,
    ) -> Result<BatchResponse, RestError> {
        let body = serde_json::to_value(BatchRequest { events })
            .map_err(|e| RestError::Body(e.to_string()))?;
        let value = self.post_event_class("/events/batch", body).await?;
        serde_json::from_value(value).map_err(|e| RestError::Body(e.to_string()))
    }

    /// Report a device status transition.  Event-class: queues when offline.
    pub async fn post_device_status(&self, report: &DeviceStatusReport) -> Result<(), RestError> {
        let body = serde_json::to_value(report).map_err(|e| RestError::Body(e.to_string()))?;
        self.post_event_class("/devices/status", body).await?;
        Ok(())
    }

    /// Fetch the edge configuration document.
    pub async fn fetch_edge_config(&self) -> Result<Value, RestError> {
        self.authenticated_json(Method::GET, "/config", None, None)
            .await
    }

    /// Announce a closed offline batch ahead of its event flush.
    pub async fn notify_offline_batch_end(
        &self,
        notice: &OfflineBatchEndNotice,
    ) -> Result<(), RestError> {
        let body = serde_json::to_value(notice).map_err(|e| RestError::Body(e.to_string()))?;
        self.authenticated_json(Method::POST, "/offline-batches/end", Some(&body), None)
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Request path
    // -----------------------------------------------------------------------

    /// Event-class POST: enqueue when offline (if configured), send
    /// directly otherwise.
    async fn post_event_class(&self, path: &str, body: Value) -> Result<Value, RestError> {
        if self.cfg.queue_when_offline && !self.is_online() {
            debug!(path, "offline, queueing event-class request");
            return self.enqueue(path, body).await;
        }
        self.authenticated_json(Method::POST, path, Some(&body), None)
            .await
    }

    /// Authenticated request with identity resolution and single-shot auth
    /// recovery.
    async fn authenticated_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout_override: Option<Duration>,
    ) -> Result<Value, RestError> {
        let edge_id = match self.valid_edge_id() {
            Some(id) => id,
            None => {
                self.recover_identity(RecoveryReason::MissingOrInvalid)
                    .await?
            }
        };

        let first = self
            .execute_with_retry(
                method.clone(),
                path,
                body,
                Some(&edge_id),
                timeout_override,
            )
            .await;

        match first {
            Err(RestError::Status {
                status,
                body: reject_body,
            }) if (status == 401 || status == 404) && mentions_edge_identity(&reject_body) => {
                debug!(status, body = %reject_body, "request rejected for identity, recovering");
                let fresh_id = self.recover_identity(RecoveryReason::AuthRecovery).await?;
                // One retry with the new identity; a second rejection is
                // surfaced as-is and does not re-trigger recovery.
                self.execute_with_retry(method, path, body, Some(&fresh_id), timeout_override)
                    .await
            }
            other => other,
        }
    }

    /// Retry loop: 429/5xx/network/timeout under the backoff budget, other
    /// 4xx terminal, success marks online, exhaustion marks offline.
    async fn execute_with_retry(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        edge_id: Option<&str>,
        timeout_override: Option<Duration>,
    ) -> Result<Value, RestError> {
        let timeout =
            timeout_override.unwrap_or(Duration::from_millis(self.cfg.event_send_timeout_ms));
        let mut attempt: u32 = 0;
        loop {
            match self
                .execute_once(method.clone(), path, body, edge_id, timeout)
                .await
            {
                AttemptOutcome::Success(value) => {
                    self.mark_online();
                    return Ok(value);
                }
                AttemptOutcome::Terminal(err) => return Err(err),
                AttemptOutcome::Retryable(err) => {
                    if attempt >= self.cfg.max_retries {
                        self.mark_offline();
                        return Err(err);
                    }
                    let delay = backoff_delay(&self.cfg, attempt);
                    debug!(path, attempt, delay_ms = delay.as_millis() as u64, error = %err,
                        "retrying cloud request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn execute_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        edge_id: Option<&str>,
        timeout: Duration,
    ) -> AttemptOutcome {
        let url = format!("{}{}", self.base, path);
        let mut request = self
            .http
            .request(method, &url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .header("X-Client-Type", CLIENT_TYPE)
            .header("X-Client-Version", CLIENT_VERSION);
        if let Some(edge_id) = edge_id {
            request = request.header("X-Edge-Id", edge_id);
            if let Some(site_id) = self.site_id() {
                request = request.header("X-Site-Id", site_id);
            }
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return AttemptOutcome::Retryable(RestError::Transport(e.to_string())),
        };

        let status = response.status();
        if status.is_success() {
            let text = match response.text().await {
                Ok(t) => t,
                Err(e) => return AttemptOutcome::Retryable(RestError::Transport(e.to_string())),
            };
            if text.trim().is_empty() {
                return AttemptOutcome::Success(Value::Null);
            }
            return match serde_json::from_str(&text) {
                Ok(value) => AttemptOutcome::Success(value),
                Err(e) => AttemptOutcome::Terminal(RestError::Body(e.to_string())),
            };
        }

        let code = status.as_u16();
        let body_text = response.text().await.unwrap_or_default();
        let err = RestError::Status {
            status: code,
            body: body_text,
        };
        if code == 429 || status.is_server_error() {
            AttemptOutcome::Retryable(err)
        } else {
            AttemptOutcome::Terminal(err)
        }
    }

    // -----------------------------------------------------------------------
    // Offline queue
    // -----------------------------------------------------------------------

    async fn enqueue(&self, path: &str, body: Value) -> Result<Value, RestError> {
        let (responder, rx) = oneshot::channel();
        {
            let mut queue = self.queue.lock().await;
            queue.push_back(QueuedRequest {
                path: path.to_owned(),
                body,
                responder,
            });
            if queue.len() > self.cfg.max_queue_size {
                if let Some(oldest) = queue.pop_front() {
                    warn!(path = %oldest.path, "offline queue full, dropping oldest request");
                    let _ = oldest.responder.send(Err(RestError::QueueFull));
                }
            }
        }
        rx.await.unwrap_or(Err(RestError::Teardown))
    }

    pub async fn queued_request_count(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Drain the queue in insertion order.  A transport failure re-queues
    /// the request at the tail and ends the round once the client is
    /// offline again; a Cloud response (any status) resolves the caller.
    pub async fn drain_queue(&self) {
        loop {
            let Some(item) = self.queue.lock().await.pop_front() else {
                return;
            };
            match self
                .authenticated_json(Method::POST, &item.path, Some(&item.body), None)
                .await
            {
                Ok(value) => {
                    let _ = item.responder.send(Ok(value));
                }
                Err(RestError::Transport(msg)) => {
                    warn!(path = %item.path, error = %msg, "queued request failed, re-queueing");
                    self.queue.lock().await.push_back(item);
                    if !self.is_online() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = item.responder.send(Err(err));
                }
            }
        }
    }

    async fn fail_queue_on_teardown(&self) {
        let mut queue = self.queue.lock().await;
        while let Some(item) = queue.pop_front() {
            let _ = item.responder.send(Err(RestError::Teardown));
        }
    }
}

/// Spawn the single queue consumer: drains on every `Connected` transition
/// and fails all pending requests at shutdown.
pub fn spawn_queue_flush_task(
    client: Arc<RestClient>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut connectivity = client.subscribe_connectivity();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        client.fail_queue_on_teardown().await;
                        return;
                    }
                }
                event = connectivity.recv() => match event {
                    Ok(ConnectivityEvent::Connected) => client.drain_queue().await,
                    Ok(ConnectivityEvent::Disconnected) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connectivity events lagged, draining queue defensively");
                        if client.is_online() {
                            client.drain_queue().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    })
}
