//! Default identity ensurer: (re-)register against the Cloud and persist
//! the issued identity.
//!
//! Installed into the REST client at startup; the client invokes it when
//! the stored edge id is missing, malformed, or rejected.  The singleton
//! identity record is written only here (and read everywhere else through
//! the client).

use crate::cloud::rest::{IdentityEnsurer, RecoveryReason, RestClient, RestError, is_valid_edge_id};
use crate::cloud::types::RegisterRequest;
use crate::model::EdgeIdentity;
use crate::storage::Store;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Capabilities advertised in the registration body.
fn capabilities() -> Vec<String> {
    ["events", "event_batches", "sessions", "offline_batches", "device_status"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
}

pub struct EdgeRegistrar {
    store: Arc<Mutex<Store>>,
}

impl EdgeRegistrar {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        EdgeRegistrar { store }
    }
}

#[async_trait]
impl IdentityEnsurer for EdgeRegistrar {
    async fn ensure_edge_identity(
        &self,
        client: &RestClient,
        reason: RecoveryReason,
    ) -> Result<EdgeIdentity, RestError> {
        let current = client.current_identity();

        // Offer the previous identity back only when it is well-formed;
        // a malformed stored id must not reach the wire.
        let request = RegisterRequest {
            edge_id: current
                .as_ref()
                .map(|i| i.edge_id.clone())
                .filter(|id| is_valid_edge_id(id)),
            site_id: current.as_ref().and_then(|i| i.site_id.clone()),
            site_name: current.as_ref().and_then(|i| i.site_name.clone()),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            capabilities: capabilities(),
        };

        info!(reason = reason.as_str(), "registering edge with cloud");
        let response = client.register(&request).await?;

        let identity = EdgeIdentity {
            edge_id: response.edge_id.to_string(),
            site_id: response.site_id.or(request.site_id),
            site_name: response.site_name.or(request.site_name),
            registered_at: Utc::now(),
        };

        self.store
            .lock()
            .await
            .save_identity(&identity)
            .map_err(|e| RestError::IdentityPersistence(e.to_string()))?;

        info!(edge_id = %identity.edge_id, site_id = ?identity.site_id, "edge identity stored");
        Ok(identity)
    }
}
