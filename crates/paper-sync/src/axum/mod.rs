use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use uuid::Uuid;

pub mod client;
pub mod handler;

pub use client::{connect, ClientHandle};
pub use handler::WebSocketHandler;

use crate::relay::{RelayEvent, RelayStore};

/// Axum state for the relay endpoint
#[derive(Clone)]
pub struct RelayState {
    store: Arc<RelayStore>,
    connections: Arc<ConnectionManager>,
}

impl RelayState {
    pub fn new(store: Arc<RelayStore>) -> Self {
        Self {
            store,
            connections: Arc::new(ConnectionManager::new()),
        }
    }

    pub fn store(&self) -> &Arc<RelayStore> {
        &self.store
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }
}

/// Connected WebSocket clients and the documents each one joined
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, HashSet<String>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new connection and return its id
    pub async fn register(&self) -> String {
        let conn_id = Uuid::new_v4().to_string();
        self.connections
            .write()
            .await
            .insert(conn_id.clone(), HashSet::new());
        tracing::info!("Registered connection: {}", conn_id);
        conn_id
    }

    /// Unregister a connection, returning the documents it had joined
    pub async fn unregister(&self, conn_id: &str) -> Vec<String> {
        let removed = self.connections.write().await.remove(conn_id);
        tracing::info!("Unregistered connection: {}", conn_id);
        removed
            .map(|documents| documents.into_iter().collect())
            .unwrap_or_default()
    }

    pub async fn record_join(&self, conn_id: &str, document_id: &str) {
        if let Some(documents) = self.connections.write().await.get_mut(conn_id) {
            documents.insert(document_id.to_string());
        }
    }

    pub async fn has_joined(&self, conn_id: &str, document_id: &str) -> bool {
        self.connections
            .read()
            .await
            .get(conn_id)
            .is_some_and(|documents| documents.contains(document_id))
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a router with the relay WebSocket endpoint
pub fn router_with_relay(store: Arc<RelayStore>) -> Router<RelayState> {
    router_with_relay_state(RelayState::new(store))
}

/// Create a router with the relay WebSocket endpoint using an existing
/// [`RelayState`], so other routes can share the same store and connections
pub fn router_with_relay_state(state: RelayState) -> Router<RelayState> {
    start_event_logger(state.store.clone());

    Router::new()
        .route("/paper", get(websocket_handler))
        .with_state(state)
}

/// Log relay activity in the background
fn start_event_logger(store: Arc<RelayStore>) {
    let mut events = store.subscribe_events();
    tokio::spawn(async move {
        tracing::info!("Started relay event logger");

        loop {
            match events.recv().await {
                Ok(RelayEvent::StepsAccepted {
                    document_id,
                    version,
                    client_id,
                    count,
                }) => {
                    tracing::debug!(
                        "Document '{}' at version {} after {} step(s) from {}",
                        document_id,
                        version,
                        count,
                        client_id
                    );
                }
                Ok(RelayEvent::SaveRequested { document_id }) => {
                    tracing::debug!("Save requested for document '{}'", document_id);
                }
                Ok(RelayEvent::Persisted {
                    document_id,
                    version,
                    ..
                }) => {
                    tracing::debug!("Document '{}' persisted at version {}", document_id, version);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Relay event logger lagged behind, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => {
                    tracing::debug!("Relay event channel closed");
                    break;
                }
            }
        }
    });
}

/// WebSocket handler endpoint
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| WebSocketHandler::new(socket, state).handle())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_tracking() {
        let manager = ConnectionManager::new();
        let conn_id = manager.register().await;

        manager.record_join(&conn_id, "doc-a").await;
        manager.record_join(&conn_id, "doc-b").await;
        assert!(manager.has_joined(&conn_id, "doc-a").await);
        assert!(!manager.has_joined(&conn_id, "doc-c").await);
        assert!(!manager.has_joined("someone-else", "doc-a").await);

        let mut documents = manager.unregister(&conn_id).await;
        documents.sort();
        assert_eq!(documents, vec!["doc-a".to_string(), "doc-b".to_string()]);
        assert!(!manager.has_joined(&conn_id, "doc-a").await);
        assert!(manager.unregister(&conn_id).await.is_empty());
    }
}
