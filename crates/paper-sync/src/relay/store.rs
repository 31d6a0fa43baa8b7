use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::room::DocumentRoom;
use super::{AllowAll, Authorizer};
use crate::config::RelayConfig;
use crate::model::Schema;
use crate::protocol::ServerMessage;
use crate::{SyncError, SyncResult};

/// Store-wide notifications for observers such as the persistence manager
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    StepsAccepted {
        document_id: String,
        version: u64,
        client_id: String,
        count: usize,
    },
    SaveRequested {
        document_id: String,
    },
    Persisted {
        document_id: String,
        version: u64,
        updated_at: DateTime<Utc>,
    },
}

/// All rooms served by a relay
///
/// Rooms are created on first access from the schema's default document.
pub struct RelayStore {
    schema: Arc<Schema>,
    config: RelayConfig,
    rooms: DashMap<String, Arc<DocumentRoom>>,
    event_tx: broadcast::Sender<RelayEvent>,
    authorizer: Arc<dyn Authorizer>,
}

impl RelayStore {
    pub fn new(schema: Arc<Schema>, config: RelayConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            schema,
            config,
            rooms: DashMap::new(),
            event_tx,
            authorizer: Arc::new(AllowAll),
        }
    }

    /// Replace the authorization hook consulted on join
    pub fn with_authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn authorize(&self, document_id: &str, token: Option<&str>) -> bool {
        self.authorizer.authorize(document_id, token)
    }

    /// Get a room, creating it from the default document if it does not exist
    pub fn get_or_create_room(&self, id: &str) -> SyncResult<Arc<DocumentRoom>> {
        if let Some(room) = self.get_room(id) {
            return Ok(room);
        }
        let doc = self.schema.default_doc()?;
        let room = self
            .rooms
            .entry(id.to_string())
            .or_insert_with(|| {
                info!("Creating new document room: {}", id);
                Arc::new(DocumentRoom::new(
                    id,
                    self.schema.clone(),
                    doc,
                    self.config.history_limit,
                ))
            })
            .clone();
        Ok(room)
    }

    pub fn get_room(&self, id: &str) -> Option<Arc<DocumentRoom>> {
        self.rooms.get(id).map(|entry| entry.value().clone())
    }

    /// Add a room restored from storage, replacing any room with the same id
    pub fn insert_room(&self, room: DocumentRoom) -> Arc<DocumentRoom> {
        let room = Arc::new(room);
        self.rooms.insert(room.id().to_string(), room.clone());
        room
    }

    /// List all document IDs
    pub fn list_rooms(&self) -> Vec<String> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Submit a batch to a document's room
    pub fn submit(
        &self,
        document_id: &str,
        base_version: u64,
        steps: Vec<JsonValue>,
        client_id: &str,
    ) -> SyncResult<u64> {
        let room = self
            .get_room(document_id)
            .ok_or_else(|| SyncError::DocumentNotFound {
                id: document_id.to_string(),
            })?;
        let count = steps.len();
        let version = room.submit(base_version, steps, client_id)?;
        if count > 0 {
            self.publish(RelayEvent::StepsAccepted {
                document_id: document_id.to_string(),
                version,
                client_id: client_id.to_string(),
                count,
            });
        }
        Ok(version)
    }

    /// Ask observers to persist a document now
    pub fn request_save(&self, document_id: &str) -> SyncResult<()> {
        if self.get_room(document_id).is_none() {
            return Err(SyncError::DocumentNotFound {
                id: document_id.to_string(),
            });
        }
        self.publish(RelayEvent::SaveRequested {
            document_id: document_id.to_string(),
        });
        Ok(())
    }

    /// Tell a room's subscribers that the document was written to storage
    pub fn notify_persisted(&self, document_id: &str, version: u64, updated_at: DateTime<Utc>) {
        if let Some(room) = self.get_room(document_id) {
            let message = ServerMessage::Persisted {
                document_id: document_id.to_string(),
                version,
                updated_at,
            };
            if let Err(e) = room.deliver(message) {
                debug!("Could not notify subscribers of '{}': {}", document_id, e);
            }
        }
        self.publish(RelayEvent::Persisted {
            document_id: document_id.to_string(),
            version,
            updated_at,
        });
    }

    fn publish(&self, event: RelayEvent) {
        // no receivers is fine
        let _ = self.event_tx.send(event);
    }

    /// Subscribe to relay events across all documents
    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::paper_schema;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn insert(pos: usize, text: &str) -> JsonValue {
        json!({
            "stepType": "replace",
            "from": pos,
            "to": pos,
            "slice": {"content": [{"type": "text", "text": text}]}
        })
    }

    #[tokio::test]
    async fn test_rooms_created_on_demand() {
        let store = RelayStore::new(paper_schema(), RelayConfig::default());
        assert_eq!(store.room_count(), 0);
        let room = store.get_or_create_room("notes").unwrap();
        let again = store.get_or_create_room("notes").unwrap();
        assert!(Arc::ptr_eq(&room, &again));
        assert_eq!(store.list_rooms(), vec!["notes".to_string()]);
        assert!(matches!(
            store.submit("missing", 0, vec![], "a"),
            Err(SyncError::DocumentNotFound { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submits_linearize() {
        let store = Arc::new(RelayStore::new(paper_schema(), RelayConfig::default()));
        let room = store.get_or_create_room("doc").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        room.join("observer", tx, None).unwrap();
        let _ = rx.recv().await;

        let clients = 8;
        let mut handles = Vec::new();
        for n in 0..clients {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let client_id = format!("client-{}", n);
                // retry against the current version until accepted
                loop {
                    let base = store.get_room("doc").unwrap().version().unwrap();
                    match store.submit("doc", base, vec![insert(3, "x")], &client_id) {
                        Ok(version) => return version,
                        Err(SyncError::OutOfDate { .. }) => tokio::task::yield_now().await,
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
            }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap());
        }
        versions.sort();
        assert_eq!(versions, (1..=clients as u64).collect::<Vec<_>>());

        // broadcasts arrive in acceptance order with consecutive versions
        for expected in 1..=clients as u64 {
            match rx.recv().await.unwrap() {
                ServerMessage::StepsBroadcast { version, .. } => assert_eq!(version, expected),
                other => panic!("Expected StepsBroadcast, got: {:?}", other),
            }
        }
        assert_eq!(room.snapshot().unwrap().1.child(1).text_content().len(), clients);
    }

    #[tokio::test]
    async fn test_events_published() {
        let store = RelayStore::new(paper_schema(), RelayConfig::default());
        let mut events = store.subscribe_events();
        store.get_or_create_room("doc").unwrap();
        store.submit("doc", 0, vec![insert(3, "a")], "client-a").unwrap();
        store.request_save("doc").unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            RelayEvent::StepsAccepted {
                document_id: "doc".into(),
                version: 1,
                client_id: "client-a".into(),
                count: 1
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RelayEvent::SaveRequested {
                document_id: "doc".into()
            }
        );
    }

    #[tokio::test]
    async fn test_authorizer_hook() {
        struct TokenRequired;
        impl Authorizer for TokenRequired {
            fn authorize(&self, _document_id: &str, token: Option<&str>) -> bool {
                token == Some("secret")
            }
        }
        let store = RelayStore::new(paper_schema(), RelayConfig::default()).with_authorizer(TokenRequired);
        assert!(store.authorize("doc", Some("secret")));
        assert!(!store.authorize("doc", None));
    }
}
