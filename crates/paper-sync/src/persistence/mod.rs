use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::relay::{DocumentRoom, RelayEvent, RelayStore, RoomSnapshot};
use crate::{SyncError, SyncResult};

const EXTENSION: &str = ".paper.json";

/// Writes room snapshots to disk in the background and restores them on startup
pub struct PersistenceManager {
    store: Arc<RelayStore>,
    storage_path: PathBuf,
    check_interval: Duration,
    handles: JoinSet<()>,
}

impl PersistenceManager {
    pub fn new(store: Arc<RelayStore>, storage_path: impl Into<PathBuf>) -> Self {
        let check_interval = store.config().persistence_interval;
        Self {
            store,
            storage_path: storage_path.into(),
            check_interval,
            handles: JoinSet::new(),
        }
    }

    /// Set the interval for checking dirty rooms
    pub fn set_check_interval(&mut self, interval: Duration) {
        self.check_interval = interval;
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Start the periodic writer and the save request listener
    pub async fn start(&mut self) -> SyncResult<()> {
        tokio::fs::create_dir_all(&self.storage_path).await?;

        info!(
            "Starting persistence manager with storage path: {:?}",
            self.storage_path
        );

        let store = self.store.clone();
        let storage_path = self.storage_path.clone();
        let check_interval = self.check_interval;
        self.handles.spawn(async move {
            let mut interval = interval(check_interval);
            loop {
                interval.tick().await;
                persist_dirty(&store, &storage_path).await;
            }
        });

        // subscribe before returning so no request sent after start is missed
        let mut events = self.store.subscribe_events();
        let store = self.store.clone();
        let storage_path = self.storage_path.clone();
        self.handles.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RelayEvent::SaveRequested { document_id }) => {
                        let Some(room) = store.get_room(&document_id) else {
                            continue;
                        };
                        if let Err(e) = persist_and_notify(&store, &room, &storage_path).await {
                            error!("Failed to save document '{}': {}", document_id, e);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Persistence listener skipped {} relay events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(())
    }

    /// Stop background work after a final pass over dirty rooms
    pub async fn stop(&mut self) {
        info!("Stopping persistence manager");

        persist_dirty(&self.store, &self.storage_path).await;

        self.handles.abort_all();
        while let Some(result) = self.handles.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!("Persistence task error: {}", e);
                }
            }
        }
    }

    /// Restore every stored room into the relay store
    ///
    /// Files that cannot be read are logged and skipped. Returns the number of
    /// rooms loaded.
    pub async fn load_all(&self) -> SyncResult<usize> {
        info!("Loading rooms from storage path: {:?}", self.storage_path);

        let mut loaded = 0;
        let mut entries = tokio::fs::read_dir(&self.storage_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(id) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(EXTENSION))
            else {
                continue;
            };
            match load_room(&self.store, id, &path).await {
                Ok(version) => {
                    info!("Loaded document '{}' at version {}", id, version);
                    loaded += 1;
                }
                Err(e) => error!("Failed to load document from {:?}: {}", path, e),
            }
        }
        Ok(loaded)
    }
}

async fn persist_dirty(store: &RelayStore, storage_path: &Path) {
    for id in store.list_rooms() {
        let Some(room) = store.get_room(&id) else {
            continue;
        };
        if !room.is_dirty() {
            continue;
        }
        if let Err(e) = persist_and_notify(store, &room, storage_path).await {
            error!("Failed to persist document '{}': {}", id, e);
        }
    }
}

async fn persist_and_notify(store: &RelayStore, room: &DocumentRoom, storage_path: &Path) -> SyncResult<()> {
    let (version, updated_at) = persist_room(room, storage_path).await?;
    info!("Persisted document '{}' at version {}", room.id(), version);
    store.notify_persisted(room.id(), version, updated_at);
    Ok(())
}

/// Write one room's snapshot, replacing the previous file atomically
async fn persist_room(room: &DocumentRoom, storage_path: &Path) -> SyncResult<(u64, DateTime<Utc>)> {
    let file_path = storage_path.join(file_name(room.id())?);
    let temp_path = file_path.with_extension("json.tmp");

    // cleared first so changes made while writing keep the room dirty
    room.mark_clean();
    let result = async {
        let snapshot = room.to_snapshot()?;
        let json_data = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(&temp_path, json_data).await?;
        tokio::fs::rename(&temp_path, &file_path).await?;
        Ok::<_, SyncError>(snapshot.version)
    }
    .await;

    match result {
        Ok(version) => Ok((version, Utc::now())),
        Err(e) => {
            room.mark_dirty();
            Err(e)
        }
    }
}

async fn load_room(store: &RelayStore, id: &str, file_path: &Path) -> SyncResult<u64> {
    let json_data = tokio::fs::read_to_string(file_path).await?;
    let snapshot: RoomSnapshot = serde_json::from_str(&json_data)?;
    let room = DocumentRoom::from_snapshot(
        id,
        store.schema().clone(),
        snapshot,
        store.config().history_limit,
    )?;
    let room = store.insert_room(room);
    debug!("Restored room '{}'", room.id());
    room.version()
}

fn file_name(document_id: &str) -> SyncResult<String> {
    let unsafe_name = document_id.is_empty()
        || document_id.starts_with('.')
        || document_id.contains(['/', '\\', '\0']);
    if unsafe_name {
        return Err(SyncError::Persistence(format!(
            "Document id '{}' cannot be used as a file name",
            document_id
        )));
    }
    Ok(format!("{}{}", document_id, EXTENSION))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::model::paper_schema;
    use crate::protocol::ServerMessage;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn store() -> Arc<RelayStore> {
        Arc::new(RelayStore::new(paper_schema(), RelayConfig::default()))
    }

    fn insert(pos: usize, text: &str) -> serde_json::Value {
        json!({
            "stepType": "replace",
            "from": pos,
            "to": pos,
            "slice": {"content": [{"type": "text", "text": text}]}
        })
    }

    #[tokio::test]
    async fn test_interval_from_config() {
        let mut config = RelayConfig::default();
        config.set_persistence_interval(Duration::from_secs(3));
        let store = Arc::new(RelayStore::new(paper_schema(), config));
        let temp_dir = TempDir::new().unwrap();

        let mut manager = PersistenceManager::new(store, temp_dir.path());
        assert_eq!(manager.check_interval, Duration::from_secs(3));
        manager.set_check_interval(Duration::from_secs(1));
        assert_eq!(manager.check_interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let store = store();
        let temp_dir = TempDir::new().unwrap();
        store.get_or_create_room("notes").unwrap();
        store.submit("notes", 0, vec![insert(1, "Plan")], "a").unwrap();
        store.submit("notes", 1, vec![insert(7, "hello")], "b").unwrap();

        let room = store.get_room("notes").unwrap();
        assert!(room.is_dirty());
        let (version, _) = persist_room(&room, temp_dir.path()).await.unwrap();
        assert_eq!(version, 2);
        assert!(!room.is_dirty());
        assert!(temp_dir.path().join("notes.paper.json").exists());

        let restored = self::store();
        let manager = PersistenceManager::new(restored.clone(), temp_dir.path());
        assert_eq!(manager.load_all().await.unwrap(), 1);

        let loaded = restored.get_room("notes").unwrap();
        let (version, doc) = loaded.snapshot().unwrap();
        assert_eq!(version, 2);
        assert_eq!(doc.title().as_deref(), Some("Plan"));
        assert_eq!(doc, room.snapshot().unwrap().1);
        // the retained log still serves resumes
        assert_eq!(loaded.steps_since(1).unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_skips_unreadable_files() {
        let store = store();
        let temp_dir = TempDir::new().unwrap();
        tokio::fs::write(temp_dir.path().join("broken.paper.json"), "{not json")
            .await
            .unwrap();
        tokio::fs::write(temp_dir.path().join("notes.txt"), "ignored")
            .await
            .unwrap();

        let manager = PersistenceManager::new(store.clone(), temp_dir.path());
        assert_eq!(manager.load_all().await.unwrap(), 0);
        assert_eq!(store.room_count(), 0);
    }

    #[tokio::test]
    async fn test_save_request_writes_and_notifies() {
        let store = store();
        let temp_dir = TempDir::new().unwrap();
        let room = store.get_or_create_room("doc").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        room.join("conn-1", tx, None).unwrap();
        let _ = rx.recv().await;

        let mut manager = PersistenceManager::new(store.clone(), temp_dir.path());
        manager.set_check_interval(Duration::from_secs(3600));
        manager.start().await.unwrap();
        store.request_save("doc").unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            message,
            ServerMessage::Persisted { version: 0, .. }
        ));
        assert!(temp_dir.path().join("doc.paper.json").exists());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_runs_final_pass() {
        let store = store();
        let temp_dir = TempDir::new().unwrap();
        let mut manager = PersistenceManager::new(store.clone(), temp_dir.path());
        manager.set_check_interval(Duration::from_secs(3600));
        manager.start().await.unwrap();

        store.get_or_create_room("late").unwrap();
        store.submit("late", 0, vec![insert(1, "x")], "a").unwrap();
        manager.stop().await;

        assert!(temp_dir.path().join("late.paper.json").exists());
        assert!(!store.get_room("late").unwrap().is_dirty());
    }

    #[test]
    fn test_unsafe_ids_rejected() {
        assert!(file_name("notes").is_ok());
        assert!(file_name("../etc").is_err());
        assert!(file_name("a/b").is_err());
        assert!(file_name("").is_err());
    }
}
