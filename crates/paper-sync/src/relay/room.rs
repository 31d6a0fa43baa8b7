use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::model::{Node, Schema};
use crate::protocol::{steps_from_json, ResumeFrom, ServerMessage};
use crate::transform::Transaction;
use crate::{SyncError, SyncResult};

/// One accepted step with the client that submitted it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedStep {
    pub step: JsonValue,
    pub client_id: String,
}

/// Persistent shape of a room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub version: u64,
    pub doc: JsonValue,
    /// Version at which the retained history begins
    pub history_start: u64,
    pub history: Vec<LoggedStep>,
}

/// How a join was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The client got a full snapshot
    Snapshot { version: u64 },
    /// The client got every batch it missed and keeps its session
    Resumed { from: u64, version: u64 },
}

struct RoomState {
    doc: Node,
    version: u64,
    history: VecDeque<LoggedStep>,
    subscribers: HashMap<String, UnboundedSender<ServerMessage>>,
}

impl RoomState {
    fn history_start(&self) -> u64 {
        self.version - self.history.len() as u64
    }

    /// Send to every subscriber, dropping the ones whose connection is gone
    fn deliver(&mut self, document_id: &str, message: &ServerMessage) {
        self.subscribers.retain(|conn_id, sender| {
            let alive = sender.send(message.clone()).is_ok();
            if !alive {
                warn!(
                    "Dropping subscriber {} of document '{}': channel closed",
                    conn_id, document_id
                );
            }
            alive
        });
    }
}

/// The authority for a single document
///
/// The canonical tree, version, step log and subscriber list live behind one
/// mutex. Everything that reads or changes the version happens while holding
/// it, and accepted batches are handed to subscriber channels before it is
/// released, so every subscriber sees batches in acceptance order.
pub struct DocumentRoom {
    id: String,
    schema: Arc<Schema>,
    history_limit: usize,
    state: Mutex<RoomState>,
    dirty: AtomicBool,
}

impl DocumentRoom {
    /// Create a room holding `doc` at version 0
    pub fn new(id: impl Into<String>, schema: Arc<Schema>, doc: Node, history_limit: usize) -> Self {
        Self::at_version(id, schema, doc, 0, VecDeque::new(), history_limit)
    }

    fn at_version(
        id: impl Into<String>,
        schema: Arc<Schema>,
        doc: Node,
        version: u64,
        history: VecDeque<LoggedStep>,
        history_limit: usize,
    ) -> Self {
        Self {
            id: id.into(),
            schema,
            history_limit,
            state: Mutex::new(RoomState {
                doc,
                version,
                history,
                subscribers: HashMap::new(),
            }),
            dirty: AtomicBool::new(false),
        }
    }

    /// Restore a room from a persisted snapshot
    pub fn from_snapshot(
        id: impl Into<String>,
        schema: Arc<Schema>,
        snapshot: RoomSnapshot,
        history_limit: usize,
    ) -> SyncResult<Self> {
        let doc = schema.doc_from_json(&snapshot.doc)?;
        let mut history: VecDeque<LoggedStep> = snapshot.history.into();
        if snapshot.history_start + history.len() as u64 != snapshot.version {
            // an inconsistent log cannot serve resumes
            history.clear();
        }
        while history.len() > history_limit {
            history.pop_front();
        }
        Ok(Self::at_version(
            id,
            schema,
            doc,
            snapshot.version,
            history,
            history_limit,
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, RoomState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::Internal(format!("Room '{}' lock poisoned", self.id)))
    }

    pub fn version(&self) -> SyncResult<u64> {
        Ok(self.lock()?.version)
    }

    /// The canonical document and its version
    pub fn snapshot(&self) -> SyncResult<(u64, Node)> {
        let state = self.lock()?;
        Ok((state.version, state.doc.clone()))
    }

    /// Accept a batch of steps built on `base_version`
    ///
    /// The batch is applied to the canonical tree as one transaction, logged,
    /// and delivered to every subscriber (the submitter included). Returns the
    /// new version.
    pub fn submit(&self, base_version: u64, steps: Vec<JsonValue>, client_id: &str) -> SyncResult<u64> {
        let mut state = self.lock()?;
        if base_version != state.version {
            return Err(SyncError::OutOfDate {
                base_version,
                current_version: state.version,
            });
        }
        if steps.is_empty() {
            return Ok(state.version);
        }

        let decoded = steps_from_json(&steps, &self.schema)?;
        let applied = Transaction::from_steps(decoded).apply(&state.doc, &self.schema)?;

        state.doc = applied.doc;
        state.version += steps.len() as u64;
        for step in &steps {
            state.history.push_back(LoggedStep {
                step: step.clone(),
                client_id: client_id.to_string(),
            });
        }
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }
        self.mark_dirty();

        let version = state.version;
        let message = ServerMessage::StepsBroadcast {
            document_id: self.id.clone(),
            version,
            steps,
            client_id: client_id.to_string(),
        };
        state.deliver(&self.id, &message);

        debug!(
            "Document '{}' accepted {} step(s) from {}, now at version {}",
            self.id,
            version - base_version,
            client_id,
            version
        );
        Ok(version)
    }

    /// Logged steps after `version`, or `None` when the log no longer reaches back that far
    pub fn steps_since(&self, version: u64) -> SyncResult<Option<Vec<LoggedStep>>> {
        let state = self.lock()?;
        Ok(Self::history_since(&state, version))
    }

    fn history_since(state: &RoomState, version: u64) -> Option<Vec<LoggedStep>> {
        if version < state.history_start() || version > state.version {
            return None;
        }
        let skip = (version - state.history_start()) as usize;
        Some(state.history.iter().skip(skip).cloned().collect())
    }

    /// Subscribe a connection and bring it up to date
    ///
    /// With a resume point still covered by the log, the missed batches are
    /// re-sent as ordinary broadcasts followed by `Resumed`; otherwise the
    /// connection receives a full snapshot.
    pub fn join(
        &self,
        conn_id: &str,
        sender: UnboundedSender<ServerMessage>,
        resume: Option<&ResumeFrom>,
    ) -> SyncResult<JoinOutcome> {
        let mut state = self.lock()?;
        let missed = resume.and_then(|resume| {
            Self::history_since(&state, resume.version).map(|steps| (resume.version, steps))
        });

        let outcome = match missed {
            Some((from, steps)) => {
                let mut version = from;
                for batch in group_by_client(steps) {
                    version += batch.steps.len() as u64;
                    send(&sender, ServerMessage::StepsBroadcast {
                        document_id: self.id.clone(),
                        version,
                        steps: batch.steps,
                        client_id: batch.client_id,
                    })?;
                }
                send(&sender, ServerMessage::Resumed {
                    document_id: self.id.clone(),
                    version: state.version,
                })?;
                JoinOutcome::Resumed {
                    from,
                    version: state.version,
                }
            }
            None => {
                send(&sender, ServerMessage::Joined {
                    document_id: self.id.clone(),
                    version: state.version,
                    doc: state.doc.to_json()?,
                })?;
                JoinOutcome::Snapshot {
                    version: state.version,
                }
            }
        };

        state.subscribers.insert(conn_id.to_string(), sender);
        info!(
            "Connection {} joined document '{}' ({:?})",
            conn_id, self.id, outcome
        );
        Ok(outcome)
    }

    /// Remove a connection from the subscriber list
    pub fn leave(&self, conn_id: &str) -> SyncResult<bool> {
        let removed = self.lock()?.subscribers.remove(conn_id).is_some();
        if removed {
            debug!("Connection {} left document '{}'", conn_id, self.id);
        }
        Ok(removed)
    }

    pub fn subscriber_count(&self) -> SyncResult<usize> {
        Ok(self.lock()?.subscribers.len())
    }

    /// Send a message to every subscriber
    pub fn deliver(&self, message: ServerMessage) -> SyncResult<()> {
        self.lock()?.deliver(&self.id, &message);
        Ok(())
    }

    pub fn to_snapshot(&self) -> SyncResult<RoomSnapshot> {
        let state = self.lock()?;
        Ok(RoomSnapshot {
            version: state.version,
            doc: state.doc.to_json()?,
            history_start: state.history_start(),
            history: state.history.iter().cloned().collect(),
        })
    }

    /// Check if the room changed since it was last persisted
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

struct Batch {
    client_id: String,
    steps: Vec<JsonValue>,
}

/// Regroup logged steps into runs submitted by the same client
fn group_by_client(steps: Vec<LoggedStep>) -> Vec<Batch> {
    let mut batches: Vec<Batch> = Vec::new();
    for logged in steps {
        match batches.last_mut() {
            Some(batch) if batch.client_id == logged.client_id => batch.steps.push(logged.step),
            _ => batches.push(Batch {
                client_id: logged.client_id,
                steps: vec![logged.step],
            }),
        }
    }
    batches
}

fn send(sender: &UnboundedSender<ServerMessage>, message: ServerMessage) -> SyncResult<()> {
    sender
        .send(message)
        .map_err(|_| SyncError::TransportFailure("Connection closed during join".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::paper_schema;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn room(limit: usize) -> DocumentRoom {
        let schema = paper_schema();
        let doc = schema.default_doc().unwrap();
        DocumentRoom::new("doc-1", schema, doc, limit)
    }

    fn insert(pos: usize, text: &str) -> JsonValue {
        json!({
            "stepType": "replace",
            "from": pos,
            "to": pos,
            "slice": {"content": [{"type": "text", "text": text}]}
        })
    }

    #[test]
    fn test_submit_advances_version_and_broadcasts() {
        let room = room(100);
        let (tx, mut rx) = mpsc::unbounded_channel();
        room.join("conn-a", tx, None).unwrap();
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Joined { version: 0, .. }));

        let version = room.submit(0, vec![insert(3, "hi"), insert(5, "!")], "client-a").unwrap();
        assert_eq!(version, 2);
        match rx.try_recv().unwrap() {
            ServerMessage::StepsBroadcast {
                version,
                steps,
                client_id,
                ..
            } => {
                assert_eq!(version, 2);
                assert_eq!(steps.len(), 2);
                assert_eq!(client_id, "client-a");
            }
            other => panic!("Expected StepsBroadcast, got: {:?}", other),
        }
        let (_, doc) = room.snapshot().unwrap();
        assert_eq!(doc.child(1).text_content(), "hi!");
        assert!(room.is_dirty());
    }

    #[test]
    fn test_stale_base_version_rejected() {
        let room = room(100);
        room.submit(0, vec![insert(3, "a")], "client-a").unwrap();
        let err = room.submit(0, vec![insert(3, "b")], "client-b").unwrap_err();
        assert!(matches!(
            err,
            SyncError::OutOfDate {
                base_version: 0,
                current_version: 1
            }
        ));
        assert_eq!(room.version().unwrap(), 1);
    }

    #[test]
    fn test_invalid_batch_changes_nothing() {
        let room = room(100);
        let bad = vec![insert(3, "ok"), json!({"stepType": "replace", "from": 0, "to": 99})];
        assert!(room.submit(0, bad, "client-a").is_err());
        assert_eq!(room.version().unwrap(), 0);
        assert!(room.steps_since(0).unwrap().unwrap().is_empty());
        assert!(!room.is_dirty());
    }

    #[test]
    fn test_resume_replays_missed_batches() {
        let room = room(100);
        room.submit(0, vec![insert(3, "a")], "client-a").unwrap();
        room.submit(1, vec![insert(4, "b"), insert(5, "c")], "client-b").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let resume = ResumeFrom {
            client_id: "client-a".into(),
            version: 1,
        };
        let outcome = room.join("conn-a2", tx, Some(&resume)).unwrap();
        assert_eq!(outcome, JoinOutcome::Resumed { from: 1, version: 3 });
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::StepsBroadcast { version: 3, ref client_id, .. } if client_id == "client-b"
        ));
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Resumed { version: 3, .. }));
    }

    #[test]
    fn test_resume_beyond_history_gets_snapshot() {
        let room = room(2);
        for version in 0..4 {
            room.submit(version, vec![insert(3, "x")], "client-a").unwrap();
        }
        assert!(room.steps_since(1).unwrap().is_none());
        assert_eq!(room.steps_since(2).unwrap().map(|s| s.len()), Some(2));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let resume = ResumeFrom {
            client_id: "client-a".into(),
            version: 1,
        };
        let outcome = room.join("conn", tx, Some(&resume)).unwrap();
        assert_eq!(outcome, JoinOutcome::Snapshot { version: 4 });
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Joined { version: 4, .. }));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let room = room(100);
        room.submit(0, vec![insert(3, "persist me")], "client-a").unwrap();
        let snapshot = room.to_snapshot().unwrap();
        let restored = DocumentRoom::from_snapshot("doc-1", paper_schema(), snapshot, 100).unwrap();
        assert_eq!(restored.version().unwrap(), 1);
        assert_eq!(restored.snapshot().unwrap().1, room.snapshot().unwrap().1);
        assert_eq!(restored.steps_since(0).unwrap().map(|s| s.len()), Some(1));
    }

    #[test]
    fn test_closed_subscriber_is_dropped() {
        let room = room(100);
        let (tx, rx) = mpsc::unbounded_channel();
        room.join("conn", tx, None).unwrap();
        drop(rx);
        room.submit(0, vec![insert(3, "a")], "client-a").unwrap();
        assert_eq!(room.subscriber_count().unwrap(), 0);
    }
}
