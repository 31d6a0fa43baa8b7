use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::corrections::correction_transaction;
use super::state::CollabState;
use crate::config::{ClientConfig, ResyncPolicy};
use crate::model::{Node, Schema};
use crate::protocol::{steps_from_json, steps_to_json, ClientMessage, ResumeFrom, ServerMessage};
use crate::transform::{Applied, Step, Transaction};
use crate::{SyncError, SyncResult};

/// Connection and confirmation state shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No document attached yet
    Uninitialized,
    /// Attached with nothing pending
    Syncing,
    /// Local edits waiting to be flushed
    Editing,
    /// A flush is waiting for its echo
    AwaitingAck,
    /// Transport lost; edits keep applying locally
    Disconnected,
    /// Rejoin sent, waiting for the relay to catch us up
    Resuming,
}

/// Notifications for the rendering layer
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    DocChanged { version: u64 },
    StatusChanged(SyncStatus),
    TitleChanged { title: String },
    /// Pending steps that could not be rebased or replayed
    StepsDropped { count: usize },
    /// Unconfirmed steps were parked after a cold resync
    ResyncRequired { held: usize },
    LocalEditsDiscarded { count: usize },
    Persisted { version: u64, updated_at: DateTime<Utc> },
    /// The relay refused a request; `joining` is set when the refused
    /// request was the join itself, leaving the client detached
    RelayError { message: String, joining: bool },
    /// Steps just applied to the local document, for layers that follow
    /// edits incrementally such as an [`EmbedArena`](crate::bridge::EmbedArena)
    StepsApplied {
        steps: Vec<Step>,
        /// The document before each step
        docs: Vec<Node>,
        /// The document after the last step
        doc: Node,
        /// Whether the steps came from the relay rather than a local edit
        remote: bool,
    },
}

/// A batch ready to be submitted to the relay
#[derive(Debug, Clone, PartialEq)]
pub struct Sendable {
    pub version: u64,
    pub steps: Vec<Step>,
    pub client_id: String,
}

#[derive(Debug, Clone)]
struct InFlight {
    base_version: u64,
    count: usize,
    sent_at: Instant,
}

/// Client side of the sync protocol for one document
///
/// The client does no I/O itself. Server messages are fed to
/// [`handle_server_message`](Self::handle_server_message) and the messages it
/// returns are sent back over whatever transport the caller uses.
pub struct SyncClient {
    schema: Arc<Schema>,
    config: ClientConfig,
    client_id: String,
    document_id: Option<String>,
    doc: Option<Node>,
    collab: Option<CollabState>,
    status: SyncStatus,
    in_flight: Option<InFlight>,
    /// Relay version reported by the last rejection, until we catch up
    behind: Option<u64>,
    held: Vec<Step>,
    title: Option<String>,
    event_tx: broadcast::Sender<ClientEvent>,
}

impl SyncClient {
    pub fn new(schema: Arc<Schema>, config: ClientConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            schema,
            config,
            client_id: Uuid::new_v4().to_string(),
            document_id: None,
            doc: None,
            collab: None,
            status: SyncStatus::Uninitialized,
            in_flight: None,
            behind: None,
            held: Vec::new(),
            title: None,
            event_tx,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn document_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// The local document, including optimistic edits
    pub fn doc(&self) -> Option<&Node> {
        self.doc.as_ref()
    }

    /// Version last confirmed by the relay
    pub fn version(&self) -> Option<u64> {
        self.collab.as_ref().map(CollabState::version)
    }

    pub fn pending_len(&self) -> usize {
        self.collab.as_ref().map_or(0, |c| c.pending().len())
    }

    /// Steps parked by a cold resync under [`ResyncPolicy::Hold`]
    pub fn held_steps(&self) -> &[Step] {
        &self.held
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    /// Build the join request for a document
    ///
    /// Rejoining the document we already hold asks the relay to resume from
    /// our confirmed version so pending edits survive the reconnect.
    pub fn join(&mut self, document_id: &str, auth_token: Option<String>) -> SyncResult<ClientMessage> {
        let same_document = self.document_id.as_deref() == Some(document_id);
        let resume = match &self.collab {
            Some(collab) if same_document => Some(ResumeFrom {
                client_id: self.client_id.clone(),
                version: collab.version(),
            }),
            _ => None,
        };

        if resume.is_none() {
            if !same_document && !self.held.is_empty() {
                return Err(SyncError::ResyncPending);
            }
            self.document_id = Some(document_id.to_string());
            self.doc = None;
            self.collab = None;
            self.title = None;
        }
        self.in_flight = None;
        self.behind = None;
        self.set_status(if resume.is_some() {
            SyncStatus::Resuming
        } else {
            SyncStatus::Uninitialized
        });

        info!(
            "Joining document '{}' as {} (resume: {:?})",
            document_id, self.client_id, resume
        );
        Ok(ClientMessage::Join {
            document_id: document_id.to_string(),
            auth_token,
            resume,
        })
    }

    /// Apply a local transaction optimistically
    ///
    /// The transaction is applied at once, whatever the connection state, and
    /// its steps join the pending batch. Correction steps follow as a
    /// separate transaction.
    pub fn apply_local_transaction(&mut self, tr: &Transaction) -> SyncResult<()> {
        if tr.is_empty() {
            return Ok(());
        }
        let doc = self.doc.as_ref().ok_or(SyncError::NotAttached)?;
        let applied = tr.apply(doc, &self.schema)?;
        self.commit_local(applied)?;
        self.after_local_change()
    }

    /// Take the pending batch for submission, if one may be sent now
    pub fn sendable(&mut self) -> Option<Sendable> {
        if !self.is_connected() || self.in_flight.is_some() {
            return None;
        }
        let collab = self.collab.as_ref()?;
        if !collab.has_pending() || self.behind.is_some_and(|v| collab.version() < v) {
            return None;
        }
        let sendable = Sendable {
            version: collab.version(),
            steps: collab.pending_steps(),
            client_id: self.client_id.clone(),
        };
        self.in_flight = Some(InFlight {
            base_version: sendable.version,
            count: sendable.steps.len(),
            sent_at: Instant::now(),
        });
        self.set_status(SyncStatus::AwaitingAck);
        Some(sendable)
    }

    /// [`sendable`](Self::sendable) wrapped as a wire message
    pub fn flush(&mut self) -> SyncResult<Option<ClientMessage>> {
        let Some(document_id) = self.document_id.clone() else {
            return Ok(None);
        };
        let Some(sendable) = self.sendable() else {
            return Ok(None);
        };
        debug!(
            "Flushing {} steps at version {}",
            sendable.steps.len(),
            sendable.version
        );
        Ok(Some(ClientMessage::SubmitSteps {
            document_id,
            base_version: sendable.version,
            steps: steps_to_json(&sendable.steps)?,
            client_id: sendable.client_id,
        }))
    }

    /// Fold a batch accepted by the relay into the local state
    ///
    /// Batches ending at or below the confirmed version were already applied
    /// and are ignored. A batch that does not continue exactly from the
    /// confirmed version is a protocol error.
    pub fn receive_remote(
        &mut self,
        steps: Vec<Step>,
        client_ids: &[String],
        new_version: u64,
    ) -> SyncResult<()> {
        let (Some(collab), Some(doc)) = (self.collab.as_mut(), self.doc.as_ref()) else {
            return Err(SyncError::NotAttached);
        };
        let count = steps.len() as u64;
        if new_version <= collab.version() {
            debug!("Ignoring batch ending at version {}, already applied", new_version);
            return Ok(());
        }
        if new_version != collab.version() + count {
            return Err(SyncError::Protocol {
                message: format!(
                    "batch of {} steps ending at version {} does not follow version {}",
                    count,
                    new_version,
                    collab.version()
                ),
            });
        }

        let received = collab.receive(&self.schema, doc, steps, client_ids)?;

        if received.confirmed > 0 {
            let remaining = self
                .in_flight
                .as_ref()
                .map(|f| f.count.saturating_sub(received.confirmed));
            match remaining {
                Some(0) => self.in_flight = None,
                Some(n) => {
                    if let Some(in_flight) = self.in_flight.as_mut() {
                        in_flight.count = n;
                    }
                }
                None => {}
            }
        }
        if received.dropped > 0 {
            warn!("{} pending steps no longer apply and were dropped", received.dropped);
            self.emit(ClientEvent::StepsDropped {
                count: received.dropped,
            });
        }
        if received.foreign > 0 {
            self.emit(ClientEvent::StepsApplied {
                steps: received.steps,
                docs: received.docs,
                doc: received.doc.clone(),
                remote: true,
            });
            self.doc = Some(received.doc);
            self.emit(ClientEvent::DocChanged {
                version: new_version,
            });
            self.check_title();
        }
        if self.is_connected() {
            self.settle_status();
        }
        Ok(())
    }

    /// Process one message from the relay, returning the next flush if one
    /// became possible
    pub fn handle_server_message(&mut self, message: ServerMessage) -> SyncResult<Option<ClientMessage>> {
        match message {
            ServerMessage::Joined {
                document_id,
                version,
                doc,
            } => {
                if !self.is_ours(&document_id) {
                    return Ok(None);
                }
                self.on_snapshot(version, &doc)?;
            }
            ServerMessage::Resumed {
                document_id,
                version,
            } => {
                if !self.is_ours(&document_id) {
                    return Ok(None);
                }
                let local = self.version().ok_or(SyncError::NotAttached)?;
                if local != version {
                    return Err(SyncError::Protocol {
                        message: format!(
                            "relay resumed at version {} but local version is {}",
                            version, local
                        ),
                    });
                }
                info!("Resumed document '{}' at version {}", document_id, version);
                self.settle_status();
            }
            ServerMessage::StepsBroadcast {
                document_id,
                version,
                steps,
                client_id,
            } => {
                if !self.is_ours(&document_id) {
                    return Ok(None);
                }
                let steps = steps_from_json(&steps, &self.schema)?;
                let client_ids = vec![client_id; steps.len()];
                self.receive_remote(steps, &client_ids, version)?;
            }
            ServerMessage::Rejected {
                document_id,
                base_version,
                current_version,
                ..
            } => {
                if !self.is_ours(&document_id) {
                    return Ok(None);
                }
                debug!(
                    "Submission at version {} is out of date (relay at {})",
                    base_version, current_version
                );
                if self
                    .in_flight
                    .as_ref()
                    .is_some_and(|f| f.base_version == base_version)
                {
                    self.in_flight = None;
                    self.settle_status();
                }
                // wait for the missed batches before submitting again
                if self.version().is_some_and(|v| v < current_version) {
                    self.behind = Some(current_version);
                    return Ok(None);
                }
            }
            ServerMessage::Persisted {
                document_id,
                version,
                updated_at,
            } => {
                if self.is_ours(&document_id) {
                    self.emit(ClientEvent::Persisted {
                        version,
                        updated_at,
                    });
                }
                return Ok(None);
            }
            ServerMessage::Error { message } => {
                // the in-flight batch, if any, stays until its timeout
                let joining = matches!(
                    self.status,
                    SyncStatus::Uninitialized | SyncStatus::Resuming
                );
                warn!("Relay error (joining: {}): {}", joining, message);
                self.emit(ClientEvent::RelayError { message, joining });
                return Ok(None);
            }
        }
        self.flush()
    }

    /// Fail with a transport error when the flush in flight has gone
    /// unanswered for longer than the configured timeout
    pub fn check_timeout(&self, now: Instant) -> SyncResult<()> {
        match &self.in_flight {
            Some(in_flight)
                if now.saturating_duration_since(in_flight.sent_at) >= self.config.flush_timeout =>
            {
                Err(SyncError::TransportFailure(format!(
                    "no answer to flush at version {} within {:?}",
                    in_flight.base_version, self.config.flush_timeout
                )))
            }
            _ => Ok(()),
        }
    }

    /// Note that the transport is gone; pending steps are kept
    pub fn disconnect(&mut self) {
        if self.in_flight.take().is_some() {
            debug!("Dropping in-flight marker; the flush is settled on resume");
        }
        if self.status != SyncStatus::Uninitialized {
            self.set_status(SyncStatus::Disconnected);
        }
    }

    /// Decide what happens to steps parked by a cold resync
    ///
    /// Replayed steps are not mapped through edits made since the resync.
    pub fn resolve_resync(&mut self, policy: ResyncPolicy) -> SyncResult<()> {
        if self.held.is_empty() {
            return Ok(());
        }
        match policy {
            ResyncPolicy::Discard => {
                let count = self.held.len();
                self.held.clear();
                info!("Discarded {} held steps", count);
                self.emit(ClientEvent::LocalEditsDiscarded { count });
            }
            ResyncPolicy::Replay => {
                if self.doc.is_none() {
                    return Err(SyncError::NotAttached);
                }
                let steps = std::mem::take(&mut self.held);
                self.replay(steps)?;
            }
            ResyncPolicy::Hold => {}
        }
        Ok(())
    }

    pub fn request_save(&self) -> SyncResult<ClientMessage> {
        let document_id = self.document_id.clone().ok_or(SyncError::NotAttached)?;
        Ok(ClientMessage::Save { document_id })
    }

    fn on_snapshot(&mut self, version: u64, doc: &JsonValue) -> SyncResult<()> {
        let doc = self.schema.doc_from_json(doc)?;
        let leftover = self
            .collab
            .take()
            .map(|c| c.pending_steps())
            .unwrap_or_default();

        self.in_flight = None;
        self.behind = None;
        self.doc = Some(doc);
        self.collab = Some(CollabState::new(version, self.client_id.clone()));
        self.set_status(SyncStatus::Syncing);
        info!(
            "Attached to '{}' at version {}",
            self.document_id.as_deref().unwrap_or_default(),
            version
        );

        if !leftover.is_empty() {
            info!(
                "Cold resync with {} unconfirmed steps, policy {:?}",
                leftover.len(),
                self.config.resync_policy
            );
            match self.config.resync_policy {
                ResyncPolicy::Discard => {
                    self.emit(ClientEvent::LocalEditsDiscarded {
                        count: leftover.len(),
                    });
                }
                ResyncPolicy::Replay => self.replay(leftover)?,
                ResyncPolicy::Hold => {
                    self.held.extend(leftover);
                    self.emit(ClientEvent::ResyncRequired {
                        held: self.held.len(),
                    });
                }
            }
        }

        self.emit(ClientEvent::DocChanged { version });
        self.check_title();
        self.settle_status();
        Ok(())
    }

    /// Apply steps one by one as new local edits, dropping those that fail
    fn replay(&mut self, steps: Vec<Step>) -> SyncResult<()> {
        let mut dropped = 0;
        for step in steps {
            let doc = self.doc.as_ref().ok_or(SyncError::NotAttached)?;
            match Transaction::from_steps(vec![step]).apply(doc, &self.schema) {
                Ok(applied) => self.commit_local(applied)?,
                Err(e) => {
                    debug!("Step no longer applies after resync: {}", e);
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            self.emit(ClientEvent::StepsDropped { count: dropped });
        }
        self.after_local_change()
    }

    fn commit_local(&mut self, applied: Applied) -> SyncResult<()> {
        let collab = self.collab.as_mut().ok_or(SyncError::NotAttached)?;
        collab.push_local(&applied);
        self.emit(ClientEvent::StepsApplied {
            steps: applied.steps,
            docs: applied.docs,
            doc: applied.doc.clone(),
            remote: false,
        });
        self.doc = Some(applied.doc);
        Ok(())
    }

    /// Run corrections and notify after local steps were committed
    fn after_local_change(&mut self) -> SyncResult<()> {
        let doc = self.doc.as_ref().ok_or(SyncError::NotAttached)?;
        match correction_transaction(&self.schema, doc).and_then(|tr| {
            tr.map(|tr| tr.apply(doc, &self.schema)).transpose()
        }) {
            Ok(Some(applied)) => {
                debug!("Appending {} correction steps", applied.steps.len());
                self.commit_local(applied)?;
            }
            Ok(None) => {}
            Err(e) => warn!("Skipping correction transaction: {}", e),
        }

        let version = self.version().unwrap_or_default();
        self.emit(ClientEvent::DocChanged { version });
        self.check_title();
        if self.is_connected() {
            self.settle_status();
        }
        Ok(())
    }

    fn is_ours(&self, document_id: &str) -> bool {
        let ours = self.document_id.as_deref() == Some(document_id);
        if !ours {
            debug!("Ignoring message for document '{}'", document_id);
        }
        ours
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.status,
            SyncStatus::Syncing | SyncStatus::Editing | SyncStatus::AwaitingAck
        )
    }

    fn settle_status(&mut self) {
        let status = if self.in_flight.is_some() {
            SyncStatus::AwaitingAck
        } else if self.collab.as_ref().is_some_and(CollabState::has_pending) {
            SyncStatus::Editing
        } else {
            SyncStatus::Syncing
        };
        self.set_status(status);
    }

    fn set_status(&mut self, status: SyncStatus) {
        if self.status != status {
            debug!("Sync status {:?} -> {:?}", self.status, status);
            self.status = status;
            self.emit(ClientEvent::StatusChanged(status));
        }
    }

    fn check_title(&mut self) {
        let title = self.doc.as_ref().and_then(Node::title);
        if title != self.title {
            self.title = title.clone();
            if let Some(title) = title {
                self.emit(ClientEvent::TitleChanged { title });
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        // nobody listening is fine
        let _ = self.event_tx.send(event);
    }
}
