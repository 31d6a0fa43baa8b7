use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::RelayState;
use crate::protocol::{decode_message, encode_message, ClientMessage, RejectReason, ServerMessage};
use crate::{SyncError, SyncResult};

/// Handles the WebSocket connection of one client
pub struct WebSocketHandler {
    socket: WebSocket,
    state: RelayState,
}

impl WebSocketHandler {
    pub fn new(socket: WebSocket, state: RelayState) -> Self {
        Self { socket, state }
    }

    /// Serve the connection until either side closes it
    pub async fn handle(self) {
        let (mut ws_sender, mut ws_receiver) = self.socket.split();

        // one channel carries both broadcasts and direct replies, so a
        // rejection can never overtake the batches that caused it
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

        let conn_id = self.state.connections().register().await;

        info!("New WebSocket connection established: {}", conn_id);

        let sender_task = {
            let conn_id = conn_id.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    match encode_message(&message) {
                        Ok(encoded) => {
                            if let Err(e) = ws_sender.send(Message::Binary(encoded.into())).await {
                                error!("Failed to send WebSocket message to {}: {}", conn_id, e);
                                break;
                            }
                        }
                        Err(e) => {
                            error!("Failed to encode message for {}: {}", conn_id, e);
                        }
                    }
                }
                debug!("Sender task ended for {}", conn_id);
            })
        };

        let receiver_task = {
            let state = self.state.clone();
            let conn_id = conn_id.clone();

            tokio::spawn(async move {
                while let Some(msg) = ws_receiver.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            if let Err(e) = handle_client_message(&state, &conn_id, &tx, &data).await {
                                warn!("Error handling message from {}: {}", conn_id, e);
                                let error_msg = ServerMessage::Error {
                                    message: e.to_string(),
                                };
                                if tx.send(error_msg).is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(Message::Text(text)) => {
                            warn!("Received unexpected text message from {}: {}", conn_id, text);
                        }
                        Ok(Message::Close(_)) => {
                            info!("Connection {} closed normally", conn_id);
                            break;
                        }
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                        Err(e) => {
                            warn!("WebSocket error for {}: {}", conn_id, e);
                            break;
                        }
                    }
                }
                debug!("Receiver task ended for {}", conn_id);
            })
        };

        let completion_reason = tokio::select! {
            _ = sender_task => "sender task completed",
            _ = receiver_task => "receiver task completed",
        };

        info!(
            "WebSocket connection {} ending ({})",
            conn_id, completion_reason
        );

        for document_id in self.state.connections().unregister(&conn_id).await {
            if let Some(room) = self.state.store().get_room(&document_id) {
                if let Err(e) = room.leave(&conn_id) {
                    error!("Failed to leave document '{}': {}", document_id, e);
                }
            }
        }

        info!("Connection {} fully disconnected and cleaned up", conn_id);
    }
}

/// Handle one message from a client
async fn handle_client_message(
    state: &RelayState,
    conn_id: &str,
    sender: &mpsc::UnboundedSender<ServerMessage>,
    data: &[u8],
) -> SyncResult<()> {
    let message: ClientMessage = decode_message(data)?;

    match message {
        ClientMessage::Join {
            document_id,
            auth_token,
            resume,
        } => {
            if !state.store().authorize(&document_id, auth_token.as_deref()) {
                warn!("Connection {} not authorized for '{}'", conn_id, document_id);
                return Err(SyncError::Unauthorized { document_id });
            }
            let room = state.store().get_or_create_room(&document_id)?;
            room.join(conn_id, sender.clone(), resume.as_ref())?;
            state.connections().record_join(conn_id, &document_id).await;
        }

        ClientMessage::SubmitSteps {
            document_id,
            base_version,
            steps,
            client_id,
        } => {
            if !state.connections().has_joined(conn_id, &document_id).await {
                return Err(SyncError::Protocol {
                    message: format!("Submit to '{}' without joining it", document_id),
                });
            }
            match state
                .store()
                .submit(&document_id, base_version, steps, &client_id)
            {
                Ok(version) => {
                    debug!("Accepted batch from {} at version {}", client_id, version);
                }
                Err(SyncError::OutOfDate {
                    base_version,
                    current_version,
                }) => {
                    debug!(
                        "Rejected batch from {} based on {} (now {})",
                        client_id, base_version, current_version
                    );
                    let rejected = ServerMessage::Rejected {
                        document_id,
                        reason: RejectReason::OutOfDate,
                        base_version,
                        current_version,
                    };
                    if sender.send(rejected).is_err() {
                        debug!("Connection {} gone before rejection", conn_id);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        ClientMessage::Save { document_id } => {
            debug!("Connection {} requested save of '{}'", conn_id, document_id);
            state.store().request_save(&document_id)?;
        }
    }

    Ok(())
}
