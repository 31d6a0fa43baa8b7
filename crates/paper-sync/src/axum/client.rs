//! WebSocket transport for a [`SyncClient`].
//!
//! [`connect`] spawns a driver task that owns the connection: it joins (or
//! resumes) the document, feeds relay messages to the client, flushes local
//! edits, enforces the flush timeout and reconnects with backoff.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::collab::{ClientEvent, SyncClient};
use crate::config::ResyncPolicy;
use crate::model::Node;
use crate::protocol::{decode_message, encode_message, ClientMessage, ServerMessage};
use crate::transform::Transaction;
use crate::{SyncError, SyncResult};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TIMEOUT_CHECK: Duration = Duration::from_millis(250);

/// Application side of a connected client
#[derive(Clone)]
pub struct ClientHandle {
    client: Arc<Mutex<SyncClient>>,
    flush: Arc<Notify>,
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    shutdown: watch::Sender<bool>,
}

impl ClientHandle {
    /// Apply a local edit and schedule a flush
    pub async fn apply_local_transaction(&self, tr: &Transaction) -> SyncResult<()> {
        self.client.lock().await.apply_local_transaction(tr)?;
        self.flush.notify_one();
        Ok(())
    }

    /// Snapshot of the local document
    pub async fn doc(&self) -> Option<Node> {
        self.client.lock().await.doc().cloned()
    }

    /// Run a closure against the client state
    pub async fn with_client<R>(&self, f: impl FnOnce(&SyncClient) -> R) -> R {
        f(&*self.client.lock().await)
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.client.lock().await.subscribe()
    }

    pub async fn resolve_resync(&self, policy: ResyncPolicy) -> SyncResult<()> {
        self.client.lock().await.resolve_resync(policy)?;
        self.flush.notify_one();
        Ok(())
    }

    /// Ask the relay to persist the document now
    pub async fn request_save(&self) -> SyncResult<()> {
        let message = self.client.lock().await.request_save()?;
        self.outgoing
            .send(message)
            .map_err(|_| SyncError::TransportFailure("client driver stopped".to_string()))
    }

    /// Stop the driver and close the connection
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Connect a new client to `url` and keep it attached to `document_id`
pub fn connect(
    url: impl Into<String>,
    document_id: impl Into<String>,
    auth_token: Option<String>,
    client: SyncClient,
) -> (ClientHandle, JoinHandle<()>) {
    let client = Arc::new(Mutex::new(client));
    let flush = Arc::new(Notify::new());
    let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
    let (shutdown, shutdown_rx) = watch::channel(false);

    let driver = Driver {
        url: url.into(),
        document_id: document_id.into(),
        auth_token,
        client: client.clone(),
        flush: flush.clone(),
        outgoing: outgoing_rx,
        shutdown: shutdown_rx,
    };
    let handle = tokio::spawn(driver.run());

    (
        ClientHandle {
            client,
            flush,
            outgoing,
            shutdown,
        },
        handle,
    )
}

struct Driver {
    url: String,
    document_id: String,
    auth_token: Option<String>,
    client: Arc<Mutex<SyncClient>>,
    flush: Arc<Notify>,
    outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self) {
        let mut attempt = 0u32;
        loop {
            match connect_async(self.url.as_str()).await {
                Ok((socket, _)) => {
                    info!("Connected to {}", self.url);
                    attempt = 0;
                    match self.session(socket).await {
                        Ok(()) => break,
                        Err(e) => warn!("Connection to {} lost: {}", self.url, e),
                    }
                }
                Err(e) => warn!("Failed to connect to {}: {}", self.url, e),
            }

            self.client.lock().await.disconnect();
            let delay = self.client.lock().await.config().backoff(attempt);
            attempt = attempt.saturating_add(1);
            debug!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
            if *self.shutdown.borrow() {
                break;
            }
        }
        info!("Client driver for '{}' stopped", self.document_id);
    }

    /// Serve one connection; `Ok` means shutdown was requested
    async fn session(&mut self, socket: Socket) -> SyncResult<()> {
        let (mut sink, mut stream): (SplitSink<Socket, Message>, SplitStream<Socket>) = socket.split();

        let join = self
            .client
            .lock()
            .await
            .join(&self.document_id, self.auth_token.clone())?;
        send(&mut sink, &join).await?;

        let mut ticker = interval(TIMEOUT_CHECK);
        loop {
            tokio::select! {
                msg = stream.next() => {
                    let data = match msg {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(SyncError::TransportFailure("connection closed".to_string()));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(SyncError::WebSocket(e.to_string())),
                    };
                    let message: ServerMessage = decode_message(&data)?;
                    let reply = self.client.lock().await.handle_server_message(message)?;
                    if let Some(reply) = reply {
                        send(&mut sink, &reply).await?;
                    }
                }
                _ = self.flush.notified() => {
                    let message = self.client.lock().await.flush()?;
                    if let Some(message) = message {
                        send(&mut sink, &message).await?;
                    }
                }
                Some(message) = self.outgoing.recv() => {
                    send(&mut sink, &message).await?;
                }
                _ = ticker.tick() => {
                    self.client.lock().await.check_timeout(Instant::now())?;
                }
                _ = self.shutdown.changed() => {
                    let _ = sink.close().await;
                    return Ok(());
                }
            }
        }
    }
}

async fn send(sink: &mut SplitSink<Socket, Message>, message: &ClientMessage) -> SyncResult<()> {
    let encoded = encode_message(message)?;
    sink.send(Message::Binary(encoded.into()))
        .await
        .map_err(|e| SyncError::WebSocket(e.to_string()))
}
