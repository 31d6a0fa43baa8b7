//! Several clients editing one document through an in-memory relay.

use paper_sync::collab::SyncClient;
use paper_sync::model::{Fragment, Slice};
use paper_sync::protocol::{ClientMessage, RejectReason, ServerMessage};
use paper_sync::{
    paper_schema, ClientConfig, Node, RelayConfig, RelayStore, ResyncPolicy, SyncError, SyncStatus,
    Transaction,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

const DOC: &str = "shared";

/// Deterministic pseudo-random source so failures reproduce
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

struct Peer {
    name: String,
    client: SyncClient,
    tx: mpsc::UnboundedSender<ServerMessage>,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
}

struct Harness {
    store: Arc<RelayStore>,
    peers: Vec<Peer>,
}

impl Harness {
    fn new(config: RelayConfig) -> Self {
        let store = Arc::new(RelayStore::new(paper_schema(), config));
        store.get_or_create_room(DOC).unwrap();
        Self {
            store,
            peers: Vec::new(),
        }
    }

    fn add_peer(&mut self, client_config: ClientConfig) -> usize {
        let (tx, rx) = mpsc::unbounded_channel();
        let idx = self.peers.len();
        self.peers.push(Peer {
            name: format!("peer-{}", idx),
            client: SyncClient::new(paper_schema(), client_config),
            tx,
            rx,
        });
        self.connect(idx);
        idx
    }

    fn connect(&mut self, idx: usize) {
        let join = self.peers[idx].client.join(DOC, None).unwrap();
        self.route(idx, join);
        while self.deliver_one(idx) {}
    }

    /// Drop the transport: queued messages are lost and the room forgets the peer
    fn disconnect(&mut self, idx: usize) {
        let room = self.store.get_room(DOC).unwrap();
        let peer = &mut self.peers[idx];
        room.leave(&peer.name).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        peer.tx = tx;
        peer.rx = rx;
        peer.client.disconnect();
    }

    fn route(&mut self, idx: usize, message: ClientMessage) {
        let peer = &self.peers[idx];
        match message {
            ClientMessage::Join {
                document_id,
                resume,
                ..
            } => {
                let room = self.store.get_or_create_room(&document_id).unwrap();
                room.join(&peer.name, peer.tx.clone(), resume.as_ref())
                    .unwrap();
            }
            ClientMessage::SubmitSteps {
                document_id,
                base_version,
                steps,
                client_id,
            } => match self
                .store
                .submit(&document_id, base_version, steps, &client_id)
            {
                Ok(_) => {}
                Err(SyncError::OutOfDate {
                    base_version,
                    current_version,
                }) => {
                    peer.tx
                        .send(ServerMessage::Rejected {
                            document_id,
                            reason: RejectReason::OutOfDate,
                            base_version,
                            current_version,
                        })
                        .unwrap();
                }
                Err(e) => panic!("relay refused a batch from {}: {}", peer.name, e),
            },
            ClientMessage::Save { document_id } => {
                self.store.request_save(&document_id).unwrap();
            }
        }
    }

    fn deliver_one(&mut self, idx: usize) -> bool {
        let Ok(message) = self.peers[idx].rx.try_recv() else {
            return false;
        };
        let reply = self.peers[idx]
            .client
            .handle_server_message(message)
            .unwrap();
        if let Some(reply) = reply {
            self.route(idx, reply);
        }
        true
    }

    fn flush(&mut self, idx: usize) {
        if let Some(message) = self.peers[idx].client.flush().unwrap() {
            self.route(idx, message);
        }
    }

    /// Flush and deliver until nothing moves
    fn settle(&mut self) {
        loop {
            let mut progress = false;
            for idx in 0..self.peers.len() {
                self.flush(idx);
                while self.deliver_one(idx) {
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
    }

    fn assert_converged(&self) {
        let (version, canonical) = self.store.get_room(DOC).unwrap().snapshot().unwrap();
        for peer in &self.peers {
            assert_eq!(peer.client.pending_len(), 0, "{} has pending steps", peer.name);
            assert_eq!(peer.client.version(), Some(version), "{} version", peer.name);
            assert_eq!(peer.client.doc(), Some(&canonical), "{} document", peer.name);
        }
    }
}

/// A random edit inside the first paragraph (or joining it with the next one)
fn random_edit(rng: &mut Lcg, doc: &Node) -> Transaction {
    let schema = paper_schema();
    let start = doc.child(0).node_size() + 1;
    let len = doc.child(1).content().size();
    let mut tr = Transaction::new();
    match rng.below(7) {
        2 if len > 0 => {
            let at = start + rng.below(len);
            tr.delete(at, at + 1);
        }
        3 if len >= 2 => {
            let from = start + rng.below(len - 1);
            let bold = schema.mark("bold", Default::default()).unwrap();
            tr.add_mark(from, from + 2, bold);
        }
        4 => {
            let at = start + rng.below(len + 1);
            let halves = Fragment::from_nodes(vec![
                schema.create_and_fill("paragraph").unwrap(),
                schema.create_and_fill("paragraph").unwrap(),
            ]);
            tr.replace(at, at, Slice::new(halves, 1, 1));
        }
        6 if len >= 2 => {
            // mark a range, then keep typing inside it
            let from = start + rng.below(len - 1);
            let italic = schema.mark("italic", Default::default()).unwrap();
            tr.add_mark(from, from + 2, italic).insert_text(from + 1, "x");
        }
        5 if doc.child_count() > 2 => {
            tr.delete(start + len, start + len + 2);
        }
        _ => {
            let letter = (b'a' + rng.below(26) as u8) as char;
            tr.insert_text(start + rng.below(len + 1), &letter.to_string());
        }
    }
    tr
}

#[test]
fn test_random_concurrent_editing_converges() {
    let mut harness = Harness::new(RelayConfig::default());
    for _ in 0..3 {
        harness.add_peer(ClientConfig::default());
    }
    let mut rng = Lcg(42);

    for _ in 0..60 {
        let idx = rng.below(harness.peers.len());
        match rng.below(4) {
            0 | 1 => {
                let doc = harness.peers[idx].client.doc().unwrap().clone();
                let tr = random_edit(&mut rng, &doc);
                assert_ok!(harness.peers[idx].client.apply_local_transaction(&tr));
            }
            2 => harness.flush(idx),
            _ => {
                for _ in 0..rng.below(3) + 1 {
                    harness.deliver_one(idx);
                }
            }
        }
    }
    harness.settle();
    harness.assert_converged();
}

#[test]
fn test_same_prefix_same_tree() {
    let mut harness = Harness::new(RelayConfig::default());
    let a = harness.add_peer(ClientConfig::default());
    let b = harness.add_peer(ClientConfig::default());

    let mut tr = Transaction::new();
    tr.insert_text(1, "Minutes").insert_text(10, "agreed");
    assert_ok!(harness.peers[a].client.apply_local_transaction(&tr));
    harness.flush(a);

    // b has no pending steps and receives the batch
    while harness.deliver_one(b) {}
    while harness.deliver_one(a) {}
    assert_eq!(harness.peers[a].client.doc(), harness.peers[b].client.doc());
    assert_eq!(
        harness.peers[b].client.doc().unwrap().title().as_deref(),
        Some("Minutes")
    );
    assert_eq!(harness.peers[b].client.status(), SyncStatus::Syncing);
}

#[test]
fn test_offline_edits_survive_warm_resume() {
    let mut harness = Harness::new(RelayConfig::default());
    let a = harness.add_peer(ClientConfig::default());
    let b = harness.add_peer(ClientConfig::default());

    let mut first = Transaction::new();
    first.insert_text(3, "shared ");
    assert_ok!(harness.peers[a].client.apply_local_transaction(&first));
    harness.settle();

    harness.disconnect(a);
    let mut offline = Transaction::new();
    offline.insert_text(3, "offline ");
    assert_ok!(harness.peers[a].client.apply_local_transaction(&offline));
    harness.flush(a);
    assert_eq!(harness.peers[a].client.pending_len(), 1);

    let mut online = Transaction::new();
    online.insert_text(10, "online");
    assert_ok!(harness.peers[b].client.apply_local_transaction(&online));
    harness.settle();

    harness.connect(a);
    assert_eq!(harness.peers[a].client.status(), SyncStatus::AwaitingAck);
    harness.settle();
    harness.assert_converged();

    let text = harness.peers[b].client.doc().unwrap().child(1).text_content();
    assert!(text.contains("offline"), "{}", text);
    assert!(text.contains("online"), "{}", text);
}

#[test]
fn test_cold_resync_replays_when_history_is_gone() {
    let mut relay_config = RelayConfig::default();
    relay_config.set_history_limit(2);
    let mut harness = Harness::new(relay_config);
    let mut replay = ClientConfig::default();
    replay.set_resync_policy(ResyncPolicy::Replay);
    let a = harness.add_peer(replay);
    let b = harness.add_peer(ClientConfig::default());

    harness.disconnect(a);
    let mut offline = Transaction::new();
    offline.insert_text(3, "kept");
    assert_ok!(harness.peers[a].client.apply_local_transaction(&offline));

    for word in ["one ", "two ", "three "] {
        let mut tr = Transaction::new();
        tr.insert_text(3, word);
        assert_ok!(harness.peers[b].client.apply_local_transaction(&tr));
        harness.settle();
    }

    harness.connect(a);
    harness.settle();
    harness.assert_converged();
    let text = harness.peers[a].client.doc().unwrap().child(1).text_content();
    assert_eq!(text, "keptthree two one ");
}

#[test]
fn test_marking_and_typing_survive_unrelated_edit() {
    let mut harness = Harness::new(RelayConfig::default());
    let a = harness.add_peer(ClientConfig::default());
    let b = harness.add_peer(ClientConfig::default());

    let mut text = Transaction::new();
    text.insert_text(3, "abcdef");
    assert_ok!(harness.peers[a].client.apply_local_transaction(&text));
    harness.settle();

    // bold part of the text, settle, then bold a range overlapping it
    let bold = paper_schema().mark("bold", Default::default()).unwrap();
    let mut first = Transaction::new();
    first.add_mark(5, 7, bold.clone());
    assert_ok!(harness.peers[a].client.apply_local_transaction(&first));
    harness.settle();

    let mut events = harness.peers[a].client.subscribe();
    let mut overlap = Transaction::new();
    overlap.add_mark(3, 9, bold).insert_text(5, "X");
    assert_ok!(harness.peers[a].client.apply_local_transaction(&overlap));

    let mut title = Transaction::new();
    title.insert_text(1, "Draft");
    assert_ok!(harness.peers[b].client.apply_local_transaction(&title));
    harness.flush(b);
    harness.settle();
    harness.assert_converged();

    let doc = harness.peers[b].client.doc().unwrap().clone();
    assert_eq!(doc.title().as_deref(), Some("Draft"));
    assert_eq!(doc.child(1).text_content(), "abXcdef");
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, paper_sync::ClientEvent::StepsDropped { .. }),
            "local edit was dropped"
        );
    }
}
