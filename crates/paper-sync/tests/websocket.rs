use paper_sync::axum::{connect, ClientHandle};
use paper_sync::{
    paper_schema, router_with_relay_state, ClientConfig, RelayConfig, RelayState, RelayStore,
    SyncClient, SyncStatus, Transaction,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

async fn start_relay() -> (SocketAddr, Arc<RelayStore>) {
    let store = Arc::new(RelayStore::new(paper_schema(), RelayConfig::default()));
    let state = RelayState::new(store.clone());
    let app = router_with_relay_state(state.clone()).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, store)
}

fn spawn_client(addr: SocketAddr) -> ClientHandle {
    let client = SyncClient::new(paper_schema(), ClientConfig::default());
    let (handle, _driver) = connect(format!("ws://{}/paper", addr), "minutes", None, client);
    handle
}

async fn wait_for<F>(handle: &ClientHandle, check: F)
where
    F: Fn(&SyncClient) -> bool,
{
    timeout(Duration::from_secs(5), async {
        while !handle.with_client(&check).await {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client did not reach the expected state");
}

#[tokio::test]
async fn test_two_clients_converge_over_websocket() {
    let (addr, store) = start_relay().await;
    let alice = spawn_client(addr);
    let bob = spawn_client(addr);

    let synced = |c: &SyncClient| c.status() == SyncStatus::Syncing;
    wait_for(&alice, synced).await;
    wait_for(&bob, synced).await;

    let mut title = Transaction::new();
    title.insert_text(1, "Plan");
    alice.apply_local_transaction(&title).await.unwrap();

    wait_for(&bob, |c| c.version() == Some(1)).await;
    let mut body = Transaction::new();
    body.insert_text(7, "first item");
    bob.apply_local_transaction(&body).await.unwrap();

    let settled = |c: &SyncClient| c.pending_len() == 0 && c.version() == Some(2);
    wait_for(&alice, settled).await;
    wait_for(&bob, settled).await;

    let (version, canonical) = store.get_room("minutes").unwrap().snapshot().unwrap();
    assert_eq!(version, 2);
    assert_eq!(alice.doc().await.as_ref(), Some(&canonical));
    assert_eq!(bob.doc().await.as_ref(), Some(&canonical));
    assert_eq!(canonical.title().as_deref(), Some("Plan"));
    assert_eq!(canonical.child(1).text_content(), "first item");

    alice.shutdown();
    bob.shutdown();
}

#[tokio::test]
async fn test_save_request_reaches_relay_observers() {
    let (addr, store) = start_relay().await;
    let mut events = store.subscribe_events();
    let alice = spawn_client(addr);
    wait_for(&alice, |c| c.status() == SyncStatus::Syncing).await;

    alice.request_save().await.unwrap();
    let event = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(paper_sync::RelayEvent::SaveRequested { document_id }) => break document_id,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {}", e),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event, "minutes");
    alice.shutdown();
}
