use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use paper_sync::model::PaperDocument;
use paper_sync::{paper_schema, PersistenceManager, RelayConfig, RelayState, RelayStore, SyncError};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};

#[derive(Debug, Deserialize)]
pub struct AppendParagraphRequest {
    pub text: String,
}

fn status_for(error: &SyncError) -> StatusCode {
    match error {
        SyncError::DocumentNotFound { .. } => StatusCode::NOT_FOUND,
        SyncError::OutOfDate { .. } => StatusCode::CONFLICT,
        e if e.is_structural() => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn list_documents(State(state): State<RelayState>) -> Json<Vec<String>> {
    let mut ids = state.store().list_rooms();
    ids.sort();
    Json(ids)
}

/// The canonical document in the typed interchange format
async fn get_document(
    State(state): State<RelayState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let room = state.store().get_room(&id).ok_or(StatusCode::NOT_FOUND)?;
    let (version, doc) = room.snapshot().map_err(|e| status_for(&e))?;
    let document = PaperDocument::from_node(&doc).map_err(|e| status_for(&e))?;

    Ok(Json(json!({
        "version": version,
        "subscribers": room.subscriber_count().unwrap_or_default(),
        "document": document,
    })))
}

/// Append a paragraph as a server-side edit, broadcast like any client batch
async fn append_paragraph(
    State(state): State<RelayState>,
    Path(id): Path<String>,
    Json(request): Json<AppendParagraphRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let room = state
        .store()
        .get_or_create_room(&id)
        .map_err(|e| status_for(&e))?;
    let (version, doc) = room.snapshot().map_err(|e| status_for(&e))?;
    let end = doc.content().size();
    let step = json!({
        "stepType": "replace",
        "from": end,
        "to": end,
        "slice": {"content": [
            {"type": "paragraph", "content": [{"type": "text", "text": request.text}]}
        ]}
    });
    let version = state
        .store()
        .submit(&id, version, vec![step], "server")
        .map_err(|e| status_for(&e))?;

    info!("Appended paragraph to '{}', now at version {}", id, version);
    Ok(Json(json!({ "version": version })))
}

async fn save_document(
    State(state): State<RelayState>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    state
        .store()
        .request_save(&id)
        .map_err(|e| status_for(&e))?;
    Ok(StatusCode::ACCEPTED)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting paper relay...");

    let store = Arc::new(RelayStore::new(paper_schema(), RelayConfig::default()));

    let mut persistence = PersistenceManager::new(store.clone(), "./data");
    let loaded = persistence.load_all().await?;
    info!("Restored {} documents", loaded);
    persistence.start().await?;

    let state = RelayState::new(store);

    let app: Router = paper_sync::router_with_relay_state(state.clone())
        .route("/documents", get(list_documents))
        .route("/documents/{id}", get(get_document))
        .route("/documents/{id}/paragraphs", post(append_paragraph))
        .route("/documents/{id}/save", post(save_document))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:3001").await?;
    info!("Server running on http://127.0.0.1:3001");
    info!("WebSocket endpoint available at ws://127.0.0.1:3001/paper");
    info!("API endpoints:");
    info!("  GET    /documents                 - List open documents");
    info!("  GET    /documents/:id             - Get a document as PaperDocument JSON");
    info!("  POST   /documents/:id/paragraphs  - Append a paragraph");
    info!("  POST   /documents/:id/save        - Persist a document now");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    persistence.stop().await;
    Ok(())
}
