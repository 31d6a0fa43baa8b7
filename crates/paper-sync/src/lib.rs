//! # paper-sync
//!
//! Server-mediated real-time synchronization for structured rich-text documents.
//!
//! Clients edit a local document tree optimistically and send the resulting
//! steps to a relay. The relay accepts batches strictly in order and
//! broadcasts them to every client of the document, and clients rebase
//! their unconfirmed steps over whatever arrived first. The relay never
//! transforms steps, so convergence rests on every client applying the same
//! broadcast order.

pub mod bridge;
pub mod collab;
pub mod config;
pub mod error;
pub mod model;
pub mod protocol;
pub mod relay;
pub mod transform;

#[cfg(feature = "persistence")]
pub mod persistence;

#[cfg(feature = "axum")]
pub mod axum;

// Re-exports for convenience
pub use collab::{ClientEvent, CollabState, SyncClient, SyncStatus};
pub use config::{ClientConfig, RelayConfig, ResyncPolicy};
pub use error::{SyncError, SyncResult};
pub use model::{paper_schema, Fragment, Mark, Node, PaperDocument, Schema, Slice};
pub use protocol::{ClientMessage, ServerMessage};
pub use relay::{Authorizer, DocumentRoom, RelayEvent, RelayStore};
pub use transform::{Bias, Mapping, Step, StepMap, Transaction};

#[cfg(feature = "axum")]
pub use axum::{router_with_relay, router_with_relay_state, RelayState, WebSocketHandler};

#[cfg(feature = "persistence")]
pub use persistence::PersistenceManager;
