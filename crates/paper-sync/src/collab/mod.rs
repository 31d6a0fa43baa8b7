//! Client-side synchronization: local state, rebase and the sync client.

pub mod client;
pub mod corrections;
pub mod state;

pub use client::{ClientEvent, Sendable, SyncClient, SyncStatus};
pub use corrections::correction_transaction;
pub use state::{rebase_steps, CollabState, Rebaseable, Received};
