//! The relay: per-document authorities that linearize step batches.

pub mod room;
pub mod store;

pub use room::{DocumentRoom, JoinOutcome, LoggedStep, RoomSnapshot};
pub use store::{RelayEvent, RelayStore};

/// Decides whether a connection may join a document
pub trait Authorizer: Send + Sync {
    fn authorize(&self, document_id: &str, token: Option<&str>) -> bool;
}

/// Lets everyone in
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _document_id: &str, _token: Option<&str>) -> bool {
        true
    }
}
