//! The document tree: immutable nodes, marks, slices and the content grammar
//! they are validated against.

pub mod content;
pub mod fragment;
pub mod mark;
pub mod node;
pub mod paper;
pub mod resolve;
pub mod schema;
pub mod slice;

use std::collections::BTreeMap;

/// Node and mark attributes, ordered by name so equal attribute sets compare
/// and serialize identically on every client
pub type Attrs = BTreeMap<String, serde_json::Value>;

pub use content::ContentExpr;
pub use fragment::Fragment;
pub use mark::Mark;
pub use node::{Node, NodeJson};
pub use paper::{paper_schema, PaperDocument};
pub use resolve::ResolvedPos;
pub use schema::{AttrSpec, MarkSet, MarkSpec, NodeSpec, NodeType, Schema, SchemaBuilder};
pub use slice::{Slice, SliceJson};
