//! Follow-up edits appended after local transactions.

use crate::bridge::assign_missing_ids;
use crate::model::{Node, Schema};
use crate::transform::Transaction;
use crate::SyncResult;

/// Steps that bring a locally edited document back into shape, if any are needed
///
/// Embedded blocks without a stable id get one, and a document whose last
/// block is not of the schema's trailing type gets an empty one appended.
pub fn correction_transaction(schema: &Schema, doc: &Node) -> SyncResult<Option<Transaction>> {
    let mut tr = Transaction::new();
    assign_missing_ids(schema, doc, &mut tr);

    if let Some(trailing) = schema.trailing_type() {
        let ends_with_trailing = doc
            .last_child()
            .is_some_and(|last| last.node_type() == trailing);
        if !ends_with_trailing {
            let node = schema.create_and_fill(trailing)?;
            tr.insert(doc.content().size(), vec![node]);
        }
    }

    Ok((!tr.is_empty()).then_some(tr))
}
