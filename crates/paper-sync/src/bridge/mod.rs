//! Embedded sub-editor bridging.
//!
//! Blocks whose node type is marked embedded (code blocks in the paper
//! schema) host their own editing surface. Steps touching such a block are
//! translated into text edits for its sub-editor, and the sub-editor's edits
//! are turned back into steps. Sub-editors live in an [`EmbedArena`] keyed by
//! the block's stable `id` attribute.

use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

use crate::model::{Fragment, Node, Schema, Slice};
use crate::transform::{Step, Transaction};
use crate::{SyncError, SyncResult};

/// A change to a sub-editor's text, in characters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub offset: usize,
    pub delete_len: usize,
    pub insert: String,
}

impl TextEdit {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            delete_len: 0,
            insert: text.into(),
        }
    }

    pub fn delete(offset: usize, len: usize) -> Self {
        Self {
            offset,
            delete_len: len,
            insert: String::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.delete_len == 0 && self.insert.is_empty()
    }
}

/// An embedded editing surface with its own content model
pub trait SubEditor: Send {
    fn text(&self) -> String;

    /// Apply a fine-grained edit coming from the outer document
    fn apply_edit(&mut self, edit: &TextEdit) -> SyncResult<()>;

    /// Throw away all state and start over from `text`
    fn reset(&mut self, text: &str);
}

/// Plain character buffer, the simplest [`SubEditor`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    chars: Vec<char>,
}

impl TextBuffer {
    pub fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
        }
    }
}

impl SubEditor for TextBuffer {
    fn text(&self) -> String {
        self.chars.iter().collect()
    }

    fn apply_edit(&mut self, edit: &TextEdit) -> SyncResult<()> {
        let end = edit.offset + edit.delete_len;
        if end > self.chars.len() {
            return Err(SyncError::invalid_step(format!(
                "Edit {}..{} outside text of length {}",
                edit.offset,
                end,
                self.chars.len()
            )));
        }
        self.chars.splice(edit.offset..end, edit.insert.chars());
        Ok(())
    }

    fn reset(&mut self, text: &str) {
        self.chars = text.chars().collect();
    }
}

/// How a step affects one embedded block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeUpdate {
    Edits(Vec<TextEdit>),
    /// The block was replaced or restructured; rebuild the sub-editor
    Reinitialize,
}

/// Stable identifier of an embedded block
pub fn block_id(node: &Node) -> Option<&str> {
    node.attr("id").and_then(JsonValue::as_str)
}

/// Append steps giving every embedded block without an id a fresh one
///
/// Returns the number of blocks that received an id.
pub fn assign_missing_ids(schema: &Schema, doc: &Node, tr: &mut Transaction) -> usize {
    let mut assigned = 0;
    doc.descendants(|node, pos, _| {
        if !schema.is_embedded(node.node_type()) {
            return true;
        }
        if block_id(node).is_none() {
            let mut attrs = node.attrs().clone();
            attrs.insert(
                "id".to_string(),
                JsonValue::String(Uuid::new_v4().to_string()),
            );
            tr.set_node_attrs(pos, attrs);
            assigned += 1;
        }
        false
    });
    assigned
}

/// Embedded blocks that carry an id, with their positions
pub fn embedded_blocks(schema: &Schema, doc: &Node) -> Vec<(usize, Node)> {
    let mut blocks = Vec::new();
    doc.descendants(|node, pos, _| {
        if schema.is_embedded(node.node_type()) {
            if block_id(node).is_some() {
                blocks.push((pos, node.clone()));
            }
            return false;
        }
        true
    });
    blocks
}

/// Find an embedded block by id
pub fn find_block(schema: &Schema, doc: &Node, id: &str) -> Option<(usize, Node)> {
    embedded_blocks(schema, doc)
        .into_iter()
        .find(|(_, node)| block_id(node) == Some(id))
}

/// Translate a step into edits for the block at `block_pos`
///
/// Returns `None` when the step leaves the block's text alone. A replace that
/// stays inside the block's text with plain text content becomes a single
/// edit; anything overlapping the block only partly, or inserting structure,
/// reinitializes the sub-editor.
pub fn translate_step(step: &Step, block_pos: usize, block: &Node) -> Option<BridgeUpdate> {
    let Step::ReplaceRange { from, to, slice } = step else {
        return None;
    };
    let (from, to) = (*from, *to);
    let start = block_pos + 1;
    let end = start + block.content().size();
    let outer_end = block_pos + block.node_size();

    if from >= start && to <= end {
        if !slice.is_plain_text() {
            return Some(BridgeUpdate::Reinitialize);
        }
        let edit = TextEdit {
            offset: from - start,
            delete_len: to - from,
            insert: slice.content().text_content(),
        };
        if edit.is_noop() {
            return None;
        }
        return Some(BridgeUpdate::Edits(vec![edit]));
    }
    if from < outer_end && to > block_pos {
        return Some(BridgeUpdate::Reinitialize);
    }
    None
}

/// Turn a sub-editor's own edit into a step against the outer document
pub fn edit_to_step(schema: &Schema, doc: &Node, id: &str, edit: &TextEdit) -> SyncResult<Step> {
    let (pos, block) = find_block(schema, doc, id)
        .ok_or_else(|| SyncError::invalid_step(format!("No embedded block with id '{}'", id)))?;
    let size = block.content().size();
    if edit.offset + edit.delete_len > size {
        return Err(SyncError::invalid_step(format!(
            "Edit {}..{} outside block '{}' of length {}",
            edit.offset,
            edit.offset + edit.delete_len,
            id,
            size
        )));
    }
    let from = pos + 1 + edit.offset;
    let slice = if edit.insert.is_empty() {
        Slice::empty()
    } else {
        Slice::closed(Fragment::from_node(schema.text(&edit.insert, Vec::new())))
    };
    Ok(Step::ReplaceRange {
        from,
        to: from + edit.delete_len,
        slice,
    })
}

/// What an arena update did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaChanges {
    pub created: Vec<String>,
    pub removed: Vec<String>,
    pub reset: Vec<String>,
    /// Blocks that received incremental edits
    pub edited: Vec<String>,
}

impl ArenaChanges {
    fn merge(&mut self, other: ArenaChanges) {
        self.created.extend(other.created);
        self.removed.extend(other.removed);
        self.reset.extend(other.reset);
        self.edited.extend(other.edited);
    }
}

/// Sub-editor instances keyed by block id
///
/// Instances are created when a block with an id appears in the document
/// and dropped when it disappears.
pub struct EmbedArena<E: SubEditor> {
    editors: HashMap<String, E>,
    factory: Box<dyn Fn() -> E + Send>,
}

impl<E: SubEditor> EmbedArena<E> {
    pub fn new(factory: impl Fn() -> E + Send + 'static) -> Self {
        Self {
            editors: HashMap::new(),
            factory: Box::new(factory),
        }
    }

    pub fn get(&self, id: &str) -> Option<&E> {
        self.editors.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut E> {
        self.editors.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.editors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.editors.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.editors.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reconcile instances with the blocks present in `doc`
    ///
    /// Missing instances are created, instances of vanished blocks dropped,
    /// and instances whose text drifted from the block are reset.
    pub fn sync_with_doc(&mut self, schema: &Schema, doc: &Node) -> ArenaChanges {
        let mut changes = ArenaChanges::default();
        let mut present = HashSet::new();

        for (_, block) in embedded_blocks(schema, doc) {
            let Some(id) = block_id(&block) else {
                continue;
            };
            present.insert(id.to_string());
            let text = block.text_content();
            match self.editors.get_mut(id) {
                Some(editor) => {
                    if editor.text() != text {
                        editor.reset(&text);
                        changes.reset.push(id.to_string());
                    }
                }
                None => {
                    let mut editor = (self.factory)();
                    editor.reset(&text);
                    self.editors.insert(id.to_string(), editor);
                    changes.created.push(id.to_string());
                }
            }
        }

        let gone: Vec<String> = self
            .editors
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            debug!("Dropping sub-editor for block {}", id);
            self.editors.remove(&id);
            changes.removed.push(id);
        }
        changes
    }

    /// Forward a step applied to the outer document to the affected sub-editors
    ///
    /// `before` and `after` are the documents around the step. Steps that
    /// came from a sub-editor through [`edit_to_step`] are already reflected
    /// in it and must not be passed here.
    pub fn apply_step(
        &mut self,
        schema: &Schema,
        before: &Node,
        step: &Step,
        after: &Node,
    ) -> ArenaChanges {
        let mut changes = ArenaChanges::default();

        for (pos, block) in embedded_blocks(schema, before) {
            let Some(id) = block_id(&block) else {
                continue;
            };
            let Some(editor) = self.editors.get_mut(id) else {
                continue;
            };
            match translate_step(step, pos, &block) {
                Some(BridgeUpdate::Edits(edits)) => {
                    let applied = edits.iter().try_for_each(|edit| editor.apply_edit(edit));
                    match applied {
                        Ok(()) => changes.edited.push(id.to_string()),
                        Err(e) => {
                            debug!("Sub-editor {} out of step, resetting: {}", id, e);
                            if let Some((_, fresh)) = find_block(schema, after, id) {
                                editor.reset(&fresh.text_content());
                                changes.reset.push(id.to_string());
                            }
                        }
                    }
                }
                Some(BridgeUpdate::Reinitialize) => {
                    if let Some((_, fresh)) = find_block(schema, after, id) {
                        editor.reset(&fresh.text_content());
                        changes.reset.push(id.to_string());
                    }
                }
                None => {}
            }
        }

        changes.merge(self.sync_with_doc(schema, after));
        changes
    }

    /// Forward a sequence of steps, as carried by
    /// [`ClientEvent::StepsApplied`](crate::collab::ClientEvent::StepsApplied)
    ///
    /// `docs[i]` is the document before `steps[i]` and `after` the document
    /// after the last one.
    pub fn apply_steps(
        &mut self,
        schema: &Schema,
        steps: &[Step],
        docs: &[Node],
        after: &Node,
    ) -> ArenaChanges {
        let mut changes = ArenaChanges::default();
        for (i, (step, before)) in steps.iter().zip(docs).enumerate() {
            let next = docs.get(i + 1).unwrap_or(after);
            changes.merge(self.apply_step(schema, before, step, next));
        }
        changes
    }
}
