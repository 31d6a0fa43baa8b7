//! Replacing a range of a document with a slice.
//!
//! Open sides of the slice are joined with the nodes around the replaced
//! range; every node rebuilt along the way is checked against the schema so a
//! join that breaks a content grammar fails instead of producing a bad tree.

use crate::model::{Fragment, Node, ResolvedPos, Schema, Slice};
use crate::{SyncError, SyncResult};

/// Replace `from..to` in `doc` with `slice`
pub(crate) fn replace(
    schema: &Schema,
    doc: &Node,
    from: usize,
    to: usize,
    slice: &Slice,
) -> SyncResult<Node> {
    let rfrom = doc.resolve(from)?;
    let rto = doc.resolve(to)?;
    if slice.open_start() > rfrom.depth() {
        return Err(SyncError::invalid_step(
            "Inserted content deeper than insertion position",
        ));
    }
    if rfrom.depth() - slice.open_start() + slice.open_end() != rto.depth() {
        return Err(SyncError::invalid_step("Inconsistent open depths"));
    }
    Replacer { schema }.outer(&rfrom, &rto, slice, 0)
}

struct Replacer<'a> {
    schema: &'a Schema,
}

impl Replacer<'_> {
    fn outer(
        &self,
        rfrom: &ResolvedPos,
        rto: &ResolvedPos,
        slice: &Slice,
        depth: usize,
    ) -> SyncResult<Node> {
        let index = rfrom.index(depth);
        let node = rfrom.node(depth);
        if index == rto.index(depth) && depth < rfrom.depth() - slice.open_start() {
            let inner = self.outer(rfrom, rto, slice, depth + 1)?;
            return Ok(node.copy(node.content().replace_child(index, inner)));
        }
        if slice.content().size() == 0 {
            let content = self.two_way(rfrom, rto, depth)?;
            return self.close(node, content);
        }
        if slice.open_start() == 0
            && slice.open_end() == 0
            && rfrom.depth() == depth
            && rto.depth() == depth
        {
            let parent = rfrom.parent();
            let content = parent.content();
            let joined = content
                .cut(0, rfrom.parent_offset())
                .append(slice.content())
                .append(&content.cut(rto.parent_offset(), content.size()));
            return self.close(parent, joined);
        }
        let (start, end) = prepare_slice(slice, rfrom)?;
        let content = self.three_way(rfrom, &start, &end, rto, depth)?;
        self.close(node, content)
    }

    fn close(&self, node: &Node, content: Fragment) -> SyncResult<Node> {
        let node = node.copy(content);
        self.schema.check_content(&node)?;
        Ok(node)
    }

    fn check_join(&self, main: &Node, sub: &Node) -> SyncResult<()> {
        if self
            .schema
            .compatible_content(main.node_type(), sub.node_type())
        {
            Ok(())
        } else {
            Err(SyncError::invalid_step(format!(
                "Cannot join {} onto {}",
                sub.node_type(),
                main.node_type()
            )))
        }
    }

    fn joinable(&self, before: &ResolvedPos, after: &ResolvedPos, depth: usize) -> SyncResult<Node> {
        let node = before.node(depth);
        self.check_join(node, after.node(depth))?;
        Ok(node.clone())
    }

    fn three_way(
        &self,
        rfrom: &ResolvedPos,
        start: &ResolvedPos,
        end: &ResolvedPos,
        rto: &ResolvedPos,
        depth: usize,
    ) -> SyncResult<Fragment> {
        let open_start = if rfrom.depth() > depth {
            Some(self.joinable(rfrom, start, depth + 1)?)
        } else {
            None
        };
        let open_end = if rto.depth() > depth {
            Some(self.joinable(end, rto, depth + 1)?)
        } else {
            None
        };

        let mut content = Vec::new();
        add_range(None, Some(rfrom), depth, &mut content);
        match (&open_start, &open_end) {
            (Some(os), Some(oe)) if start.index(depth) == end.index(depth) => {
                self.check_join(os, oe)?;
                let inner = self.three_way(rfrom, start, end, rto, depth + 1)?;
                content.push(self.close(os, inner)?);
            }
            _ => {
                if let Some(os) = &open_start {
                    let inner = self.two_way(rfrom, start, depth + 1)?;
                    content.push(self.close(os, inner)?);
                }
                add_range(Some(start), Some(end), depth, &mut content);
                if let Some(oe) = &open_end {
                    let inner = self.two_way(end, rto, depth + 1)?;
                    content.push(self.close(oe, inner)?);
                }
            }
        }
        add_range(Some(rto), None, depth, &mut content);
        Ok(Fragment::from_nodes(content))
    }

    fn two_way(&self, rfrom: &ResolvedPos, rto: &ResolvedPos, depth: usize) -> SyncResult<Fragment> {
        let mut content = Vec::new();
        add_range(None, Some(rfrom), depth, &mut content);
        if rfrom.depth() > depth {
            let node = self.joinable(rfrom, rto, depth + 1)?;
            let inner = self.two_way(rfrom, rto, depth + 1)?;
            content.push(self.close(&node, inner)?);
        }
        add_range(Some(rto), None, depth, &mut content);
        Ok(Fragment::from_nodes(content))
    }
}

/// Push the children of the node at `depth` lying between `start` and `end`
fn add_range(
    start: Option<&ResolvedPos>,
    end: Option<&ResolvedPos>,
    depth: usize,
    target: &mut Vec<Node>,
) {
    let Some(node) = end.or(start).map(|pos| pos.node(depth)) else {
        return;
    };
    let mut start_index = 0;
    let end_index = end.map_or(node.child_count(), |end| end.index(depth));
    if let Some(start) = start {
        start_index = start.index(depth);
        if start.depth() > depth {
            start_index += 1;
        } else if start.text_offset() > 0 {
            if let Some(after) = start.node_after() {
                target.push(after);
            }
            start_index += 1;
        }
    }
    for i in start_index..end_index {
        target.push(node.child(i).clone());
    }
    if let Some(end) = end {
        if end.depth() == depth && end.text_offset() > 0 {
            if let Some(before) = end.node_before() {
                target.push(before);
            }
        }
    }
}

/// Wrap the slice in copies of the ancestors of `along` so its open sides can
/// be resolved at the same depths as the replaced range
fn prepare_slice(slice: &Slice, along: &ResolvedPos) -> SyncResult<(ResolvedPos, ResolvedPos)> {
    let extra = along.depth() - slice.open_start();
    let mut node = along.node(extra).copy(slice.content().clone());
    for depth in (0..extra).rev() {
        node = along.node(depth).copy(Fragment::from_node(node));
    }
    let start = node.resolve(slice.open_start() + extra)?;
    let end = node.resolve(node.content().size() - slice.open_end() - extra)?;
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::paper_schema;
    use serde_json::json;

    fn two_paragraphs() -> Node {
        paper_schema()
            .doc_from_json(&json!({
                "type": "doc",
                "content": [
                    {"type": "title"},
                    {"type": "paragraph", "content": [{"type": "text", "text": "abc"}]},
                    {"type": "paragraph", "content": [{"type": "text", "text": "def"}]}
                ]
            }))
            .unwrap()
    }

    #[test]
    fn test_insert_text_flat() {
        let schema = paper_schema();
        let doc = two_paragraphs();
        let slice = Slice::closed(Fragment::from_node(schema.text("XY", vec![])));
        let result = replace(&schema, &doc, 4, 4, &slice).unwrap();
        assert_eq!(result.child(1).text_content(), "aXYbc");
        assert_eq!(result.content().size(), doc.content().size() + 2);
    }

    #[test]
    fn test_delete_across_blocks_joins_paragraphs() {
        let schema = paper_schema();
        let doc = two_paragraphs();
        // from after "a" to before "f"
        let result = replace(&schema, &doc, 4, 10, &Slice::empty()).unwrap();
        assert_eq!(result.child_count(), 2);
        assert_eq!(result.child(1).text_content(), "af");
    }

    #[test]
    fn test_split_paragraph_with_open_slice() {
        let schema = paper_schema();
        let doc = two_paragraphs();
        let para = schema.node("paragraph", Default::default(), vec![]).unwrap();
        let slice = Slice::new(Fragment::from_nodes(vec![para.clone(), para]), 1, 1);
        let result = replace(&schema, &doc, 4, 4, &slice).unwrap();
        assert_eq!(result.child_count(), 4);
        assert_eq!(result.child(1).text_content(), "a");
        assert_eq!(result.child(2).text_content(), "bc");
    }

    #[test]
    fn test_join_into_title_rejects_marks() {
        let schema = paper_schema();
        let doc = schema
            .doc_from_json(&json!({
                "type": "doc",
                "content": [
                    {"type": "title", "content": [{"type": "text", "text": "T"}]},
                    {"type": "paragraph", "content": [
                        {"type": "text", "text": "abc", "marks": [{"type": "bold"}]}
                    ]},
                    {"type": "paragraph"}
                ]
            }))
            .unwrap();
        // joining the bold paragraph text onto the title is not allowed
        let err = replace(&schema, &doc, 2, 5, &Slice::empty()).unwrap_err();
        assert!(matches!(err, SyncError::SchemaViolation { .. }));
    }

    #[test]
    fn test_incompatible_join_rejected() {
        let schema = paper_schema();
        let doc = schema
            .doc_from_json(&json!({
                "type": "doc",
                "content": [
                    {"type": "title"},
                    {"type": "bullet_list", "content": [
                        {"type": "list_item", "content": [{"type": "paragraph"}]}
                    ]},
                    {"type": "paragraph", "content": [{"type": "text", "text": "x"}]}
                ]
            }))
            .unwrap();
        // a list item cannot be closed against a top-level paragraph
        let err = replace(&schema, &doc, 4, 9, &Slice::empty()).unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_open_depth_mismatch_rejected() {
        let schema = paper_schema();
        let doc = two_paragraphs();
        let slice = Slice::new(Fragment::from_node(schema.text("x", vec![])), 0, 1);
        assert!(matches!(
            replace(&schema, &doc, 4, 4, &slice),
            Err(SyncError::InvalidStep { .. })
        ));
    }
}
