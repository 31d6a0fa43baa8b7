use std::sync::Arc;

use super::Node;

/// An immutable, shareable sequence of child nodes
///
/// Adjacent text nodes with identical marks are always merged and empty text
/// nodes dropped, so two fragments holding the same content compare equal no
/// matter how they were built.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fragment {
    nodes: Arc<Vec<Node>>,
    size: usize,
}

impl Fragment {
    /// The empty fragment
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a fragment from a list of nodes, normalizing text runs
    pub fn from_nodes(nodes: Vec<Node>) -> Self {
        let mut joined: Vec<Node> = Vec::with_capacity(nodes.len());
        for node in nodes {
            push_node(&mut joined, node);
        }
        let size = joined.iter().map(Node::node_size).sum();
        Self {
            nodes: Arc::new(joined),
            size,
        }
    }

    /// Build a fragment holding a single node
    pub fn from_node(node: Node) -> Self {
        Self::from_nodes(vec![node])
    }

    /// Total size of the fragment in positions
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn child_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get the child at the given index
    ///
    /// Panics when the index is out of bounds, like slice indexing.
    pub fn child(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn maybe_child(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn first_child(&self) -> Option<&Node> {
        self.nodes.first()
    }

    pub fn last_child(&self) -> Option<&Node> {
        self.nodes.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    pub fn to_vec(&self) -> Vec<Node> {
        self.nodes.as_ref().clone()
    }

    /// Concatenated text of all descendant text nodes
    pub fn text_content(&self) -> String {
        self.nodes.iter().map(Node::text_content).collect()
    }

    /// Find the child index containing `pos`, with the offset at which that child starts
    ///
    /// A position on a boundary between two children resolves to the later one.
    pub fn find_index(&self, pos: usize) -> (usize, usize) {
        if pos == 0 {
            return (0, 0);
        }
        if pos >= self.size {
            return (self.nodes.len(), self.size);
        }
        let mut cur = 0;
        for (index, child) in self.nodes.iter().enumerate() {
            let end = cur + child.node_size();
            if end >= pos {
                if end == pos {
                    return (index + 1, end);
                }
                return (index, cur);
            }
            cur = end;
        }
        (self.nodes.len(), self.size)
    }

    /// Cut out the part of the fragment between two positions
    pub fn cut(&self, from: usize, to: usize) -> Fragment {
        if from == 0 && to >= self.size {
            return self.clone();
        }
        let mut result = Vec::new();
        if to > from {
            let mut pos = 0;
            for child in self.nodes.iter() {
                if pos >= to {
                    break;
                }
                let end = pos + child.node_size();
                if end > from {
                    let piece = if pos < from || end > to {
                        if child.is_text() {
                            child.cut(from.saturating_sub(pos), (to - pos).min(child.text_len()))
                        } else {
                            child.cut(
                                from.saturating_sub(pos + 1),
                                (to.saturating_sub(pos + 1)).min(child.content().size()),
                            )
                        }
                    } else {
                        child.clone()
                    };
                    result.push(piece);
                }
                pos = end;
            }
        }
        Fragment::from_nodes(result)
    }

    /// Append another fragment, joining text at the seam
    pub fn append(&self, other: &Fragment) -> Fragment {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut nodes = self.to_vec();
        nodes.extend(other.iter().cloned());
        Fragment::from_nodes(nodes)
    }

    /// Replace the child at `index` with a new node
    pub fn replace_child(&self, index: usize, node: Node) -> Fragment {
        let mut nodes = self.to_vec();
        nodes[index] = node;
        Fragment::from_nodes(nodes)
    }

    /// Walk descendants, calling `f(node, absolute_pos, parent)`
    ///
    /// When `f` returns false the node's children are skipped. `start` is the
    /// absolute position at which this fragment begins.
    pub fn descendants<F>(&self, start: usize, parent: &Node, f: &mut F)
    where
        F: FnMut(&Node, usize, &Node) -> bool,
    {
        let mut pos = start;
        for child in self.nodes.iter() {
            if f(child, pos, parent) && !child.content().is_empty() {
                child.content().descendants(pos + 1, child, f);
            }
            pos += child.node_size();
        }
    }

    /// Walk the nodes overlapping `from..to` (relative to this fragment)
    pub fn nodes_between<F>(&self, from: usize, to: usize, start: usize, parent: &Node, f: &mut F)
    where
        F: FnMut(&Node, usize, &Node) -> bool,
    {
        let mut pos = 0;
        for child in self.nodes.iter() {
            if pos >= to {
                break;
            }
            let end = pos + child.node_size();
            if end > from && f(child, start + pos, parent) && !child.content().is_empty() {
                let inner = pos + 1;
                child.content().nodes_between(
                    from.saturating_sub(inner),
                    (to - inner).min(child.content().size()),
                    start + inner,
                    child,
                    f,
                );
            }
            pos = end;
        }
    }
}

/// Push a node, merging it into a preceding text node with the same marks
fn push_node(target: &mut Vec<Node>, node: Node) {
    if node.is_text() && node.text_len() == 0 {
        return;
    }
    if let Some(last) = target.last_mut() {
        if last.is_text() && node.is_text() && last.marks() == node.marks() {
            let mut text = last.text().unwrap_or_default().to_string();
            text.push_str(node.text().unwrap_or_default());
            *last = last.with_text(text);
            return;
        }
    }
    target.push(node);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attrs, Mark};

    fn text(s: &str) -> Node {
        Node::new_text(s, Vec::new())
    }

    fn para(children: Vec<Node>) -> Node {
        Node::new("paragraph", Attrs::new(), Fragment::from_nodes(children), Vec::new(), false)
    }

    #[test]
    fn test_text_runs_merge() {
        let fragment = Fragment::from_nodes(vec![text("ab"), text(""), text("cd")]);
        assert_eq!(fragment.child_count(), 1);
        assert_eq!(fragment.child(0).text(), Some("abcd"));
        assert_eq!(fragment.size(), 4);

        let bold = vec![Mark::new("bold", Attrs::new())];
        let mixed = Fragment::from_nodes(vec![text("ab"), Node::new_text("cd", bold)]);
        assert_eq!(mixed.child_count(), 2);
    }

    #[test]
    fn test_find_index() {
        let fragment = Fragment::from_nodes(vec![para(vec![text("abc")]), para(vec![])]);
        assert_eq!(fragment.size(), 7);
        assert_eq!(fragment.find_index(0), (0, 0));
        assert_eq!(fragment.find_index(2), (0, 0));
        assert_eq!(fragment.find_index(5), (1, 5));
        assert_eq!(fragment.find_index(7), (2, 7));
    }

    #[test]
    fn test_cut_through_nodes() {
        let fragment = Fragment::from_nodes(vec![para(vec![text("hello")]), para(vec![text("world")])]);
        let cut = fragment.cut(3, 10);
        assert_eq!(cut.child_count(), 2);
        assert_eq!(cut.child(0).text_content(), "llo");
        assert_eq!(cut.child(1).text_content(), "wo");
    }

    #[test]
    fn test_nodes_between_visits_overlap_only() {
        let doc = para(vec![]);
        let fragment = Fragment::from_nodes(vec![para(vec![text("ab")]), para(vec![text("cd")])]);
        let mut seen = Vec::new();
        fragment.nodes_between(1, 3, 0, &doc, &mut |node, pos, _| {
            seen.push((node.node_type().to_string(), pos));
            true
        });
        assert_eq!(
            seen,
            vec![("paragraph".to_string(), 0), ("text".to_string(), 1)]
        );
    }
}
