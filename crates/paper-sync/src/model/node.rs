use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;

use super::{Attrs, Fragment, Mark, ResolvedPos, Slice};
use crate::{SyncError, SyncResult};

/// A node in the document tree
///
/// Nodes are immutable values: every edit produces new nodes and shares the
/// untouched subtrees. A node is either a text node (carrying text and marks),
/// a leaf (an atom occupying a single position), or a container of children.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    node_type: String,
    attrs: Attrs,
    content: Fragment,
    marks: Vec<Mark>,
    text: Option<String>,
    text_len: usize,
    leaf: bool,
}

impl Node {
    pub(crate) fn new(
        node_type: impl Into<String>,
        attrs: Attrs,
        content: Fragment,
        marks: Vec<Mark>,
        leaf: bool,
    ) -> Self {
        Self {
            node_type: node_type.into(),
            attrs,
            content,
            marks,
            text: None,
            text_len: 0,
            leaf,
        }
    }

    pub(crate) fn new_text(text: impl Into<String>, marks: Vec<Mark>) -> Self {
        let text = text.into();
        Self {
            node_type: "text".to_string(),
            attrs: Attrs::new(),
            content: Fragment::empty(),
            marks,
            text_len: text.chars().count(),
            text: Some(text),
            leaf: true,
        }
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    pub fn attr(&self, name: &str) -> Option<&JsonValue> {
        self.attrs.get(name)
    }

    pub fn content(&self) -> &Fragment {
        &self.content
    }

    pub fn marks(&self) -> &[Mark] {
        &self.marks
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn is_text(&self) -> bool {
        self.text.is_some()
    }

    /// Whether the node is a leaf (text or an atom without content)
    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    /// Length of the text in characters (zero for non-text nodes)
    pub fn text_len(&self) -> usize {
        self.text_len
    }

    /// Number of positions this node occupies in its parent
    pub fn node_size(&self) -> usize {
        if self.is_text() {
            self.text_len
        } else if self.leaf {
            1
        } else {
            self.content.size() + 2
        }
    }

    pub fn child_count(&self) -> usize {
        self.content.child_count()
    }

    pub fn child(&self, index: usize) -> &Node {
        self.content.child(index)
    }

    pub fn first_child(&self) -> Option<&Node> {
        self.content.first_child()
    }

    pub fn last_child(&self) -> Option<&Node> {
        self.content.last_child()
    }

    /// Concatenated text of this node and its descendants
    pub fn text_content(&self) -> String {
        match &self.text {
            Some(text) => text.clone(),
            None => self.content.text_content(),
        }
    }

    /// Whether this node has the same type, attributes and marks as another
    pub fn same_markup(&self, other: &Node) -> bool {
        self.node_type == other.node_type && self.attrs == other.attrs && self.marks == other.marks
    }

    /// Copy of this node with different content
    pub fn copy(&self, content: Fragment) -> Node {
        Node {
            content,
            ..self.clone()
        }
    }

    pub(crate) fn with_text(&self, text: String) -> Node {
        Node::new_text(text, self.marks.clone())
    }

    pub(crate) fn with_attrs(&self, attrs: Attrs) -> Node {
        Node {
            attrs,
            ..self.clone()
        }
    }

    pub(crate) fn with_marks(&self, marks: Vec<Mark>) -> Node {
        Node {
            marks,
            ..self.clone()
        }
    }

    /// Cut out the part of the node between two positions
    ///
    /// For text nodes the positions are character offsets; otherwise they are
    /// positions inside the node's content.
    pub fn cut(&self, from: usize, to: usize) -> Node {
        if let Some(text) = &self.text {
            if from == 0 && to >= self.text_len {
                return self.clone();
            }
            let sliced: String = text.chars().skip(from).take(to.saturating_sub(from)).collect();
            return self.with_text(sliced);
        }
        if from == 0 && to >= self.content.size() {
            return self.clone();
        }
        self.copy(self.content.cut(from, to))
    }

    /// Resolve a position inside this node
    pub fn resolve(&self, pos: usize) -> SyncResult<ResolvedPos> {
        ResolvedPos::resolve(self, pos)
    }

    /// The node directly after `pos`, if any
    pub fn node_at(&self, pos: usize) -> Option<&Node> {
        let mut node = self;
        let mut pos = pos;
        loop {
            let (index, offset) = node.content.find_index(pos);
            let child = node.content.maybe_child(index)?;
            if offset == pos || child.is_text() {
                return Some(child);
            }
            pos -= offset + 1;
            node = child;
        }
    }

    /// Cut a slice out of this node between two positions
    pub fn slice(&self, from: usize, to: usize) -> SyncResult<Slice> {
        if from == to {
            return Ok(Slice::empty());
        }
        if from > to {
            return Err(SyncError::invalid_step(format!(
                "Cannot slice backwards range {}..{}",
                from, to
            )));
        }
        let rfrom = self.resolve(from)?;
        let rto = self.resolve(to)?;
        let depth = rfrom.shared_depth(to);
        let start = rfrom.start(depth);
        let node = rfrom.node(depth);
        let content = node.content().cut(from - start, to - start);
        Ok(Slice::new(content, rfrom.depth() - depth, rto.depth() - depth))
    }

    /// Walk all descendants with their absolute positions
    pub fn descendants<F>(&self, mut f: F)
    where
        F: FnMut(&Node, usize, &Node) -> bool,
    {
        self.content.descendants(0, self, &mut f);
    }

    /// Walk the descendants overlapping `from..to`
    pub fn nodes_between<F>(&self, from: usize, to: usize, mut f: F)
    where
        F: FnMut(&Node, usize, &Node) -> bool,
    {
        self.content.nodes_between(from, to, 0, self, &mut f);
    }

    /// The text of the leading `title` node, if the document has one
    pub fn title(&self) -> Option<String> {
        self.first_child()
            .filter(|child| child.node_type() == "title")
            .map(Node::text_content)
    }
}

/// Serializable (TreeJSON) shape of a node
///
/// Decoding goes through [`Schema::node_from_json`](super::Schema::node_from_json)
/// because leaf-ness and attribute defaults come from the schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeJson {
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub attrs: Attrs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<NodeJson>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl From<&Node> for NodeJson {
    fn from(node: &Node) -> Self {
        NodeJson {
            node_type: node.node_type.clone(),
            attrs: node.attrs.clone(),
            content: node.content.iter().map(NodeJson::from).collect(),
            marks: node.marks.clone(),
            text: node.text.clone(),
        }
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        NodeJson::from(self).serialize(serializer)
    }
}

impl Node {
    /// Encode the node as TreeJSON
    pub fn to_json(&self) -> SyncResult<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }
}
