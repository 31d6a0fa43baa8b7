use serde_json::Value as JsonValue;

use super::mark::normalize_set;
use super::{Attrs, ContentExpr, Fragment, Mark, Node, NodeJson};
use crate::{SyncError, SyncResult};

/// Declaration of a single attribute
#[derive(Debug, Clone, Default)]
pub struct AttrSpec {
    /// Value used when the attribute is omitted; `None` makes it required
    pub default: Option<JsonValue>,
}

/// Which marks may appear on the inline content of a node
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MarkSet {
    #[default]
    All,
    None,
    Only(Vec<String>),
}

impl MarkSet {
    fn allows(&self, mark_type: &str) -> bool {
        match self {
            MarkSet::All => true,
            MarkSet::None => false,
            MarkSet::Only(names) => names.iter().any(|name| name == mark_type),
        }
    }
}

/// Declarative capability entry for a node type
///
/// Besides the content grammar, a spec declares the attributes with their
/// defaults, the allowed marks, and whether the node hosts an embedded
/// sub-editor that must be bridged (see [`crate::bridge`]).
#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    content: String,
    groups: Vec<String>,
    attrs: Vec<(String, AttrSpec)>,
    marks: MarkSet,
    embedded: bool,
}

impl NodeSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, expr: &str) -> Self {
        self.content = expr.to_string();
        self
    }

    pub fn group(mut self, groups: &str) -> Self {
        self.groups = groups.split_whitespace().map(String::from).collect();
        self
    }

    pub fn attr(mut self, name: &str, default: JsonValue) -> Self {
        self.attrs.push((
            name.to_string(),
            AttrSpec {
                default: Some(default),
            },
        ));
        self
    }

    pub fn required_attr(mut self, name: &str) -> Self {
        self.attrs.push((name.to_string(), AttrSpec { default: None }));
        self
    }

    pub fn marks(mut self, marks: MarkSet) -> Self {
        self.marks = marks;
        self
    }

    /// Mark the node as hosting an embedded sub-editor keyed by its `id` attribute
    pub fn embedded(mut self) -> Self {
        self.embedded = true;
        if !self.attrs.iter().any(|(name, _)| name == "id") {
            self.attrs.push((
                "id".to_string(),
                AttrSpec {
                    default: Some(JsonValue::Null),
                },
            ));
        }
        self
    }
}

/// Declaration of a mark type
#[derive(Debug, Clone, Default)]
pub struct MarkSpec {
    attrs: Vec<(String, AttrSpec)>,
}

impl MarkSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attr(mut self, name: &str, default: JsonValue) -> Self {
        self.attrs.push((
            name.to_string(),
            AttrSpec {
                default: Some(default),
            },
        ));
        self
    }
}

/// A compiled node type
#[derive(Debug, Clone)]
pub struct NodeType {
    name: String,
    spec: NodeSpec,
    content: ContentExpr,
}

impl NodeType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_expr(&self) -> &ContentExpr {
        &self.content
    }

    pub fn is_text(&self) -> bool {
        self.name == "text"
    }

    pub fn is_leaf(&self) -> bool {
        self.content.is_leaf()
    }

    pub fn is_embedded(&self) -> bool {
        self.spec.embedded
    }

    /// Whether the node holds inline content (text)
    pub fn is_textblock(&self) -> bool {
        self.content.allows("text")
    }

    pub fn allows_mark(&self, mark_type: &str) -> bool {
        self.spec.marks.allows(mark_type)
    }
}

/// Builder for [`Schema`]
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    nodes: Vec<(String, NodeSpec)>,
    marks: Vec<(String, MarkSpec)>,
    top: Option<String>,
    trailing: Option<String>,
}

impl SchemaBuilder {
    pub fn node(mut self, name: &str, spec: NodeSpec) -> Self {
        self.nodes.push((name.to_string(), spec));
        self
    }

    pub fn mark(mut self, name: &str, spec: MarkSpec) -> Self {
        self.marks.push((name.to_string(), spec));
        self
    }

    /// Name of the document root type (defaults to the first node declared)
    pub fn top(mut self, name: &str) -> Self {
        self.top = Some(name.to_string());
        self
    }

    /// Node type that must always close the document (appended by corrections)
    pub fn trailing(mut self, name: &str) -> Self {
        self.trailing = Some(name.to_string());
        self
    }

    pub fn build(self) -> SyncResult<Schema> {
        let nodes = &self.nodes;
        let expand = |word: &str| -> Option<Vec<String>> {
            if nodes.iter().any(|(name, _)| name == word) {
                return Some(vec![word.to_string()]);
            }
            let members: Vec<String> = nodes
                .iter()
                .filter(|(_, spec)| spec.groups.iter().any(|group| group == word))
                .map(|(name, _)| name.clone())
                .collect();
            (!members.is_empty()).then_some(members)
        };

        let mut compiled = Vec::with_capacity(nodes.len());
        for (name, spec) in nodes {
            compiled.push(NodeType {
                name: name.clone(),
                content: ContentExpr::parse(&spec.content, expand)?,
                spec: spec.clone(),
            });
        }

        let top = match self.top.or_else(|| nodes.first().map(|(name, _)| name.clone())) {
            Some(top) => top,
            None => return Err(SyncError::schema("Schema declares no node types")),
        };
        for required in std::iter::once(&top).chain(self.trailing.iter()) {
            if !compiled.iter().any(|ty| &ty.name == required) {
                return Err(SyncError::schema(format!(
                    "Schema references undeclared node type '{}'",
                    required
                )));
            }
        }

        Ok(Schema {
            nodes: compiled,
            marks: self.marks,
            top,
            trailing: self.trailing,
        })
    }
}

/// The content grammar and type table a document must conform to
///
/// Every Step application validates its result against the schema, so an
/// edit that would break the grammar is rejected instead of applied.
#[derive(Debug, Clone)]
pub struct Schema {
    nodes: Vec<NodeType>,
    marks: Vec<(String, MarkSpec)>,
    top: String,
    trailing: Option<String>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn top_type(&self) -> &str {
        &self.top
    }

    pub fn trailing_type(&self) -> Option<&str> {
        self.trailing.as_deref()
    }

    pub fn node_type(&self, name: &str) -> SyncResult<&NodeType> {
        self.nodes
            .iter()
            .find(|ty| ty.name == name)
            .ok_or_else(|| SyncError::schema(format!("Unknown node type '{}'", name)))
    }

    pub fn node_types(&self) -> impl Iterator<Item = &NodeType> {
        self.nodes.iter()
    }

    /// Whether `name` is a node type hosting an embedded sub-editor
    pub fn is_embedded(&self, name: &str) -> bool {
        self.node_type(name).map(NodeType::is_embedded).unwrap_or(false)
    }

    fn mark_spec(&self, name: &str) -> SyncResult<&MarkSpec> {
        self.marks
            .iter()
            .find(|(mark, _)| mark == name)
            .map(|(_, spec)| spec)
            .ok_or_else(|| SyncError::schema(format!("Unknown mark type '{}'", name)))
    }

    pub fn has_mark(&self, name: &str) -> bool {
        self.mark_spec(name).is_ok()
    }

    /// Fill in defaults and reject unknown or missing attributes
    fn compute_attrs(specs: &[(String, AttrSpec)], given: &Attrs, owner: &str) -> SyncResult<Attrs> {
        if let Some(unknown) = given.keys().find(|key| !specs.iter().any(|(name, _)| name == *key)) {
            return Err(SyncError::schema(format!(
                "Unknown attribute '{}' on '{}'",
                unknown, owner
            )));
        }
        let mut attrs = Attrs::new();
        for (name, spec) in specs {
            let value = match (given.get(name), &spec.default) {
                (Some(value), _) => value.clone(),
                (None, Some(default)) => default.clone(),
                (None, None) => {
                    return Err(SyncError::schema(format!(
                        "Missing required attribute '{}' on '{}'",
                        name, owner
                    )))
                }
            };
            attrs.insert(name.clone(), value);
        }
        Ok(attrs)
    }

    /// Attributes of a node type with defaults applied
    pub fn node_attrs(&self, node_type: &str, given: &Attrs) -> SyncResult<Attrs> {
        let ty = self.node_type(node_type)?;
        Self::compute_attrs(&ty.spec.attrs, given, node_type)
    }

    /// Create a mark, validating its attributes
    pub fn mark(&self, mark_type: &str, attrs: Attrs) -> SyncResult<Mark> {
        let spec = self.mark_spec(mark_type)?;
        let attrs = Self::compute_attrs(&spec.attrs, &attrs, mark_type)?;
        Ok(Mark::new(mark_type, attrs))
    }

    /// Create a text node
    pub fn text(&self, text: &str, marks: Vec<Mark>) -> Node {
        Node::new_text(text, normalize_set(marks))
    }

    /// Create a node, validating attributes and its direct content
    pub fn node(&self, node_type: &str, attrs: Attrs, children: Vec<Node>) -> SyncResult<Node> {
        let ty = self.node_type(node_type)?;
        if ty.is_text() {
            return Err(SyncError::schema("Text nodes are created with Schema::text"));
        }
        let attrs = Self::compute_attrs(&ty.spec.attrs, &attrs, node_type)?;
        let node = Node::new(
            node_type,
            attrs,
            Fragment::from_nodes(children),
            Vec::new(),
            ty.is_leaf(),
        );
        self.check_content(&node)?;
        Ok(node)
    }

    /// Check that a node's direct children satisfy its grammar and mark rules
    pub fn check_content(&self, node: &Node) -> SyncResult<()> {
        if node.is_text() {
            return Ok(());
        }
        let ty = self.node_type(node.node_type())?;
        if ty.is_leaf() != node.is_leaf() {
            return Err(SyncError::schema(format!(
                "Leaf flag of '{}' does not match its type",
                node.node_type()
            )));
        }
        let names: Vec<&str> = node.content().iter().map(Node::node_type).collect();
        if !ty.content.matches(&names) {
            return Err(SyncError::schema(format!(
                "Invalid content for node '{}': [{}] does not match '{}'",
                node.node_type(),
                names.join(", "),
                ty.content.source()
            )));
        }
        for child in node.content().iter() {
            if !child.is_text() && !child.marks().is_empty() {
                return Err(SyncError::schema(format!(
                    "Marks are only allowed on text, found on '{}'",
                    child.node_type()
                )));
            }
            for mark in child.marks() {
                if !ty.allows_mark(mark.mark_type()) {
                    return Err(SyncError::schema(format!(
                        "Mark '{}' is not allowed in '{}'",
                        mark.mark_type(),
                        node.node_type()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Deeply validate a node and everything below it
    pub fn check(&self, node: &Node) -> SyncResult<()> {
        if node.is_text() {
            if node.text_len() == 0 {
                return Err(SyncError::schema("Empty text nodes are not allowed"));
            }
            for mark in node.marks() {
                let spec = self.mark_spec(mark.mark_type())?;
                let expected = Self::compute_attrs(&spec.attrs, mark.attrs(), mark.mark_type())?;
                if &expected != mark.attrs() {
                    return Err(SyncError::schema(format!(
                        "Mark '{}' is missing attributes",
                        mark.mark_type()
                    )));
                }
            }
            return Ok(());
        }
        let ty = self.node_type(node.node_type())?;
        let expected = Self::compute_attrs(&ty.spec.attrs, node.attrs(), node.node_type())?;
        if &expected != node.attrs() {
            return Err(SyncError::schema(format!(
                "Node '{}' is missing attributes",
                node.node_type()
            )));
        }
        self.check_content(node)?;
        node.content().iter().try_for_each(|child| self.check(child))
    }

    /// Deeply validate a whole document, including its root type
    pub fn check_doc(&self, doc: &Node) -> SyncResult<()> {
        if doc.node_type() != self.top {
            return Err(SyncError::schema(format!(
                "Document root must be '{}', found '{}'",
                self.top,
                doc.node_type()
            )));
        }
        self.check(doc)
    }

    /// Whether content of `sub` may be joined onto `main`
    pub fn compatible_content(&self, main: &str, sub: &str) -> bool {
        if main == sub {
            return true;
        }
        match (self.node_type(main), self.node_type(sub)) {
            (Ok(a), Ok(b)) => a.content.shares_type_with(&b.content),
            _ => false,
        }
    }

    pub(crate) fn node_from_raw(&self, raw: &NodeJson) -> SyncResult<Node> {
        let marks = raw
            .marks
            .iter()
            .map(|mark| self.mark(mark.mark_type(), mark.attrs().clone()))
            .collect::<SyncResult<Vec<_>>>()?;
        if raw.node_type == "text" {
            let text = raw
                .text
                .as_deref()
                .ok_or_else(|| SyncError::schema("Text node without text"))?;
            let node = self.text(text, marks);
            self.check(&node)?;
            return Ok(node);
        }
        let ty = self.node_type(&raw.node_type)?;
        let children = self.fragment_from_raw(&raw.content)?;
        let attrs = Self::compute_attrs(&ty.spec.attrs, &raw.attrs, &raw.node_type)?;
        let node = Node::new(
            raw.node_type.clone(),
            attrs,
            children,
            normalize_set(marks),
            ty.is_leaf(),
        );
        self.check_content(&node)?;
        Ok(node)
    }

    pub(crate) fn fragment_from_raw(&self, raw: &[NodeJson]) -> SyncResult<Fragment> {
        let nodes = raw
            .iter()
            .map(|child| self.node_from_raw(child))
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(Fragment::from_nodes(nodes))
    }

    /// Decode a TreeJSON node (any type) and validate it
    pub fn node_from_json(&self, value: &JsonValue) -> SyncResult<Node> {
        let raw: NodeJson = serde_json::from_value(value.clone())?;
        self.node_from_raw(&raw)
    }

    /// Decode a TreeJSON document and validate it, including the root type
    pub fn doc_from_json(&self, value: &JsonValue) -> SyncResult<Node> {
        let doc = self.node_from_json(value)?;
        self.check_doc(&doc)?;
        Ok(doc)
    }

    /// Build the smallest valid node of the given type
    pub fn create_and_fill(&self, node_type: &str) -> SyncResult<Node> {
        let ty = self.node_type(node_type)?;
        let mut children = Vec::new();
        for term in ty.content.required_names() {
            if term != "text" {
                children.push(self.create_and_fill(&term)?);
            }
        }
        self.node(node_type, Attrs::new(), children)
    }

    /// The empty document new rooms start from
    pub fn default_doc(&self) -> SyncResult<Node> {
        self.create_and_fill(&self.top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::paper::paper_schema;
    use serde_json::json;

    #[test]
    fn test_default_doc_is_valid() {
        let schema = paper_schema();
        let doc = schema.default_doc().unwrap();
        assert_eq!(doc.node_type(), "doc");
        assert_eq!(doc.child_count(), 2);
        assert_eq!(doc.child(0).node_type(), "title");
        assert_eq!(doc.child(1).node_type(), "paragraph");
        schema.check_doc(&doc).unwrap();
    }

    #[test]
    fn test_attribute_defaults_and_unknowns() {
        let schema = paper_schema();
        let heading = schema.node("heading", Attrs::new(), vec![]).unwrap();
        assert_eq!(heading.attr("level"), Some(&json!(1)));

        let mut bogus = Attrs::new();
        bogus.insert("colour".into(), json!("red"));
        let err = schema.node("heading", bogus, vec![]).unwrap_err();
        assert!(matches!(err, SyncError::SchemaViolation { .. }));
    }

    #[test]
    fn test_grammar_rejects_missing_title() {
        let schema = paper_schema();
        let err = schema
            .doc_from_json(&json!({
                "type": "doc",
                "content": [{"type": "paragraph"}]
            }))
            .unwrap_err();
        assert!(matches!(err, SyncError::SchemaViolation { .. }));
    }

    #[test]
    fn test_marks_not_allowed_in_code_block() {
        let schema = paper_schema();
        let err = schema
            .node_from_json(&json!({
                "type": "code_block",
                "content": [{"type": "text", "text": "fn", "marks": [{"type": "bold"}]}]
            }))
            .unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn test_compatible_content() {
        let schema = paper_schema();
        assert!(schema.compatible_content("paragraph", "paragraph"));
        assert!(schema.compatible_content("ordered_list", "bullet_list"));
        assert!(!schema.compatible_content("paragraph", "blockquote"));
    }

    #[test]
    fn test_bad_schema_reference() {
        let result = Schema::builder()
            .node("doc", NodeSpec::new().content("figure+"))
            .build();
        assert!(result.is_err());
    }
}
