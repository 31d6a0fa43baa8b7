use super::map::{Mapping, StepMap};
use super::step::Step;
use crate::model::{Attrs, Fragment, Mark, Node, Schema, Slice};
use crate::SyncResult;

/// Steps applied one after another to a document, with the intermediate
/// documents, the inverses and the composed mapping
pub struct Transform<'s> {
    schema: &'s Schema,
    doc: Node,
    steps: Vec<Step>,
    docs: Vec<Node>,
    inverted: Vec<Step>,
    mapping: Mapping,
}

impl<'s> Transform<'s> {
    pub fn new(schema: &'s Schema, doc: Node) -> Self {
        Self {
            schema,
            doc,
            steps: Vec::new(),
            docs: Vec::new(),
            inverted: Vec::new(),
            mapping: Mapping::new(),
        }
    }

    /// The current document
    pub fn doc(&self) -> &Node {
        &self.doc
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// The document before each step
    pub fn docs(&self) -> &[Node] {
        &self.docs
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn mapping_mut(&mut self) -> &mut Mapping {
        &mut self.mapping
    }

    /// Apply a step; on failure nothing changes
    pub fn step(&mut self, step: Step) -> SyncResult<()> {
        let map = step.get_map();
        self.step_with_map(step, map)
    }

    /// Apply a step but record `map` for it in the mapping
    ///
    /// Used when the caller knows better than the step how positions move,
    /// as for the inverse of a mark step, which restores the range verbatim.
    pub fn step_with_map(&mut self, step: Step, map: StepMap) -> SyncResult<()> {
        let (doc, inverse) = step.apply_with_inverse(&self.doc, self.schema)?;
        self.docs.push(std::mem::replace(&mut self.doc, doc));
        self.mapping.append_map(map, None);
        self.inverted.push(inverse);
        self.steps.push(step);
        Ok(())
    }

    /// Inverse of the most recently applied step
    pub fn last_inverse(&self) -> Option<&Step> {
        self.inverted.last()
    }

    /// Apply a step and report whether it applied
    pub fn maybe_step(&mut self, step: Step) -> bool {
        self.step(step).is_ok()
    }

    pub fn finish(self) -> Applied {
        let mut inverted = self.inverted;
        inverted.reverse();
        Applied {
            doc: self.doc,
            docs: self.docs,
            steps: self.steps,
            mapping: self.mapping,
            inverted,
        }
    }
}

/// The result of applying a [`Transaction`]
#[derive(Debug, Clone)]
pub struct Applied {
    pub doc: Node,
    /// The document before each step
    pub docs: Vec<Node>,
    pub steps: Vec<Step>,
    pub mapping: Mapping,
    /// Steps undoing the transaction, in the order they must be applied
    pub inverted: Vec<Step>,
}

/// An ordered batch of steps produced by one logical edit
///
/// Positions of each step refer to the document as left by the steps before
/// it. Applying a transaction is all or nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    steps: Vec<Step>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<Step> {
        self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn push(&mut self, step: Step) -> &mut Self {
        self.steps.push(step);
        self
    }

    /// Insert unmarked text at a position
    pub fn insert_text(&mut self, pos: usize, text: &str) -> &mut Self {
        let node = Node::new_text(text, Vec::new());
        self.insert(pos, vec![node])
    }

    /// Insert whole nodes at a position
    pub fn insert(&mut self, pos: usize, nodes: Vec<Node>) -> &mut Self {
        self.replace(pos, pos, Slice::closed(Fragment::from_nodes(nodes)))
    }

    pub fn delete(&mut self, from: usize, to: usize) -> &mut Self {
        self.replace(from, to, Slice::empty())
    }

    pub fn replace(&mut self, from: usize, to: usize, slice: Slice) -> &mut Self {
        self.push(Step::ReplaceRange { from, to, slice })
    }

    pub fn add_mark(&mut self, from: usize, to: usize, mark: Mark) -> &mut Self {
        self.push(Step::AddMark { from, to, mark })
    }

    pub fn remove_mark(&mut self, from: usize, to: usize, mark_type: &str) -> &mut Self {
        self.push(Step::RemoveMark {
            from,
            to,
            mark_type: mark_type.to_string(),
        })
    }

    pub fn set_node_attrs(&mut self, pos: usize, attrs: Attrs) -> &mut Self {
        self.push(Step::SetNodeAttributes { pos, attrs })
    }

    /// Apply every step in order, failing without effect if any step fails
    pub fn apply(&self, doc: &Node, schema: &Schema) -> SyncResult<Applied> {
        let mut transform = Transform::new(schema, doc.clone());
        for step in &self.steps {
            transform.step(step.clone())?;
        }
        Ok(transform.finish())
    }
}

impl From<Vec<Step>> for Transaction {
    fn from(steps: Vec<Step>) -> Self {
        Self::from_steps(steps)
    }
}
