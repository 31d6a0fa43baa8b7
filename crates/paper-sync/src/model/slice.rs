use serde::{Deserialize, Serialize, Serializer};

use super::{Fragment, NodeJson};

/// A piece of a document: a fragment plus how deeply each side is "open"
///
/// An open side means the boundary nodes were cut through, so placing the
/// slice joins them with the surrounding content instead of inserting whole
/// nodes (e.g. pasting the tail of one paragraph into another).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Slice {
    content: Fragment,
    open_start: usize,
    open_end: usize,
}

impl Slice {
    pub fn new(content: Fragment, open_start: usize, open_end: usize) -> Self {
        Self {
            content,
            open_start,
            open_end,
        }
    }

    /// A closed slice holding whole nodes
    pub fn closed(content: Fragment) -> Self {
        Self::new(content, 0, 0)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn content(&self) -> &Fragment {
        &self.content
    }

    pub fn open_start(&self) -> usize {
        self.open_start
    }

    pub fn open_end(&self) -> usize {
        self.open_end
    }

    /// Number of positions the slice adds when inserted
    pub fn size(&self) -> usize {
        self.content
            .size()
            .saturating_sub(self.open_start + self.open_end)
    }

    /// Whether the slice is a flat run of unmarked text
    pub fn is_plain_text(&self) -> bool {
        self.open_start == 0
            && self.open_end == 0
            && self
                .content
                .iter()
                .all(|node| node.is_text() && node.marks().is_empty())
    }
}

/// Serializable shape of a slice
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceJson {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<NodeJson>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub open_start: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub open_end: usize,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

impl From<&Slice> for SliceJson {
    fn from(slice: &Slice) -> Self {
        SliceJson {
            content: slice.content.iter().map(NodeJson::from).collect(),
            open_start: slice.open_start,
            open_end: slice.open_end,
        }
    }
}

impl Serialize for Slice {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SliceJson::from(self).serialize(serializer)
    }
}
