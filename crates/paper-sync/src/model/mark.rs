use serde::{Deserialize, Serialize};

use super::Attrs;

/// A style mark carried by inline text (bold, link, ...)
///
/// Marks in a set are kept sorted by type name and a set holds at most one
/// mark of each type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    #[serde(rename = "type")]
    mark_type: String,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    attrs: Attrs,
}

impl Mark {
    pub(crate) fn new(mark_type: impl Into<String>, attrs: Attrs) -> Self {
        Self {
            mark_type: mark_type.into(),
            attrs,
        }
    }

    /// Get the mark type name
    pub fn mark_type(&self) -> &str {
        &self.mark_type
    }

    /// Get the mark attributes
    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    /// Add this mark to a set, replacing any mark of the same type
    pub fn add_to_set(&self, set: &[Mark]) -> Vec<Mark> {
        let mut result: Vec<Mark> = set
            .iter()
            .filter(|mark| mark.mark_type != self.mark_type)
            .cloned()
            .collect();
        let at = result
            .iter()
            .position(|mark| mark.mark_type > self.mark_type)
            .unwrap_or(result.len());
        result.insert(at, self.clone());
        result
    }

    /// Check whether this exact mark (type and attributes) is in the set
    pub fn is_in_set(&self, set: &[Mark]) -> bool {
        set.iter().any(|mark| mark == self)
    }
}

/// Remove every mark of the given type from a set
pub fn remove_type_from_set(mark_type: &str, set: &[Mark]) -> Vec<Mark> {
    set.iter()
        .filter(|mark| mark.mark_type != mark_type)
        .cloned()
        .collect()
}

/// Find the mark of the given type in a set
pub fn find_type_in_set<'a>(mark_type: &str, set: &'a [Mark]) -> Option<&'a Mark> {
    set.iter().find(|mark| mark.mark_type == mark_type)
}

/// Normalize an arbitrary list of marks into a sorted set
pub(crate) fn normalize_set(marks: Vec<Mark>) -> Vec<Mark> {
    marks
        .into_iter()
        .fold(Vec::new(), |set, mark| mark.add_to_set(&set))
}
