use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;

use super::map::{Bias, Mapping, StepMap};
use super::replace::replace;
use crate::model::mark::{find_type_in_set, remove_type_from_set};
use crate::model::{Attrs, Fragment, Mark, Node, Schema, Slice, SliceJson};
use crate::{SyncError, SyncResult};

/// An atomic, invertible edit of a document tree
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Replace `from..to` with the content of a slice
    ReplaceRange { from: usize, to: usize, slice: Slice },
    /// Replace the attributes of the node starting at `pos`
    SetNodeAttributes { pos: usize, attrs: Attrs },
    /// Add a mark to all text in `from..to`
    AddMark { from: usize, to: usize, mark: Mark },
    /// Remove marks of a type from all text in `from..to`
    RemoveMark {
        from: usize,
        to: usize,
        mark_type: String,
    },
}

impl Step {
    /// Apply the step, validating the resulting document against the schema
    pub fn apply(&self, doc: &Node, schema: &Schema) -> SyncResult<Node> {
        let result = match self {
            Step::ReplaceRange { from, to, slice } => {
                check_range(doc, *from, *to)?;
                replace(schema, doc, *from, *to, slice)?
            }
            Step::SetNodeAttributes { pos, attrs } => set_node_attrs(doc, schema, *pos, attrs)?,
            Step::AddMark { from, to, mark } => {
                check_range(doc, *from, *to)?;
                let old = doc.slice(*from, *to)?;
                let parent = shared_parent(doc, *from, *to)?;
                let content = map_text(old.content(), &parent, &mut |text, parent| {
                    if allows_mark(schema, parent, mark.mark_type()) {
                        text.with_marks(mark.add_to_set(text.marks()))
                    } else {
                        text.clone()
                    }
                });
                let slice = Slice::new(content, old.open_start(), old.open_end());
                replace(schema, doc, *from, *to, &slice)?
            }
            Step::RemoveMark {
                from,
                to,
                mark_type,
            } => {
                check_range(doc, *from, *to)?;
                let old = doc.slice(*from, *to)?;
                let parent = shared_parent(doc, *from, *to)?;
                let content = map_text(old.content(), &parent, &mut |text, _| {
                    text.with_marks(remove_type_from_set(mark_type, text.marks()))
                });
                let slice = Slice::new(content, old.open_start(), old.open_end());
                replace(schema, doc, *from, *to, &slice)?
            }
        };
        schema.check_doc(&result)?;
        Ok(result)
    }

    /// Apply the step and return the new document together with its inverse
    pub fn apply_with_inverse(&self, doc: &Node, schema: &Schema) -> SyncResult<(Node, Step)> {
        let inverted = self.invert(doc, schema)?;
        let result = self.apply(doc, schema)?;
        Ok((result, inverted))
    }

    /// Whether the step only changes marks, leaving every position in place
    pub fn is_mark_step(&self) -> bool {
        matches!(self, Step::AddMark { .. } | Step::RemoveMark { .. })
    }

    /// The position map of this step
    pub fn get_map(&self) -> StepMap {
        match self {
            Step::ReplaceRange { from, to, slice } => StepMap::new(*from, to - from, slice.size()),
            _ => StepMap::empty(),
        }
    }

    /// The step that undoes this one, given the document it applies to
    ///
    /// Mark steps invert to the opposite mark step only when that restores
    /// the document exactly; otherwise the inverse replaces the range with
    /// the original content.
    pub fn invert(&self, doc: &Node, schema: &Schema) -> SyncResult<Step> {
        let step = match self {
            Step::ReplaceRange { from, to, slice } => Step::ReplaceRange {
                from: *from,
                to: from + slice.size(),
                slice: doc.slice(*from, *to)?,
            },
            Step::SetNodeAttributes { pos, .. } => {
                let node = attr_target(doc, *pos)?;
                Step::SetNodeAttributes {
                    pos: *pos,
                    attrs: node.attrs().clone(),
                }
            }
            Step::AddMark { from, to, mark } => {
                let mut lossless = true;
                doc.nodes_between(*from, *to, |node, _, _| {
                    if node.is_text() && find_type_in_set(mark.mark_type(), node.marks()).is_some() {
                        lossless = false;
                    }
                    lossless
                });
                if lossless {
                    Step::RemoveMark {
                        from: *from,
                        to: *to,
                        mark_type: mark.mark_type().to_string(),
                    }
                } else {
                    self.restoring(doc, *from, *to)?
                }
            }
            Step::RemoveMark {
                from,
                to,
                mark_type,
            } => {
                let mut found: Option<Mark> = None;
                let mut uniform = true;
                let mut missing = false;
                doc.nodes_between(*from, *to, |node, _, parent| {
                    if node.is_text() {
                        match find_type_in_set(mark_type, node.marks()) {
                            Some(mark) => match &found {
                                Some(seen) if seen != mark => uniform = false,
                                Some(_) => {}
                                None => found = Some(mark.clone()),
                            },
                            None if allows_mark(schema, parent, mark_type) => missing = true,
                            None => {}
                        }
                    }
                    true
                });
                match found {
                    None => self.clone(),
                    Some(mark) if uniform && !missing => Step::AddMark {
                        from: *from,
                        to: *to,
                        mark,
                    },
                    Some(_) => self.restoring(doc, *from, *to)?,
                }
            }
        };
        Ok(step)
    }

    fn restoring(&self, doc: &Node, from: usize, to: usize) -> SyncResult<Step> {
        Ok(Step::ReplaceRange {
            from,
            to,
            slice: doc.slice(from, to)?,
        })
    }

    /// Map the step through a mapping, or `None` when its target was deleted
    pub fn map(&self, mapping: &Mapping) -> Option<Step> {
        match self {
            Step::ReplaceRange { from, to, slice } => {
                let from = mapping.map_result(*from, Bias::End);
                let to = mapping.map_result(*to, Bias::Start);
                if from.deleted_across() && to.deleted_across() {
                    return None;
                }
                Some(Step::ReplaceRange {
                    from: from.pos,
                    to: from.pos.max(to.pos),
                    slice: slice.clone(),
                })
            }
            Step::SetNodeAttributes { pos, attrs } => {
                let pos = mapping.map_result(*pos, Bias::End);
                if pos.deleted_after() {
                    return None;
                }
                Some(Step::SetNodeAttributes {
                    pos: pos.pos,
                    attrs: attrs.clone(),
                })
            }
            Step::AddMark { from, to, mark } => {
                let (from, to) = map_mark_range(mapping, *from, *to)?;
                Some(Step::AddMark {
                    from,
                    to,
                    mark: mark.clone(),
                })
            }
            Step::RemoveMark {
                from,
                to,
                mark_type,
            } => {
                let (from, to) = map_mark_range(mapping, *from, *to)?;
                Some(Step::RemoveMark {
                    from,
                    to,
                    mark_type: mark_type.clone(),
                })
            }
        }
    }

    /// Decode a step from its JSON form, validating content against the schema
    pub fn from_json(value: &JsonValue, schema: &Schema) -> SyncResult<Step> {
        let raw: StepJson = serde_json::from_value(value.clone())?;
        let step = match raw {
            StepJson::Replace { from, to, slice } => Step::ReplaceRange {
                from,
                to,
                slice: Slice::new(
                    schema.fragment_from_raw(&slice.content)?,
                    slice.open_start,
                    slice.open_end,
                ),
            },
            StepJson::Attrs { pos, attrs } => Step::SetNodeAttributes { pos, attrs },
            StepJson::AddMark { from, to, mark } => Step::AddMark {
                from,
                to,
                mark: schema.mark(mark.mark_type(), mark.attrs().clone())?,
            },
            StepJson::RemoveMark {
                from,
                to,
                mark_type,
            } => {
                if !schema.has_mark(&mark_type) {
                    return Err(SyncError::schema(format!(
                        "Unknown mark type '{}'",
                        mark_type
                    )));
                }
                Step::RemoveMark {
                    from,
                    to,
                    mark_type,
                }
            }
        };
        Ok(step)
    }

    /// Encode the step as StepJSON
    pub fn to_json(&self) -> SyncResult<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Serializable (StepJSON) shape of a step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stepType", rename_all = "camelCase")]
pub enum StepJson {
    Replace {
        from: usize,
        to: usize,
        #[serde(default, skip_serializing_if = "slice_is_empty")]
        slice: SliceJson,
    },
    Attrs {
        pos: usize,
        attrs: Attrs,
    },
    AddMark {
        from: usize,
        to: usize,
        mark: Mark,
    },
    RemoveMark {
        from: usize,
        to: usize,
        #[serde(rename = "markType")]
        mark_type: String,
    },
}

fn slice_is_empty(slice: &SliceJson) -> bool {
    slice.content.is_empty()
}

impl From<&Step> for StepJson {
    fn from(step: &Step) -> Self {
        match step {
            Step::ReplaceRange { from, to, slice } => StepJson::Replace {
                from: *from,
                to: *to,
                slice: SliceJson::from(slice),
            },
            Step::SetNodeAttributes { pos, attrs } => StepJson::Attrs {
                pos: *pos,
                attrs: attrs.clone(),
            },
            Step::AddMark { from, to, mark } => StepJson::AddMark {
                from: *from,
                to: *to,
                mark: mark.clone(),
            },
            Step::RemoveMark {
                from,
                to,
                mark_type,
            } => StepJson::RemoveMark {
                from: *from,
                to: *to,
                mark_type: mark_type.clone(),
            },
        }
    }
}

impl Serialize for Step {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        StepJson::from(self).serialize(serializer)
    }
}

fn check_range(doc: &Node, from: usize, to: usize) -> SyncResult<()> {
    let size = doc.content().size();
    if from > to || to > size {
        return Err(SyncError::invalid_step(format!(
            "Range {}..{} out of bounds (document size {})",
            from, to, size
        )));
    }
    Ok(())
}

fn map_mark_range(mapping: &Mapping, from: usize, to: usize) -> Option<(usize, usize)> {
    let from = mapping.map_result(from, Bias::End);
    let to = mapping.map_result(to, Bias::Start);
    if (from.deleted() && to.deleted()) || from.pos >= to.pos {
        return None;
    }
    Some((from.pos, to.pos))
}

fn allows_mark(schema: &Schema, parent: &Node, mark_type: &str) -> bool {
    schema
        .node_type(parent.node_type())
        .map(|ty| ty.allows_mark(mark_type))
        .unwrap_or(false)
}

fn shared_parent(doc: &Node, from: usize, to: usize) -> SyncResult<Node> {
    let rfrom = doc.resolve(from)?;
    Ok(rfrom.node(rfrom.shared_depth(to)).clone())
}

/// Rebuild a fragment, passing every text node and its parent through `f`
fn map_text<F>(fragment: &Fragment, parent: &Node, f: &mut F) -> Fragment
where
    F: FnMut(&Node, &Node) -> Node,
{
    let nodes = fragment
        .iter()
        .map(|child| {
            if child.is_text() {
                f(child, parent)
            } else if child.content().is_empty() {
                child.clone()
            } else {
                child.copy(map_text(child.content(), child, f))
            }
        })
        .collect();
    Fragment::from_nodes(nodes)
}

fn attr_target(doc: &Node, pos: usize) -> SyncResult<&Node> {
    let node = doc
        .node_at(pos)
        .ok_or_else(|| SyncError::invalid_step(format!("No node at position {}", pos)))?;
    if node.is_text() {
        return Err(SyncError::invalid_step(format!(
            "Cannot set attributes on text at position {}",
            pos
        )));
    }
    Ok(node)
}

fn set_node_attrs(doc: &Node, schema: &Schema, pos: usize, attrs: &Attrs) -> SyncResult<Node> {
    let rpos = doc.resolve(pos)?;
    if rpos.text_offset() > 0 {
        return Err(SyncError::invalid_step(format!(
            "Position {} is inside a text node",
            pos
        )));
    }
    let target = attr_target(doc, pos)?;
    let attrs = schema.node_attrs(target.node_type(), attrs)?;
    let mut replaced = target.with_attrs(attrs);
    for depth in (0..=rpos.depth()).rev() {
        let parent = rpos.node(depth);
        replaced = parent.copy(parent.content().replace_child(rpos.index(depth), replaced));
    }
    Ok(replaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::paper_schema;
    use serde_json::json;

    fn doc() -> Node {
        paper_schema()
            .doc_from_json(&json!({
                "type": "doc",
                "content": [
                    {"type": "title", "content": [{"type": "text", "text": "Hi"}]},
                    {"type": "paragraph", "content": [
                        {"type": "text", "text": "plain "},
                        {"type": "text", "text": "bold", "marks": [{"type": "bold"}]}
                    ]},
                    {"type": "heading", "content": [{"type": "text", "text": "Head"}]}
                ]
            }))
            .unwrap()
    }

    fn bold() -> Mark {
        paper_schema().mark("bold", Attrs::new()).unwrap()
    }

    fn link(href: &str) -> Mark {
        let mut attrs = Attrs::new();
        attrs.insert("href".into(), json!(href));
        paper_schema().mark("link", attrs).unwrap()
    }

    fn assert_invertible(step: Step) {
        let schema = paper_schema();
        let doc = doc();
        let (changed, inverse) = step.apply_with_inverse(&doc, &schema).unwrap();
        let restored = inverse.apply(&changed, &schema).unwrap();
        assert_eq!(restored, doc, "inverse of {:?} is {:?}", step, inverse);
    }

    #[test]
    fn test_steps_are_invertible() {
        let schema = paper_schema();
        assert_invertible(Step::ReplaceRange {
            from: 6,
            to: 8,
            slice: Slice::closed(Fragment::from_node(schema.text("xyz", vec![]))),
        });
        assert_invertible(Step::ReplaceRange {
            from: 5,
            to: 17,
            slice: Slice::empty(),
        });
        // bold over text that is partly bold already
        assert_invertible(Step::AddMark {
            from: 5,
            to: 15,
            mark: bold(),
        });
        assert_invertible(Step::AddMark {
            from: 5,
            to: 9,
            mark: link("https://a.example"),
        });
        assert_invertible(Step::RemoveMark {
            from: 5,
            to: 15,
            mark_type: "bold".into(),
        });
        assert_invertible(Step::RemoveMark {
            from: 11,
            to: 15,
            mark_type: "bold".into(),
        });
        let mut attrs = Attrs::new();
        attrs.insert("level".into(), json!(3));
        assert_invertible(Step::SetNodeAttributes { pos: 16, attrs });
    }

    #[test]
    fn test_mark_inverse_prefers_opposite_mark_step() {
        let schema = paper_schema();
        let add = Step::AddMark {
            from: 5,
            to: 9,
            mark: bold(),
        };
        assert!(matches!(
            add.invert(&doc(), &schema).unwrap(),
            Step::RemoveMark { .. }
        ));

        let remove = Step::RemoveMark {
            from: 11,
            to: 15,
            mark_type: "bold".into(),
        };
        assert!(matches!(
            remove.invert(&doc(), &schema).unwrap(),
            Step::AddMark { .. }
        ));
    }

    #[test]
    fn test_set_node_attributes() {
        let schema = paper_schema();
        let mut attrs = Attrs::new();
        attrs.insert("level".into(), json!(2));
        let result = Step::SetNodeAttributes { pos: 16, attrs }
            .apply(&doc(), &schema)
            .unwrap();
        assert_eq!(result.child(2).attr("level"), Some(&json!(2)));
        assert_eq!(result.child(2).text_content(), "Head");

        let mut bogus = Attrs::new();
        bogus.insert("colour".into(), json!("red"));
        let err = Step::SetNodeAttributes { pos: 16, attrs: bogus }
            .apply(&doc(), &schema)
            .unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let schema = paper_schema();
        let err = Step::ReplaceRange {
            from: 40,
            to: 41,
            slice: Slice::empty(),
        }
        .apply(&doc(), &schema)
        .unwrap_err();
        assert!(matches!(err, SyncError::InvalidStep { .. }));
    }

    #[test]
    fn test_mark_not_allowed_in_title_is_skipped() {
        let schema = paper_schema();
        let result = Step::AddMark {
            from: 1,
            to: 3,
            mark: bold(),
        }
        .apply(&doc(), &schema)
        .unwrap();
        assert!(result.child(0).child(0).marks().is_empty());
    }

    #[test]
    fn test_json_round_trip() {
        let schema = paper_schema();
        let steps = vec![
            Step::ReplaceRange {
                from: 6,
                to: 6,
                slice: Slice::closed(Fragment::from_node(schema.text("x", vec![bold()]))),
            },
            Step::ReplaceRange {
                from: 2,
                to: 4,
                slice: Slice::empty(),
            },
            Step::AddMark {
                from: 5,
                to: 9,
                mark: link("https://b.example"),
            },
            Step::RemoveMark {
                from: 5,
                to: 9,
                mark_type: "link".into(),
            },
        ];
        for step in steps {
            let value = step.to_json().unwrap();
            assert_eq!(Step::from_json(&value, &schema).unwrap(), step);
        }

        let value = Step::ReplaceRange {
            from: 2,
            to: 4,
            slice: Slice::empty(),
        }
        .to_json()
        .unwrap();
        assert_eq!(value, json!({"stepType": "replace", "from": 2, "to": 4}));
    }

    #[test]
    fn test_unknown_mark_in_json_rejected() {
        let schema = paper_schema();
        let value = json!({"stepType": "addMark", "from": 1, "to": 2, "mark": {"type": "blink"}});
        assert!(Step::from_json(&value, &schema).is_err());
    }

    #[test]
    fn test_replace_maps_through_insert_before_it() {
        let step = Step::ReplaceRange {
            from: 10,
            to: 12,
            slice: Slice::empty(),
        };
        let mapping = Mapping::from_maps(vec![StepMap::new(3, 0, 4)]);
        assert_eq!(
            step.map(&mapping),
            Some(Step::ReplaceRange {
                from: 14,
                to: 16,
                slice: Slice::empty()
            })
        );

        // the whole range was deleted underneath it
        let deleted = Mapping::from_maps(vec![StepMap::new(8, 6, 0)]);
        assert_eq!(step.map(&deleted), None);
    }
}
