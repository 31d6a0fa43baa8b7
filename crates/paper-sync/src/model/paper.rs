//! The default "paper" schema and the typed `PaperDocument` interchange format.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, OnceLock};

use super::{Attrs, MarkSet, MarkSpec, Mark, Node, NodeSpec, Schema};
use crate::{SyncError, SyncResult};

/// The schema used by paper documents: a title followed by one or more blocks
pub fn paper_schema() -> Arc<Schema> {
    static SCHEMA: OnceLock<Arc<Schema>> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            let schema = Schema::builder()
                .node("doc", NodeSpec::new().content("title block+"))
                .node("title", NodeSpec::new().content("text*").marks(MarkSet::None))
                .node("paragraph", NodeSpec::new().content("inline*").group("block"))
                .node(
                    "heading",
                    NodeSpec::new()
                        .content("text*")
                        .group("block")
                        .attr("level", json!(1)),
                )
                .node("blockquote", NodeSpec::new().content("block+").group("block"))
                .node("ordered_list", NodeSpec::new().content("list_item+").group("block"))
                .node("bullet_list", NodeSpec::new().content("list_item+").group("block"))
                .node("list_item", NodeSpec::new().content("paragraph block*"))
                .node("todo_list", NodeSpec::new().content("todo_item+").group("block"))
                .node(
                    "todo_item",
                    NodeSpec::new()
                        .content("paragraph block*")
                        .attr("checked", json!(false)),
                )
                .node(
                    "code_block",
                    NodeSpec::new()
                        .content("text*")
                        .group("block")
                        .marks(MarkSet::None)
                        .attr("language", json!(null))
                        .embedded(),
                )
                .node(
                    "image_block",
                    NodeSpec::new()
                        .group("block")
                        .attr("src", json!(null))
                        .attr("caption", json!(null)),
                )
                .node(
                    "video_block",
                    NodeSpec::new()
                        .group("block")
                        .attr("src", json!(null))
                        .attr("caption", json!(null)),
                )
                .node("text", NodeSpec::new().group("inline"))
                .mark("link", MarkSpec::new().attr("href", json!("")))
                .mark("bold", MarkSpec::new())
                .mark("italic", MarkSpec::new())
                .mark("code", MarkSpec::new())
                .mark("underline", MarkSpec::new())
                .mark("strikethrough", MarkSpec::new())
                .top("doc")
                .trailing("paragraph")
                .build();
            Arc::new(schema.expect("paper schema is well-formed"))
        })
        .clone()
}

/// A paper document in its typed interchange form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperDocument {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Block {
    Heading(Heading),
    Paragraph(Paragraph),
    Blockquote(Blockquote),
    OrderedList(List),
    BulletList(List),
    TodoList(TodoList),
    CodeBlock(CodeBlock),
    ImageBlock(Media),
    VideoBlock(Media),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heading {
    pub level: u8,
    #[serde(default)]
    pub content: Vec<Inline>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Paragraph {
    #[serde(default)]
    pub content: Vec<Inline>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blockquote {
    pub content: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List {
    pub content: Vec<ListEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntry {
    pub list_item: ListItem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    pub content: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoList {
    pub content: Vec<TodoEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoEntry {
    pub todo_item: TodoItem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    #[serde(default)]
    pub checked: bool,
    pub content: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeBlock {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub content: Vec<Inline>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Media {
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inline {
    Text(TextRun),
}

/// A run of text with its style flags
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub bold: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub italic: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub underline: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub strikethrough: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub code: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<Link>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn attrs(pairs: &[(&str, serde_json::Value)]) -> Attrs {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

impl PaperDocument {
    /// Build a document tree under the paper schema
    pub fn to_node(&self, schema: &Schema) -> SyncResult<Node> {
        let title = inlines_to_nodes(
            schema,
            &[Inline::Text(TextRun {
                text: self.title.clone(),
                ..TextRun::default()
            })],
        )?;
        let mut children = vec![schema.node("title", Attrs::new(), title)?];
        children.extend(blocks_to_nodes(schema, &self.content)?);
        let doc = schema.node("doc", Attrs::new(), children)?;
        schema.check_doc(&doc)?;
        Ok(doc)
    }

    /// Read a document tree back into the typed form
    pub fn from_node(doc: &Node) -> SyncResult<Self> {
        let title = doc.title().unwrap_or_default();
        let content = nodes_to_blocks(doc.content().iter().filter(|n| n.node_type() != "title"))?;
        Ok(PaperDocument { title, content })
    }
}

fn blocks_to_nodes(schema: &Schema, blocks: &[Block]) -> SyncResult<Vec<Node>> {
    blocks.iter().map(|block| block_to_node(schema, block)).collect()
}

fn block_to_node(schema: &Schema, block: &Block) -> SyncResult<Node> {
    match block {
        Block::Heading(heading) => schema.node(
            "heading",
            attrs(&[("level", json!(heading.level))]),
            inlines_to_nodes(schema, &heading.content)?,
        ),
        Block::Paragraph(paragraph) => schema.node(
            "paragraph",
            Attrs::new(),
            inlines_to_nodes(schema, &paragraph.content)?,
        ),
        Block::Blockquote(quote) => {
            schema.node("blockquote", Attrs::new(), blocks_to_nodes(schema, &quote.content)?)
        }
        Block::OrderedList(list) | Block::BulletList(list) => {
            let name = if matches!(block, Block::OrderedList(_)) {
                "ordered_list"
            } else {
                "bullet_list"
            };
            let items = list
                .content
                .iter()
                .map(|entry| {
                    schema.node(
                        "list_item",
                        Attrs::new(),
                        blocks_to_nodes(schema, &entry.list_item.content)?,
                    )
                })
                .collect::<SyncResult<Vec<_>>>()?;
            schema.node(name, Attrs::new(), items)
        }
        Block::TodoList(list) => {
            let items = list
                .content
                .iter()
                .map(|entry| {
                    schema.node(
                        "todo_item",
                        attrs(&[("checked", json!(entry.todo_item.checked))]),
                        blocks_to_nodes(schema, &entry.todo_item.content)?,
                    )
                })
                .collect::<SyncResult<Vec<_>>>()?;
            schema.node("todo_list", Attrs::new(), items)
        }
        Block::CodeBlock(code) => schema.node(
            "code_block",
            attrs(&[("language", json!(code.language))]),
            inlines_to_nodes(schema, &code.content)?,
        ),
        Block::ImageBlock(media) | Block::VideoBlock(media) => {
            let name = if matches!(block, Block::ImageBlock(_)) {
                "image_block"
            } else {
                "video_block"
            };
            schema.node(
                name,
                attrs(&[("src", json!(media.src)), ("caption", json!(media.caption))]),
                Vec::new(),
            )
        }
    }
}

fn inlines_to_nodes(schema: &Schema, inlines: &[Inline]) -> SyncResult<Vec<Node>> {
    let mut nodes = Vec::new();
    for Inline::Text(run) in inlines {
        if run.text.is_empty() {
            continue;
        }
        let mut marks = Vec::new();
        for (flag, name) in [
            (run.bold, "bold"),
            (run.italic, "italic"),
            (run.underline, "underline"),
            (run.strikethrough, "strikethrough"),
            (run.code, "code"),
        ] {
            if flag {
                marks.push(schema.mark(name, Attrs::new())?);
            }
        }
        if let Some(link) = &run.link {
            marks.push(schema.mark("link", attrs(&[("href", json!(link.href))]))?);
        }
        nodes.push(schema.text(&run.text, marks));
    }
    Ok(nodes)
}

fn nodes_to_blocks<'a>(nodes: impl Iterator<Item = &'a Node>) -> SyncResult<Vec<Block>> {
    nodes.map(node_to_block).collect()
}

fn attr_str(node: &Node, name: &str) -> Option<String> {
    node.attr(name).and_then(|v| v.as_str()).map(String::from)
}

fn node_to_block(node: &Node) -> SyncResult<Block> {
    let block = match node.node_type() {
        "heading" => Block::Heading(Heading {
            level: node.attr("level").and_then(|v| v.as_u64()).unwrap_or(1) as u8,
            content: nodes_to_inlines(node)?,
        }),
        "paragraph" => Block::Paragraph(Paragraph {
            content: nodes_to_inlines(node)?,
        }),
        "blockquote" => Block::Blockquote(Blockquote {
            content: nodes_to_blocks(node.content().iter())?,
        }),
        "ordered_list" | "bullet_list" => {
            let list = List {
                content: node
                    .content()
                    .iter()
                    .map(|item| {
                        Ok(ListEntry {
                            list_item: ListItem {
                                content: nodes_to_blocks(item.content().iter())?,
                            },
                        })
                    })
                    .collect::<SyncResult<Vec<_>>>()?,
            };
            if node.node_type() == "ordered_list" {
                Block::OrderedList(list)
            } else {
                Block::BulletList(list)
            }
        }
        "todo_list" => Block::TodoList(TodoList {
            content: node
                .content()
                .iter()
                .map(|item| {
                    Ok(TodoEntry {
                        todo_item: TodoItem {
                            checked: item.attr("checked") == Some(&json!(true)),
                            content: nodes_to_blocks(item.content().iter())?,
                        },
                    })
                })
                .collect::<SyncResult<Vec<_>>>()?,
        }),
        "code_block" => Block::CodeBlock(CodeBlock {
            language: attr_str(node, "language"),
            content: nodes_to_inlines(node)?,
        }),
        "image_block" | "video_block" => {
            let media = Media {
                src: attr_str(node, "src"),
                caption: attr_str(node, "caption"),
            };
            if node.node_type() == "image_block" {
                Block::ImageBlock(media)
            } else {
                Block::VideoBlock(media)
            }
        }
        other => {
            return Err(SyncError::schema(format!("Unknown node type {}", other)));
        }
    };
    Ok(block)
}

fn nodes_to_inlines(node: &Node) -> SyncResult<Vec<Inline>> {
    node.content()
        .iter()
        .map(|child| {
            let text = child
                .text()
                .ok_or_else(|| SyncError::schema(format!("Unknown node type {}", child.node_type())))?;
            let mut run = TextRun {
                text: text.to_string(),
                ..TextRun::default()
            };
            for mark in child.marks() {
                apply_mark(&mut run, mark)?;
            }
            Ok(Inline::Text(run))
        })
        .collect()
}

fn apply_mark(run: &mut TextRun, mark: &Mark) -> SyncResult<()> {
    match mark.mark_type() {
        "bold" => run.bold = true,
        "italic" => run.italic = true,
        "underline" => run.underline = true,
        "strikethrough" => run.strikethrough = true,
        "code" => run.code = true,
        "link" => {
            run.link = Some(Link {
                href: mark
                    .attrs()
                    .get("href")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
        }
        other => return Err(SyncError::schema(format!("Unknown mark type {}", other))),
    }
    Ok(())
}
