//! Portable text document model.
//!
//! A document is an ordered list of blocks. Text blocks hold spans and inline
//! objects; object blocks hold arbitrary fields. Every node carries a `_key`
//! and is addressed by key, never by index.

mod apply;
mod path;

pub use apply::{PatchError, apply_patch, apply_patches};
pub use path::{CHILDREN, Path, PathSegment, TEXT, Target};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::key::Key;

/// `_type` of text blocks.
pub const BLOCK_TYPE: &str = "block";
/// `_type` of spans.
pub const SPAN_TYPE: &str = "span";
/// Style given to blocks that don't name one.
pub const DEFAULT_STYLE: &str = "normal";

fn default_style() -> String {
    DEFAULT_STYLE.to_string()
}

/// A run of text with uniform marks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    #[serde(rename = "_key")]
    pub key: Key,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub marks: Vec<String>,
}

impl Span {
    pub fn new(key: impl Into<Key>, text: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            text: text.into(),
            marks: Vec::new(),
        }
    }

    pub fn with_marks(mut self, marks: &[&str]) -> Self {
        self.marks = marks.iter().map(|m| m.to_string()).collect();
        self
    }

    /// Length in code points.
    pub fn len(&self) -> usize {
        char_len(&self.text)
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn has_mark(&self, mark: &str) -> bool {
        self.marks.iter().any(|m| m == mark)
    }
}

/// A non-text child of a text block (mention, image, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineObject {
    #[serde(rename = "_key")]
    pub key: Key,
    #[serde(rename = "_type")]
    pub object_type: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Child of a text block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Child {
    Span(Span),
    Object(InlineObject),
}

impl Child {
    pub fn key(&self) -> &Key {
        match self {
            Child::Span(span) => &span.key,
            Child::Object(object) => &object.key,
        }
    }

    pub fn set_key(&mut self, key: Key) {
        match self {
            Child::Span(span) => span.key = key,
            Child::Object(object) => object.key = key,
        }
    }

    pub fn as_span(&self) -> Option<&Span> {
        match self {
            Child::Span(span) => Some(span),
            Child::Object(_) => None,
        }
    }

    pub fn as_span_mut(&mut self) -> Option<&mut Span> {
        match self {
            Child::Span(span) => Some(span),
            Child::Object(_) => None,
        }
    }

    /// Text length in code points; inline objects count as zero.
    pub fn text_len(&self) -> usize {
        self.as_span().map_or(0, Span::len)
    }
}

impl From<Span> for Child {
    fn from(span: Span) -> Self {
        Child::Span(span)
    }
}

impl TryFrom<Value> for Child {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value.get("_type").and_then(Value::as_str) {
            Some(SPAN_TYPE) => serde_json::from_value(value).map(Child::Span),
            _ => serde_json::from_value(value).map(Child::Object),
        }
    }
}

impl From<Child> for Value {
    fn from(child: Child) -> Self {
        match child {
            Child::Span(span) => {
                let mut map = Map::new();
                map.insert("_key".into(), Value::String(span.key.to_string()));
                map.insert("_type".into(), SPAN_TYPE.into());
                map.insert("text".into(), span.text.into());
                map.insert("marks".into(), span.marks.into());
                Value::Object(map)
            }
            Child::Object(object) => keyed_object(&object.key, &object.object_type, object.fields),
        }
    }
}

/// Annotation data referenced from span marks by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkDef {
    #[serde(rename = "_key")]
    pub key: Key,
    #[serde(rename = "_type")]
    pub def_type: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl From<MarkDef> for Value {
    fn from(def: MarkDef) -> Self {
        keyed_object(&def.key, &def.def_type, def.fields)
    }
}

/// A paragraph-like block of spans and inline objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextBlock {
    #[serde(rename = "_key")]
    pub key: Key,
    #[serde(default = "default_style")]
    pub style: String,
    #[serde(default)]
    pub mark_defs: Vec<MarkDef>,
    #[serde(default)]
    pub children: Vec<Child>,
    /// Fields the model doesn't interpret (`listItem`, `level`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TextBlock {
    pub fn new(key: impl Into<Key>, children: Vec<Child>) -> Self {
        Self {
            key: key.into(),
            style: default_style(),
            mark_defs: Vec::new(),
            children,
            extra: Map::new(),
        }
    }

    pub fn child_index(&self, key: &Key) -> Option<usize> {
        self.children.iter().position(|c| c.key() == key)
    }

    pub fn child(&self, key: &Key) -> Option<&Child> {
        self.children.iter().find(|c| c.key() == key)
    }

    pub fn child_mut(&mut self, key: &Key) -> Option<&mut Child> {
        self.children.iter_mut().find(|c| c.key() == key)
    }

    pub fn span(&self, key: &Key) -> Option<&Span> {
        self.child(key).and_then(Child::as_span)
    }

    /// Concatenated text of all spans.
    pub fn plain_text(&self) -> String {
        self.children
            .iter()
            .filter_map(Child::as_span)
            .map(|s| s.text.as_str())
            .collect()
    }

    /// Text length of the whole block in code points.
    pub fn text_len(&self) -> usize {
        self.children.iter().map(Child::text_len).sum()
    }
}

/// A block holding arbitrary fields (image, code, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectBlock {
    #[serde(rename = "_key")]
    pub key: Key,
    #[serde(rename = "_type")]
    pub block_type: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ObjectBlock {
    pub fn new(key: impl Into<Key>, block_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            block_type: block_type.into(),
            fields: Map::new(),
        }
    }
}

/// Top-level document node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Block {
    Text(TextBlock),
    Object(ObjectBlock),
}

impl Block {
    pub fn key(&self) -> &Key {
        match self {
            Block::Text(block) => &block.key,
            Block::Object(block) => &block.key,
        }
    }

    pub fn set_key(&mut self, key: Key) {
        match self {
            Block::Text(block) => block.key = key,
            Block::Object(block) => block.key = key,
        }
    }

    pub fn as_text(&self) -> Option<&TextBlock> {
        match self {
            Block::Text(block) => Some(block),
            Block::Object(_) => None,
        }
    }

    pub fn as_text_mut(&mut self) -> Option<&mut TextBlock> {
        match self {
            Block::Text(block) => Some(block),
            Block::Object(_) => None,
        }
    }
}

impl From<TextBlock> for Block {
    fn from(block: TextBlock) -> Self {
        Block::Text(block)
    }
}

impl From<ObjectBlock> for Block {
    fn from(block: ObjectBlock) -> Self {
        Block::Object(block)
    }
}

impl TryFrom<Value> for Block {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(mut map)
                if map.get("_type").and_then(Value::as_str) == Some(BLOCK_TYPE) =>
            {
                map.remove("_type");
                serde_json::from_value(Value::Object(map)).map(Block::Text)
            }
            other => serde_json::from_value(other).map(Block::Object),
        }
    }
}

impl From<Block> for Value {
    fn from(block: Block) -> Self {
        match block {
            Block::Text(block) => {
                let mut map = block.extra;
                map.insert("_key".into(), Value::String(block.key.to_string()));
                map.insert("_type".into(), BLOCK_TYPE.into());
                map.insert("style".into(), block.style.into());
                map.insert(
                    "markDefs".into(),
                    Value::Array(block.mark_defs.into_iter().map(Value::from).collect()),
                );
                map.insert(
                    "children".into(),
                    Value::Array(block.children.into_iter().map(Value::from).collect()),
                );
                Value::Object(map)
            }
            Block::Object(block) => keyed_object(&block.key, &block.block_type, block.fields),
        }
    }
}

fn keyed_object(key: &Key, type_name: &str, fields: Map<String, Value>) -> Value {
    let mut map = fields;
    map.insert("_key".into(), Value::String(key.to_string()));
    map.insert("_type".into(), type_name.into());
    Value::Object(map)
}

/// The shared value edited by every session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    blocks: Vec<Block>,
}

impl Document {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_index(&self, key: &Key) -> Option<usize> {
        self.blocks.iter().position(|b| b.key() == key)
    }

    pub fn block(&self, key: &Key) -> Option<&Block> {
        self.blocks.iter().find(|b| b.key() == key)
    }

    pub fn block_mut(&mut self, key: &Key) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.key() == key)
    }

    pub fn text_block(&self, key: &Key) -> Option<&TextBlock> {
        self.block(key).and_then(Block::as_text)
    }

    pub fn span(&self, block: &Key, span: &Key) -> Option<&Span> {
        self.text_block(block).and_then(|b| b.span(span))
    }

    /// Block keys unique in the document and child keys unique per block.
    pub fn has_unique_keys(&self) -> bool {
        let mut blocks = HashSet::new();
        self.blocks.iter().all(|block| {
            let children_unique = block.as_text().is_none_or(|text| {
                let mut seen = HashSet::new();
                text.children.iter().all(|c| seen.insert(c.key()))
            });
            blocks.insert(block.key()) && children_unique
        })
    }

    pub(crate) fn blocks_mut(&mut self) -> &mut Vec<Block> {
        &mut self.blocks
    }
}

/// Length of `text` in code points.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Byte index of code point `offset`, clamped to the end of `text`.
pub(crate) fn byte_index(text: &str, offset: usize) -> usize {
    text.char_indices()
        .nth(offset)
        .map_or(text.len(), |(index, _)| index)
}

/// Code points `[start, end)` of `text`, clamped.
pub(crate) fn char_slice(text: &str, start: usize, end: usize) -> &str {
    let from = byte_index(text, start);
    let to = byte_index(text, end.max(start));
    &text[from..to]
}
