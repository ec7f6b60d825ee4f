//! Turns editing intents into patches.
//!
//! The encoder works on a scratch copy of the value and applies each patch it
//! emits, so later steps of one intent see the effect of earlier ones. The
//! caller gets the patches in order plus the selection that follows them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::document::{
    Block, CHILDREN, Child, DEFAULT_STYLE, Document, InlineObject, MarkDef, Path, PatchError, Span, Target,
    TextBlock, apply_patch, char_len, char_slice,
};
use crate::key::{Key, KeyGenerator};
use crate::patch::{InsertPosition, Patch, SplitSource, TextDelta};
use crate::selection::{Point, Selection, fallback};

/// A user action on the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EditIntent {
    InsertText {
        text: String,
    },
    /// Enter: split the block at the caret.
    InsertBreak,
    DeleteBackward,
    DeleteForward,
    /// Remove the selected range and join its ends.
    DeleteRange,
    InsertBlock {
        block: Block,
    },
    InsertInlineObject {
        object: InlineObject,
    },
    ToggleMark {
        mark: String,
    },
    SetStyle {
        style: String,
    },
    AddAnnotation {
        #[serde(rename = "annotationType")]
        annotation_type: String,
        #[serde(default)]
        value: Map<String, Value>,
    },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EncodeError {
    #[error("No selection to apply the edit at")]
    NoSelection,

    #[error("Selection does not resolve: {0}")]
    InvalidSelection(Path),

    #[error("Unsupported edit: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Patch(#[from] PatchError),
}

pub type Result<T> = std::result::Result<T, EncodeError>;

/// Output of [`encode`].
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    pub patches: Vec<Patch>,
    pub selection: Option<Selection>,
}

/// Encode `intent` against `document` at `selection`.
///
/// Fresh keys for new nodes come from `keys`. Nothing is applied to
/// `document` itself.
pub fn encode(
    document: &Document,
    selection: Option<&Selection>,
    intent: &EditIntent,
    keys: &mut dyn KeyGenerator,
) -> Result<Encoded> {
    let mut encoder = Encoder {
        doc: document.clone(),
        patches: Vec::new(),
        keys,
    };
    let selection = encoder.run(selection, intent)?;
    Ok(Encoded {
        patches: encoder.patches,
        selection,
    })
}

/// A resolved, collapsed position.
///
/// `child` is `None` on object blocks and on text blocks without children.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Caret {
    block: Key,
    child: Option<Key>,
    offset: usize,
}

impl Caret {
    fn point(&self) -> Point {
        match &self.child {
            Some(child) => Point::new(Path::child(&self.block, child), self.offset),
            None => Point::new(Path::block(&self.block), 0),
        }
    }
}

/// A stretch `[from, to)` of one span covered by the selection.
struct Piece {
    block: Key,
    span: Span,
    from: usize,
    to: usize,
}

struct Encoder<'k> {
    doc: Document,
    patches: Vec<Patch>,
    keys: &'k mut dyn KeyGenerator,
}

impl Encoder<'_> {
    fn run(&mut self, selection: Option<&Selection>, intent: &EditIntent) -> Result<Option<Selection>> {
        if let EditIntent::InsertBlock { block } = intent {
            let caret = self.insert_block(selection, block)?;
            return Ok(Some(Selection::caret(caret.point())));
        }

        let selection = selection.ok_or(EncodeError::NoSelection)?;
        let caret = match intent {
            EditIntent::InsertText { text } => Some(self.insert_text(selection, text)?),
            EditIntent::InsertBreak => {
                let caret = self.collapse(selection)?;
                Some(self.insert_break(&caret)?)
            }
            EditIntent::DeleteBackward if selection.is_collapsed() => {
                let caret = self.resolve(&selection.focus)?;
                self.delete_backward(caret)?
            }
            EditIntent::DeleteForward if selection.is_collapsed() => {
                let caret = self.resolve(&selection.focus)?;
                self.delete_forward(caret)?
            }
            EditIntent::DeleteBackward | EditIntent::DeleteForward | EditIntent::DeleteRange => {
                self.delete_range(selection)?
            }
            EditIntent::InsertInlineObject { object } => Some(self.insert_inline_object(selection, object)?),
            EditIntent::ToggleMark { mark } => return self.toggle_mark(selection, mark),
            EditIntent::SetStyle { style } => {
                self.set_style(selection, style)?;
                return Ok(Some(selection.clone()));
            }
            EditIntent::AddAnnotation {
                annotation_type,
                value,
            } => return self.add_annotation(selection, annotation_type, value),
            EditIntent::InsertBlock { .. } => None,
        };
        Ok(caret.map(|caret| Selection::caret(caret.point())))
    }

    fn emit(&mut self, patch: Patch) -> Result<()> {
        self.doc = apply_patch(&self.doc, &patch)?;
        self.patches.push(patch);
        Ok(())
    }

    // ========================================================================
    // Resolving positions
    // ========================================================================

    fn resolve(&self, point: &Point) -> Result<Caret> {
        let invalid = || EncodeError::InvalidSelection(point.path.clone());
        match point.path.target().ok_or_else(invalid)? {
            Target::Block(block) => {
                let child = match self.doc.block(block).ok_or_else(invalid)? {
                    Block::Text(text) => text.children.first().map(|c| c.key().clone()),
                    Block::Object(_) => None,
                };
                Ok(Caret {
                    block: block.clone(),
                    child,
                    offset: 0,
                })
            }
            Target::Child(block, child) | Target::ChildField(block, child, _) => {
                let node = self
                    .doc
                    .text_block(block)
                    .and_then(|text| text.child(child))
                    .ok_or_else(invalid)?;
                Ok(Caret {
                    block: block.clone(),
                    child: Some(child.clone()),
                    offset: point.offset.min(node.text_len()),
                })
            }
            _ => Err(invalid()),
        }
    }

    /// Document order key of a caret.
    fn position(&self, caret: &Caret) -> Result<(usize, usize, usize)> {
        let block = self
            .doc
            .block_index(&caret.block)
            .ok_or_else(|| EncodeError::InvalidSelection(Path::block(&caret.block)))?;
        let child = match (&caret.child, self.doc.text_block(&caret.block)) {
            (Some(child), Some(text)) => text.child_index(child).unwrap_or(0),
            _ => 0,
        };
        Ok((block, child, caret.offset))
    }

    fn ordered(&self, selection: &Selection) -> Result<(Caret, Caret)> {
        let anchor = self.resolve(&selection.anchor)?;
        let focus = self.resolve(&selection.focus)?;
        if self.position(&anchor)? <= self.position(&focus)? {
            Ok((anchor, focus))
        } else {
            Ok((focus, anchor))
        }
    }

    fn collapse(&mut self, selection: &Selection) -> Result<Caret> {
        if selection.is_collapsed() {
            return self.resolve(&selection.focus);
        }
        self.delete_range(selection)?
            .ok_or_else(|| EncodeError::Unsupported("nothing left to edit after deleting the selection".into()))
    }

    fn block(&self, key: &Key) -> Result<Block> {
        self.doc
            .block(key)
            .cloned()
            .ok_or_else(|| EncodeError::InvalidSelection(Path::block(key)))
    }

    fn text_block(&self, key: &Key) -> Result<TextBlock> {
        self.doc
            .text_block(key)
            .cloned()
            .ok_or_else(|| EncodeError::InvalidSelection(Path::block(key)))
    }

    // ========================================================================
    // Text
    // ========================================================================

    fn insert_text(&mut self, selection: &Selection, text: &str) -> Result<Caret> {
        let caret = self.collapse(selection)?;
        if text.is_empty() {
            return Ok(caret);
        }
        let Some(child) = caret.child.clone() else {
            let span = Span::new(self.keys.next_key(), text);
            return self.fill_empty_block(&caret.block, span.into(), char_len(text));
        };

        match self.text_block(&caret.block)?.child(&child).cloned() {
            Some(Child::Span(span)) => {
                self.replace_text(&caret.block, &span, caret.offset, caret.offset, text)?;
                Ok(Caret {
                    offset: caret.offset + char_len(text),
                    ..caret
                })
            }
            _ => {
                // Typing on an inline object starts a new span after it.
                let key = self.keys.next_key();
                self.emit(Patch::insert_children(
                    Path::child(&caret.block, &child),
                    InsertPosition::After,
                    vec![Span::new(key.clone(), text).into()],
                ))?;
                Ok(Caret {
                    block: caret.block,
                    child: Some(key),
                    offset: char_len(text),
                })
            }
        }
    }

    /// Give a childless text block its first child.
    fn fill_empty_block(&mut self, block: &Key, child: Child, offset: usize) -> Result<Caret> {
        if self.doc.text_block(block).is_none() {
            return Err(EncodeError::Unsupported(format!("block {block} does not hold text")));
        }
        let key = child.key().clone();
        self.emit(Patch::set(Path::block_field(block, CHILDREN), vec![Value::from(child)]))?;
        Ok(Caret {
            block: block.clone(),
            child: Some(key),
            offset,
        })
    }

    /// Replace code points `[from, to)` of `span` with `insert`.
    fn replace_text(&mut self, block: &Key, span: &Span, from: usize, to: usize, insert: &str) -> Result<()> {
        let text = format!(
            "{}{}{}",
            char_slice(&span.text, 0, from),
            insert,
            char_slice(&span.text, to, usize::MAX)
        );
        if text == span.text {
            return Ok(());
        }
        self.emit(Patch::diff_match_patch(
            Path::text(block, &span.key),
            TextDelta::diff(&span.text, &text),
        ))
    }

    // ========================================================================
    // Breaks and joins
    // ========================================================================

    fn insert_break(&mut self, caret: &Caret) -> Result<Caret> {
        let (Block::Text(source), Some(child)) = (self.block(&caret.block)?, caret.child.clone()) else {
            return self.insert_empty_block_after(&caret.block);
        };
        let index = source
            .child_index(&child)
            .ok_or_else(|| EncodeError::InvalidSelection(caret.point().path))?;

        let (tail_text, marks) = match &source.children[index] {
            Child::Span(span) => (
                char_slice(&span.text, caret.offset, usize::MAX).to_string(),
                span.marks.clone(),
            ),
            Child::Object(_) => (String::new(), Vec::new()),
        };
        let moved: Vec<Key> = source.children[index + 1..]
            .iter()
            .map(|c| c.key().clone())
            .collect();

        // Breaking at the very end starts a plain paragraph.
        let style = if tail_text.is_empty() && moved.is_empty() {
            DEFAULT_STYLE.to_string()
        } else {
            source.style.clone()
        };

        let tail = self.keys.next_key();
        let key = self.keys.next_key();
        let remainder = TextBlock {
            key: key.clone(),
            style,
            mark_defs: source.mark_defs.clone(),
            children: vec![
                Span {
                    key: tail.clone(),
                    text: tail_text,
                    marks,
                }
                .into(),
            ],
            extra: source.extra.clone(),
        };
        self.emit(Patch::split(
            SplitSource {
                block: caret.block.clone(),
                span: child,
                offset: caret.offset,
                moved,
            },
            remainder.into(),
        ))?;

        Ok(Caret {
            block: key,
            child: Some(tail),
            offset: 0,
        })
    }

    fn insert_empty_block_after(&mut self, block: &Key) -> Result<Caret> {
        let span = self.keys.next_key();
        let key = self.keys.next_key();
        let paragraph = TextBlock::new(key.clone(), vec![Span::new(span.clone(), "").into()]);
        self.emit(Patch::insert_blocks(
            Path::block(block),
            InsertPosition::After,
            vec![paragraph.into()],
        ))?;
        Ok(Caret {
            block: key,
            child: Some(span),
            offset: 0,
        })
    }

    /// Move the children of `from` to the end of `into` and remove `from`.
    ///
    /// Children whose key `into` already uses get a fresh one. Returns the
    /// join point.
    fn merge(&mut self, into: &Key, from: &Key) -> Result<Caret> {
        let target = self.text_block(into)?;
        let source = self.text_block(from)?;

        let mut taken: HashSet<Key> = target.children.iter().map(|c| c.key().clone()).collect();
        let mut renamed = BTreeMap::new();
        for child in &source.children {
            if !taken.insert(child.key().clone()) {
                let key = self.keys.next_key();
                taken.insert(key.clone());
                renamed.insert(child.key().clone(), key);
            }
        }

        let missing: Vec<MarkDef> = source
            .mark_defs
            .iter()
            .filter(|def| !target.mark_defs.iter().any(|t| t.key == def.key))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let defs: Vec<Value> = target
                .mark_defs
                .iter()
                .cloned()
                .chain(missing)
                .map(Value::from)
                .collect();
            self.emit(Patch::set(Path::block_field(into, "markDefs"), defs))?;
        }

        let caret = match target.children.last() {
            Some(last) => Caret {
                block: into.clone(),
                child: Some(last.key().clone()),
                offset: last.text_len(),
            },
            None => Caret {
                block: into.clone(),
                child: source
                    .children
                    .first()
                    .map(|c| renamed.get(c.key()).unwrap_or(c.key()).clone()),
                offset: 0,
            },
        };
        let children = source.children.iter().map(|c| c.key().clone()).collect();
        self.emit(Patch::merge(from, into, children, renamed))?;
        Ok(caret)
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    fn delete_backward(&mut self, caret: Caret) -> Result<Option<Caret>> {
        let Block::Text(text) = self.block(&caret.block)? else {
            return self.remove_block(&caret.block);
        };

        if let Some(child) = &caret.child {
            let index = text.child_index(child).unwrap_or(0);
            match &text.children[index] {
                Child::Span(span) if caret.offset > 0 => {
                    self.replace_text(&caret.block, span, caret.offset - 1, caret.offset, "")?;
                    return Ok(Some(Caret {
                        offset: caret.offset - 1,
                        ..caret
                    }));
                }
                Child::Object(_) => return self.remove_child(&text, index).map(Some),
                Child::Span(_) => {}
            }
            if index > 0 {
                match &text.children[index - 1] {
                    Child::Span(previous) if !previous.is_empty() => {
                        let len = previous.len();
                        self.replace_text(&caret.block, previous, len - 1, len, "")?;
                        return Ok(Some(Caret {
                            block: caret.block,
                            child: Some(previous.key.clone()),
                            offset: len - 1,
                        }));
                    }
                    previous => {
                        self.emit(Patch::unset(Path::child(&caret.block, previous.key())))?;
                        return Ok(Some(caret));
                    }
                }
            }
        }

        // Start of the block: join with whatever precedes it.
        let index = self.doc.block_index(&caret.block).unwrap_or(0);
        if index == 0 {
            return Ok(Some(caret));
        }
        match self.doc.blocks()[index - 1].clone() {
            Block::Text(previous) => self.merge(&previous.key, &caret.block).map(Some),
            Block::Object(object) => {
                self.emit(Patch::unset(Path::block(&object.key)))?;
                Ok(Some(caret))
            }
        }
    }

    fn delete_forward(&mut self, caret: Caret) -> Result<Option<Caret>> {
        let Block::Text(text) = self.block(&caret.block)? else {
            return self.remove_block(&caret.block);
        };

        if let Some(child) = &caret.child {
            let index = text.child_index(child).unwrap_or(0);
            match &text.children[index] {
                Child::Span(span) if caret.offset < span.len() => {
                    self.replace_text(&caret.block, span, caret.offset, caret.offset + 1, "")?;
                    return Ok(Some(caret));
                }
                Child::Object(_) => return self.remove_child(&text, index).map(Some),
                Child::Span(_) => {}
            }
            if let Some(next) = text.children.get(index + 1) {
                match next {
                    Child::Span(next) if !next.is_empty() => {
                        self.replace_text(&caret.block, next, 0, 1, "")?;
                    }
                    next => self.emit(Patch::unset(Path::child(&caret.block, next.key())))?,
                }
                return Ok(Some(caret));
            }
        }

        let index = self.doc.block_index(&caret.block).unwrap_or(0);
        match self.doc.blocks().get(index + 1).cloned() {
            None => Ok(Some(caret)),
            Some(Block::Text(next)) => self.merge(&caret.block, &next.key).map(Some),
            Some(Block::Object(object)) => {
                self.emit(Patch::unset(Path::block(&object.key)))?;
                Ok(Some(caret))
            }
        }
    }

    fn remove_child(&mut self, text: &TextBlock, index: usize) -> Result<Caret> {
        self.emit(Patch::unset(Path::child(&text.key, text.children[index].key())))?;
        let caret = match (index.checked_sub(1).map(|i| &text.children[i]), text.children.get(index + 1)) {
            (Some(previous), _) => Caret {
                block: text.key.clone(),
                child: Some(previous.key().clone()),
                offset: previous.text_len(),
            },
            (None, Some(next)) => Caret {
                block: text.key.clone(),
                child: Some(next.key().clone()),
                offset: 0,
            },
            (None, None) => Caret {
                block: text.key.clone(),
                child: None,
                offset: 0,
            },
        };
        Ok(caret)
    }

    fn remove_block(&mut self, key: &Key) -> Result<Option<Caret>> {
        let before = self.doc.clone();
        self.emit(Patch::unset(Path::block(key)))?;
        let lost = Point::new(Path::block(key), 0);
        Ok(fallback(&before, &self.doc, &lost).and_then(|selection| self.resolve(&selection.focus).ok()))
    }

    fn delete_range(&mut self, selection: &Selection) -> Result<Option<Caret>> {
        let (start, end) = self.ordered(selection)?;
        if start == end {
            return Ok(Some(start));
        }

        if start.block == end.block {
            return match self.block(&start.block)? {
                Block::Text(text) => {
                    self.trim_between(&text, &start, &end)?;
                    Ok(Some(start))
                }
                Block::Object(_) => self.remove_block(&start.block),
            };
        }

        let first = self.block(&start.block)?;
        let last = self.block(&end.block)?;
        let (from, to) = (self.position(&start)?.0, self.position(&end)?.0);
        let between: Vec<Key> = self.doc.blocks()[from + 1..to]
            .iter()
            .map(|b| b.key().clone())
            .collect();
        for key in between {
            self.emit(Patch::unset(Path::block(&key)))?;
        }

        match (first, last) {
            (Block::Text(first), Block::Text(last)) => {
                self.trim_after(&first, &start)?;
                self.trim_before(&last, &end)?;
                self.merge(&first.key, &last.key).map(Some)
            }
            (Block::Text(first), Block::Object(last)) => {
                self.trim_after(&first, &start)?;
                self.emit(Patch::unset(Path::block(&last.key)))?;
                Ok(Some(start))
            }
            (Block::Object(first), Block::Text(last)) => {
                self.trim_before(&last, &end)?;
                self.emit(Patch::unset(Path::block(&first.key)))?;
                let child = self
                    .text_block(&last.key)?
                    .children
                    .first()
                    .map(|c| c.key().clone());
                Ok(Some(Caret {
                    block: last.key,
                    child,
                    offset: 0,
                }))
            }
            (Block::Object(first), Block::Object(last)) => {
                // Leave an empty paragraph where the objects were.
                self.emit(Patch::unset(Path::block(&last.key)))?;
                let caret = self.insert_empty_block_after(&first.key)?;
                self.emit(Patch::unset(Path::block(&first.key)))?;
                Ok(Some(caret))
            }
        }
    }

    /// Delete between two carets in the same text block.
    fn trim_between(&mut self, text: &TextBlock, start: &Caret, end: &Caret) -> Result<()> {
        let (Some(first), Some(last)) = (&start.child, &end.child) else {
            return Ok(());
        };
        let (Some(from), Some(to)) = (text.child_index(first), text.child_index(last)) else {
            return Ok(());
        };
        if from == to {
            if let Child::Span(span) = &text.children[from] {
                self.replace_text(&text.key, span, start.offset, end.offset, "")?;
            }
            return Ok(());
        }
        if let Child::Span(span) = &text.children[from] {
            self.replace_text(&text.key, span, start.offset, span.len(), "")?;
        }
        for child in &text.children[from + 1..to] {
            self.emit(Patch::unset(Path::child(&text.key, child.key())))?;
        }
        if let Child::Span(span) = &text.children[to] {
            self.replace_text(&text.key, span, 0, end.offset, "")?;
        }
        Ok(())
    }

    /// Delete from `start` to the end of its block.
    fn trim_after(&mut self, text: &TextBlock, start: &Caret) -> Result<()> {
        let Some(index) = start.child.as_ref().and_then(|c| text.child_index(c)) else {
            return Ok(());
        };
        if let Child::Span(span) = &text.children[index] {
            self.replace_text(&text.key, span, start.offset, span.len(), "")?;
        }
        for child in &text.children[index + 1..] {
            self.emit(Patch::unset(Path::child(&text.key, child.key())))?;
        }
        Ok(())
    }

    /// Delete from the start of the block up to `end`.
    fn trim_before(&mut self, text: &TextBlock, end: &Caret) -> Result<()> {
        let Some(index) = end.child.as_ref().and_then(|c| text.child_index(c)) else {
            return Ok(());
        };
        for child in &text.children[..index] {
            self.emit(Patch::unset(Path::child(&text.key, child.key())))?;
        }
        if let Child::Span(span) = &text.children[index] {
            self.replace_text(&text.key, span, 0, end.offset, "")?;
        }
        Ok(())
    }

    // ========================================================================
    // Objects
    // ========================================================================

    fn insert_block(&mut self, selection: Option<&Selection>, block: &Block) -> Result<Caret> {
        let mut block = block.clone();
        block.set_key(self.keys.next_key());
        if let Block::Text(text) = &mut block {
            for child in &mut text.children {
                child.set_key(self.keys.next_key());
            }
        }

        let (anchor, position) = match selection {
            None => (Path::root(), InsertPosition::After),
            Some(selection) => {
                let caret = self.collapse(selection)?;
                self.placement(&caret)?
            }
        };

        let caret = Caret {
            block: block.key().clone(),
            child: block
                .as_text()
                .and_then(|text| text.children.first())
                .map(|c| c.key().clone()),
            offset: 0,
        };
        self.emit(Patch::insert_blocks(anchor, position, vec![block]))?;
        Ok(caret)
    }

    /// Where a block inserted at `caret` goes.
    ///
    /// After the block at its end, before it at its start, otherwise the
    /// block is split and the new one lands between the halves.
    fn placement(&mut self, caret: &Caret) -> Result<(Path, InsertPosition)> {
        let here = Path::block(&caret.block);
        let (Block::Text(text), Some(child)) = (self.block(&caret.block)?, &caret.child) else {
            return Ok((here, InsertPosition::After));
        };
        let index = text.child_index(child).unwrap_or(0);
        let at_end = index + 1 == text.children.len() && caret.offset >= text.children[index].text_len();
        let at_start = index == 0 && caret.offset == 0;

        if at_end || text.text_len() == 0 {
            Ok((here, InsertPosition::After))
        } else if at_start {
            Ok((here, InsertPosition::Before))
        } else {
            self.insert_break(caret)?;
            Ok((here, InsertPosition::After))
        }
    }

    fn insert_inline_object(&mut self, selection: &Selection, object: &InlineObject) -> Result<Caret> {
        let caret = self.collapse(selection)?;
        let mut object = object.clone();
        object.key = self.keys.next_key();
        let key = object.key.clone();

        let Some(child) = caret.child.clone() else {
            return self.fill_empty_block(&caret.block, Child::Object(object), 0);
        };
        let at = Path::child(&caret.block, &child);
        match self.text_block(&caret.block)?.child(&child).cloned() {
            Some(Child::Span(span)) if caret.offset == 0 && !span.is_empty() => {
                self.emit(Patch::insert_children(at, InsertPosition::Before, vec![Child::Object(object)]))?;
            }
            Some(Child::Span(span)) if caret.offset < span.len() => {
                let rest = Span {
                    key: self.keys.next_key(),
                    text: char_slice(&span.text, caret.offset, usize::MAX).to_string(),
                    marks: span.marks.clone(),
                };
                self.replace_text(&caret.block, &span, caret.offset, usize::MAX, "")?;
                self.emit(Patch::insert_children(
                    at,
                    InsertPosition::After,
                    vec![Child::Object(object), rest.into()],
                ))?;
            }
            _ => {
                self.emit(Patch::insert_children(at, InsertPosition::After, vec![Child::Object(object)]))?;
            }
        }

        Ok(Caret {
            block: caret.block,
            child: Some(key),
            offset: 0,
        })
    }

    // ========================================================================
    // Formatting
    // ========================================================================

    fn set_style(&mut self, selection: &Selection, style: &str) -> Result<()> {
        let (start, end) = self.ordered(selection)?;
        let (from, to) = (self.position(&start)?.0, self.position(&end)?.0);
        let targets: Vec<Key> = self.doc.blocks()[from..=to]
            .iter()
            .filter_map(Block::as_text)
            .filter(|text| text.style != style)
            .map(|text| text.key.clone())
            .collect();
        for key in targets {
            self.emit(Patch::set(Path::block_field(&key, "style"), style))?;
        }
        Ok(())
    }

    fn toggle_mark(&mut self, selection: &Selection, mark: &str) -> Result<Option<Selection>> {
        if selection.is_collapsed() {
            return Ok(Some(selection.clone()));
        }
        let pieces = self.pieces(selection)?;
        if pieces.is_empty() {
            return Ok(Some(selection.clone()));
        }
        let remove = pieces.iter().all(|piece| piece.span.has_mark(mark));
        self.mark_pieces(pieces, |marks| {
            if remove {
                marks.retain(|m| m != mark);
            } else if !marks.iter().any(|m| m == mark) {
                marks.push(mark.to_string());
            }
        })
    }

    fn add_annotation(
        &mut self,
        selection: &Selection,
        annotation_type: &str,
        value: &Map<String, Value>,
    ) -> Result<Option<Selection>> {
        if selection.is_collapsed() {
            return Err(EncodeError::Unsupported(
                "annotations need an expanded selection".into(),
            ));
        }
        let pieces = self.pieces(selection)?;
        if pieces.is_empty() {
            return Ok(Some(selection.clone()));
        }

        let def = MarkDef {
            key: self.keys.next_key(),
            def_type: annotation_type.to_string(),
            fields: value.clone(),
        };
        let mut blocks: Vec<Key> = pieces.iter().map(|piece| piece.block.clone()).collect();
        blocks.dedup();
        for block in blocks {
            let defs: Vec<Value> = self
                .text_block(&block)?
                .mark_defs
                .into_iter()
                .chain([def.clone()])
                .map(Value::from)
                .collect();
            self.emit(Patch::set(Path::block_field(&block, "markDefs"), defs))?;
        }

        let mark = def.key.to_string();
        self.mark_pieces(pieces, |marks| marks.push(mark.clone()))
    }

    /// Span stretches covered by an expanded selection, in document order.
    fn pieces(&self, selection: &Selection) -> Result<Vec<Piece>> {
        let (start, end) = self.ordered(selection)?;
        let (first, last) = (self.position(&start)?, self.position(&end)?);
        let mut pieces = Vec::new();

        for (block_index, block) in self.doc.blocks().iter().enumerate().take(last.0 + 1).skip(first.0) {
            let Block::Text(text) = block else { continue };
            for (child_index, child) in text.children.iter().enumerate() {
                let Child::Span(span) = child else { continue };
                let at = (block_index, child_index);
                if at < (first.0, first.1) || at > (last.0, last.1) {
                    continue;
                }
                let from = if at == (first.0, first.1) { first.2 } else { 0 };
                let to = if at == (last.0, last.1) { last.2 } else { span.len() };
                if from < to {
                    pieces.push(Piece {
                        block: text.key.clone(),
                        span: span.clone(),
                        from,
                        to,
                    });
                }
            }
        }
        Ok(pieces)
    }

    /// Rewrite the marks of each piece, splitting spans at piece edges.
    fn mark_pieces(&mut self, pieces: Vec<Piece>, edit: impl Fn(&mut Vec<String>)) -> Result<Option<Selection>> {
        let mut points: Vec<(Point, Point)> = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let mut marks = piece.span.marks.clone();
            edit(&mut marks);
            let (key, from, to) = self.mark_piece(&piece, marks)?;
            points.push((
                Point::new(Path::child(&piece.block, &key), from),
                Point::new(Path::child(&piece.block, &key), to),
            ));
        }
        let anchor = points.first().map(|(start, _)| start.clone());
        let focus = points.last().map(|(_, end)| end.clone());
        Ok(anchor.zip(focus).map(|(anchor, focus)| Selection::new(anchor, focus)))
    }

    /// Returns the span now holding the piece and its range inside it.
    fn mark_piece(&mut self, piece: &Piece, marks: Vec<String>) -> Result<(Key, usize, usize)> {
        let Piece { block, span, from, to } = piece;
        let (from, to) = (*from, *to);
        let len = span.len();
        if marks == span.marks {
            return Ok((span.key.clone(), from, to));
        }
        let anchor = Path::child(block, &span.key);

        if from == 0 {
            self.emit(Patch::set(Path::child_field(block, &span.key, "marks"), marks))?;
            if to < len {
                let rest = Span {
                    key: self.keys.next_key(),
                    text: char_slice(&span.text, to, usize::MAX).to_string(),
                    marks: span.marks.clone(),
                };
                self.replace_text(block, span, to, len, "")?;
                self.emit(Patch::insert_children(anchor, InsertPosition::After, vec![rest.into()]))?;
            }
            return Ok((span.key.clone(), 0, to));
        }

        let middle = Span {
            key: self.keys.next_key(),
            text: char_slice(&span.text, from, to).to_string(),
            marks,
        };
        let middle_key = middle.key.clone();
        let mut items: Vec<Child> = vec![middle.into()];
        if to < len {
            items.push(
                Span {
                    key: self.keys.next_key(),
                    text: char_slice(&span.text, to, usize::MAX).to_string(),
                    marks: span.marks.clone(),
                }
                .into(),
            );
        }
        self.replace_text(block, span, from, len, "")?;
        self.emit(Patch::insert_children(anchor, InsertPosition::After, items))?;
        Ok((middle_key, 0, to - from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ObjectBlock, apply_patches};
    use crate::editor_id::EditorId;
    use crate::key::PrefixedKeys;
    use serde_json::json;

    fn k(s: &str) -> Key {
        Key::from(s)
    }

    fn caret(block: &str, span: &str, offset: usize) -> Selection {
        Selection::caret(Point::new(Path::child(&k(block), &k(span)), offset))
    }

    fn range(anchor: (&str, &str, usize), focus: (&str, &str, usize)) -> Selection {
        Selection::new(
            Point::new(Path::child(&k(anchor.0), &k(anchor.1)), anchor.2),
            Point::new(Path::child(&k(focus.0), &k(focus.1)), focus.2),
        )
    }

    fn keys() -> PrefixedKeys {
        let editor: EditorId = "A".parse().unwrap();
        PrefixedKeys::new(&editor)
    }

    fn doc() -> Document {
        Document::new(vec![
            TextBlock::new("b0", vec![Span::new("s0", "Hello world").into()]).into(),
            TextBlock::new(
                "b1",
                vec![
                    Span::new("s1", "Second ").into(),
                    Span::new("s2", "block").with_marks(&["em"]).into(),
                ],
            )
            .into(),
        ])
    }

    /// Encode and check the patches reproduce the scratch result.
    fn run(doc: &Document, selection: Option<&Selection>, intent: EditIntent) -> (Document, Option<Selection>) {
        let encoded = encode(doc, selection, &intent, &mut keys()).unwrap();
        let value = apply_patches(doc, &encoded.patches).unwrap();
        assert!(value.has_unique_keys());
        (value, encoded.selection)
    }

    fn text(doc: &Document, block: &str) -> String {
        doc.text_block(&k(block)).unwrap().plain_text()
    }

    fn block_keys(doc: &Document) -> Vec<String> {
        doc.blocks().iter().map(|b| b.key().to_string()).collect()
    }

    // ========================================================================
    // Text
    // ========================================================================

    #[test]
    fn test_insert_text_at_caret() {
        let (value, selection) = run(
            &doc(),
            Some(&caret("b0", "s0", 5)),
            EditIntent::InsertText { text: ",".into() },
        );
        assert_eq!(text(&value, "b0"), "Hello, world");
        assert_eq!(selection, Some(caret("b0", "s0", 6)));
    }

    #[test]
    fn test_insert_text_clamps_offset() {
        let base = Document::new(vec![
            TextBlock::new("b", vec![Span::new("s", "Hello").into()]).into(),
        ]);
        let (value, selection) = run(
            &base,
            Some(&caret("b", "s", 11)),
            EditIntent::InsertText { text: " world".into() },
        );
        assert_eq!(text(&value, "b"), "Hello world");
        assert_eq!(selection, Some(caret("b", "s", 11)));
    }

    #[test]
    fn test_insert_text_replaces_range() {
        let (value, selection) = run(
            &doc(),
            Some(&range(("b0", "s0", 6), ("b0", "s0", 11))),
            EditIntent::InsertText { text: "there".into() },
        );
        assert_eq!(text(&value, "b0"), "Hello there");
        assert_eq!(selection, Some(caret("b0", "s0", 11)));
    }

    #[test]
    fn test_insert_text_uses_diff() {
        let encoded = encode(
            &doc(),
            Some(&caret("b0", "s0", 5)),
            &EditIntent::InsertText { text: "!".into() },
            &mut keys(),
        )
        .unwrap();
        assert_eq!(
            encoded.patches,
            vec![Patch::diff_match_patch(
                Path::text(&k("b0"), &k("s0")),
                TextDelta::insert_at(5, "!")
            )]
        );
    }

    #[test]
    fn test_no_selection_is_an_error() {
        let result = encode(&doc(), None, &EditIntent::InsertText { text: "x".into() }, &mut keys());
        assert_eq!(result, Err(EncodeError::NoSelection));
    }

    #[test]
    fn test_unresolved_selection_is_an_error() {
        let result = encode(
            &doc(),
            Some(&caret("missing", "s0", 0)),
            &EditIntent::InsertText { text: "x".into() },
            &mut keys(),
        );
        assert!(matches!(result, Err(EncodeError::InvalidSelection(_))));
    }

    // ========================================================================
    // Breaks
    // ========================================================================

    #[test]
    fn test_break_splits_block() {
        let (value, selection) = run(&doc(), Some(&caret("b0", "s0", 5)), EditIntent::InsertBreak);
        assert_eq!(block_keys(&value), ["b0", "A-1", "b1"]);
        assert_eq!(text(&value, "b0"), "Hello");
        assert_eq!(text(&value, "A-1"), " world");
        assert_eq!(selection, Some(caret("A-1", "A-0", 0)));
    }

    #[test]
    fn test_break_at_end_adds_empty_block() {
        let (value, selection) = run(&doc(), Some(&caret("b0", "s0", 11)), EditIntent::InsertBreak);
        assert_eq!(text(&value, "A-1"), "");
        assert_eq!(value.text_block(&k("A-1")).unwrap().children.len(), 1);
        assert_eq!(selection, Some(caret("A-1", "A-0", 0)));
    }

    #[test]
    fn test_break_moves_following_children() {
        let (value, _) = run(&doc(), Some(&caret("b1", "s1", 3)), EditIntent::InsertBreak);
        assert_eq!(text(&value, "b1"), "Sec");
        let remainder = value.text_block(&k("A-1")).unwrap();
        assert_eq!(remainder.plain_text(), "ond block");
        assert_eq!(remainder.span(&k("s2")).unwrap().marks, ["em"]);
    }

    #[test]
    fn test_break_at_end_of_heading_starts_paragraph() {
        let mut heading = TextBlock::new("h", vec![Span::new("s", "Title").into()]);
        heading.style = "h1".into();
        let base = Document::new(vec![heading.into()]);
        let (value, _) = run(&base, Some(&caret("h", "s", 5)), EditIntent::InsertBreak);
        assert_eq!(value.text_block(&k("A-1")).unwrap().style, "normal");
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    #[test]
    fn test_delete_backward_in_span() {
        let (value, selection) = run(&doc(), Some(&caret("b0", "s0", 5)), EditIntent::DeleteBackward);
        assert_eq!(text(&value, "b0"), "Hell world");
        assert_eq!(selection, Some(caret("b0", "s0", 4)));
    }

    #[test]
    fn test_delete_backward_at_block_start_merges() {
        let (value, selection) = run(&doc(), Some(&caret("b1", "s1", 0)), EditIntent::DeleteBackward);
        assert_eq!(block_keys(&value), ["b0"]);
        assert_eq!(text(&value, "b0"), "Hello worldSecond block");
        assert_eq!(selection, Some(caret("b0", "s0", 11)));
        let merged = value.text_block(&k("b0")).unwrap();
        assert_eq!(merged.span(&k("s2")).unwrap().marks, ["em"]);
        assert_eq!(merged.children.len(), 3);
    }

    #[test]
    fn test_join_is_a_single_merge_patch() {
        let encoded = encode(&doc(), Some(&caret("b1", "s1", 0)), &EditIntent::DeleteBackward, &mut keys()).unwrap();
        assert_eq!(
            encoded.patches,
            vec![Patch::merge(&k("b1"), &k("b0"), vec![k("s1"), k("s2")], BTreeMap::new())]
        );
    }

    #[test]
    fn test_join_into_empty_block_puts_caret_on_first_child() {
        let base = Document::new(vec![
            TextBlock::new("b0", vec![]).into(),
            TextBlock::new("b1", vec![Span::new("s1", "Two").into()]).into(),
        ]);
        let (value, selection) = run(&base, Some(&caret("b1", "s1", 0)), EditIntent::DeleteBackward);
        assert_eq!(text(&value, "b0"), "Two");
        assert_eq!(selection, Some(caret("b0", "s1", 0)));
    }

    #[test]
    fn test_delete_backward_at_document_start_is_noop() {
        let encoded = encode(&doc(), Some(&caret("b0", "s0", 0)), &EditIntent::DeleteBackward, &mut keys()).unwrap();
        assert!(encoded.patches.is_empty());
        assert_eq!(encoded.selection, Some(caret("b0", "s0", 0)));
    }

    #[test]
    fn test_delete_forward_at_block_end_merges() {
        let (value, selection) = run(&doc(), Some(&caret("b0", "s0", 11)), EditIntent::DeleteForward);
        assert_eq!(text(&value, "b0"), "Hello worldSecond block");
        assert_eq!(selection, Some(caret("b0", "s0", 11)));
    }

    #[test]
    fn test_merge_rekeys_colliding_children() {
        let base = Document::new(vec![
            TextBlock::new("b0", vec![Span::new("s", "One").with_marks(&["strong"]).into()]).into(),
            TextBlock::new("b1", vec![Span::new("s", "Two").into()]).into(),
        ]);
        let (value, _) = run(&base, Some(&caret("b1", "s", 0)), EditIntent::DeleteBackward);
        let merged = value.text_block(&k("b0")).unwrap();
        assert_eq!(merged.plain_text(), "OneTwo");
        assert_eq!(merged.children.len(), 2);
        assert_eq!(merged.children[1].key(), &k("A-0"));
    }

    #[test]
    fn test_delete_range_across_blocks() {
        let (value, selection) = run(
            &doc(),
            Some(&range(("b1", "s2", 2), ("b0", "s0", 5))),
            EditIntent::DeleteRange,
        );
        assert_eq!(block_keys(&value), ["b0"]);
        assert_eq!(text(&value, "b0"), "Helloock");
        assert_eq!(selection, Some(caret("b0", "s0", 5)));
    }

    #[test]
    fn test_delete_object_block() {
        let base = Document::new(vec![
            TextBlock::new("b0", vec![Span::new("s0", "Text").into()]).into(),
            ObjectBlock::new("img", "image").into(),
        ]);
        let selection = Selection::caret(Point::new(Path::block(&k("img")), 0));
        let (value, selection) = run(&base, Some(&selection), EditIntent::DeleteBackward);
        assert_eq!(block_keys(&value), ["b0"]);
        assert_eq!(selection, Some(caret("b0", "s0", 4)));
    }

    // ========================================================================
    // Objects
    // ========================================================================

    #[test]
    fn test_insert_block_at_end_goes_after() {
        let block: Block = ObjectBlock::new("", "image").into();
        let (value, selection) = run(&doc(), Some(&caret("b0", "s0", 11)), EditIntent::InsertBlock { block });
        assert_eq!(block_keys(&value), ["b0", "A-0", "b1"]);
        assert_eq!(selection, Some(Selection::caret(Point::new(Path::block(&k("A-0")), 0))));
    }

    #[test]
    fn test_insert_block_at_start_goes_before() {
        let block: Block = ObjectBlock::new("", "image").into();
        let (value, _) = run(&doc(), Some(&caret("b0", "s0", 0)), EditIntent::InsertBlock { block });
        assert_eq!(block_keys(&value), ["A-0", "b0", "b1"]);
    }

    #[test]
    fn test_insert_block_mid_text_splits() {
        let block: Block = ObjectBlock::new("", "image").into();
        let (value, _) = run(&doc(), Some(&caret("b0", "s0", 5)), EditIntent::InsertBlock { block });
        assert_eq!(block_keys(&value), ["b0", "A-0", "A-2", "b1"]);
        assert_eq!(text(&value, "b0"), "Hello");
        assert_eq!(text(&value, "A-2"), " world");
    }

    #[test]
    fn test_insert_block_without_selection_appends() {
        let block: Block = ObjectBlock::new("", "image").into();
        let (value, _) = run(&doc(), None, EditIntent::InsertBlock { block });
        assert_eq!(block_keys(&value), ["b0", "b1", "A-0"]);
    }

    #[test]
    fn test_insert_inline_object_splits_span() {
        let object: InlineObject = serde_json::from_value(json!({"_key": "", "_type": "mention", "user": "ada"})).unwrap();
        let (value, selection) = run(
            &doc(),
            Some(&caret("b0", "s0", 5)),
            EditIntent::InsertInlineObject { object },
        );
        let block = value.text_block(&k("b0")).unwrap();
        let keys: Vec<&str> = block.children.iter().map(|c| c.key().as_str()).collect();
        assert_eq!(keys, ["s0", "A-0", "A-1"]);
        assert_eq!(block.plain_text(), "Hello world");
        assert_eq!(selection, Some(caret("b0", "A-0", 0)));
    }

    // ========================================================================
    // Formatting
    // ========================================================================

    #[test]
    fn test_toggle_mark_splits_span() {
        let (value, selection) = run(
            &doc(),
            Some(&range(("b0", "s0", 6), ("b0", "s0", 11))),
            EditIntent::ToggleMark { mark: "strong".into() },
        );
        let block = value.text_block(&k("b0")).unwrap();
        assert_eq!(block.span(&k("s0")).unwrap().text, "Hello ");
        assert_eq!(block.span(&k("A-0")).unwrap().text, "world");
        assert_eq!(block.span(&k("A-0")).unwrap().marks, ["strong"]);
        assert_eq!(selection, Some(range(("b0", "A-0", 0), ("b0", "A-0", 5))));
    }

    #[test]
    fn test_toggle_mark_removes_when_all_marked() {
        let (value, _) = run(
            &doc(),
            Some(&range(("b1", "s2", 0), ("b1", "s2", 5))),
            EditIntent::ToggleMark { mark: "em".into() },
        );
        assert!(value.span(&k("b1"), &k("s2")).unwrap().marks.is_empty());
    }

    #[test]
    fn test_set_style_on_each_block() {
        let (value, selection) = run(
            &doc(),
            Some(&range(("b0", "s0", 0), ("b1", "s1", 0))),
            EditIntent::SetStyle { style: "h2".into() },
        );
        assert_eq!(value.text_block(&k("b0")).unwrap().style, "h2");
        assert_eq!(value.text_block(&k("b1")).unwrap().style, "h2");
        assert_eq!(selection, Some(range(("b0", "s0", 0), ("b1", "s1", 0))));
    }

    #[test]
    fn test_add_annotation() {
        let mut value = Map::new();
        value.insert("href".into(), json!("https://example.com"));
        let (doc, _) = run(
            &doc(),
            Some(&range(("b0", "s0", 0), ("b0", "s0", 5))),
            EditIntent::AddAnnotation {
                annotation_type: "link".into(),
                value,
            },
        );
        let block = doc.text_block(&k("b0")).unwrap();
        assert_eq!(block.mark_defs.len(), 1);
        assert_eq!(block.mark_defs[0].key, k("A-0"));
        assert_eq!(block.span(&k("s0")).unwrap().marks, ["A-0"]);
        assert_eq!(block.plain_text(), "Hello world");
    }

    #[test]
    fn test_collapsed_annotation_is_unsupported() {
        let result = encode(
            &doc(),
            Some(&caret("b0", "s0", 0)),
            &EditIntent::AddAnnotation {
                annotation_type: "link".into(),
                value: Map::new(),
            },
            &mut keys(),
        );
        assert!(matches!(result, Err(EncodeError::Unsupported(_))));
    }

    #[test]
    fn test_intent_wire_shape() {
        let intent: EditIntent = serde_json::from_value(json!({"type": "insertText", "text": "hi"})).unwrap();
        assert_eq!(intent, EditIntent::InsertText { text: "hi".into() });
        let intent: EditIntent = serde_json::from_value(json!({"type": "insertBreak"})).unwrap();
        assert_eq!(intent, EditIntent::InsertBreak);
    }
}
