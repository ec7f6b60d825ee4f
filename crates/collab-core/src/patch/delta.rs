//! Text deltas: retain/insert/delete runs over code points.
//!
//! A delta is written against a base text. Anything past the last op is
//! implicitly retained, so `[retain 5, insert " world"]` applies to any text
//! of at least five characters.

use serde::{Deserialize, Serialize};
use similar::{Algorithm, ChangeTag, TextDiff};
use thiserror::Error;

use crate::document::{byte_index, char_len};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error("Delta spans {needed} characters but the text has {actual}")]
    OutOfRange { needed: usize, actual: usize },
}

/// One run of a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TextOp {
    Retain(usize),
    Insert(String),
    Delete(usize),
}

/// A normalized sequence of text ops.
///
/// Adjacent ops of the same kind are merged, inserts come before deletes at
/// the same position and there is never a trailing retain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextDelta {
    ops: Vec<TextOp>,
}

impl TextDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimal character diff turning `old` into `new`.
    pub fn diff(old: &str, new: &str) -> Self {
        let diff = TextDiff::configure()
            .algorithm(Algorithm::Myers)
            .diff_chars(old, new);
        let mut delta = Self::new();
        for change in diff.iter_all_changes() {
            let value = change.value();
            match change.tag() {
                ChangeTag::Equal => delta.retain(char_len(value)),
                ChangeTag::Delete => delta.delete(char_len(value)),
                ChangeTag::Insert => delta.insert(value),
            }
        }
        delta.trim();
        delta
    }

    /// Insert `text` at `offset`.
    pub fn insert_at(offset: usize, text: &str) -> Self {
        let mut delta = Self::new();
        delta.retain(offset);
        delta.insert(text);
        delta.trim();
        delta
    }

    /// Delete `len` characters starting at `offset`.
    pub fn delete_at(offset: usize, len: usize) -> Self {
        let mut delta = Self::new();
        delta.retain(offset);
        delta.delete(len);
        delta.trim();
        delta
    }

    pub fn ops(&self) -> &[TextOp] {
        &self.ops
    }

    /// True when applying the delta changes nothing.
    pub fn is_noop(&self) -> bool {
        self.ops.iter().all(|op| match op {
            TextOp::Retain(_) => true,
            TextOp::Insert(s) => s.is_empty(),
            TextOp::Delete(n) => *n == 0,
        })
    }

    /// Characters of base text the delta reads explicitly.
    pub fn base_len(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                TextOp::Retain(n) | TextOp::Delete(n) => *n,
                TextOp::Insert(_) => 0,
            })
            .sum()
    }

    /// Net change in length.
    pub fn len_change(&self) -> isize {
        self.ops
            .iter()
            .map(|op| match op {
                TextOp::Retain(_) => 0,
                TextOp::Insert(s) => char_len(s) as isize,
                TextOp::Delete(n) => -(*n as isize),
            })
            .sum()
    }

    pub fn retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(TextOp::Retain(last)) = self.ops.last_mut() {
            *last += n;
        } else {
            self.ops.push(TextOp::Retain(n));
        }
    }

    pub fn insert(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.ops.as_mut_slice() {
            [.., TextOp::Insert(last)] | [.., TextOp::Insert(last), TextOp::Delete(_)] => {
                last.push_str(text);
                return;
            }
            _ => {}
        }
        match self.ops.last() {
            Some(TextOp::Delete(_)) => {
                let at = self.ops.len() - 1;
                self.ops.insert(at, TextOp::Insert(text.to_string()));
            }
            _ => self.ops.push(TextOp::Insert(text.to_string())),
        }
    }

    pub fn delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(TextOp::Delete(last)) = self.ops.last_mut() {
            *last += n;
        } else {
            self.ops.push(TextOp::Delete(n));
        }
    }

    fn trim(&mut self) {
        if let Some(TextOp::Retain(_)) = self.ops.last() {
            self.ops.pop();
        }
    }

    /// Apply to `text`.
    pub fn apply(&self, text: &str) -> Result<String, DeltaError> {
        let actual = char_len(text);
        let needed = self.base_len();
        if needed > actual {
            return Err(DeltaError::OutOfRange { needed, actual });
        }

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        for op in &self.ops {
            match op {
                TextOp::Retain(n) => {
                    let at = byte_index(rest, *n);
                    out.push_str(&rest[..at]);
                    rest = &rest[at..];
                }
                TextOp::Insert(s) => out.push_str(s),
                TextOp::Delete(n) => rest = &rest[byte_index(rest, *n)..],
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Rewrite `self` to apply after `other`, both written against the same text.
    ///
    /// Inserts at the same position are ordered by `self_first`.
    pub fn transform(&self, other: &TextDelta, self_first: bool) -> TextDelta {
        let mut out = TextDelta::new();
        let mut a = Ops::new(&self.ops);
        let mut b = Ops::new(&other.ops);

        loop {
            match (a.peek(), b.peek()) {
                (None, _) => break,
                (Some(TextOp::Insert(s)), Some(TextOp::Insert(t))) => {
                    if self_first {
                        out.insert(&s);
                        a.next_whole();
                    } else {
                        out.retain(char_len(&t));
                        b.next_whole();
                    }
                }
                (Some(TextOp::Insert(s)), _) => {
                    out.insert(&s);
                    a.next_whole();
                }
                (_, Some(TextOp::Insert(t))) => {
                    out.retain(char_len(&t));
                    b.next_whole();
                }
                (Some(op), None) => {
                    match op {
                        TextOp::Retain(n) => out.retain(n),
                        TextOp::Delete(n) => out.delete(n),
                        TextOp::Insert(_) => {}
                    }
                    a.next_whole();
                }
                (Some(x), Some(y)) => {
                    let n = x.width().min(y.width());
                    match (&x, &y) {
                        (TextOp::Retain(_), TextOp::Retain(_)) => out.retain(n),
                        (TextOp::Delete(_), TextOp::Retain(_)) => out.delete(n),
                        // Both deleted, or only `other` deleted: nothing left to touch.
                        _ => {}
                    }
                    a.advance(n);
                    b.advance(n);
                }
            }
        }

        out.trim();
        out
    }

    /// Where `offset` ends up after the delta.
    ///
    /// An insert exactly at `offset` pushes it forward only when
    /// `insert_before` is set; deletes covering it clamp it to their start.
    pub fn transform_offset(&self, offset: usize, insert_before: bool) -> usize {
        let mut index = 0;
        let mut result = offset;
        for op in &self.ops {
            if index > offset {
                break;
            }
            match op {
                TextOp::Retain(n) => index += n,
                TextOp::Insert(s) => {
                    if index < offset || (index == offset && insert_before) {
                        result += char_len(s);
                    }
                }
                TextOp::Delete(n) => {
                    if index < offset {
                        result -= (*n).min(offset - index);
                    }
                    index += n;
                }
            }
        }
        result
    }

    /// Split into the part acting on `[0, at)` and the part acting on `[at, ..)`.
    ///
    /// Inserts exactly at `at` stay with the first part. The second part is
    /// rebased to start at zero.
    pub fn split_at(&self, at: usize) -> (TextDelta, TextDelta) {
        let mut before = TextDelta::new();
        let mut after = TextDelta::new();
        let mut index = 0;

        for op in &self.ops {
            match op {
                TextOp::Insert(s) => {
                    if index <= at {
                        before.insert(s);
                    } else {
                        after.insert(s);
                    }
                }
                TextOp::Retain(n) | TextOp::Delete(n) => {
                    let head = (*n).min(at.saturating_sub(index));
                    let tail = n - head;
                    let retain = matches!(op, TextOp::Retain(_));
                    if retain {
                        before.retain(head);
                        after.retain(tail);
                    } else {
                        before.delete(head);
                        after.delete(tail);
                    }
                    index += n;
                }
            }
        }

        before.trim();
        after.trim();
        (before, after)
    }
}

/// Cursor over ops that can consume part of a retain or delete.
struct Ops<'a> {
    ops: &'a [TextOp],
    index: usize,
    consumed: usize,
}

impl<'a> Ops<'a> {
    fn new(ops: &'a [TextOp]) -> Self {
        Self {
            ops,
            index: 0,
            consumed: 0,
        }
    }

    fn peek(&self) -> Option<TextOp> {
        self.ops.get(self.index).map(|op| match op {
            TextOp::Retain(n) => TextOp::Retain(n - self.consumed),
            TextOp::Delete(n) => TextOp::Delete(n - self.consumed),
            TextOp::Insert(s) => TextOp::Insert(s.clone()),
        })
    }

    fn next_whole(&mut self) {
        self.index += 1;
        self.consumed = 0;
    }

    fn advance(&mut self, n: usize) {
        match self.ops.get(self.index) {
            Some(TextOp::Retain(len) | TextOp::Delete(len)) if self.consumed + n < *len => {
                self.consumed += n;
            }
            Some(_) => self.next_whole(),
            None => {}
        }
    }
}

impl TextOp {
    fn width(&self) -> usize {
        match self {
            TextOp::Retain(n) | TextOp::Delete(n) => *n,
            TextOp::Insert(_) => 0,
        }
    }
}
