//! Cursor positions and how they move under patches.

use serde::{Deserialize, Serialize};

use crate::document::{Block, Document, Path, Target};
use crate::patch::{Patch, item_key};

/// A position inside a span (or on an object) in code points.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub path: Path,
    pub offset: usize,
}

impl Point {
    pub fn new(path: Path, offset: usize) -> Self {
        Self { path, offset }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: Point,
    pub focus: Point,
}

impl Selection {
    pub fn new(anchor: Point, focus: Point) -> Self {
        Self { anchor, focus }
    }

    /// A collapsed selection at `point`.
    pub fn caret(point: Point) -> Self {
        Self {
            anchor: point.clone(),
            focus: point,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }

    /// Clamp offsets to the nodes in `document`.
    ///
    /// Returns `None` when either point no longer resolves.
    pub fn normalize(&self, document: &Document) -> Option<Selection> {
        Some(Selection {
            anchor: clamp(&self.anchor, document)?,
            focus: clamp(&self.focus, document)?,
        })
    }
}

/// What a patch did to a selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionUpdate {
    Unchanged,
    Moved(Selection),
    /// The node under the focus went away.
    Removed,
}

/// Carry `selection` across one applied patch.
pub fn rebase_selection(selection: &Selection, patch: &Patch) -> SelectionUpdate {
    let (Some(anchor), Some(focus)) = (
        rebase_point(&selection.anchor, patch),
        rebase_point(&selection.focus, patch),
    ) else {
        return SelectionUpdate::Removed;
    };
    let moved = Selection { anchor, focus };
    if moved == *selection {
        SelectionUpdate::Unchanged
    } else {
        SelectionUpdate::Moved(moved)
    }
}

/// Carry one point across a patch. `None` means its node was removed.
pub fn rebase_point(point: &Point, patch: &Patch) -> Option<Point> {
    let path = &point.path;
    if patch.removes_anchor() && path.starts_with(patch.path()) {
        return None;
    }

    match patch {
        Patch::Unset {
            path: removed,
            merge: Some(merge),
        } if path.starts_with(removed) => path
            .child_key()
            .map(|child| Point::new(Path::child(&merge.into, merge.key_of(child)), point.offset)),
        Patch::DiffMatchPatch { path: text, value } if text.node_path() == *path => Some(Point {
            path: path.clone(),
            offset: value.transform_offset(point.offset, false),
        }),
        Patch::Set {
            path: target,
            value,
        } if target.node_path() == *path && matches!(target.target(), Some(Target::ChildField(..))) => {
            let len = value.as_str().map_or(0, crate::document::char_len);
            Some(Point {
                path: path.clone(),
                offset: point.offset.min(len),
            })
        }
        Patch::Insert {
            split: Some(split),
            items,
            ..
        } if path.block_key() == Some(&split.block) => {
            let remainder = items.first().and_then(item_key);
            let tail = items
                .first()
                .and_then(|block| block.get(crate::document::CHILDREN))
                .and_then(|children| children.as_array())
                .and_then(|children| children.first())
                .and_then(item_key);
            let child = path.child_key();
            match (remainder, child) {
                (Some(remainder), Some(child)) if *child == split.span && point.offset > split.offset => {
                    match tail {
                        Some(tail) => Some(Point::new(
                            Path::child(&remainder, &tail),
                            point.offset - split.offset,
                        )),
                        None => Some(point.clone()),
                    }
                }
                (Some(remainder), Some(child)) if split.moved.contains(child) => Some(Point {
                    path: path.with_block(&remainder),
                    offset: point.offset,
                }),
                _ => Some(point.clone()),
            }
        }
        _ => Some(point.clone()),
    }
}

/// Where a caret goes when the node under it disappears.
///
/// Prefers the end of the nearest preceding content, then the start of the
/// following content. `before` is the document the lost point lived in.
pub fn fallback(before: &Document, after: &Document, lost: &Point) -> Option<Selection> {
    let block = lost.path.block_key()?;

    if let (Some(Block::Text(old)), Some(Block::Text(now))) = (before.block(block), after.block(block)) {
        let index = lost
            .path
            .child_key()
            .and_then(|child| old.child_index(child))
            .unwrap_or(0);
        let preceding = old.children[..index.min(old.children.len())]
            .iter()
            .rev()
            .find_map(|child| now.child(child.key()));
        if let Some(child) = preceding {
            return Some(Selection::caret(Point::new(
                Path::child(block, child.key()),
                child.text_len(),
            )));
        }
        if let Some(first) = now.children.first() {
            return Some(Selection::caret(Point::new(Path::child(block, first.key()), 0)));
        }
    }

    let index = before.block_index(block);
    let earlier = index.map_or(&[][..], |i| &before.blocks()[..i]);
    for candidate in earlier.iter().rev() {
        if let Some(point) = after.block(candidate.key()).and_then(end_of) {
            return Some(Selection::caret(point));
        }
    }
    let later = index.map_or(before.blocks(), |i| &before.blocks()[i + 1..]);
    for candidate in later {
        if let Some(point) = after.block(candidate.key()).and_then(start_of) {
            return Some(Selection::caret(point));
        }
    }
    after.blocks().first().and_then(start_of).map(Selection::caret)
}

fn end_of(block: &Block) -> Option<Point> {
    match block {
        Block::Text(text) => {
            let last = text.children.last()?;
            Some(Point::new(Path::child(&text.key, last.key()), last.text_len()))
        }
        Block::Object(object) => Some(Point::new(Path::block(&object.key), 0)),
    }
}

fn start_of(block: &Block) -> Option<Point> {
    match block {
        Block::Text(text) => {
            let first = text.children.first()?;
            Some(Point::new(Path::child(&text.key, first.key()), 0))
        }
        Block::Object(object) => Some(Point::new(Path::block(&object.key), 0)),
    }
}

fn clamp(point: &Point, document: &Document) -> Option<Point> {
    match point.path.target()? {
        Target::Block(block) => {
            document.block(block)?;
            Some(Point::new(point.path.clone(), 0))
        }
        Target::Child(block, child) | Target::ChildField(block, child, _) => {
            let child = document.text_block(block)?.child(child)?;
            Some(Point::new(
                Path::child(block, child.key()),
                point.offset.min(child.text_len()),
            ))
        }
        _ => None,
    }
}
