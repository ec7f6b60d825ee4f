//! Pure patch application.

use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

use super::path::{Path, Target};
use super::{Block, Child, DEFAULT_STYLE, Document, MarkDef, TextBlock, byte_index};
use crate::key::Key;
use crate::patch::{InsertPosition, MergeTarget, Patch, SplitSource};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PatchError {
    #[error("Path does not resolve: {0}")]
    InvalidPath(Path),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type Result<T> = std::result::Result<T, PatchError>;

fn invalid(message: impl Into<String>) -> PatchError {
    PatchError::InvalidOperation(message.into())
}

/// Apply one patch, returning the new document. The input is left untouched.
pub fn apply_patch(document: &Document, patch: &Patch) -> Result<Document> {
    let mut next = document.clone();
    apply_in_place(&mut next, patch)?;
    Ok(next)
}

/// Apply patches in order, all or nothing.
pub fn apply_patches(document: &Document, patches: &[Patch]) -> Result<Document> {
    let mut next = document.clone();
    for patch in patches {
        apply_in_place(&mut next, patch)?;
    }
    Ok(next)
}

fn apply_in_place(doc: &mut Document, patch: &Patch) -> Result<()> {
    let path = patch.path();
    let target = path
        .target()
        .ok_or_else(|| PatchError::InvalidPath(path.clone()))?;

    match patch {
        Patch::Insert {
            position,
            items,
            split,
            ..
        } => insert(doc, path, target, *position, items, split.as_ref()),
        Patch::Set { value, .. } => set(doc, path, target, value),
        Patch::SetIfMissing { value, .. } => set_if_missing(doc, path, target, value),
        Patch::Unset { merge: Some(merge), .. } => merge_blocks(doc, path, target, merge),
        Patch::Unset { merge: None, .. } => unset(doc, path, target),
        Patch::DiffMatchPatch { value, .. } => {
            let Target::ChildField(b, c, field) = target else {
                return Err(invalid(format!("diffMatchPatch needs a text path, got {path}")));
            };
            if field != super::TEXT {
                return Err(invalid(format!("diffMatchPatch on non-text field {field}")));
            }
            let child = child_mut(doc, path, b, c)?;
            let Child::Span(span) = child else {
                return Err(invalid("diffMatchPatch on an inline object"));
            };
            span.text = value
                .apply(&span.text)
                .map_err(|e| invalid(e.to_string()))?;
            Ok(())
        }
    }
}

// ============================================================================
// Resolution
// ============================================================================

fn block_mut<'a>(doc: &'a mut Document, path: &Path, key: &Key) -> Result<&'a mut Block> {
    doc.block_mut(key)
        .ok_or_else(|| PatchError::InvalidPath(path.clone()))
}

fn text_block_mut<'a>(doc: &'a mut Document, path: &Path, key: &Key) -> Result<&'a mut TextBlock> {
    match block_mut(doc, path, key)? {
        Block::Text(block) => Ok(block),
        Block::Object(_) => Err(invalid(format!("{key} is not a text block"))),
    }
}

fn child_mut<'a>(doc: &'a mut Document, path: &Path, block: &Key, child: &Key) -> Result<&'a mut Child> {
    text_block_mut(doc, path, block)?
        .child_mut(child)
        .ok_or_else(|| PatchError::InvalidPath(path.clone()))
}

fn parse<T: TryFrom<Value, Error = serde_json::Error>>(value: &Value) -> Result<T> {
    T::try_from(value.clone()).map_err(|e| invalid(e.to_string()))
}

fn parse_all<T: TryFrom<Value, Error = serde_json::Error>>(items: &[Value]) -> Result<Vec<T>> {
    items.iter().map(parse).collect()
}

// ============================================================================
// Insert
// ============================================================================

fn insert(
    doc: &mut Document,
    path: &Path,
    target: Target<'_>,
    position: InsertPosition,
    items: &[Value],
    split: Option<&SplitSource>,
) -> Result<()> {
    match target {
        Target::Root | Target::Block(_) => {
            let mut blocks: Vec<Block> = parse_all(items)?;
            if let Some(split) = split {
                apply_split(doc, split, &mut blocks)?;
            }
            let anchor = match target {
                Target::Block(key) => Some(key),
                _ => None,
            };
            insert_blocks(doc, path, anchor, position, blocks)
        }
        Target::Child(b, c) => {
            if split.is_some() {
                return Err(invalid("split must be anchored on a block"));
            }
            let children: Vec<Child> = parse_all(items)?;
            let block = text_block_mut(doc, path, b)?;
            let index = block
                .child_index(c)
                .ok_or_else(|| PatchError::InvalidPath(path.clone()))?;
            let replaced = (position == InsertPosition::Replace).then_some(c);
            check_new_keys(
                block.children.iter().map(Child::key),
                children.iter().map(Child::key),
                replaced,
            )?;
            splice(&mut block.children, index, position, children);
            Ok(())
        }
        _ => Err(invalid(format!("insert needs a node path, got {path}"))),
    }
}

fn insert_blocks(
    doc: &mut Document,
    path: &Path,
    anchor: Option<&Key>,
    position: InsertPosition,
    blocks: Vec<Block>,
) -> Result<()> {
    let replaced = anchor.filter(|_| position == InsertPosition::Replace);
    check_new_keys(
        doc.blocks().iter().map(Block::key),
        blocks.iter().map(Block::key),
        replaced,
    )?;

    match anchor {
        None => match position {
            InsertPosition::Before => {
                doc.blocks_mut().splice(0..0, blocks);
            }
            InsertPosition::After => doc.blocks_mut().extend(blocks),
            InsertPosition::Replace => return Err(invalid("cannot replace the document root")),
        },
        Some(key) => {
            let index = doc
                .block_index(key)
                .ok_or_else(|| PatchError::InvalidPath(path.clone()))?;
            splice(doc.blocks_mut(), index, position, blocks);
        }
    }
    Ok(())
}

fn splice<T>(nodes: &mut Vec<T>, index: usize, position: InsertPosition, items: Vec<T>) {
    match position {
        InsertPosition::Before => {
            nodes.splice(index..index, items);
        }
        InsertPosition::After => {
            nodes.splice(index + 1..index + 1, items);
        }
        InsertPosition::Replace => {
            nodes.splice(index..index + 1, items);
        }
    }
}

/// Reject keys that already exist among siblings or repeat within the items.
fn check_new_keys<'a>(
    existing: impl Iterator<Item = &'a Key>,
    new: impl Iterator<Item = &'a Key>,
    replaced: Option<&Key>,
) -> Result<()> {
    let mut seen: HashSet<&Key> = existing.filter(|k| Some(*k) != replaced).collect();
    for key in new {
        if !seen.insert(key) {
            return Err(invalid(format!("duplicate key {key}")));
        }
    }
    Ok(())
}

/// Truncate the split span and move trailing children into the remainder.
///
/// Without the span only the listed children move.
fn apply_split(doc: &mut Document, split: &SplitSource, blocks: &mut [Block]) -> Result<()> {
    let [Block::Text(remainder)] = blocks else {
        return Err(invalid("split inserts exactly one text block"));
    };
    let source = text_block_mut(doc, &Path::block(&split.block), &split.block)?;

    if let Some(Child::Span(span)) = source.child_mut(&split.span) {
        let at = byte_index(&span.text, split.offset);
        span.text.truncate(at);
    }
    match source.child_index(&split.span) {
        Some(index) => remainder.children.extend(source.children.drain(index + 1..)),
        None => {
            for key in &split.moved {
                if let Some(index) = source.child_index(key) {
                    let child = source.children.remove(index);
                    remainder.children.push(child);
                }
            }
        }
    }

    let mut seen = HashSet::new();
    if let Some(dup) = remainder.children.iter().map(Child::key).find(|k| !seen.insert(*k)) {
        return Err(invalid(format!("duplicate key {dup} in split remainder")));
    }
    Ok(())
}

// ============================================================================
// Set / SetIfMissing / Unset
// ============================================================================

fn set(doc: &mut Document, path: &Path, target: Target<'_>, value: &Value) -> Result<()> {
    match target {
        Target::Root => {
            let blocks: Vec<Block> = match value {
                Value::Array(items) => parse_all(items)?,
                _ => return Err(invalid("document value must be an array")),
            };
            let replacement = Document::new(blocks);
            if !replacement.has_unique_keys() {
                return Err(invalid("document value has duplicate keys"));
            }
            *doc = replacement;
        }
        Target::Block(key) => {
            let mut block: Block = parse(value)?;
            block.set_key(key.clone());
            *block_mut(doc, path, key)? = block;
        }
        Target::BlockField(key, field) => {
            reject_reserved(field)?;
            match block_mut(doc, path, key)? {
                Block::Text(block) => set_text_block_field(block, field, value)?,
                Block::Object(block) => {
                    block.fields.insert(field.to_string(), value.clone());
                }
            }
        }
        Target::Child(b, c) => {
            let mut child: Child = parse(value)?;
            child.set_key(c.clone());
            *child_mut(doc, path, b, c)? = child;
        }
        Target::ChildField(b, c, field) => {
            reject_reserved(field)?;
            match child_mut(doc, path, b, c)? {
                Child::Span(span) => match field {
                    "text" => {
                        span.text = value
                            .as_str()
                            .ok_or_else(|| invalid("span text must be a string"))?
                            .to_string();
                    }
                    "marks" => span.marks = from_value(value)?,
                    other => return Err(invalid(format!("spans have no field {other}"))),
                },
                Child::Object(object) => {
                    object.fields.insert(field.to_string(), value.clone());
                }
            }
        }
    }
    Ok(())
}

fn set_text_block_field(block: &mut TextBlock, field: &str, value: &Value) -> Result<()> {
    match field {
        "style" => {
            block.style = value
                .as_str()
                .ok_or_else(|| invalid("style must be a string"))?
                .to_string();
        }
        "markDefs" => {
            let defs: Vec<MarkDef> = from_value(value)?;
            block.mark_defs = defs;
        }
        "children" => {
            let children: Vec<Child> = from_value(value)?;
            let mut seen = HashSet::new();
            if !children.iter().all(|c| seen.insert(c.key())) {
                return Err(invalid("children have duplicate keys"));
            }
            block.children = children;
        }
        other => {
            block.extra.insert(other.to_string(), value.clone());
        }
    }
    Ok(())
}

fn set_if_missing(doc: &mut Document, path: &Path, target: Target<'_>, value: &Value) -> Result<()> {
    match target {
        Target::Root => Ok(()),
        Target::Block(key) => block_mut(doc, path, key).map(|_| ()),
        Target::Child(b, c) => child_mut(doc, path, b, c).map(|_| ()),
        Target::BlockField(key, field) => {
            reject_reserved(field)?;
            match block_mut(doc, path, key)? {
                Block::Text(block) => {
                    if !matches!(field, "style" | "markDefs" | "children") {
                        block
                            .extra
                            .entry(field.to_string())
                            .or_insert_with(|| value.clone());
                    }
                }
                Block::Object(block) => {
                    block
                        .fields
                        .entry(field.to_string())
                        .or_insert_with(|| value.clone());
                }
            }
            Ok(())
        }
        Target::ChildField(b, c, field) => {
            reject_reserved(field)?;
            match child_mut(doc, path, b, c)? {
                Child::Span(_) if matches!(field, "text" | "marks") => Ok(()),
                Child::Span(_) => Err(invalid(format!("spans have no field {field}"))),
                Child::Object(object) => {
                    object
                        .fields
                        .entry(field.to_string())
                        .or_insert_with(|| value.clone());
                    Ok(())
                }
            }
        }
    }
}

fn unset(doc: &mut Document, path: &Path, target: Target<'_>) -> Result<()> {
    match target {
        Target::Root => doc.blocks_mut().clear(),
        Target::Block(key) => {
            let index = doc
                .block_index(key)
                .ok_or_else(|| PatchError::InvalidPath(path.clone()))?;
            doc.blocks_mut().remove(index);
        }
        Target::BlockField(key, field) => {
            reject_reserved(field)?;
            match block_mut(doc, path, key)? {
                Block::Text(block) => match field {
                    "style" => block.style = DEFAULT_STYLE.to_string(),
                    "markDefs" => block.mark_defs.clear(),
                    "children" => block.children.clear(),
                    other => {
                        block.extra.remove(other);
                    }
                },
                Block::Object(block) => {
                    block.fields.remove(field);
                }
            }
        }
        Target::Child(b, c) => {
            let block = text_block_mut(doc, path, b)?;
            let index = block
                .child_index(c)
                .ok_or_else(|| PatchError::InvalidPath(path.clone()))?;
            block.children.remove(index);
        }
        Target::ChildField(b, c, field) => {
            reject_reserved(field)?;
            match child_mut(doc, path, b, c)? {
                Child::Span(span) => match field {
                    "text" => span.text.clear(),
                    "marks" => span.marks.clear(),
                    _ => {}
                },
                Child::Object(object) => {
                    object.fields.remove(field);
                }
            }
        }
    }
    Ok(())
}

/// Move the children of the addressed block to the end of `merge.into`, then
/// remove it.
fn merge_blocks(doc: &mut Document, path: &Path, target: Target<'_>, merge: &MergeTarget) -> Result<()> {
    let Target::Block(from) = target else {
        return Err(invalid(format!("merge needs a block path, got {path}")));
    };
    if *from == merge.into {
        return Err(invalid(format!("cannot merge {from} into itself")));
    }

    let mut children = std::mem::take(&mut text_block_mut(doc, path, from)?.children);
    for child in &mut children {
        let key = merge.key_of(child.key()).clone();
        child.set_key(key);
    }
    let into = text_block_mut(doc, &Path::block(&merge.into), &merge.into)?;
    check_new_keys(
        into.children.iter().map(Child::key),
        children.iter().map(Child::key),
        None,
    )?;
    into.children.extend(children);
    unset(doc, path, target)
}

fn reject_reserved(field: &str) -> Result<()> {
    if field == "_key" || field == "_type" {
        return Err(invalid(format!("{field} cannot be patched directly")));
    }
    Ok(())
}

fn from_value<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T> {
    serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ObjectBlock, Span};
    use crate::patch::TextDelta;
    use serde_json::json;

    fn k(s: &str) -> Key {
        Key::from(s)
    }

    fn doc() -> Document {
        Document::new(vec![
            TextBlock::new(
                "b1",
                vec![Span::new("s1", "Hello world").into(), Span::new("s2", "!").into()],
            )
            .into(),
            ObjectBlock::new("img", "image").into(),
        ])
    }

    fn text(doc: &Document, b: &str, s: &str) -> String {
        doc.span(&k(b), &k(s)).unwrap().text.clone()
    }

    // ========================================================================
    // Text
    // ========================================================================

    #[test]
    fn test_diff_match_patch_edits_span() {
        let before = doc();
        let patch = Patch::diff_match_patch(Path::text(&k("b1"), &k("s1")), TextDelta::insert_at(5, ","));
        let after = apply_patch(&before, &patch).unwrap();
        assert_eq!(text(&after, "b1", "s1"), "Hello, world");
        // Input untouched
        assert_eq!(text(&before, "b1", "s1"), "Hello world");
    }

    #[test]
    fn test_diff_match_patch_out_of_range_is_invalid_operation() {
        let patch = Patch::diff_match_patch(Path::text(&k("b1"), &k("s2")), TextDelta::delete_at(0, 5));
        assert!(matches!(
            apply_patch(&doc(), &patch),
            Err(PatchError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_missing_span_is_invalid_path() {
        let patch = Patch::unset(Path::child(&k("b1"), &k("nope")));
        assert!(matches!(
            apply_patch(&doc(), &patch),
            Err(PatchError::InvalidPath(_))
        ));
    }

    // ========================================================================
    // Insert
    // ========================================================================

    #[test]
    fn test_insert_blocks_around_anchor() {
        let before = Patch::insert_blocks(
            Path::block(&k("img")),
            InsertPosition::Before,
            vec![TextBlock::new("b0", vec![]).into()],
        );
        let after = apply_patch(&doc(), &before).unwrap();
        let keys: Vec<_> = after.blocks().iter().map(|b| b.key().as_str()).collect();
        assert_eq!(keys, ["b1", "b0", "img"]);
    }

    #[test]
    fn test_insert_at_root_appends_and_prepends() {
        let append = Patch::insert_blocks(
            Path::root(),
            InsertPosition::After,
            vec![TextBlock::new("z", vec![]).into()],
        );
        let prepend = Patch::insert_blocks(
            Path::root(),
            InsertPosition::Before,
            vec![TextBlock::new("a", vec![]).into()],
        );
        let result = apply_patches(&doc(), &[append, prepend]).unwrap();
        let keys: Vec<_> = result.blocks().iter().map(|b| b.key().as_str()).collect();
        assert_eq!(keys, ["a", "b1", "img", "z"]);
    }

    #[test]
    fn test_insert_duplicate_key_rejected() {
        let patch = Patch::insert_children(
            Path::child(&k("b1"), &k("s1")),
            InsertPosition::After,
            vec![Span::new("s2", "dup").into()],
        );
        assert!(matches!(
            apply_patch(&doc(), &patch),
            Err(PatchError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_replace_child() {
        let patch = Patch::insert_children(
            Path::child(&k("b1"), &k("s2")),
            InsertPosition::Replace,
            vec![Span::new("s2", "?").into()],
        );
        let after = apply_patch(&doc(), &patch).unwrap();
        assert_eq!(text(&after, "b1", "s2"), "?");
    }

    #[test]
    fn test_split_truncates_and_moves() {
        let patch = Patch::split(
            SplitSource {
                block: k("b1"),
                span: k("s1"),
                offset: 5,
                moved: vec![k("s2")],
            },
            TextBlock::new("b2", vec![Span::new("t", " world").into()]).into(),
        );
        let after = apply_patch(&doc(), &patch).unwrap();
        let b1 = after.text_block(&k("b1")).unwrap();
        let b2 = after.text_block(&k("b2")).unwrap();
        assert_eq!(b1.plain_text(), "Hello");
        assert_eq!(b2.plain_text(), " world!");
        assert_eq!(after.block_index(&k("b2")), Some(1));
    }

    #[test]
    fn test_split_moves_children_added_after_the_span() {
        let patch = Patch::split(
            SplitSource {
                block: k("b1"),
                span: k("s1"),
                offset: 5,
                moved: vec![],
            },
            TextBlock::new("b2", vec![Span::new("t", " world").into()]).into(),
        );
        let after = apply_patch(&doc(), &patch).unwrap();
        let b2 = after.text_block(&k("b2")).unwrap();
        assert_eq!(b2.plain_text(), " world!");
        assert!(b2.span(&k("s2")).is_some());
    }

    #[test]
    fn test_split_of_missing_block_is_invalid_path() {
        let patch = Patch::split(
            SplitSource {
                block: k("gone"),
                span: k("s1"),
                offset: 0,
                moved: vec![],
            },
            TextBlock::new("b2", vec![]).into(),
        );
        assert!(matches!(
            apply_patch(&doc(), &patch),
            Err(PatchError::InvalidPath(_))
        ));
    }

    // ========================================================================
    // Set / SetIfMissing / Unset
    // ========================================================================

    #[test]
    fn test_set_style_and_object_field() {
        let patches = [
            Patch::set(Path::block_field(&k("b1"), "style"), "h2"),
            Patch::set(Path::block_field(&k("img"), "alt"), "A cat"),
        ];
        let after = apply_patches(&doc(), &patches).unwrap();
        assert_eq!(after.text_block(&k("b1")).unwrap().style, "h2");
        let Block::Object(img) = after.block(&k("img")).unwrap() else {
            panic!("expected object block");
        };
        assert_eq!(img.fields["alt"], "A cat");
    }

    #[test]
    fn test_set_keeps_addressed_key() {
        let patch = Patch::set(
            Path::block(&k("img")),
            json!({"_key": "other", "_type": "image", "src": "b.png"}),
        );
        let after = apply_patch(&doc(), &patch).unwrap();
        assert!(after.block(&k("img")).is_some());
        assert!(after.block(&k("other")).is_none());
    }

    #[test]
    fn test_set_if_missing_only_fills_gaps() {
        let patches = [
            Patch::SetIfMissing {
                path: Path::block_field(&k("img"), "alt"),
                value: json!("first"),
            },
            Patch::SetIfMissing {
                path: Path::block_field(&k("img"), "alt"),
                value: json!("second"),
            },
        ];
        let after = apply_patches(&doc(), &patches).unwrap();
        let Block::Object(img) = after.block(&k("img")).unwrap() else {
            panic!("expected object block");
        };
        assert_eq!(img.fields["alt"], "first");
    }

    #[test]
    fn test_unset_block_and_fields() {
        let patches = [
            Patch::unset(Path::block(&k("img"))),
            Patch::unset(Path::child_field(&k("b1"), &k("s1"), "text")),
        ];
        let after = apply_patches(&doc(), &patches).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(text(&after, "b1", "s1"), "");
    }

    #[test]
    fn test_merge_moves_children_and_removes_block() {
        let base = Document::new(vec![
            TextBlock::new("b0", vec![Span::new("s1", "One").into()]).into(),
            TextBlock::new("b1", vec![Span::new("s1", "Two").into(), Span::new("s2", "!").into()]).into(),
        ]);
        let patch = Patch::merge(&k("b1"), &k("b0"), vec![k("s1"), k("s2")], [(k("s1"), k("n"))].into());
        let after = apply_patch(&base, &patch).unwrap();
        assert_eq!(after.len(), 1);
        let merged = after.text_block(&k("b0")).unwrap();
        let keys: Vec<_> = merged.children.iter().map(|c| c.key().as_str()).collect();
        assert_eq!(keys, ["s1", "n", "s2"]);
        assert_eq!(merged.plain_text(), "OneTwo!");
    }

    #[test]
    fn test_merge_with_colliding_key_rejected() {
        let base = Document::new(vec![
            TextBlock::new("b0", vec![Span::new("s1", "One").into()]).into(),
            TextBlock::new("b1", vec![Span::new("s1", "Two").into()]).into(),
        ]);
        let patch = Patch::merge(&k("b1"), &k("b0"), vec![k("s1")], Default::default());
        assert!(matches!(
            apply_patch(&base, &patch),
            Err(PatchError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_merge_into_object_rejected() {
        let patch = Patch::merge(&k("b1"), &k("img"), vec![], Default::default());
        assert!(apply_patch(&doc(), &patch).is_err());
    }

    #[test]
    fn test_batch_is_atomic() {
        let before = doc();
        let patches = [
            Patch::unset(Path::block(&k("img"))),
            Patch::unset(Path::block(&k("img"))),
        ];
        assert!(apply_patches(&before, &patches).is_err());
        assert_eq!(before.len(), 2);
    }

    #[test]
    fn test_reserved_fields_rejected() {
        let patch = Patch::set(Path::block_field(&k("b1"), "_key"), "x");
        assert!(matches!(
            apply_patch(&doc(), &patch),
            Err(PatchError::InvalidOperation(_))
        ));
    }
}
