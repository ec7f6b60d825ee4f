//! Operational transform over patches.
//!
//! [`rebase`] rewrites a remote patch so it applies after a concurrent local
//! one. Both sides of an exchange run the same rules with mirrored priority,
//! so `apply(apply(d, l), rebase(r, l, p)) == apply(apply(d, r), rebase(l, r, !p))`.
//!
//! Priority decides positional ties: concurrent inserts at the same spot,
//! competing `set`s of one field, splits at the same offset.
//!
//! Splits and merges move children between blocks. Anything addressing a
//! moved child follows it, which is why both carry the keys they move.

use serde_json::Value;

use crate::document::{CHILDREN, Path, Target, char_len, char_slice};
use crate::key::Key;
use crate::patch::{InsertPosition, MergeTarget, Patch, SplitSource, TextDelta, item_key};

/// Rewrite `remote` to apply after `local`.
///
/// Returns an empty list when `remote` no longer has anything to act on and
/// several patches when its effect now spans more than one node.
pub fn rebase(remote: &Patch, local: &Patch, remote_first: bool) -> Vec<Patch> {
    match local {
        Patch::Insert {
            path,
            split: Some(split),
            items,
            ..
        } => over_split(remote, path, split, items, remote_first),
        Patch::Insert { path, position, .. } => {
            over_insert(remote, path, *position, &local.inserted_paths(), remote_first)
        }
        Patch::Unset {
            path,
            merge: Some(merge),
        } => over_merge(remote, path, merge),
        Patch::Unset { path, merge: None } => over_unset(remote, path),
        Patch::Set { path, value } => over_set(remote, path, value, remote_first),
        Patch::SetIfMissing { path, .. } => over_set_if_missing(remote, path, remote_first),
        Patch::DiffMatchPatch { path, value } => over_text(remote, path, value, remote_first),
    }
}

/// Transform two concurrent patch sequences against each other.
///
/// Returns `(a', b')` where `a'` applies after `b` and `b'` after `a`.
pub fn transform_lists(a: &[Patch], b: &[Patch], a_first: bool) -> (Vec<Patch>, Vec<Patch>) {
    if a.is_empty() || b.is_empty() {
        return (a.to_vec(), b.to_vec());
    }
    if let ([x], [y]) = (a, b) {
        return (rebase(x, y, a_first), rebase(y, x, !a_first));
    }

    if a.len() > 1 {
        let (head, rest) = a.split_at(1);
        let (head, b) = transform_lists(head, b, a_first);
        let (rest, b) = transform_lists(rest, &b, a_first);
        ([head, rest].concat(), b)
    } else {
        let (head, rest) = b.split_at(1);
        let (a, head) = transform_lists(a, head, a_first);
        let (a, rest) = transform_lists(&a, rest, a_first);
        (a, [head, rest].concat())
    }
}

/// Rebase a remote batch through the local patches the sender has not seen.
///
/// `pending` holds one group per original local patch. Returns the remote
/// patches to apply and the pending groups rewritten to follow them.
pub fn rebase_through(
    remote: &[Patch],
    pending: &[Vec<Patch>],
    remote_first: bool,
) -> (Vec<Patch>, Vec<Vec<Patch>>) {
    let mut incoming = remote.to_vec();
    let mut rebased = Vec::with_capacity(pending.len());
    for group in pending {
        let (next, group) = transform_lists(&incoming, group, remote_first);
        incoming = next;
        rebased.push(group);
    }
    (incoming, rebased)
}

// ============================================================================
// Rules, keyed by the local patch
// ============================================================================

fn over_unset(remote: &Patch, removed: &Path) -> Vec<Patch> {
    if within(remote, removed) {
        return Vec::new();
    }
    if let Some(merge) = merge_of(remote) {
        // Joining onto a removed block removes the joined one too.
        if *removed == Path::block(&merge.into) {
            return vec![Patch::unset(remote.path().clone())];
        }
        if let Some(child) = merged_child(removed, remote.path()) {
            return vec![edit_merge(remote, |merge| merge.children.retain(|k| *k != child))];
        }
    }
    if let Some(split) = split_of(remote) {
        if *removed == Path::block_field(&split.block, CHILDREN) {
            return Vec::new();
        }
        if *removed == Path::child(&split.block, &split.span) {
            return vec![edit_split(remote, |_, _, items| drop_tail(items))];
        }
        if *removed == Path::text(&split.block, &split.span) {
            return vec![edit_split(remote, |_, split, items| {
                split.offset = 0;
                set_tail_text(items, String::new());
            })];
        }
        if let Some(moved) = moved_child(removed, split) {
            return vec![edit_split(remote, |_, split, _| {
                split.moved.retain(|k| *k != moved);
            })];
        }
    }
    vec![remote.clone()]
}

fn over_set(remote: &Patch, target: &Path, value: &Value, remote_first: bool) -> Vec<Patch> {
    let same = remote.path() == target;
    match remote {
        Patch::Unset { .. } if same => return vec![remote.clone()],
        Patch::Set { .. } if same => {
            return if remote_first {
                vec![remote.clone()]
            } else {
                Vec::new()
            };
        }
        Patch::SetIfMissing { .. } | Patch::DiffMatchPatch { .. } if same => return Vec::new(),
        Patch::Insert { split: None, .. } if same => return vec![remote.clone()],
        _ => {}
    }
    if remote.path().starts_with(target) && !same {
        return Vec::new();
    }

    if let Some(split) = split_of(remote) {
        if Path::block(&split.block).starts_with(target)
            || *target == Path::block_field(&split.block, CHILDREN)
        {
            return Vec::new();
        }
        let text = if *target == Path::text(&split.block, &split.span) {
            Some(value.as_str())
        } else if *target == Path::child(&split.block, &split.span) {
            Some(value.get("text").and_then(Value::as_str))
        } else {
            None
        };
        if let Some(text) = text {
            let offset = text.map_or(0, char_len);
            return vec![edit_split(remote, |_, split, _| split.offset = offset)];
        }
    }
    vec![remote.clone()]
}

fn over_set_if_missing(remote: &Patch, target: &Path, remote_first: bool) -> Vec<Patch> {
    match remote {
        Patch::SetIfMissing { path, value } if path == target => {
            if remote_first {
                vec![Patch::Set {
                    path: path.clone(),
                    value: value.clone(),
                }]
            } else {
                Vec::new()
            }
        }
        _ => vec![remote.clone()],
    }
}

fn over_text(remote: &Patch, target: &Path, delta: &TextDelta, remote_first: bool) -> Vec<Patch> {
    if let Patch::DiffMatchPatch { path, value } = remote {
        if path == target {
            return vec![Patch::diff_match_patch(
                path.clone(),
                value.transform(delta, remote_first),
            )];
        }
    }

    if let Some(split) = split_of(remote) {
        if *target == Path::text(&split.block, &split.span) {
            let (before, after) = delta.split_at(split.offset);
            let offset = (split.offset as isize + before.len_change()).max(0) as usize;
            return vec![edit_split(remote, |_, split, items| {
                split.offset = offset;
                if let Some(text) = tail_text(items) {
                    if let Ok(text) = after.apply(&text) {
                        set_tail_text(items, text);
                    }
                }
            })];
        }
    }
    vec![remote.clone()]
}

fn over_insert(
    remote: &Patch,
    anchor: &Path,
    position: InsertPosition,
    added: &[Path],
    remote_first: bool,
) -> Vec<Patch> {
    if position == InsertPosition::Replace {
        return over_replace(remote, anchor, added, remote_first);
    }

    let same = remote.path() == anchor;
    match remote {
        Patch::Unset { merge: None, .. }
        | Patch::Insert {
            position: InsertPosition::Replace,
            ..
        } if same && !anchor.is_root() => {
            // Removing the anchor also removes what was inserted next to it.
            let mut out = vec![remote.clone()];
            out.extend(added.iter().cloned().map(Patch::unset));
            return out;
        }
        Patch::Insert {
            position: remote_position,
            ..
        } if same && *remote_position == position => {
            return vec![order_tie(remote, anchor, position, added, remote_first)];
        }
        _ => {}
    }

    if let Some(split) = split_of(remote) {
        if let Some(neighbour) = moved_child(anchor, split) {
            let keys = keys_of(added);
            return vec![edit_split(remote, |_, split, _| {
                insert_keys(&mut split.moved, &neighbour, position, keys)
            })];
        }
        // Right after the split span is the front of the remainder.
        if *anchor == Path::child(&split.block, &split.span) && position == InsertPosition::After {
            let keys = keys_of(added);
            return vec![edit_split(remote, |_, split, _| {
                split.moved.splice(0..0, keys);
            })];
        }
    }
    if merge_of(remote).is_some() {
        if let Some(neighbour) = merged_child(anchor, remote.path()) {
            let keys = keys_of(added);
            return vec![edit_merge(remote, |merge| {
                insert_keys(&mut merge.children, &neighbour, position, keys)
            })];
        }
    }
    vec![remote.clone()]
}

fn over_replace(remote: &Patch, anchor: &Path, added: &[Path], remote_first: bool) -> Vec<Patch> {
    let same = remote.path() == anchor;
    match remote {
        Patch::Insert {
            position: InsertPosition::Replace,
            items,
            ..
        } if same => {
            let Some((first, rest)) = added.split_first() else {
                return Vec::new();
            };
            if !remote_first {
                return Vec::new();
            }
            let mut out = vec![Patch::Insert {
                path: first.clone(),
                position: InsertPosition::Replace,
                items: items.clone(),
                split: None,
            }];
            out.extend(rest.iter().cloned().map(Patch::unset));
            return out;
        }
        // An unset beats the replacement.
        Patch::Unset { merge: None, .. } if same => return added.iter().cloned().map(Patch::unset).collect(),
        _ => {}
    }
    if within(remote, anchor) {
        return Vec::new();
    }
    if merge_of(remote).is_some() {
        if let Some(replaced) = merged_child(anchor, remote.path()) {
            let keys = keys_of(added);
            return vec![edit_merge(remote, |merge| {
                if let Some(at) = merge.children.iter().position(|k| *k == replaced) {
                    merge.children.splice(at..at + 1, keys);
                }
            })];
        }
    }

    if let Some(split) = split_of(remote) {
        if *anchor == Path::child(&split.block, &split.span) {
            return vec![edit_split(remote, |_, _, items| drop_tail(items))];
        }
        if let Some(replaced) = moved_child(anchor, split) {
            let keys = keys_of(added);
            return vec![edit_split(remote, |_, split, _| {
                if let Some(at) = split.moved.iter().position(|k| *k == replaced) {
                    split.moved.splice(at..at + 1, keys);
                }
            })];
        }
    }
    vec![remote.clone()]
}

fn over_split(
    remote: &Patch,
    anchor: &Path,
    split: &SplitSource,
    items: &[Value],
    remote_first: bool,
) -> Vec<Patch> {
    let Some(remainder) = items.first().and_then(item_key) else {
        return vec![remote.clone()];
    };
    let tail = tail_key(items);
    let source_block = Path::block(&split.block);
    let source_span = Path::child(&split.block, &split.span);
    let source_text = Path::text(&split.block, &split.span);
    let children = Path::block_field(&split.block, CHILDREN);

    let removes_source = match remote {
        Patch::Unset { path, merge: None }
        | Patch::Insert {
            path,
            position: InsertPosition::Replace,
            ..
        } => *path == source_block || path == anchor || *path == children,
        Patch::Set { path, .. } => *path == source_block || *path == children,
        _ => false,
    };
    if removes_source {
        return vec![remote.clone(), Patch::unset(Path::block(&remainder))];
    }

    // Anything addressing a moved child follows it into the remainder.
    if let Some(child) = remote.path().child_key() {
        if remote.path().block_key() == Some(&split.block) && split.moved.contains(child) {
            let mut moved = remote.clone();
            *moved.path_mut() = remote.path().with_block(&remainder);
            return vec![moved];
        }
    }

    if let Some(merge) = merge_of(remote) {
        if merge.into == split.block {
            // The split block ends in the remainder now.
            return vec![edit_merge(remote, |merge| merge.into = remainder.clone())];
        }
        if *remote.path() == source_block {
            return vec![edit_merge(remote, |merge| {
                merge.children.retain(|k| !split.moved.contains(k))
            })];
        }
        return vec![remote.clone()];
    }

    match remote {
        Patch::DiffMatchPatch { path, value } if *path == source_text => {
            if value.is_noop() {
                return vec![remote.clone()];
            }
            let (before, after) = value.split_at(split.offset);
            let mut out = Vec::new();
            if !before.is_noop() {
                out.push(Patch::diff_match_patch(path.clone(), before));
            }
            if let Some(tail) = &tail {
                if !after.is_noop() {
                    out.push(Patch::diff_match_patch(Path::text(&remainder, tail), after));
                }
            }
            out
        }
        Patch::Unset { path, .. }
        | Patch::Insert {
            path,
            position: InsertPosition::Replace,
            ..
        } if *path == source_span => {
            let mut out = vec![remote.clone()];
            if let Some(tail) = &tail {
                out.push(Patch::unset(Path::child(&remainder, tail)));
            }
            out
        }
        Patch::Unset { path, .. } if *path == source_text => {
            let mut out = vec![remote.clone()];
            if let Some(tail) = &tail {
                out.push(Patch::unset(Path::text(&remainder, tail)));
            }
            out
        }
        Patch::Insert {
            split: Some(other), ..
        } if other.block == split.block => {
            vec![split_over_split(remote, other, split, &remainder, tail.as_ref(), remote_first)]
        }
        Patch::Insert {
            path,
            position: InsertPosition::After,
            ..
        } if path == anchor => {
            if remote_first {
                vec![remote.clone()]
            } else {
                vec![reanchor(remote, Path::block(&remainder), InsertPosition::After)]
            }
        }
        // Right after the split span is the front of the remainder.
        Patch::Insert {
            path,
            position: InsertPosition::After,
            split: None,
            ..
        } if *path == source_span => match &tail {
            Some(tail) => vec![reanchor(remote, Path::child(&remainder, tail), InsertPosition::After)],
            None => vec![remote.clone()],
        },
        _ => vec![remote.clone()],
    }
}

/// Rules for a local merge of the block at `from` into `merge.into`.
fn over_merge(remote: &Patch, from: &Path, merge: &MergeTarget) -> Vec<Patch> {
    let Some(from_key) = from.block_key() else {
        return vec![remote.clone()];
    };
    let merged = || merge.children.iter().map(|k| merge.key_of(k).clone());

    if let Some(split) = split_of(remote) {
        if split.block == *from_key {
            // Splitting the merged block now splits what it was merged into.
            return vec![edit_split(remote, |path, split, _| {
                *path = Path::block(&merge.into);
                split.block = merge.into.clone();
                split.span = merge.key_of(&split.span).clone();
                for key in &mut split.moved {
                    *key = merge.key_of(key).clone();
                }
            })];
        }
        if split.block == merge.into {
            return vec![edit_split(remote, |_, split, _| split.moved.extend(merged()))];
        }
        return vec![remote.clone()];
    }

    if let Some(theirs) = merge_of(remote) {
        let theirs_from = remote.path();
        if theirs_from == from {
            return Vec::new();
        }
        if theirs.into == *from_key {
            return vec![edit_merge(remote, |theirs| theirs.into = merge.into.clone())];
        }
        if *theirs_from == Path::block(&merge.into) {
            return vec![edit_merge(remote, |theirs| theirs.children.extend(merged()))];
        }
        return vec![remote.clone()];
    }

    if !remote.path().starts_with(from) {
        return vec![remote.clone()];
    }
    if let Some(path) = merged_path(remote.path(), merge) {
        let mut moved = remote.clone();
        *moved.path_mut() = path;
        return vec![moved];
    }
    match remote {
        // Blocks placed around the merged one go after its target.
        Patch::Insert { path, .. } if path == from => {
            vec![reanchor(remote, Path::block(&merge.into), InsertPosition::After)]
        }
        _ => Vec::new(),
    }
}

/// Order two splits of the same block by where they cut it.
fn split_over_split(
    remote: &Patch,
    theirs: &SplitSource,
    ours: &SplitSource,
    remainder: &Key,
    tail: Option<&Key>,
    remote_first: bool,
) -> Patch {
    let later = if theirs.span == ours.span {
        theirs.offset > ours.offset || (theirs.offset == ours.offset && !remote_first)
    } else {
        ours.moved.contains(&theirs.span)
    };

    if later {
        // Their cut falls inside our remainder.
        edit_split(remote, |path, split, _| {
            *path = Path::block(remainder);
            split.block = remainder.clone();
            if split.span == ours.span {
                if let Some(tail) = tail {
                    split.span = tail.clone();
                }
                split.offset = split.offset.saturating_sub(ours.offset);
            }
        })
    } else {
        // Their remainder stops where ours begins.
        edit_split(remote, |_, split, items| {
            split.moved.retain(|k| !ours.moved.contains(k));
            if split.span == ours.span {
                let keep = ours.offset.saturating_sub(split.offset);
                if let Some(text) = tail_text(items) {
                    set_tail_text(items, char_slice(&text, 0, keep).to_string());
                }
            }
        })
    }
}

/// Place `remote` relative to concurrently inserted items at the same spot.
///
/// The side with priority ends up first in document order.
fn order_tie(
    remote: &Patch,
    anchor: &Path,
    position: InsertPosition,
    added: &[Path],
    remote_first: bool,
) -> Patch {
    let (Some(first), Some(last)) = (added.first(), added.last()) else {
        return remote.clone();
    };
    use InsertPosition::{After, Before};
    match (position, anchor.is_root(), remote_first) {
        (After, false, false) | (Before, true, false) => reanchor(remote, last.clone(), After),
        (After, true, true) | (Before, false, true) => reanchor(remote, first.clone(), Before),
        _ => remote.clone(),
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Whether `patch` acts on `node` or something inside it.
fn within(patch: &Patch, node: &Path) -> bool {
    patch.path().starts_with(node)
        || split_of(patch).is_some_and(|s| Path::block(&s.block).starts_with(node))
}

fn split_of(patch: &Patch) -> Option<&SplitSource> {
    match patch {
        Patch::Insert {
            split: Some(split), ..
        } => Some(split),
        _ => None,
    }
}

fn merge_of(patch: &Patch) -> Option<&MergeTarget> {
    match patch {
        Patch::Unset {
            merge: Some(merge), ..
        } => Some(merge),
        _ => None,
    }
}

/// Key of the child of the block at `from` that `path` addresses, if any.
fn merged_child(path: &Path, from: &Path) -> Option<Key> {
    match path.target()? {
        Target::Child(block, child) if Path::block(block) == *from => Some(child.clone()),
        _ => None,
    }
}

/// Where a path into the merged block points once its children moved.
fn merged_path(path: &Path, merge: &MergeTarget) -> Option<Path> {
    match path.target()? {
        Target::Child(_, child) => Some(Path::child(&merge.into, merge.key_of(child))),
        Target::ChildField(_, child, field) => Some(Path::child_field(&merge.into, merge.key_of(child), field)),
        _ => None,
    }
}

/// Insert `keys` next to `neighbour`, or at the end when it is unknown.
fn insert_keys(list: &mut Vec<Key>, neighbour: &Key, position: InsertPosition, keys: Vec<Key>) {
    let at = list
        .iter()
        .position(|k| k == neighbour)
        .map_or(list.len(), |i| match position {
            InsertPosition::Before => i,
            _ => i + 1,
        });
    list.splice(at..at, keys);
}

/// Key of the moved child `path` addresses, if any.
fn moved_child(path: &Path, split: &SplitSource) -> Option<Key> {
    match path.target()? {
        Target::Child(block, child) if *block == split.block && split.moved.contains(child) => {
            Some(child.clone())
        }
        _ => None,
    }
}

fn keys_of(paths: &[Path]) -> Vec<Key> {
    paths
        .iter()
        .filter_map(|p| p.segments().last())
        .filter_map(|segment| match segment {
            crate::document::PathSegment::Key { key } => Some(key.clone()),
            _ => None,
        })
        .collect()
}

fn reanchor(patch: &Patch, anchor: Path, position: InsertPosition) -> Patch {
    let mut patch = patch.clone();
    if let Patch::Insert {
        path,
        position: current,
        ..
    } = &mut patch
    {
        *path = anchor;
        *current = position;
    }
    patch
}

fn edit_split(
    patch: &Patch,
    edit: impl FnOnce(&mut Path, &mut SplitSource, &mut Vec<Value>),
) -> Patch {
    let mut patch = patch.clone();
    if let Patch::Insert {
        path,
        split: Some(split),
        items,
        ..
    } = &mut patch
    {
        edit(path, split, items);
    }
    patch
}

fn edit_merge(patch: &Patch, edit: impl FnOnce(&mut MergeTarget)) -> Patch {
    let mut patch = patch.clone();
    if let Patch::Unset {
        merge: Some(merge), ..
    } = &mut patch
    {
        edit(merge);
    }
    patch
}

fn tail_key(items: &[Value]) -> Option<Key> {
    items
        .first()?
        .get(CHILDREN)?
        .as_array()?
        .first()
        .and_then(item_key)
}

fn tail_text(items: &[Value]) -> Option<String> {
    let text = items.first()?.get(CHILDREN)?.as_array()?.first()?.get("text")?;
    text.as_str().map(str::to_string)
}

fn set_tail_text(items: &mut [Value], text: String) {
    let tail = items
        .first_mut()
        .and_then(|block| block.get_mut(CHILDREN))
        .and_then(Value::as_array_mut)
        .and_then(|children| children.first_mut());
    if let Some(Value::Object(span)) = tail {
        span.insert("text".into(), Value::String(text));
    }
}

fn drop_tail(items: &mut [Value]) {
    let children = items
        .first_mut()
        .and_then(|block| block.get_mut(CHILDREN))
        .and_then(Value::as_array_mut);
    if let Some(children) = children {
        if !children.is_empty() {
            children.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, ObjectBlock, Span, TextBlock, apply_patches};
    use serde_json::json;

    fn k(s: &str) -> Key {
        Key::from(s)
    }

    fn doc() -> Document {
        Document::new(vec![
            TextBlock::new("b0", vec![Span::new("s0", "First").into()]).into(),
            TextBlock::new(
                "b1",
                vec![
                    Span::new("s1", "Hello world").into(),
                    Span::new("s2", " again").with_marks(&["strong"]).into(),
                ],
            )
            .into(),
            ObjectBlock::new("img", "image").into(),
        ])
    }

    /// Apply both orders and check they agree.
    fn converge(base: &Document, r: &Patch, l: &Patch, r_first: bool) -> Document {
        let local_side = apply_patches(base, std::slice::from_ref(l)).unwrap();
        let local_side = apply_patches(&local_side, &rebase(r, l, r_first)).unwrap();
        let remote_side = apply_patches(base, std::slice::from_ref(r)).unwrap();
        let remote_side = apply_patches(&remote_side, &rebase(l, r, !r_first)).unwrap();
        assert_eq!(local_side, remote_side);
        local_side
    }

    fn text_of(doc: &Document, b: &str) -> String {
        doc.text_block(&k(b)).unwrap().plain_text()
    }

    fn keys(doc: &Document) -> Vec<String> {
        doc.blocks().iter().map(|b| b.key().to_string()).collect()
    }

    fn split(block: &str, span: &str, offset: usize, moved: &[&str], new: &str, tail: &str, text: &str) -> Patch {
        Patch::split(
            SplitSource {
                block: k(block),
                span: k(span),
                offset,
                moved: moved.iter().map(|m| k(m)).collect(),
            },
            TextBlock::new(new, vec![Span::new(tail, text).into()]).into(),
        )
    }

    fn type_at(block: &str, span: &str, at: usize, text: &str) -> Patch {
        Patch::diff_match_patch(Path::text(&k(block), &k(span)), TextDelta::insert_at(at, text))
    }

    // ========================================================================
    // Text
    // ========================================================================

    #[test]
    fn test_text_inserts_in_same_span() {
        let r = type_at("b1", "s1", 5, ",");
        let l = type_at("b1", "s1", 11, "!");
        let result = converge(&doc(), &r, &l, true);
        assert_eq!(text_of(&result, "b1"), "Hello, world! again");
    }

    #[test]
    fn test_text_inserts_at_same_offset_follow_priority() {
        let r = type_at("b1", "s1", 11, " A");
        let l = type_at("b1", "s1", 11, " B");
        let result = converge(&doc(), &r, &l, true);
        assert_eq!(text_of(&result, "b1"), "Hello world A B again");
    }

    #[test]
    fn test_text_in_other_span_untouched() {
        let r = type_at("b0", "s0", 0, ">");
        let l = type_at("b1", "s1", 0, "<");
        assert_eq!(rebase(&r, &l, false), vec![r.clone()]);
        converge(&doc(), &r, &l, false);
    }

    #[test]
    fn test_edit_in_unset_span_is_dropped() {
        let r = type_at("b1", "s2", 0, "x");
        let l = Patch::unset(Path::child(&k("b1"), &k("s2")));
        assert!(rebase(&r, &l, true).is_empty());
        let result = converge(&doc(), &r, &l, true);
        assert_eq!(text_of(&result, "b1"), "Hello world");
    }

    // ========================================================================
    // Blocks
    // ========================================================================

    #[test]
    fn test_block_inserts_at_same_anchor() {
        let r = Patch::insert_blocks(
            Path::block(&k("b0")),
            InsertPosition::After,
            vec![TextBlock::new("r", vec![]).into()],
        );
        let l = Patch::insert_blocks(
            Path::block(&k("b0")),
            InsertPosition::After,
            vec![TextBlock::new("l", vec![]).into()],
        );
        let result = converge(&doc(), &r, &l, true);
        assert_eq!(keys(&result), ["b0", "r", "l", "b1", "img"]);
        let result = converge(&doc(), &r, &l, false);
        assert_eq!(keys(&result), ["b0", "l", "r", "b1", "img"]);
    }

    #[test]
    fn test_appends_at_root_follow_priority() {
        let r = Patch::insert_blocks(Path::root(), InsertPosition::After, vec![ObjectBlock::new("r", "x").into()]);
        let l = Patch::insert_blocks(Path::root(), InsertPosition::After, vec![ObjectBlock::new("l", "x").into()]);
        let result = converge(&doc(), &r, &l, false);
        assert_eq!(keys(&result), ["b0", "b1", "img", "l", "r"]);
    }

    #[test]
    fn test_unset_anchor_removes_concurrent_insert() {
        let r = Patch::unset(Path::block(&k("b0")));
        let l = Patch::insert_blocks(
            Path::block(&k("b0")),
            InsertPosition::After,
            vec![TextBlock::new("l", vec![]).into()],
        );
        let result = converge(&doc(), &r, &l, false);
        assert_eq!(keys(&result), ["b1", "img"]);
    }

    #[test]
    fn test_set_conflict_follows_priority() {
        let r = Patch::set(Path::block_field(&k("b1"), "style"), "h1");
        let l = Patch::set(Path::block_field(&k("b1"), "style"), "h2");
        let result = converge(&doc(), &r, &l, true);
        assert_eq!(result.text_block(&k("b1")).unwrap().style, "h1");
        let result = converge(&doc(), &r, &l, false);
        assert_eq!(result.text_block(&k("b1")).unwrap().style, "h2");
    }

    #[test]
    fn test_set_if_missing_race_converges() {
        let path = Path::block_field(&k("img"), "alt");
        let r = Patch::SetIfMissing {
            path: path.clone(),
            value: json!("remote"),
        };
        let l = Patch::SetIfMissing {
            path,
            value: json!("local"),
        };
        converge(&doc(), &r, &l, true);
        converge(&doc(), &r, &l, false);
    }

    #[test]
    fn test_set_of_block_drops_edits_inside() {
        let r = type_at("b0", "s0", 0, "x");
        let l = Patch::set(
            Path::block(&k("b0")),
            json!({"_key": "b0", "_type": "block", "children": [{"_key": "n", "_type": "span", "text": "New"}]}),
        );
        let result = converge(&doc(), &r, &l, true);
        assert_eq!(text_of(&result, "b0"), "New");
    }

    // ========================================================================
    // Splits
    // ========================================================================

    #[test]
    fn test_typing_after_split_point_moves_to_remainder() {
        let r = type_at("b1", "s1", 11, "!");
        let l = split("b1", "s1", 5, &["s2"], "z", "t", " world");
        let result = converge(&doc(), &r, &l, false);
        assert_eq!(text_of(&result, "b1"), "Hello");
        assert_eq!(text_of(&result, "z"), " world! again");
    }

    #[test]
    fn test_typing_before_split_point_stays() {
        let r = type_at("b1", "s1", 0, ">");
        let l = split("b1", "s1", 5, &["s2"], "z", "t", " world");
        let result = converge(&doc(), &r, &l, true);
        assert_eq!(text_of(&result, "b1"), ">Hello");
        assert_eq!(text_of(&result, "z"), " world again");
    }

    #[test]
    fn test_delete_across_split_point() {
        let r = Patch::diff_match_patch(Path::text(&k("b1"), &k("s1")), TextDelta::delete_at(3, 4));
        let l = split("b1", "s1", 5, &["s2"], "z", "t", " world");
        let result = converge(&doc(), &r, &l, true);
        assert_eq!(text_of(&result, "b1"), "Hel");
        assert_eq!(text_of(&result, "z"), "orld again");
    }

    #[test]
    fn test_edit_in_moved_span_follows_it() {
        let r = type_at("b1", "s2", 6, "!");
        let l = split("b1", "s1", 5, &["s2"], "z", "t", " world");
        let result = converge(&doc(), &r, &l, false);
        assert_eq!(text_of(&result, "z"), " world again!");
    }

    #[test]
    fn test_splits_at_different_offsets() {
        let r = split("b1", "s1", 8, &["s2"], "zr", "tr", "rld");
        let l = split("b1", "s1", 5, &["s2"], "zl", "tl", " world");
        for r_first in [true, false] {
            let result = converge(&doc(), &r, &l, r_first);
            assert_eq!(keys(&result), ["b0", "b1", "zl", "zr", "img"]);
            assert_eq!(text_of(&result, "b1"), "Hello");
            assert_eq!(text_of(&result, "zl"), " wo");
            assert_eq!(text_of(&result, "zr"), "rld again");
        }
    }

    #[test]
    fn test_splits_at_same_offset() {
        let r = split("b1", "s1", 5, &["s2"], "zr", "tr", " world");
        let l = split("b1", "s1", 5, &["s2"], "zl", "tl", " world");
        let result = converge(&doc(), &r, &l, true);
        assert_eq!(keys(&result), ["b0", "b1", "zr", "zl", "img"]);
        assert_eq!(text_of(&result, "zr"), "");
        assert_eq!(text_of(&result, "zl"), " world again");
    }

    #[test]
    fn test_unset_block_removes_concurrent_remainder() {
        let r = Patch::unset(Path::block(&k("b1")));
        let l = split("b1", "s1", 5, &["s2"], "z", "t", " world");
        let result = converge(&doc(), &r, &l, false);
        assert_eq!(keys(&result), ["b0", "img"]);
    }

    #[test]
    fn test_unset_split_span_drops_tail() {
        let r = Patch::unset(Path::child(&k("b1"), &k("s1")));
        let l = split("b1", "s1", 5, &["s2"], "z", "t", " world");
        let result = converge(&doc(), &r, &l, true);
        assert_eq!(text_of(&result, "b1"), "");
        assert_eq!(text_of(&result, "z"), " again");
    }

    #[test]
    fn test_block_insert_next_to_split() {
        let r = Patch::insert_blocks(
            Path::block(&k("b1")),
            InsertPosition::After,
            vec![ObjectBlock::new("pic", "image").into()],
        );
        let l = split("b1", "s1", 5, &["s2"], "z", "t", " world");
        let result = converge(&doc(), &r, &l, false);
        assert_eq!(keys(&result), ["b0", "b1", "z", "pic", "img"]);
    }

    #[test]
    fn test_span_inserted_after_split_point_joins_remainder() {
        let r = split("b0", "s0", 3, &[], "z", "t", "st");
        let l = Patch::insert_children(
            Path::child(&k("b0"), &k("s0")),
            InsertPosition::After,
            vec![Span::new("n", "xy").into()],
        );
        for r_first in [true, false] {
            let result = converge(&doc(), &r, &l, r_first);
            assert_eq!(keys(&result), ["b0", "z", "b1", "img"]);
            assert_eq!(text_of(&result, "b0"), "Fir");
            assert_eq!(text_of(&result, "z"), "stxy");
        }
    }

    // ========================================================================
    // Merges
    // ========================================================================

    fn merge_b1() -> Patch {
        Patch::merge(&k("b1"), &k("b0"), vec![k("s1"), k("s2")], Default::default())
    }

    #[test]
    fn test_same_merge_on_both_sides_applies_once() {
        let r = merge_b1();
        let l = merge_b1();
        assert!(rebase(&r, &l, true).is_empty());
        let result = converge(&doc(), &r, &l, false);
        assert_eq!(keys(&result), ["b0", "img"]);
        assert_eq!(text_of(&result, "b0"), "FirstHello world again");
    }

    #[test]
    fn test_typing_in_merged_block_follows_it() {
        let r = type_at("b1", "s1", 5, ",");
        let l = merge_b1();
        let result = converge(&doc(), &r, &l, true);
        assert_eq!(keys(&result), ["b0", "img"]);
        assert_eq!(text_of(&result, "b0"), "FirstHello, world again");
    }

    #[test]
    fn test_split_of_merged_block_splits_target() {
        let r = split("b1", "s1", 5, &["s2"], "z", "t", " world");
        let l = merge_b1();
        for r_first in [true, false] {
            let result = converge(&doc(), &r, &l, r_first);
            assert_eq!(keys(&result), ["b0", "z", "img"]);
            assert_eq!(text_of(&result, "b0"), "FirstHello");
            assert_eq!(text_of(&result, "z"), " world again");
        }
    }

    #[test]
    fn test_merge_into_split_block_lands_in_remainder() {
        let r = merge_b1();
        let l = split("b0", "s0", 2, &[], "z", "t", "rst");
        for r_first in [true, false] {
            let result = converge(&doc(), &r, &l, r_first);
            assert_eq!(keys(&result), ["b0", "z", "img"]);
            assert_eq!(text_of(&result, "b0"), "Fi");
            assert_eq!(text_of(&result, "z"), "rstHello world again");
        }
    }

    #[test]
    fn test_merge_into_removed_block_removes_source() {
        let r = merge_b1();
        let l = Patch::unset(Path::block(&k("b0")));
        assert_eq!(rebase(&r, &l, true), vec![Patch::unset(Path::block(&k("b1")))]);
        let result = converge(&doc(), &r, &l, true);
        assert_eq!(keys(&result), ["img"]);
    }

    // ========================================================================
    // Sequences
    // ========================================================================

    #[test]
    fn test_empty_pending_is_identity() {
        let r = vec![type_at("b1", "s1", 0, "x")];
        let (rebased, pending) = rebase_through(&r, &[], true);
        assert_eq!(rebased, r);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_transform_lists_converges() {
        let base = doc();
        let merge = vec![
            Patch::diff_match_patch(Path::text(&k("b0"), &k("s0")), TextDelta::diff("First", "FirstHello world")),
            Patch::insert_children(
                Path::child(&k("b0"), &k("s0")),
                InsertPosition::After,
                vec![Span::new("s2", " again").with_marks(&["strong"]).into()],
            ),
            Patch::unset(Path::block(&k("b1"))),
        ];
        let typing = vec![type_at("b0", "s0", 0, "1. "), type_at("b1", "s1", 5, ",")];

        let (merge2, typing2) = transform_lists(&merge, &typing, true);
        let left = apply_patches(&apply_patches(&base, &typing).unwrap(), &merge2).unwrap();
        let right = apply_patches(&apply_patches(&base, &merge).unwrap(), &typing2).unwrap();
        assert_eq!(left, right);
        assert_eq!(text_of(&left, "b0"), "1. FirstHello world again");
    }
}
