//! Patches: the unit of change exchanged between editors.
//!
//! Five kinds, tagged by `type` on the wire: `insert`, `setIfMissing`, `set`,
//! `unset` and `diffMatchPatch`. A block split travels as an `insert` with
//! [`SplitSource`] attached so that truncating the source and creating the
//! remainder happen in one step. Joining two text blocks is an `unset` of the
//! absorbed block with a [`MergeTarget`]: its children move first.

mod delta;

pub use delta::{DeltaError, TextDelta, TextOp};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::document::{Block, Child, Path, Target};
use crate::editor_id::EditorId;
use crate::key::Key;

/// Placement of inserted items relative to the anchor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertPosition {
    Before,
    After,
    Replace,
}

/// Marks an insert as the remainder of a split text block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitSource {
    /// Block being split.
    pub block: Key,
    /// Child the caret was in; truncated at `offset` when it is a span.
    pub span: Key,
    pub offset: usize,
    /// Children after `span` when the split was made. Every child after
    /// `span` moves, including ones added since.
    #[serde(default)]
    pub moved: Vec<Key>,
}

/// Marks an unset as joining the removed text block onto another one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeTarget {
    /// Block whose children are extended.
    pub into: Key,
    /// Children of the merged block when the merge was made. Every child it
    /// holds moves, including ones added since.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Key>,
    /// Children that change key on the way because `into` already has one.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub renamed: BTreeMap<Key, Key>,
}

impl MergeTarget {
    /// Key a child of the merged block has once it sits in `into`.
    pub fn key_of<'a>(&'a self, child: &'a Key) -> &'a Key {
        self.renamed.get(child).unwrap_or(child)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Patch {
    Insert {
        path: Path,
        position: InsertPosition,
        items: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        split: Option<SplitSource>,
    },
    SetIfMissing {
        path: Path,
        value: Value,
    },
    Set {
        path: Path,
        value: Value,
    },
    Unset {
        path: Path,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        merge: Option<MergeTarget>,
    },
    DiffMatchPatch {
        path: Path,
        value: TextDelta,
    },
}

impl Patch {
    pub fn path(&self) -> &Path {
        match self {
            Patch::Insert { path, .. }
            | Patch::SetIfMissing { path, .. }
            | Patch::Set { path, .. }
            | Patch::Unset { path, .. }
            | Patch::DiffMatchPatch { path, .. } => path,
        }
    }

    pub fn path_mut(&mut self) -> &mut Path {
        match self {
            Patch::Insert { path, .. }
            | Patch::SetIfMissing { path, .. }
            | Patch::Set { path, .. }
            | Patch::Unset { path, .. }
            | Patch::DiffMatchPatch { path, .. } => path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Patch::Insert { .. } => "insert",
            Patch::SetIfMissing { .. } => "setIfMissing",
            Patch::Set { .. } => "set",
            Patch::Unset { merge: Some(_), .. } => "merge",
            Patch::Unset { .. } => "unset",
            Patch::DiffMatchPatch { .. } => "diffMatchPatch",
        }
    }

    pub fn insert_blocks(anchor: Path, position: InsertPosition, blocks: Vec<Block>) -> Self {
        Patch::Insert {
            path: anchor,
            position,
            items: blocks.into_iter().map(Value::from).collect(),
            split: None,
        }
    }

    pub fn insert_children(anchor: Path, position: InsertPosition, children: Vec<Child>) -> Self {
        Patch::Insert {
            path: anchor,
            position,
            items: children.into_iter().map(Value::from).collect(),
            split: None,
        }
    }

    /// Split `source.block` and insert `remainder` right after it.
    pub fn split(source: SplitSource, remainder: Block) -> Self {
        Patch::Insert {
            path: Path::block(&source.block),
            position: InsertPosition::After,
            items: vec![Value::from(remainder)],
            split: Some(source),
        }
    }

    pub fn set(path: Path, value: impl Into<Value>) -> Self {
        Patch::Set {
            path,
            value: value.into(),
        }
    }

    pub fn unset(path: Path) -> Self {
        Patch::Unset { path, merge: None }
    }

    /// Append the children of text block `from` to `into` and remove `from`.
    pub fn merge(from: &Key, into: &Key, children: Vec<Key>, renamed: BTreeMap<Key, Key>) -> Self {
        Patch::Unset {
            path: Path::block(from),
            merge: Some(MergeTarget {
                into: into.clone(),
                children,
                renamed,
            }),
        }
    }

    pub fn diff_match_patch(path: Path, delta: TextDelta) -> Self {
        Patch::DiffMatchPatch { path, value: delta }
    }

    /// Whether this patch removes the node at its path and what is inside.
    pub(crate) fn removes_anchor(&self) -> bool {
        matches!(
            self,
            Patch::Unset { merge: None, .. }
                | Patch::Insert {
                    position: InsertPosition::Replace,
                    ..
                }
        )
    }

    /// Paths of the nodes an insert adds, in order.
    pub fn inserted_paths(&self) -> Vec<Path> {
        let Patch::Insert { path, items, .. } = self else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(item_key)
            .map(|key| match path.target() {
                Some(Target::Child(block, _)) => Path::child(block, &key),
                _ => Path::block(&key),
            })
            .collect()
    }
}

/// `_key` of an inserted item.
pub fn item_key(item: &Value) -> Option<Key> {
    item.get("_key").and_then(Value::as_str).map(Key::from)
}

/// Where a change to the store came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
}

/// Patches produced by one intent, as broadcast to every peer.
///
/// The session with the smallest editor id orders everything: it relays each
/// batch it integrates with `author` set to the editor that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchBatch {
    pub origin: EditorId,
    /// Editor whose intent the patches came from, when the origin relays them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<EditorId>,
    /// Patches the origin had applied from each peer when sending.
    #[serde(default)]
    pub acks: BTreeMap<EditorId, u64>,
    pub patches: Vec<Patch>,
}

impl PatchBatch {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// A batch that only carries acknowledgements.
    ///
    /// A relay is never one, even when none of its patches survived.
    pub fn is_ack(&self) -> bool {
        self.patches.is_empty() && self.author.is_none()
    }

    /// Editor that wrote the patches.
    pub fn authored_by(&self) -> &EditorId {
        self.author.as_ref().unwrap_or(&self.origin)
    }
}
