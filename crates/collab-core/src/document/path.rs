//! Key-based paths into a document.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

use crate::key::Key;

/// Field holding a text block's children.
pub const CHILDREN: &str = "children";
/// Field holding a span's text.
pub const TEXT: &str = "text";

/// One step of a path: a keyed node or a named field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key {
        #[serde(rename = "_key")]
        key: Key,
    },
    Field(String),
}

/// Location of a node or field, e.g. `[{_key:"b1"}, "children", {_key:"s1"}, "text"]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(Vec<PathSegment>);

/// The shapes of path the document model understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Root,
    Block(&'a Key),
    BlockField(&'a Key, &'a str),
    Child(&'a Key, &'a Key),
    ChildField(&'a Key, &'a Key, &'a str),
}

impl Path {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn block(block: &Key) -> Self {
        Self(vec![key(block)])
    }

    pub fn block_field(block: &Key, field: &str) -> Self {
        Self(vec![key(block), PathSegment::Field(field.to_string())])
    }

    pub fn child(block: &Key, child: &Key) -> Self {
        Self(vec![
            key(block),
            PathSegment::Field(CHILDREN.to_string()),
            key(child),
        ])
    }

    pub fn child_field(block: &Key, child: &Key, field: &str) -> Self {
        let mut path = Self::child(block, child);
        path.0.push(PathSegment::Field(field.to_string()));
        path
    }

    /// Path of a span's text.
    pub fn text(block: &Key, span: &Key) -> Self {
        Self::child_field(block, span, TEXT)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `prefix` addresses this path or one of its ancestors.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Classify the path, or `None` when it has an unsupported shape.
    pub fn target(&self) -> Option<Target<'_>> {
        use PathSegment::{Field, Key as K};
        match self.0.as_slice() {
            [] => Some(Target::Root),
            [K { key: b }] => Some(Target::Block(b)),
            [K { key: b }, Field(f)] => Some(Target::BlockField(b, f)),
            [K { key: b }, Field(c), K { key: s }] if c == CHILDREN => Some(Target::Child(b, s)),
            [K { key: b }, Field(c), K { key: s }, Field(f)] if c == CHILDREN => {
                Some(Target::ChildField(b, s, f))
            }
            _ => None,
        }
    }

    /// Key of the block this path points into.
    pub fn block_key(&self) -> Option<&Key> {
        match self.0.first() {
            Some(PathSegment::Key { key }) => Some(key),
            _ => None,
        }
    }

    /// Key of the child this path points into.
    pub fn child_key(&self) -> Option<&Key> {
        match self.target()? {
            Target::Child(_, c) | Target::ChildField(_, c, _) => Some(c),
            _ => None,
        }
    }

    /// Same path with its block key replaced.
    pub fn with_block(&self, block: &Key) -> Path {
        let mut path = self.clone();
        if let Some(first @ PathSegment::Key { .. }) = path.0.first_mut() {
            *first = key(block);
        }
        path
    }

    /// The node a field path belongs to (node paths return themselves).
    pub fn node_path(&self) -> Path {
        match self.target() {
            Some(Target::BlockField(b, _)) => Path::block(b),
            Some(Target::ChildField(b, c, _)) => Path::child(b, c),
            _ => self.clone(),
        }
    }

    /// Path of a sibling node: same parent, different key.
    pub fn sibling(&self, sibling: &Key) -> Path {
        let mut path = self.clone();
        if let Some(last @ PathSegment::Key { .. }) = path.0.last_mut() {
            *last = key(sibling);
        } else if path.is_root() {
            path.0.push(key(sibling));
        }
        path
    }
}

fn key(k: &Key) -> PathSegment {
    PathSegment::Key { key: k.clone() }
}

impl Display for Path {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key { key } => write!(f, "[_key==\"{key}\"]")?,
                PathSegment::Field(name) if i == 0 => f.write_str(name)?,
                PathSegment::Field(name) => write!(f, ".{name}")?,
            }
        }
        Ok(())
    }
}
