//! Node keys and the generators that mint them.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

use crate::editor_id::EditorId;

/// Opaque identifier of a block, child or mark definition.
///
/// Block keys are unique within a document, child keys within their block.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Source of fresh node keys for one editor.
pub trait KeyGenerator: Send {
    fn next_key(&mut self) -> Key;
}

/// Deterministic `<editor>-<n>` keys.
///
/// Distinct editors never collide because the editor id is part of the key.
#[derive(Debug, Clone)]
pub struct PrefixedKeys {
    prefix: String,
    next: u64,
}

impl PrefixedKeys {
    pub fn new(editor: &EditorId) -> Self {
        Self::starting_at(editor, 0)
    }

    pub fn starting_at(editor: &EditorId, next: u64) -> Self {
        Self {
            prefix: editor.to_string(),
            next,
        }
    }
}

impl KeyGenerator for PrefixedKeys {
    fn next_key(&mut self) -> Key {
        let key = Key(format!("{}-{}", self.prefix, self.next));
        self.next += 1;
        key
    }
}

/// Random 12-character hex keys derived from v4 UUIDs.
#[derive(Debug, Clone, Default)]
pub struct RandomKeys;

impl KeyGenerator for RandomKeys {
    fn next_key(&mut self) -> Key {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Key(uuid[..12].to_string())
    }
}
