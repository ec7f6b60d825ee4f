//! EditorId: Identifier for one editor instance taking part in a session.
//!
//! Editor ids are short printable strings ("A", "B", or a generated
//! 16-character hex id). Their lexicographic order decides which side wins
//! when two editors make conflicting edits at the same position.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Longest accepted editor id, in bytes.
const MAX_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditorIdError {
    #[error("Editor ID must not be empty")]
    Empty,
    #[error("Editor ID is longer than {MAX_LEN} bytes")]
    TooLong,
    #[error("Editor ID contains invalid character {0:?}")]
    InvalidChar(char),
}

/// A unique identifier for an editor instance.
///
/// # Examples
/// ```
/// use collab_core::EditorId;
///
/// let a: EditorId = "A".parse().unwrap();
/// let b: EditorId = "B".parse().unwrap();
/// assert!(a.has_priority_over(&b));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EditorId(String);

impl EditorId {
    /// Generate a new random editor ID (16 hex chars).
    pub fn generate() -> Self {
        use rand::Rng;
        let id: u64 = rand::rng().random();
        Self(format!("{id:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this editor's edits win positional ties against `other`.
    ///
    /// The lexicographically smaller id has priority.
    pub fn has_priority_over(&self, other: &EditorId) -> bool {
        self.0 < other.0
    }
}

impl Display for EditorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EditorId {
    type Err = EditorIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(EditorIdError::Empty);
        }
        if s.len() > MAX_LEN {
            return Err(EditorIdError::TooLong);
        }
        if let Some(c) = s.chars().find(|c| !c.is_ascii_graphic()) {
            return Err(EditorIdError::InvalidChar(c));
        }
        Ok(Self(s.to_string()))
    }
}

// Serialize as plain string, validated on the way in
impl serde::Serialize for EditorId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EditorId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
