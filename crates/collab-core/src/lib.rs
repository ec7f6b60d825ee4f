//! collab-core: real-time collaborative editing for portable text.
//!
//! This crate provides the core functionality for:
//! - The block/span document model and patch application
//! - Encoding editor intents into patches
//! - Operational transformation of concurrent patches
//! - Selection tracking across local and remote edits
//! - Editor sessions, the async runtime around them and PatchTransport

pub mod config;
pub mod document;
pub mod editor_id;
pub mod encoder;
pub mod events;
pub mod key;
pub mod ot;
pub mod patch;
pub mod resolver;
pub mod runtime;
pub mod selection;
pub mod session;
pub mod store;
pub mod transport;

pub use config::{ConfigError, KeyStrategy, SessionConfig};
pub use document::{Block, Child, Document, Path, PatchError, Span, TextBlock};
pub use editor_id::{EditorId, EditorIdError};
pub use encoder::{EditIntent, EncodeError};
pub use events::{EventBus, Notice, Subscription};
pub use key::{Key, KeyGenerator};
pub use patch::{Origin, Patch, PatchBatch};
pub use runtime::{SessionHandle, spawn_session};
pub use selection::{Point, Selection};
pub use session::{EditorSession, RemoteOutcome, SessionState};
pub use store::{DocumentStore, MemoryStore};
pub use transport::{LocalHub, PatchTransport};
