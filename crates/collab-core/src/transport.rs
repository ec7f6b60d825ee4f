//! PatchTransport trait for exchanging patch batches between editors.
//!
//! Implementations:
//! - `LocalHub`: in-process broadcast, used by tests and the simulator

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tracing::trace;

use crate::editor_id::EditorId;
use crate::patch::PatchBatch;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The receiver fell behind and `0` batches were discarded.
    #[error("Missed {0} batches")]
    Lagged(u64),

    #[error("Malformed batch: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Delivers batches to every other editor of the same document.
///
/// Batches from one sender must arrive in the order they were broadcast.
#[async_trait]
pub trait PatchTransport: Send + Sync {
    /// Editor this transport sends for.
    fn editor_id(&self) -> &EditorId;

    /// Editors currently reachable.
    fn peers(&self) -> Vec<EditorId>;

    /// Send a batch to every peer.
    async fn broadcast(&self, batch: &PatchBatch) -> Result<()>;

    /// Next batch from any peer (waits until one is available).
    async fn recv(&self) -> Result<PatchBatch>;
}

/// In-process hub; every joined editor sees every other editor's batches.
///
/// Batches travel as JSON so the hub exercises the wire format.
#[derive(Clone)]
pub struct LocalHub {
    sender: broadcast::Sender<String>,
    members: Arc<RwLock<Vec<EditorId>>>,
}

impl LocalHub {
    /// `capacity` bounds how far a slow member may lag before it errors.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn join(&self, editor: EditorId) -> HubTransport {
        let receiver = self.sender.subscribe();
        self.members
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(editor.clone());
        HubTransport {
            editor,
            hub: self.clone(),
            receiver: Mutex::new(receiver),
        }
    }

    pub fn members(&self) -> Vec<EditorId> {
        self.members.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub struct HubTransport {
    editor: EditorId,
    hub: LocalHub,
    receiver: Mutex<broadcast::Receiver<String>>,
}

#[async_trait]
impl PatchTransport for HubTransport {
    fn editor_id(&self) -> &EditorId {
        &self.editor
    }

    fn peers(&self) -> Vec<EditorId> {
        self.hub
            .members()
            .into_iter()
            .filter(|member| *member != self.editor)
            .collect()
    }

    async fn broadcast(&self, batch: &PatchBatch) -> Result<()> {
        let json = batch.to_json()?;
        trace!(editor = %self.editor, size = json.len(), "Broadcasting batch");
        self.hub
            .sender
            .send(json)
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Result<PatchBatch> {
        let mut receiver = self.receiver.lock().await;
        loop {
            let json = match receiver.recv().await {
                Ok(json) => json,
                Err(broadcast::error::RecvError::Closed) => return Err(TransportError::Closed),
                Err(broadcast::error::RecvError::Lagged(missed)) => return Err(TransportError::Lagged(missed)),
            };
            let batch = PatchBatch::from_json(&json)?;
            if batch.origin != self.editor {
                return Ok(batch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn id(s: &str) -> EditorId {
        s.parse().unwrap()
    }

    fn batch(origin: &str) -> PatchBatch {
        PatchBatch {
            origin: id(origin),
            author: None,
            acks: BTreeMap::new(),
            patches: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_members_see_each_other() {
        let hub = LocalHub::new(16);
        let a = hub.join(id("A"));
        let b = hub.join(id("B"));
        assert_eq!(a.peers(), vec![id("B")]);
        assert_eq!(b.peers(), vec![id("A")]);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let hub = LocalHub::new(16);
        let a = hub.join(id("A"));
        let b = hub.join(id("B"));

        a.broadcast(&batch("A")).await.unwrap();
        b.broadcast(&batch("B")).await.unwrap();

        assert_eq!(b.recv().await.unwrap().origin, id("A"));
        assert_eq!(a.recv().await.unwrap().origin, id("B"));
    }

    #[tokio::test]
    async fn test_lagging_member_errors() {
        let hub = LocalHub::new(1);
        let a = hub.join(id("A"));
        let b = hub.join(id("B"));
        a.broadcast(&batch("A")).await.unwrap();
        a.broadcast(&batch("A")).await.unwrap();
        assert!(matches!(b.recv().await, Err(TransportError::Lagged(1))));
    }
}
