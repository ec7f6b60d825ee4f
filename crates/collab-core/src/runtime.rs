//! Runs an [`EditorSession`] as a task.
//!
//! The task owns the session and serializes everything that touches it: local
//! intents arrive over a command queue, remote batches over the transport.
//! Applied patches are mirrored into a [`DocumentStore`] for rendering.

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::document::{Document, Path};
use crate::encoder::{EditIntent, EncodeError};
use crate::events::{EventBus, Notice, Subscription};
use crate::patch::{Origin, Patch, PatchBatch};
use crate::resolver::{
    InitialValueResolver, initial_block, initial_fields, initial_inline_object, resolve_with_notice,
};
use crate::selection::Selection;
use crate::session::{EditorSession, SessionError, SessionState};
use crate::store::DocumentStore;
use crate::transport::{PatchTransport, TransportError};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Session task has stopped")]
    Stopped,

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Point-in-time view of a running session.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub value: Document,
    pub selection: Option<Selection>,
    pub state: SessionState,
}

/// Where a local intent applies.
#[derive(Debug)]
enum Placement {
    Current,
    /// A selection captured earlier; falls back to appending when it no
    /// longer resolves.
    Captured(Option<Selection>),
}

#[derive(Debug)]
enum Command {
    Local {
        intent: EditIntent,
        placement: Placement,
        reply: oneshot::Sender<Result<PatchBatch>>,
    },
    Select {
        selection: Option<Selection>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Shutdown,
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    notices: Arc<EventBus<Notice>>,
    resolver: Arc<dyn InitialValueResolver>,
    config: SessionConfig,
}

impl SessionHandle {
    /// Apply an intent at the current selection.
    pub async fn apply(&self, intent: EditIntent) -> Result<PatchBatch> {
        self.local(intent, Placement::Current).await
    }

    pub async fn select(&self, selection: Option<Selection>) -> Result<()> {
        self.send(Command::Select { selection }).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| RuntimeError::Stopped)
    }

    pub async fn value(&self) -> Result<Document> {
        Ok(self.snapshot().await?.value)
    }

    pub async fn selection(&self) -> Result<Option<Selection>> {
        Ok(self.snapshot().await?.selection)
    }

    /// Stop the session task. Pending commands are dropped.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    pub fn subscribe_notices(&self, callback: impl Fn(Notice) + Send + Sync + 'static) -> Subscription {
        self.notices.subscribe(callback)
    }

    /// Insert a block of `type_name` with its resolved initial value.
    ///
    /// The selection is captured now; the insert lands there once the value
    /// resolves, even if the user moved on meanwhile.
    pub async fn insert_block_of_type(&self, type_name: &str) -> Result<JoinHandle<Result<PatchBatch>>> {
        self.insert_resolved(type_name, |type_name, value| EditIntent::InsertBlock {
            block: initial_block(type_name, value),
        })
        .await
    }

    /// Like [`SessionHandle::insert_block_of_type`] for an inline object.
    pub async fn insert_inline_object_of_type(&self, type_name: &str) -> Result<JoinHandle<Result<PatchBatch>>> {
        self.insert_resolved(type_name, |type_name, value| EditIntent::InsertInlineObject {
            object: initial_inline_object(type_name, value),
        })
        .await
    }

    /// Annotate the captured selection with a resolved `type_name` value.
    pub async fn add_annotation_of_type(&self, type_name: &str) -> Result<JoinHandle<Result<PatchBatch>>> {
        self.insert_resolved(type_name, |type_name, value| EditIntent::AddAnnotation {
            annotation_type: type_name.to_string(),
            value: initial_fields(value),
        })
        .await
    }

    async fn insert_resolved(
        &self,
        type_name: &str,
        intent: fn(&str, Value) -> EditIntent,
    ) -> Result<JoinHandle<Result<PatchBatch>>> {
        let captured = self.selection().await?;
        let handle = self.clone();
        let type_name = type_name.to_string();

        Ok(tokio::spawn(async move {
            let value = resolve_with_notice(
                handle.resolver.as_ref(),
                &type_name,
                handle.config.slow_notice,
                &handle.notices,
            )
            .await;
            handle
                .local(intent(&type_name, value), Placement::Captured(captured))
                .await
        }))
    }

    async fn local(&self, intent: EditIntent, placement: Placement) -> Result<PatchBatch> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Local {
            intent,
            placement,
            reply,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::Stopped)?
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| RuntimeError::Stopped)
    }
}

/// Start `session` on the current tokio runtime.
///
/// The store is brought in line with the session's value before any edits.
pub fn spawn_session(
    session: EditorSession,
    transport: Arc<dyn PatchTransport>,
    store: Arc<dyn DocumentStore>,
    resolver: Arc<dyn InitialValueResolver>,
    config: SessionConfig,
) -> (SessionHandle, JoinHandle<()>) {
    let (commands, rx) = mpsc::channel(config.queue_capacity.max(1));
    let notices = Arc::new(EventBus::new());

    let runner = Runner {
        session,
        transport,
        store,
        notices: Arc::clone(&notices),
    };
    let task = tokio::spawn(runner.run(rx));

    let handle = SessionHandle {
        commands,
        notices,
        resolver,
        config,
    };
    (handle, task)
}

struct Runner {
    session: EditorSession,
    transport: Arc<dyn PatchTransport>,
    store: Arc<dyn DocumentStore>,
    notices: Arc<EventBus<Notice>>,
}

impl Runner {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        for peer in self.transport.peers() {
            self.session.connect(peer);
        }
        if self.store.value() != *self.session.value() {
            debug!("Resetting store to session value");
            match serde_json::to_value(self.session.value()) {
                Ok(value) => self.mirror(&[Patch::set(Path::root(), value)], Origin::Local),
                Err(e) => error!("Failed to serialize session value: {}", e),
            }
        }
        info!(
            editor = %self.session.editor(),
            peers = self.session.peers().count(),
            "Session started"
        );

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Local { intent, placement, reply }) => {
                        let result = self.on_local(&intent, placement).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Select { selection }) => {
                        self.session.set_selection(selection);
                    }
                    Some(Command::Snapshot { reply }) => {
                        let _ = reply.send(Snapshot {
                            value: self.session.value().clone(),
                            selection: self.session.selection().cloned(),
                            state: self.session.state(),
                        });
                    }
                    Some(Command::Shutdown) | None => break,
                },

                batch = self.transport.recv() => match batch {
                    Ok(batch) => self.on_remote(batch).await,
                    Err(TransportError::Closed) => {
                        info!("Transport closed");
                        break;
                    }
                    Err(TransportError::Lagged(missed)) => {
                        error!(missed, "Fell behind the transport, stopping");
                        self.notices.emit(Notice::Warning {
                            message: format!("Missed {missed} batches from peers; the session stopped and must be reloaded."),
                        });
                        break;
                    }
                    Err(e) => {
                        error!("Failed to receive batch: {}", e);
                    }
                },
            }
        }

        info!(editor = %self.session.editor(), "Session stopped");
    }

    async fn on_local(&mut self, intent: &EditIntent, placement: Placement) -> Result<PatchBatch> {
        let batch = match placement {
            Placement::Current => self.session.apply_local(intent)?,
            Placement::Captured(selection) => match self.session.apply_local_at(intent, selection) {
                Err(SessionError::Encode(EncodeError::InvalidSelection(path))) => {
                    warn!(%path, "Captured selection is gone, appending instead");
                    self.session.apply_local_at(intent, None)?
                }
                result => result?,
            },
        };

        if batch.patches.is_empty() {
            return Ok(batch);
        }
        self.mirror(&batch.patches, Origin::Local);
        if let Err(e) = self.transport.broadcast(&batch).await {
            warn!("Failed to broadcast local edit: {}", e);
        }
        Ok(batch)
    }

    async fn on_remote(&mut self, batch: PatchBatch) {
        let outcome = self.session.apply_remote(&batch);
        debug!(
            peer = %batch.origin,
            applied = outcome.applied.len(),
            dropped = outcome.dropped,
            "Applied remote batch"
        );

        self.mirror(&outcome.applied, Origin::Remote);
        for warning in outcome.warnings {
            self.notices.emit(Notice::Warning {
                message: warning.to_string(),
            });
        }

        let reply = match outcome.relay {
            Some(relay) => relay,
            None if !batch.is_ack() => self.session.ack_batch(),
            None => return,
        };
        if let Err(e) = self.transport.broadcast(&reply).await {
            warn!("Failed to answer batch from {}: {}", batch.origin, e);
        }
    }

    fn mirror(&self, patches: &[Patch], origin: Origin) {
        if let Err(e) = self.store.apply_patches(patches, origin) {
            error!("Store rejected patches the session accepted: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Block, Span, TextBlock};
    use crate::editor_id::EditorId;
    use crate::key::Key;
    use crate::resolver::StaticResolver;
    use crate::selection::Point;
    use crate::store::MemoryStore;
    use crate::transport::LocalHub;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn id(s: &str) -> EditorId {
        s.parse().unwrap()
    }

    fn doc() -> Document {
        Document::new(vec![
            TextBlock::new("b0", vec![Span::new("s0", "Hello").into()]).into(),
        ])
    }

    fn caret(offset: usize) -> Option<Selection> {
        Some(Selection::caret(Point::new(
            Path::child(&Key::from("b0"), &Key::from("s0")),
            offset,
        )))
    }

    fn start(hub: &LocalHub, editor: &str, resolver: StaticResolver) -> (SessionHandle, Arc<MemoryStore>) {
        let transport = Arc::new(hub.join(id(editor)));
        let store = Arc::new(MemoryStore::new(doc()));
        let session = EditorSession::new(id(editor), doc());
        let (handle, _task) = spawn_session(
            session,
            transport,
            store.clone(),
            Arc::new(resolver),
            SessionConfig::default(),
        );
        (handle, store)
    }

    #[tokio::test]
    async fn test_local_edit_reaches_store() {
        let hub = LocalHub::new(64);
        let (a, store) = start(&hub, "A", StaticResolver::new());

        a.select(caret(5)).await.unwrap();
        let batch = a.apply(EditIntent::InsertText { text: "!".into() }).await.unwrap();

        assert_eq!(batch.patches.len(), 1);
        let value = a.value().await.unwrap();
        assert_eq!(store.value(), value);
        assert_eq!(value.text_block(&Key::from("b0")).unwrap().plain_text(), "Hello!");
        a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_peers_converge_over_hub() {
        let hub = LocalHub::new(64);
        let (a, _) = start(&hub, "A", StaticResolver::new());
        let (b, store_b) = start(&hub, "B", StaticResolver::new());

        a.select(caret(0)).await.unwrap();
        b.select(caret(5)).await.unwrap();
        a.apply(EditIntent::InsertText { text: ">> ".into() }).await.unwrap();
        b.apply(EditIntent::InsertText { text: " world".into() }).await.unwrap();

        let expected = ">> Hello world";
        for _ in 0..200 {
            let a_text = a.value().await.unwrap().text_block(&Key::from("b0")).unwrap().plain_text();
            let b_text = b.value().await.unwrap().text_block(&Key::from("b0")).unwrap().plain_text();
            if a_text == expected && b_text == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(a.value().await.unwrap(), b.value().await.unwrap());
        assert_eq!(store_b.value(), b.value().await.unwrap());
    }

    #[tokio::test]
    async fn test_stopped_session_errors() {
        let hub = LocalHub::new(64);
        let (a, _) = start(&hub, "A", StaticResolver::new());
        a.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(a.value().await, Err(RuntimeError::Stopped)));
    }

    #[tokio::test]
    async fn test_lagging_session_stops_with_warning() {
        let hub = LocalHub::new(1);
        let a = hub.join(id("A"));
        let b = Arc::new(hub.join(id("B")));
        for _ in 0..2 {
            a.broadcast(&PatchBatch {
                origin: id("A"),
                author: None,
                acks: Default::default(),
                patches: vec![Patch::set(Path::root(), json!([]))],
            })
            .await
            .unwrap();
        }

        let (handle, task) = spawn_session(
            EditorSession::new(id("B"), doc()),
            b,
            Arc::new(MemoryStore::new(doc())),
            Arc::new(StaticResolver::new()),
            SessionConfig::default(),
        );
        let notices = Arc::new(Mutex::new(Vec::new()));
        let notices_clone = Arc::clone(&notices);
        let _sub = handle.subscribe_notices(move |notice| notices_clone.lock().unwrap().push(notice));

        task.await.unwrap();
        assert!(matches!(notices.lock().unwrap().as_slice(), [Notice::Warning { .. }]));
        assert!(matches!(handle.value().await, Err(RuntimeError::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_block_of_type_uses_captured_selection() {
        let hub = LocalHub::new(64);
        let resolver = StaticResolver::new()
            .with_value("image", json!({"alt": "cat"}))
            .with_delay(Duration::from_secs(1));
        let (a, _) = start(&hub, "A", resolver);

        let notices = Arc::new(Mutex::new(Vec::new()));
        let notices_clone = Arc::clone(&notices);
        let _sub = a.subscribe_notices(move |notice| notices_clone.lock().unwrap().push(notice));

        a.select(caret(5)).await.unwrap();
        let pending = a.insert_block_of_type("image").await.unwrap();
        a.select(None).await.unwrap();

        let batch = pending.await.unwrap().unwrap();
        assert_eq!(batch.patches.len(), 1);

        let value = a.value().await.unwrap();
        assert_eq!(value.len(), 2);
        assert_eq!(value.blocks()[0].key(), &Key::from("b0"));

        let notices = notices.lock().unwrap();
        assert!(matches!(notices[0], Notice::ResolvingInitialValue { .. }));
        assert!(matches!(notices[1], Notice::InitialValueResolved { .. }));
    }

    #[tokio::test]
    async fn test_failed_resolution_inserts_empty_block() {
        let hub = LocalHub::new(64);
        let (a, _) = start(&hub, "A", StaticResolver::new().with_failure("image", "offline"));
        let notices = Arc::new(Mutex::new(Vec::new()));
        let notices_clone = Arc::clone(&notices);
        let _sub = a.subscribe_notices(move |notice| notices_clone.lock().unwrap().push(notice));
        a.select(caret(5)).await.unwrap();

        let pending = a.insert_block_of_type("image").await.unwrap();
        pending.await.unwrap().unwrap();

        let value = a.value().await.unwrap();
        let Block::Object(image) = &value.blocks()[1] else {
            panic!("expected an image block");
        };
        assert!(image.fields.is_empty());
        assert!(matches!(notices.lock().unwrap()[0], Notice::InitialValueFailed { .. }));
    }

    #[tokio::test]
    async fn test_annotation_of_type_uses_resolved_value() {
        let hub = LocalHub::new(64);
        let resolver = StaticResolver::new().with_value("link", json!({"href": "https://example.com"}));
        let (a, _) = start(&hub, "A", resolver);
        a.select(Some(Selection::new(
            Point::new(Path::child(&Key::from("b0"), &Key::from("s0")), 0),
            Point::new(Path::child(&Key::from("b0"), &Key::from("s0")), 5),
        )))
        .await
        .unwrap();

        let pending = a.add_annotation_of_type("link").await.unwrap();
        pending.await.unwrap().unwrap();

        let value = a.value().await.unwrap();
        let block = value.text_block(&Key::from("b0")).unwrap();
        assert_eq!(block.mark_defs.len(), 1);
        assert_eq!(block.mark_defs[0].def_type, "link");
        assert_eq!(block.mark_defs[0].fields.get("href"), Some(&json!("https://example.com")));
    }
}
