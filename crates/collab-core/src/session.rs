//! One editor's view of the shared value.
//!
//! A session applies local intents immediately and broadcasts the resulting
//! patches. The connected editor with the smallest id is the authority: it
//! rebases every batch it receives through what the sender had not seen yet,
//! applies it and relays the result to everyone. That relayed stream is the
//! canonical history.
//!
//! The other sessions keep the last confirmed value and their unconfirmed
//! local batches. Canonical patches are applied to the confirmed value, and
//! the local value is always the confirmed one with the unconfirmed batches
//! replayed on top. All peers should connect before anyone edits.

use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::SessionConfig;
use crate::document::{Document, Path, PatchError, apply_patch, apply_patches};
use crate::editor_id::EditorId;
use crate::encoder::{EditIntent, EncodeError, encode};
use crate::key::{KeyGenerator, PrefixedKeys};
use crate::ot;
use crate::patch::{Patch, PatchBatch};
use crate::selection::{Selection, SelectionUpdate, fallback, rebase_selection};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Patch(#[from] PatchError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Something that went wrong while applying a remote batch.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionWarning {
    /// A rebased patch did not apply and was skipped.
    PatchRejected { patch: Patch, error: PatchError },
    /// A batch arrived from a peer that was never connected.
    UnknownPeer(EditorId),
}

impl std::fmt::Display for SessionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionWarning::PatchRejected { patch, error } => {
                write!(f, "Skipped remote {} at {}: {}", patch.kind(), patch.path(), error)
            }
            SessionWarning::UnknownPeer(peer) => write!(f, "Batch from unknown peer {peer}"),
        }
    }
}

/// Result of [`EditorSession::apply_remote`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteOutcome {
    /// Patches applied to the local value, after rebasing.
    pub applied: Vec<Patch>,
    /// Remote patches that had nothing left to act on.
    pub dropped: usize,
    pub warnings: Vec<SessionWarning>,
    /// What the authority accepted from the batch, to broadcast to everyone.
    pub relay: Option<PatchBatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Every local patch has been acknowledged by every peer.
    Idle,
    /// Some peer has not acknowledged `outstanding` local patches.
    Pending { outstanding: usize },
}

/// A patch some peer has not seen yet, split into what it became after
/// rebasing.
#[derive(Debug, Clone)]
struct Unseen {
    author: EditorId,
    patches: Vec<Patch>,
}

/// Exchange state with one peer.
#[derive(Debug, Default)]
struct PeerChannel {
    /// Patches received from this peer. For the authority's channel these are
    /// the canonical patches authored by someone else.
    received: u64,
    /// Patches this peer has acknowledged.
    acked: u64,
    /// Patches applied here that this peer has not acknowledged, rebased over
    /// everything received from it since.
    pending: VecDeque<Unseen>,
}

impl PeerChannel {
    fn acknowledge(&mut self, acked: u64) {
        while self.acked < acked && self.pending.pop_front().is_some() {
            self.acked += 1;
        }
    }
}

pub struct EditorSession {
    editor: EditorId,
    value: Document,
    selection: Option<Selection>,
    keys: Box<dyn KeyGenerator>,
    peers: BTreeMap<EditorId, PeerChannel>,
    sent: u64,
    /// The value as of the last canonical patch. Unused on the authority.
    confirmed: Document,
    /// Local batches the authority has not relayed back yet, one group per
    /// original patch.
    unconfirmed: VecDeque<Vec<Vec<Patch>>>,
}

impl std::fmt::Debug for EditorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorSession")
            .field("editor", &self.editor)
            .field("value", &self.value)
            .field("selection", &self.selection)
            .field("peers", &self.peers)
            .field("unconfirmed", &self.unconfirmed)
            .finish_non_exhaustive()
    }
}

impl EditorSession {
    pub fn new(editor: EditorId, value: Document) -> Self {
        let keys = Box::new(PrefixedKeys::new(&editor));
        Self::with_keys(editor, value, keys)
    }

    pub fn with_config(editor: EditorId, value: Document, config: &SessionConfig) -> Self {
        let keys = config.key_strategy.generator(&editor);
        Self::with_keys(editor, value, keys)
    }

    pub fn with_keys(editor: EditorId, value: Document, keys: Box<dyn KeyGenerator>) -> Self {
        Self {
            editor,
            confirmed: value.clone(),
            value,
            selection: None,
            keys,
            peers: BTreeMap::new(),
            sent: 0,
            unconfirmed: VecDeque::new(),
        }
    }

    pub fn editor(&self) -> &EditorId {
        &self.editor
    }

    pub fn value(&self) -> &Document {
        &self.value
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// Move the selection. Offsets are clamped; an unresolvable selection
    /// clears it.
    pub fn set_selection(&mut self, selection: Option<Selection>) {
        self.selection = selection.and_then(|s| s.normalize(&self.value));
    }

    /// Start exchanging patches with `peer`.
    pub fn connect(&mut self, peer: EditorId) {
        if peer == self.editor || self.peers.contains_key(&peer) {
            return;
        }
        let before = self.authority().clone();
        self.peers.insert(peer, PeerChannel::default());
        if *self.authority() != before {
            debug!(editor = %self.editor, authority = %self.authority(), "Authority changed");
            self.confirmed = self.value.clone();
            self.unconfirmed.clear();
        }
    }

    pub fn peers(&self) -> impl Iterator<Item = &EditorId> {
        self.peers.keys()
    }

    /// The editor whose relayed batches make up the canonical history.
    pub fn authority(&self) -> &EditorId {
        self.peers
            .keys()
            .next()
            .filter(|peer| peer.has_priority_over(&self.editor))
            .unwrap_or(&self.editor)
    }

    pub fn is_authority(&self) -> bool {
        *self.authority() == self.editor
    }

    pub fn state(&self) -> SessionState {
        let outstanding = if self.is_authority() {
            self.peers
                .values()
                .map(|channel| channel.pending.len())
                .max()
                .unwrap_or(0)
        } else {
            self.unconfirmed.iter().map(Vec::len).sum()
        };
        if outstanding == 0 {
            SessionState::Idle
        } else {
            SessionState::Pending { outstanding }
        }
    }

    /// Apply an intent at the current selection.
    pub fn apply_local(&mut self, intent: &EditIntent) -> Result<PatchBatch> {
        let selection = self.selection.clone();
        self.apply_local_at(intent, selection)
    }

    /// Apply an intent at `selection` instead of the current one.
    ///
    /// Used when the position was captured before some asynchronous step.
    pub fn apply_local_at(&mut self, intent: &EditIntent, selection: Option<Selection>) -> Result<PatchBatch> {
        let encoded = encode(&self.value, selection.as_ref(), intent, self.keys.as_mut())?;
        self.value = apply_patches(&self.value, &encoded.patches)?;
        self.selection = encoded.selection;

        if self.is_authority() {
            for channel in self.peers.values_mut() {
                channel.pending.extend(encoded.patches.iter().map(|patch| Unseen {
                    author: self.editor.clone(),
                    patches: vec![patch.clone()],
                }));
            }
        } else if !encoded.patches.is_empty() {
            self.unconfirmed
                .push_back(encoded.patches.iter().map(|patch| vec![patch.clone()]).collect());
        }
        self.sent += encoded.patches.len() as u64;
        debug!(
            editor = %self.editor,
            patches = encoded.patches.len(),
            "Applied local intent"
        );

        Ok(PatchBatch {
            origin: self.editor.clone(),
            author: None,
            acks: self.acks(),
            patches: encoded.patches,
        })
    }

    /// Rebase and apply a batch from another editor.
    pub fn apply_remote(&mut self, batch: &PatchBatch) -> RemoteOutcome {
        let mut outcome = RemoteOutcome::default();
        if batch.origin == self.editor {
            trace!(editor = %self.editor, "Ignoring own batch");
            return outcome;
        }

        if !self.peers.contains_key(&batch.origin) {
            if self.sent > 0 {
                warn!(editor = %self.editor, peer = %batch.origin, "Batch from unknown peer");
                outcome
                    .warnings
                    .push(SessionWarning::UnknownPeer(batch.origin.clone()));
            }
            self.connect(batch.origin.clone());
        }

        if self.is_authority() {
            self.integrate(batch, &mut outcome);
        } else if batch.origin != *self.authority() {
            trace!(editor = %self.editor, peer = %batch.origin, "Waiting for the authority to relay batch");
        } else if !batch.is_ack() {
            self.follow(batch, &mut outcome);
        }
        outcome
    }

    /// An empty batch that only acknowledges what was received.
    pub fn ack_batch(&self) -> PatchBatch {
        PatchBatch {
            origin: self.editor.clone(),
            author: None,
            acks: self.acks(),
            patches: Vec::new(),
        }
    }

    fn acks(&self) -> BTreeMap<EditorId, u64> {
        self.peers
            .iter()
            .map(|(peer, channel)| (peer.clone(), channel.received))
            .collect()
    }

    /// Accept a peer's batch into the canonical history.
    fn integrate(&mut self, batch: &PatchBatch, outcome: &mut RemoteOutcome) {
        let origin = &batch.origin;
        let mut rebased = Vec::with_capacity(batch.patches.len());
        {
            let Some(channel) = self.peers.get_mut(origin) else {
                return;
            };
            channel.acknowledge(batch.acks.get(&self.editor).copied().unwrap_or(0));
            if batch.is_ack() {
                return;
            }

            for patch in &batch.patches {
                let mut incoming = vec![patch.clone()];
                for unseen in channel.pending.iter_mut() {
                    let remote_first = origin.has_priority_over(&unseen.author);
                    let (next, patches) = ot::transform_lists(&incoming, &unseen.patches, remote_first);
                    incoming = next;
                    unseen.patches = patches;
                }
                if incoming.is_empty() {
                    debug!(kind = patch.kind(), path = %patch.path(), "Remote patch dropped by conflict");
                    outcome.dropped += 1;
                }
                rebased.extend(incoming);
            }
            channel.received += batch.patches.len() as u64;
        }

        for patch in rebased {
            match apply_patch(&self.value, &patch) {
                Ok(next) => {
                    self.selection = self.track_selection(&next, &patch);
                    self.value = next;
                    outcome.applied.push(patch);
                }
                Err(error) => {
                    warn!(editor = %self.editor, %error, kind = patch.kind(), "Skipping remote patch");
                    outcome
                        .warnings
                        .push(SessionWarning::PatchRejected { patch, error });
                }
            }
        }

        for (peer, channel) in self.peers.iter_mut() {
            if peer != origin {
                channel.pending.extend(outcome.applied.iter().map(|patch| Unseen {
                    author: origin.clone(),
                    patches: vec![patch.clone()],
                }));
            }
        }
        outcome.relay = Some(PatchBatch {
            origin: self.editor.clone(),
            author: Some(origin.clone()),
            acks: self.acks(),
            patches: outcome.applied.clone(),
        });
    }

    /// Take a canonical batch from the authority.
    fn follow(&mut self, batch: &PatchBatch, outcome: &mut RemoteOutcome) {
        self.confirmed = replay(&self.confirmed, batch.patches.iter());

        let author = batch.authored_by();
        if *author == self.editor {
            trace!(editor = %self.editor, "Own batch confirmed");
            self.unconfirmed.pop_front();
        } else {
            let remote_first = author.has_priority_over(&self.editor);
            let mut groups: Vec<Vec<Patch>> = self.unconfirmed.iter().flatten().cloned().collect();
            let mut rebased = Vec::with_capacity(batch.patches.len());
            for patch in &batch.patches {
                let (incoming, next) = ot::rebase_through(std::slice::from_ref(patch), &groups, remote_first);
                groups = next;
                if incoming.is_empty() {
                    outcome.dropped += 1;
                }
                rebased.extend(incoming);
            }
            let mut groups = groups.into_iter();
            for group in self.unconfirmed.iter_mut().flatten() {
                if let Some(next) = groups.next() {
                    *group = next;
                }
            }

            let authority = self.authority().clone();
            if let Some(channel) = self.peers.get_mut(&authority) {
                channel.received += batch.patches.len() as u64;
            }

            for patch in rebased {
                match apply_patch(&self.value, &patch) {
                    Ok(next) => {
                        self.selection = self.track_selection(&next, &patch);
                        self.value = next;
                        outcome.applied.push(patch);
                    }
                    Err(error) => {
                        debug!(editor = %self.editor, %error, kind = patch.kind(), "Remote patch left to replay");
                    }
                }
            }
        }

        let replayed = replay(&self.confirmed, self.unconfirmed.iter().flatten().flatten());
        if replayed != self.value {
            debug!(editor = %self.editor, "Replaying unconfirmed batches over the confirmed value");
            let selection = self.selection.as_ref().and_then(|selection| {
                selection
                    .normalize(&replayed)
                    .or_else(|| fallback(&self.value, &replayed, &selection.focus))
            });
            match serde_json::to_value(&replayed) {
                Ok(value) => outcome.applied.push(Patch::set(Path::root(), value)),
                Err(error) => warn!(editor = %self.editor, %error, "Unable to describe replayed value"),
            }
            self.selection = selection;
            self.value = replayed;
        }
    }

    /// Selection after `patch` turned the current value into `next`.
    fn track_selection(&self, next: &Document, patch: &Patch) -> Option<Selection> {
        let selection = self.selection.as_ref()?;
        let moved = match rebase_selection(selection, patch) {
            SelectionUpdate::Unchanged => selection.clone(),
            SelectionUpdate::Moved(moved) => moved,
            SelectionUpdate::Removed => return fallback(&self.value, next, &selection.focus),
        };
        moved
            .normalize(next)
            .or_else(|| fallback(&self.value, next, &selection.focus))
    }
}

/// Apply `patches` in order, skipping those that no longer fit.
fn replay<'a>(base: &Document, patches: impl IntoIterator<Item = &'a Patch>) -> Document {
    patches.into_iter().fold(base.clone(), |value, patch| match apply_patch(&value, patch) {
        Ok(next) => next,
        Err(error) => {
            trace!(%error, kind = patch.kind(), "Patch skipped on replay");
            value
        }
    })
}
