//! collab-sim: deterministic replay of collaborative editing scenarios.
//!
//! A scenario names a set of editors, a starting value and a script of
//! selections, edits and deliveries. Batches travel between editors as JSON
//! through per-pair queues, so delivery order is exactly what the script says.
//! After the script runs every queue is drained and all editors must agree.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path as FsPath;
use thiserror::Error;
use tracing::{debug, info, warn};

use collab_core::document::{Block, Path};
use collab_core::session::SessionError;
use collab_core::{Document, EditIntent, EditorId, EditorSession, Key, PatchBatch, Point, Selection, SessionConfig};

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Failed to read scenario: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON scenario: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid YAML scenario: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Unsupported scenario format: {0:?}")]
    UnsupportedFormat(String),

    #[error("Invalid editor id {0:?}")]
    InvalidEditor(String),

    #[error("Unknown editor: {0}")]
    UnknownEditor(EditorId),

    #[error("Edit by {editor} failed: {source}")]
    Edit {
        editor: EditorId,
        #[source]
        source: SessionError,
    },

    #[error("Nothing queued from {from} to {to}")]
    NothingQueued { from: EditorId, to: EditorId },

    #[error("Step {step}: {editor} has {actual:?}, expected {expected:?}")]
    Expectation {
        step: usize,
        editor: EditorId,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("{a} and {b} diverged: {a_texts:?} vs {b_texts:?}")]
    Diverged {
        a: EditorId,
        b: EditorId,
        a_texts: Vec<String>,
        b_texts: Vec<String>,
    },
}

pub type Result<T> = std::result::Result<T, SimError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    pub editors: Vec<String>,
    pub value: Document,
    pub steps: Vec<Step>,
}

/// Position inside a span, in code points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caret {
    pub block: String,
    pub span: String,
    pub offset: usize,
}

impl Caret {
    fn point(&self) -> Point {
        Point::new(Path::child(&Key::from(self.block.as_str()), &Key::from(self.span.as_str())), self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "camelCase")]
pub enum Step {
    /// Move an editor's selection; `focus` extends it into a range.
    Select {
        editor: String,
        at: Caret,
        #[serde(default)]
        focus: Option<Caret>,
    },
    Edit {
        editor: String,
        intent: EditIntent,
    },
    /// Deliver the oldest `count` batches queued from one editor to another.
    Deliver {
        from: String,
        to: String,
        #[serde(default = "one")]
        count: usize,
    },
    /// Deliver everything queued.
    Sync,
    /// Check the text of one editor (or all of them).
    Expect {
        #[serde(default)]
        editor: Option<String>,
        texts: Vec<String>,
    },
}

fn one() -> usize {
    1
}

/// Outcome of a successful replay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub name: String,
    pub value: Document,
    pub delivered: usize,
    pub warnings: Vec<String>,
}

/// Load a scenario from a `.json`, `.yaml` or `.yml` file.
pub fn load(path: &FsPath) -> Result<Scenario> {
    let contents = std::fs::read_to_string(path)?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match extension.as_str() {
        "json" => Ok(serde_json::from_str(&contents)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(&contents)?),
        other => Err(SimError::UnsupportedFormat(other.to_string())),
    }
}

/// Run every step of `scenario`, drain all queues and check convergence.
pub fn replay(scenario: &Scenario, config: &SessionConfig) -> Result<Report> {
    let mut simulation = Simulation::new(scenario, config)?;
    info!(name = %scenario.name, editors = scenario.editors.len(), "Replaying scenario");

    for (index, step) in scenario.steps.iter().enumerate() {
        debug!(step = index, ?step, "Running step");
        simulation.run(index, step)?;
    }

    simulation.sync()?;
    let value = simulation.converged()?;
    Ok(Report {
        name: scenario.name.clone(),
        value,
        delivered: simulation.delivered,
        warnings: simulation.warnings,
    })
}

/// Rendered text of each block; object blocks show as `[type]`.
pub fn texts(value: &Document) -> Vec<String> {
    value
        .blocks()
        .iter()
        .map(|block| match block {
            Block::Text(text) => text.plain_text(),
            Block::Object(object) => format!("[{}]", object.block_type),
        })
        .collect()
}

struct Simulation {
    sessions: BTreeMap<EditorId, EditorSession>,
    /// Serialized batches waiting to travel from one editor to another.
    queues: BTreeMap<(EditorId, EditorId), VecDeque<String>>,
    delivered: usize,
    warnings: Vec<String>,
}

impl Simulation {
    fn new(scenario: &Scenario, config: &SessionConfig) -> Result<Self> {
        let editors = scenario
            .editors
            .iter()
            .map(|name| name.parse::<EditorId>().map_err(|_| SimError::InvalidEditor(name.clone())))
            .collect::<Result<Vec<_>>>()?;

        let mut sessions = BTreeMap::new();
        for editor in &editors {
            let mut session = EditorSession::with_config(editor.clone(), scenario.value.clone(), config);
            for peer in &editors {
                session.connect(peer.clone());
            }
            sessions.insert(editor.clone(), session);
        }

        Ok(Self {
            sessions,
            queues: BTreeMap::new(),
            delivered: 0,
            warnings: Vec::new(),
        })
    }

    fn run(&mut self, index: usize, step: &Step) -> Result<()> {
        match step {
            Step::Select { editor, at, focus } => {
                let anchor = at.point();
                let focus = focus.as_ref().map_or_else(|| anchor.clone(), Caret::point);
                self.session(editor)?.set_selection(Some(Selection::new(anchor, focus)));
            }
            Step::Edit { editor, intent } => {
                let session = self.session(editor)?;
                let batch = session.apply_local(intent).map_err(|source| SimError::Edit {
                    editor: session.editor().clone(),
                    source,
                })?;
                self.post(&batch)?;
            }
            Step::Deliver { from, to, count } => {
                let from = self.editor(from)?;
                let to = self.editor(to)?;
                for _ in 0..*count {
                    self.deliver(&from, &to)?;
                }
            }
            Step::Sync => self.sync()?,
            Step::Expect { editor, texts: expected } => {
                let editors: Vec<EditorId> = match editor {
                    Some(name) => vec![self.editor(name)?],
                    None => self.sessions.keys().cloned().collect(),
                };
                for editor in editors {
                    let actual = texts(self.sessions[&editor].value());
                    if actual != *expected {
                        return Err(SimError::Expectation {
                            step: index,
                            editor,
                            expected: expected.clone(),
                            actual,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn editor(&self, name: &str) -> Result<EditorId> {
        let editor: EditorId = name.parse().map_err(|_| SimError::InvalidEditor(name.to_string()))?;
        if !self.sessions.contains_key(&editor) {
            return Err(SimError::UnknownEditor(editor));
        }
        Ok(editor)
    }

    fn session(&mut self, name: &str) -> Result<&mut EditorSession> {
        let editor = self.editor(name)?;
        self.sessions.get_mut(&editor).ok_or(SimError::UnknownEditor(editor))
    }

    fn post(&mut self, batch: &PatchBatch) -> Result<()> {
        let json = batch.to_json()?;
        for peer in self.sessions.keys() {
            if *peer != batch.origin {
                self.queues
                    .entry((batch.origin.clone(), peer.clone()))
                    .or_default()
                    .push_back(json.clone());
            }
        }
        Ok(())
    }

    fn deliver(&mut self, from: &EditorId, to: &EditorId) -> Result<()> {
        let json = self
            .queues
            .get_mut(&(from.clone(), to.clone()))
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| SimError::NothingQueued {
                from: from.clone(),
                to: to.clone(),
            })?;
        let batch = PatchBatch::from_json(&json)?;

        let session = self
            .sessions
            .get_mut(to)
            .ok_or_else(|| SimError::UnknownEditor(to.clone()))?;
        let outcome = session.apply_remote(&batch);
        for warning in &outcome.warnings {
            warn!(editor = %to, "{}", warning);
            self.warnings.push(format!("{to}: {warning}"));
        }
        let reply = outcome
            .relay
            .or_else(|| (!batch.is_ack()).then(|| session.ack_batch()));

        self.delivered += 1;
        if let Some(reply) = reply {
            self.post(&reply)?;
        }
        Ok(())
    }

    /// Deliver queued batches, oldest pair first, until every queue is empty.
    fn sync(&mut self) -> Result<()> {
        while let Some((from, to)) = self
            .queues
            .iter()
            .find(|(_, queue)| !queue.is_empty())
            .map(|(pair, _)| pair.clone())
        {
            self.deliver(&from, &to)?;
        }
        Ok(())
    }

    fn converged(&self) -> Result<Document> {
        let mut sessions = self.sessions.values();
        let Some(first) = sessions.next() else {
            return Ok(Document::default());
        };
        for other in sessions {
            if other.value() != first.value() {
                return Err(SimError::Diverged {
                    a: first.editor().clone(),
                    b: other.editor().clone(),
                    a_texts: texts(first.value()),
                    b_texts: texts(other.value()),
                });
            }
        }
        Ok(first.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_core::document::{Span, TextBlock};

    fn hello() -> Document {
        Document::new(vec![
            TextBlock::new("b0", vec![Span::new("s0", "Hello world").into()]).into(),
        ])
    }

    fn caret(offset: usize) -> Caret {
        Caret {
            block: "b0".into(),
            span: "s0".into(),
            offset,
        }
    }

    fn scenario(steps: Vec<Step>) -> Scenario {
        Scenario {
            name: "test".into(),
            editors: vec!["A".into(), "B".into()],
            value: hello(),
            steps,
        }
    }

    fn select(editor: &str, offset: usize) -> Step {
        Step::Select {
            editor: editor.into(),
            at: caret(offset),
            focus: None,
        }
    }

    fn type_text(editor: &str, text: &str) -> Step {
        Step::Edit {
            editor: editor.into(),
            intent: EditIntent::InsertText { text: text.into() },
        }
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let report = replay(
            &scenario(vec![
                select("A", 0),
                select("B", 11),
                type_text("A", ">> "),
                type_text("B", "!"),
            ]),
            &SessionConfig::default(),
        )
        .unwrap();

        assert_eq!(texts(&report.value), [">> Hello world!"]);
        // Two edits plus their acks.
        assert_eq!(report.delivered, 4);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_expectation_checks_one_editor() {
        let result = replay(
            &scenario(vec![
                select("A", 11),
                type_text("A", "!"),
                Step::Expect {
                    editor: Some("B".into()),
                    texts: vec!["Hello world!".into()],
                },
            ]),
            &SessionConfig::default(),
        );
        assert!(matches!(result, Err(SimError::Expectation { step: 2, .. })));
    }

    #[test]
    fn test_deliver_requires_a_batch() {
        let result = replay(
            &scenario(vec![Step::Deliver {
                from: "A".into(),
                to: "B".into(),
                count: 1,
            }]),
            &SessionConfig::default(),
        );
        assert!(matches!(result, Err(SimError::NothingQueued { .. })));
    }

    #[test]
    fn test_unknown_editor() {
        let result = replay(&scenario(vec![select("C", 0)]), &SessionConfig::default());
        assert!(matches!(result, Err(SimError::UnknownEditor(_))));
    }

    #[test]
    fn test_edit_errors_carry_editor() {
        let result = replay(&scenario(vec![type_text("A", "x")]), &SessionConfig::default());
        assert!(matches!(result, Err(SimError::Edit { .. })));
    }
}
