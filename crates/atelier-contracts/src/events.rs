use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::{OperationFamily, Step, StepStatus, WorkflowId};
use crate::slots::{AssignmentRule, SlotName, WorkflowArchetype};

/// Milestones of one turn, in the order a successful turn emits them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    TurnStarted {
        text: String,
        #[serde(default)]
        uploads: BTreeMap<SlotName, String>,
        #[serde(default)]
        presets: BTreeMap<SlotName, String>,
        has_reference_payload: bool,
        history_len: usize,
    },
    ReferenceResolved {
        kind: String,
        anchor_timestamp: Option<i64>,
        #[serde(default)]
        artifacts: Vec<String>,
        chain_length: usize,
    },
    Classified {
        family: OperationFamily,
        confidence: f64,
        matcher: String,
        source: String,
        rule: AssignmentRule,
        workflow_hint: WorkflowArchetype,
    },
    PlanCreated {
        steps: Vec<Step>,
        chained: bool,
        dispatcher: String,
    },
    StepStarted {
        step: usize,
        operation: OperationFamily,
        workflow: WorkflowId,
    },
    StepFinished {
        step: usize,
        status: StepStatus,
        artifact: Option<String>,
        error: Option<String>,
        elapsed_ms: u64,
    },
    PlanFinished {
        completed: bool,
        cancelled: bool,
        /// Step that failed, or the step cancellation landed before.
        stopped_at: Option<usize>,
        steps_total: usize,
        steps_succeeded: usize,
    },
}

impl TurnEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::TurnStarted { .. } => "turn_started",
            TurnEvent::ReferenceResolved { .. } => "reference_resolved",
            TurnEvent::Classified { .. } => "classified",
            TurnEvent::PlanCreated { .. } => "plan_created",
            TurnEvent::StepStarted { .. } => "step_started",
            TurnEvent::StepFinished { .. } => "step_finished",
            TurnEvent::PlanFinished { .. } => "plan_finished",
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(flatten)]
    event: &'a TurnEvent,
    conversation_id: &'a str,
    ts: String,
}

/// Appends turn milestones to a conversation's `events.jsonl`, one compact
/// object per line. The file is opened on the first event and kept open.
#[derive(Debug, Clone)]
pub struct EventWriter {
    conversation_id: Arc<str>,
    sink: Option<Arc<Sink>>,
}

#[derive(Debug)]
struct Sink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Arc::from(conversation_id.into()),
            sink: Some(Arc::new(Sink {
                path: path.into(),
                file: Mutex::new(None),
            })),
        }
    }

    /// Writer for inspection runs: events are built and returned but never written.
    pub fn disabled(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Arc::from(conversation_id.into()),
            sink: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_deref().map(|sink| sink.path.as_path())
    }

    pub fn is_disabled(&self) -> bool {
        self.sink.is_none()
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn emit(&self, event: &TurnEvent) -> Result<Value> {
        let envelope = Envelope {
            event,
            conversation_id: &self.conversation_id,
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
        };
        let record = serde_json::to_value(&envelope)?;
        if let Some(sink) = &self.sink {
            sink.append(&record)?;
        }
        Ok(record)
    }
}

impl Sink {
    fn append(&self, record: &Value) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut guard = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("opening event log {}", self.path.display()))?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

/// Reads back the milestones in an event log, skipping lines that no longer parse.
pub fn read_events(path: &Path) -> Result<Vec<TurnEvent>> {
    let file = File::open(path).with_context(|| format!("opening event log {}", path.display()))?;
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Ok(event) = serde_json::from_str::<TurnEvent>(&line) {
            events.push(event);
        }
    }
    Ok(events)
}
