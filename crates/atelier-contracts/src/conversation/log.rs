use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::turn::{ConversationHistory, Turn};

/// Recorded outcome of one orchestrated turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub turn_timestamp: i64,
    pub recorded_at: String,
    pub outcome: Value,
}

/// File-backed conversation document: turns plus the outcomes recorded for them.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationLog {
    pub path: PathBuf,
    pub schema_version: u64,
    pub conversation_id: String,
    pub created_at: String,
    pub turns: Vec<Turn>,
    pub executions: Vec<ExecutionRecord>,
}

impl ConversationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_version: 1,
            conversation_id: Uuid::new_v4().to_string(),
            created_at: now_utc_iso(),
            turns: Vec::new(),
            executions: Vec::new(),
        }
    }

    /// Loads the document at `path`, keeping every entry that still parses.
    /// A missing or unreadable file yields an empty conversation.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut log = Self::new(path.clone());
        let payload = read_json(&path).unwrap_or(Value::Object(Map::new()));
        let Some(obj) = payload.as_object() else {
            return log;
        };

        log.schema_version = obj
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(log.schema_version);
        log.conversation_id = obj
            .get("conversation_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(log.conversation_id);
        log.created_at = obj
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(log.created_at);

        if let Some(turns) = obj.get("turns").and_then(Value::as_array) {
            for item in turns {
                if let Ok(parsed) = serde_json::from_value::<Turn>(item.clone()) {
                    log.turns.push(parsed);
                }
            }
        }
        if let Some(executions) = obj.get("executions").and_then(Value::as_array) {
            for item in executions {
                if let Ok(parsed) = serde_json::from_value::<ExecutionRecord>(item.clone()) {
                    log.executions.push(parsed);
                }
            }
        }
        log
    }

    pub fn history(&self) -> ConversationHistory {
        ConversationHistory::new(self.turns.clone())
    }

    pub fn append_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn record_outcome(&mut self, turn_timestamp: i64, outcome: Value) {
        self.executions.push(ExecutionRecord {
            turn_timestamp,
            recorded_at: now_utc_iso(),
            outcome,
        });
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let mut payload = Map::new();
        payload.insert(
            "schema_version".to_string(),
            Value::Number(self.schema_version.into()),
        );
        payload.insert(
            "conversation_id".to_string(),
            Value::String(self.conversation_id.clone()),
        );
        payload.insert(
            "created_at".to_string(),
            Value::String(self.created_at.clone()),
        );
        payload.insert("turns".to_string(), serde_json::to_value(&self.turns)?);
        payload.insert(
            "executions".to_string(),
            serde_json::to_value(&self.executions)?,
        );
        write_json(&self.path, Value::Object(payload))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json(path: &Path, payload: Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}
