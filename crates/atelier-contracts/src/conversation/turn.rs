use serde::{Deserialize, Serialize};

use crate::plan::OperationFamily;
use crate::slots::SlotName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    /// Role the uploader declared for this artifact, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<SlotName>,
}

impl Attachment {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            role: None,
        }
    }

    pub fn with_role(url: impl Into<String>, role: SlotName) -> Self {
        Self {
            url: url.into(),
            role: Some(role),
        }
    }
}

/// One recorded exchange. Immutable once appended to a history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub text: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub role: Role,
    /// Explicit pointer (a turn timestamp) this turn was issued with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<i64>,
    /// Family that produced this turn's artifacts (assistant turns).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationFamily>,
}

impl Turn {
    pub fn user(text: impl Into<String>, timestamp: i64) -> Self {
        Self::new(Role::User, text, timestamp)
    }

    pub fn assistant(text: impl Into<String>, timestamp: i64) -> Self {
        Self::new(Role::Assistant, text, timestamp)
    }

    fn new(role: Role, text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            text: text.into(),
            timestamp,
            attachments: Vec::new(),
            role,
            reference: None,
            operation: None,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_reference(mut self, timestamp: i64) -> Self {
        self.reference = Some(timestamp);
        self
    }

    pub fn with_operation(mut self, operation: OperationFamily) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    pub fn has_artifacts(&self) -> bool {
        !self.attachments.is_empty()
    }

    pub fn artifact_urls(&self) -> impl Iterator<Item = &str> {
        self.attachments.iter().map(|item| item.url.as_str())
    }
}

/// Ordered, read-only view over a conversation's turns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn get(&self, index: usize) -> Option<&Turn> {
        self.turns.get(index)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last_assistant_with_artifacts(&self) -> Option<usize> {
        self.turns
            .iter()
            .rposition(|turn| turn.is_assistant() && turn.has_artifacts())
    }

    /// Index of the turn whose timestamp is closest to `timestamp`, within `window_ms`.
    /// Ties go to the later turn.
    pub fn nearest_to(&self, timestamp: i64, window_ms: i64) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (idx, turn) in self.turns.iter().enumerate() {
            let distance = turn.timestamp.abs_diff(timestamp);
            if distance > window_ms.unsigned_abs() {
                continue;
            }
            match best {
                Some((_, best_distance)) if distance > best_distance => {}
                _ => best = Some((idx, distance)),
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Latest turn carrying `url` among its attachments.
    pub fn find_artifact(&self, url: &str) -> Option<usize> {
        self.turns
            .iter()
            .rposition(|turn| turn.artifact_urls().any(|candidate| candidate == url))
    }

    /// Nearest user turn at or before `index`.
    pub fn request_for(&self, index: usize) -> Option<usize> {
        let end = index.min(self.turns.len().checked_sub(1)?);
        (0..=end).rev().find(|idx| self.turns[*idx].is_user())
    }

    pub fn last_operation(&self) -> Option<OperationFamily> {
        self.turns
            .iter()
            .rev()
            .filter(|turn| turn.is_assistant())
            .find_map(|turn| turn.operation)
    }
}

impl From<Vec<Turn>> for ConversationHistory {
    fn from(turns: Vec<Turn>) -> Self {
        Self::new(turns)
    }
}

#[cfg(test)]
mod tests {
    use super::{Attachment, ConversationHistory, Turn};
    use crate::plan::OperationFamily;

    fn history() -> ConversationHistory {
        ConversationHistory::new(vec![
            Turn::user("a red mug", 1_000),
            Turn::assistant("here you go", 4_000)
                .with_attachment(Attachment::new("https://cdn/a.png"))
                .with_operation(OperationFamily::Generate),
            Turn::user("upscale it", 10_000),
            Turn::assistant("done", 15_000)
                .with_attachment(Attachment::new("https://cdn/b.png"))
                .with_operation(OperationFamily::Upscale),
            Turn::assistant("thanks for waiting", 16_000),
        ])
    }

    #[test]
    fn nearest_to_respects_window() {
        let history = history();
        assert_eq!(history.nearest_to(9_500, 1_000), Some(2));
        assert_eq!(history.nearest_to(7_000, 1_000), None);
    }

    #[test]
    fn nearest_to_tolerates_extreme_timestamps() {
        let history = history();
        assert_eq!(history.nearest_to(i64::MIN, 5_000), None);
        assert_eq!(history.nearest_to(i64::MAX, 5_000), None);
        assert_eq!(history.nearest_to(0, i64::MAX), Some(0));
    }

    #[test]
    fn lookups_walk_from_the_end() {
        let history = history();
        assert_eq!(history.last_assistant_with_artifacts(), Some(3));
        assert_eq!(history.find_artifact("https://cdn/a.png"), Some(1));
        assert_eq!(history.request_for(3), Some(2));
        assert_eq!(history.request_for(99), Some(2));
        assert_eq!(history.last_operation(), Some(OperationFamily::Upscale));
    }

    #[test]
    fn minimal_turn_shape_deserializes() -> anyhow::Result<()> {
        let turn: Turn = serde_json::from_str(r#"{"text":"hi","timestamp":5,"role":"user"}"#)?;
        assert!(turn.attachments.is_empty());
        assert!(turn.reference.is_none());
        assert!(turn.is_user());
        Ok(())
    }
}
