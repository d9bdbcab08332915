use std::fmt;

use serde::{Deserialize, Serialize};

/// The three semantic roles an operation input can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotName {
    Subject,
    Style,
    Palette,
}

impl SlotName {
    pub const ALL: [SlotName; 3] = [SlotName::Subject, SlotName::Style, SlotName::Palette];

    pub fn as_str(&self) -> &'static str {
        match self {
            SlotName::Subject => "subject",
            SlotName::Style => "style",
            SlotName::Palette => "palette",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "subject" | "product" | "object" => Some(SlotName::Subject),
            "style" => Some(SlotName::Style),
            "palette" | "colors" | "colours" | "color" | "colour" => Some(SlotName::Palette),
            _ => None,
        }
    }
}

impl fmt::Display for SlotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotSource {
    #[default]
    None,
    Upload,
    Preset,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResolvedSlot {
    pub filled_from: SlotSource,
    pub value: Option<String>,
}

impl ResolvedSlot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn filled(source: SlotSource, value: impl Into<String>) -> Self {
        Self {
            filled_from: source,
            value: Some(value.into()),
        }
    }

    pub fn is_filled(&self) -> bool {
        self.filled_from != SlotSource::None && self.value.is_some()
    }
}

/// Workflow archetype matching a subject/style/palette fill pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowArchetype {
    SubjectOnly,
    SubjectStyle,
    SubjectPalette,
    StylePalette,
    AllThree,
    PromptOnly,
}

impl WorkflowArchetype {
    pub fn from_pattern(subject: bool, style: bool, palette: bool) -> Self {
        match (subject, style, palette) {
            (true, false, false) => WorkflowArchetype::SubjectOnly,
            (true, true, false) => WorkflowArchetype::SubjectStyle,
            (true, false, true) => WorkflowArchetype::SubjectPalette,
            (false, true, true) => WorkflowArchetype::StylePalette,
            (true, true, true) => WorkflowArchetype::AllThree,
            _ => WorkflowArchetype::PromptOnly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowArchetype::SubjectOnly => "subject_only",
            WorkflowArchetype::SubjectStyle => "subject_style",
            WorkflowArchetype::SubjectPalette => "subject_palette",
            WorkflowArchetype::StylePalette => "style_palette",
            WorkflowArchetype::AllThree => "all_three",
            WorkflowArchetype::PromptOnly => "prompt_only",
        }
    }
}

/// Name of the precedence rule that decided where the reference landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentRule {
    ExplicitInstruction,
    CatalogSubjectSwitch,
    InspirationFirstMissing,
    Modification,
    ReferenceUnused,
    NoReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAssignment {
    pub subject: ResolvedSlot,
    pub style: ResolvedSlot,
    pub palette: ResolvedSlot,
    pub workflow_hint: WorkflowArchetype,
    pub rule: AssignmentRule,
}

impl SlotAssignment {
    pub fn slot(&self, name: SlotName) -> &ResolvedSlot {
        match name {
            SlotName::Subject => &self.subject,
            SlotName::Style => &self.style,
            SlotName::Palette => &self.palette,
        }
    }

    pub fn slot_mut(&mut self, name: SlotName) -> &mut ResolvedSlot {
        match name {
            SlotName::Subject => &mut self.subject,
            SlotName::Style => &mut self.style,
            SlotName::Palette => &mut self.palette,
        }
    }

    pub fn is_filled(&self, name: SlotName) -> bool {
        self.slot(name).is_filled()
    }

    pub fn pattern(&self) -> (bool, bool, bool) {
        (
            self.subject.is_filled(),
            self.style.is_filled(),
            self.palette.is_filled(),
        )
    }

    /// Filled slots in subject, style, palette order.
    pub fn filled(&self) -> Vec<(SlotName, &ResolvedSlot)> {
        SlotName::ALL
            .iter()
            .map(|name| (*name, self.slot(*name)))
            .filter(|(_, slot)| slot.is_filled())
            .collect()
    }
}
