use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::slots::{SlotName, SlotSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationFamily {
    Casual,
    Generate,
    Edit,
    Upscale,
    Enlarge,
    Crop,
    RemoveBackground,
    None,
    MultiStep,
}

impl OperationFamily {
    /// Families that operate on exactly one input image bound to the subject slot.
    pub fn is_single_image(&self) -> bool {
        matches!(
            self,
            OperationFamily::Upscale
                | OperationFamily::Enlarge
                | OperationFamily::Crop
                | OperationFamily::RemoveBackground
        )
    }

    /// Families that reach the capability dispatcher as a single step.
    pub fn is_dispatchable(&self) -> bool {
        !matches!(
            self,
            OperationFamily::Casual | OperationFamily::None | OperationFamily::MultiStep
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationFamily::Casual => "casual",
            OperationFamily::Generate => "generate",
            OperationFamily::Edit => "edit",
            OperationFamily::Upscale => "upscale",
            OperationFamily::Enlarge => "enlarge",
            OperationFamily::Crop => "crop",
            OperationFamily::RemoveBackground => "remove_background",
            OperationFamily::None => "none",
            OperationFamily::MultiStep => "multi_step",
        }
    }

    /// Strict identifier parse used for delegate answers; no aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "casual" => Some(OperationFamily::Casual),
            "generate" => Some(OperationFamily::Generate),
            "edit" => Some(OperationFamily::Edit),
            "upscale" => Some(OperationFamily::Upscale),
            "enlarge" => Some(OperationFamily::Enlarge),
            "crop" => Some(OperationFamily::Crop),
            "remove_background" => Some(OperationFamily::RemoveBackground),
            "none" => Some(OperationFamily::None),
            "multi_step" => Some(OperationFamily::MultiStep),
            _ => None,
        }
    }
}

impl fmt::Display for OperationFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed enumeration of downstream workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowId {
    PromptOnly,
    SubjectOnly,
    SubjectStyle,
    SubjectPalette,
    StylePalette,
    AllThree,
    Upscale,
    Enlarge,
    Crop,
    RemoveBackground,
}

impl WorkflowId {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowId::PromptOnly => "prompt_only",
            WorkflowId::SubjectOnly => "subject_only",
            WorkflowId::SubjectStyle => "subject_style",
            WorkflowId::SubjectPalette => "subject_palette",
            WorkflowId::StylePalette => "style_palette",
            WorkflowId::AllThree => "all_three",
            WorkflowId::Upscale => "upscale",
            WorkflowId::Enlarge => "enlarge",
            WorkflowId::Crop => "crop",
            WorkflowId::RemoveBackground => "remove_background",
        }
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlotBinding {
    Value { source: SlotSource, url: String },
    /// Bound at execution time to the primary artifact of an earlier step.
    PreviousOutput { step: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub operation_id: OperationFamily,
    pub workflow: WorkflowId,
    pub slot_bindings: BTreeMap<SlotName, SlotBinding>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl Step {
    pub fn chained_slot(&self) -> Option<SlotName> {
        self.slot_bindings
            .iter()
            .find(|(_, binding)| matches!(binding, SlotBinding::PreviousOutput { .. }))
            .map(|(slot, _)| *slot)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub steps: Vec<Step>,
    pub chained: bool,
}

impl WorkflowPlan {
    pub fn single(step: Step) -> Self {
        Self {
            steps: vec![step],
            chained: false,
        }
    }

    pub fn chained(steps: Vec<Step>) -> Self {
        let chained = steps.len() > 1;
        Self { steps, chained }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub step_index: usize,
    pub operation_id: OperationFamily,
    pub workflow: WorkflowId,
    pub status: StepStatus,
    pub artifact: Option<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{json, Map};

    use super::{OperationFamily, SlotBinding, Step, WorkflowId, WorkflowPlan};
    use crate::slots::{SlotName, SlotSource};

    #[test]
    fn family_parse_is_strict() {
        assert_eq!(
            OperationFamily::parse("Remove_Background"),
            Some(OperationFamily::RemoveBackground)
        );
        assert_eq!(
            OperationFamily::parse("multi_step"),
            Some(OperationFamily::MultiStep)
        );
        assert_eq!(OperationFamily::parse("remove background"), None);
        assert_eq!(OperationFamily::parse("upscaling"), None);
    }

    #[test]
    fn step_serializes_bindings_by_kind() -> anyhow::Result<()> {
        let mut bindings = BTreeMap::new();
        bindings.insert(SlotName::Subject, SlotBinding::PreviousOutput { step: 0 });
        bindings.insert(
            SlotName::Style,
            SlotBinding::Value {
                source: SlotSource::Preset,
                url: "/library/styles/floral".to_string(),
            },
        );
        let step = Step {
            index: 1,
            operation_id: OperationFamily::Crop,
            workflow: WorkflowId::Crop,
            slot_bindings: bindings,
            parameters: Map::new(),
        };
        assert_eq!(step.chained_slot(), Some(SlotName::Subject));

        let value = serde_json::to_value(&step)?;
        assert_eq!(
            value["slot_bindings"]["subject"],
            json!({"kind": "previous_output", "step": 0})
        );
        assert_eq!(value["slot_bindings"]["style"]["source"], json!("preset"));
        assert_eq!(value["operation_id"], json!("crop"));
        Ok(())
    }

    #[test]
    fn chained_flag_follows_step_count() {
        let step = |index| Step {
            index,
            operation_id: OperationFamily::Upscale,
            workflow: WorkflowId::Upscale,
            slot_bindings: BTreeMap::new(),
            parameters: Map::new(),
        };
        assert!(!WorkflowPlan::chained(vec![step(0)]).chained);
        assert!(WorkflowPlan::chained(vec![step(0), step(1)]).chained);
    }
}
