use atelier_contracts::plan::OperationFamily as Op;
use atelier_contracts::plan::{OperationFamily, WorkflowId};
use atelier_contracts::slots::SlotAssignment;

use self::Fill::{Any, Empty, Filled};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fill {
    Filled,
    Empty,
    Any,
}

impl Fill {
    fn accepts(self, filled: bool) -> bool {
        match self {
            Fill::Filled => filled,
            Fill::Empty => !filled,
            Fill::Any => true,
        }
    }
}

const COMPOSE: &[OperationFamily] = &[Op::Generate, Op::Edit];

/// `(families, [subject, style, palette], workflow)`; first matching row wins.
/// Combinations without a row fall back to `WorkflowId::PromptOnly`.
const WORKFLOW_TABLE: &[(&[OperationFamily], [Fill; 3], WorkflowId)] = &[
    (&[Op::Upscale], [Filled, Any, Any], WorkflowId::Upscale),
    (&[Op::Enlarge], [Filled, Any, Any], WorkflowId::Enlarge),
    (&[Op::Crop], [Filled, Any, Any], WorkflowId::Crop),
    (
        &[Op::RemoveBackground],
        [Filled, Any, Any],
        WorkflowId::RemoveBackground,
    ),
    (COMPOSE, [Filled, Filled, Filled], WorkflowId::AllThree),
    (COMPOSE, [Filled, Filled, Empty], WorkflowId::SubjectStyle),
    (COMPOSE, [Filled, Empty, Filled], WorkflowId::SubjectPalette),
    (COMPOSE, [Filled, Empty, Empty], WorkflowId::SubjectOnly),
    (COMPOSE, [Empty, Filled, Filled], WorkflowId::StylePalette),
];

pub fn select_workflow(family: OperationFamily, pattern: (bool, bool, bool)) -> WorkflowId {
    let (subject, style, palette) = pattern;
    WORKFLOW_TABLE
        .iter()
        .find(|(families, fills, _)| {
            families.contains(&family)
                && fills[0].accepts(subject)
                && fills[1].accepts(style)
                && fills[2].accepts(palette)
        })
        .map(|(_, _, workflow)| *workflow)
        .unwrap_or(WorkflowId::PromptOnly)
}

pub fn workflow_for(family: OperationFamily, assignment: &SlotAssignment) -> WorkflowId {
    select_workflow(family, assignment.pattern())
}
