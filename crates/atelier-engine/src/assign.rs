//! Slot assignment: decides which input source owns each of the subject, style
//! and palette slots.
//!
//! Fresh uploads beat presets, then the rows of [`PRECEDENCE`] are evaluated top
//! to bottom and the first row whose predicate holds decides where the reference
//! lands. Each row is independently testable and ties never depend on iteration
//! order.

use std::collections::BTreeMap;

use atelier_contracts::plan::OperationFamily;
use atelier_contracts::slots::{
    AssignmentRule, ResolvedSlot, SlotAssignment, SlotName, SlotSource, WorkflowArchetype,
};
use serde::{Deserialize, Serialize};

use crate::reference::ResolvedReference;

/// Fresh inputs supplied with the current turn, keyed by declared slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnInputs {
    #[serde(default)]
    pub uploads: BTreeMap<SlotName, String>,
    #[serde(default)]
    pub presets: BTreeMap<SlotName, String>,
}

impl TurnInputs {
    pub fn with_upload(mut self, slot: SlotName, url: impl Into<String>) -> Self {
        self.uploads.insert(slot, url.into());
        self
    }

    pub fn with_preset(mut self, slot: SlotName, value: impl Into<String>) -> Self {
        self.presets.insert(slot, value.into());
        self
    }

    pub fn has_uploads(&self) -> bool {
        !self.uploads.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.presets.is_empty()
    }

    /// Slots this turn supplies from any source.
    pub fn supplied_slots(&self) -> Vec<SlotName> {
        SlotName::ALL
            .iter()
            .copied()
            .filter(|slot| self.uploads.contains_key(slot) || self.presets.contains_key(slot))
            .collect()
    }
}

pub struct AssignmentRequest<'a> {
    pub inputs: &'a TurnInputs,
    pub reference: &'a ResolvedReference,
    pub family: OperationFamily,
    /// Slot named by a "use the reference for X only" instruction.
    pub instruction: Option<SlotName>,
}

struct Draft<'a> {
    request: &'a AssignmentRequest<'a>,
    assignment: SlotAssignment,
    inherited: BTreeMap<SlotName, String>,
}

impl Draft<'_> {
    fn reference_artifact(&self) -> Option<&str> {
        self.request.reference.primary_artifact()
    }

    fn filled(&self, slot: SlotName) -> bool {
        self.assignment.is_filled(slot)
    }

    fn bind_reference(&mut self, slot: SlotName) {
        if let Some(url) = self.request.reference.primary_artifact() {
            *self.assignment.slot_mut(slot) = ResolvedSlot::filled(SlotSource::Reference, url);
        }
    }
}

type Predicate = fn(&Draft<'_>) -> bool;
type Outcome = fn(&mut Draft<'_>);

/// Ordered `(rule, predicate, outcome)` rows; first match wins.
const PRECEDENCE: &[(AssignmentRule, Predicate, Outcome)] = &[
    (
        AssignmentRule::ExplicitInstruction,
        explicit_instruction_applies,
        apply_explicit_instruction,
    ),
    (
        AssignmentRule::CatalogSubjectSwitch,
        catalog_subject_switched,
        fill_first_missing_role,
    ),
    (
        AssignmentRule::InspirationFirstMissing,
        inspiration_applies,
        fill_first_missing_role,
    ),
    (
        AssignmentRule::Modification,
        modification_applies,
        apply_modification,
    ),
    (
        AssignmentRule::ReferenceUnused,
        reference_has_artifact,
        leave_reference_unused,
    ),
    (AssignmentRule::NoReference, always, fill_from_inherited),
];

pub fn assign_slots(request: &AssignmentRequest<'_>) -> SlotAssignment {
    let mut draft = Draft {
        request,
        assignment: base_fill(request.inputs),
        inherited: BTreeMap::new(),
    };
    draft.inherited = discard_conflicting_inheritance(&draft.assignment, request.reference);

    for (rule, predicate, outcome) in PRECEDENCE {
        if predicate(&draft) {
            outcome(&mut draft);
            draft.assignment.rule = *rule;
            break;
        }
    }

    let (subject, style, palette) = draft.assignment.pattern();
    draft.assignment.workflow_hint = WorkflowArchetype::from_pattern(subject, style, palette);
    draft.assignment
}

/// Uploads first, presets second; nothing from the reference yet.
fn base_fill(inputs: &TurnInputs) -> SlotAssignment {
    let pick = |slot: SlotName| {
        if let Some(url) = inputs.uploads.get(&slot) {
            ResolvedSlot::filled(SlotSource::Upload, url)
        } else if let Some(value) = inputs.presets.get(&slot) {
            ResolvedSlot::filled(SlotSource::Preset, value)
        } else {
            ResolvedSlot::empty()
        }
    };
    SlotAssignment {
        subject: pick(SlotName::Subject),
        style: pick(SlotName::Style),
        palette: pick(SlotName::Palette),
        workflow_hint: WorkflowArchetype::PromptOnly,
        rule: AssignmentRule::NoReference,
    }
}

/// Current selections always beat inherited ones for the same slot.
fn discard_conflicting_inheritance(
    assignment: &SlotAssignment,
    reference: &ResolvedReference,
) -> BTreeMap<SlotName, String> {
    reference
        .inherited_slots
        .iter()
        .filter(|(slot, _)| !assignment.is_filled(**slot))
        .map(|(slot, value)| (*slot, value.clone()))
        .collect()
}

fn explicit_instruction_applies(draft: &Draft<'_>) -> bool {
    draft.request.instruction.is_some() && !draft.request.reference.is_none()
}

/// The named slot takes the reference artifact, or its own inherited value when
/// the reference has no artifact. No other slot is touched.
fn apply_explicit_instruction(draft: &mut Draft<'_>) {
    let Some(slot) = draft.request.instruction else {
        return;
    };
    if draft.reference_artifact().is_some() {
        draft.bind_reference(slot);
    } else if let Some(value) = draft.inherited.remove(&slot) {
        *draft.assignment.slot_mut(slot) = ResolvedSlot::filled(SlotSource::Reference, value);
    }
}

fn catalog_subject_switched(draft: &Draft<'_>) -> bool {
    if draft.reference_artifact().is_none() || draft.request.family.is_single_image() {
        return false;
    }
    let current = draft.request.inputs.presets.get(&SlotName::Subject);
    let inherited = draft
        .request
        .reference
        .superseded_slots
        .get(&SlotName::Subject)
        .or_else(|| draft.request.reference.inherited_slots.get(&SlotName::Subject));
    matches!((current, inherited), (Some(current), Some(inherited)) if current != inherited)
}

fn inspiration_applies(draft: &Draft<'_>) -> bool {
    draft.reference_artifact().is_some()
        && !draft.request.family.is_single_image()
        && draft.filled(SlotName::Subject)
        && (!draft.filled(SlotName::Style) || !draft.filled(SlotName::Palette))
}

/// Style is tried before palette.
fn fill_first_missing_role(draft: &mut Draft<'_>) {
    if !draft.filled(SlotName::Style) {
        draft.bind_reference(SlotName::Style);
    } else if !draft.filled(SlotName::Palette) {
        draft.bind_reference(SlotName::Palette);
    }
}

fn modification_applies(draft: &Draft<'_>) -> bool {
    draft.reference_artifact().is_some() && !draft.filled(SlotName::Subject)
}

fn apply_modification(draft: &mut Draft<'_>) {
    draft.bind_reference(SlotName::Subject);
}

fn reference_has_artifact(draft: &Draft<'_>) -> bool {
    draft.reference_artifact().is_some()
}

fn leave_reference_unused(_draft: &mut Draft<'_>) {}

fn always(_draft: &Draft<'_>) -> bool {
    true
}

/// Without a reference artifact, inherited presets fill whatever is still empty.
fn fill_from_inherited(draft: &mut Draft<'_>) {
    let inherited = std::mem::take(&mut draft.inherited);
    for (slot, value) in inherited {
        if !draft.filled(slot) {
            *draft.assignment.slot_mut(slot) = ResolvedSlot::filled(SlotSource::Reference, value);
        }
    }
}
