use std::collections::BTreeMap;

use atelier_contracts::plan::{OperationFamily, SlotBinding, Step, WorkflowPlan};
use atelier_contracts::slots::{SlotAssignment, SlotName};
use serde_json::{Map, Value};

use crate::classifier::{Classification, PlannedOperation};
use crate::workflow::{select_workflow, workflow_for};

/// Parameter a step may carry to receive the previous output somewhere other
/// than the subject slot.
pub const INJECT_PARAMETER: &str = "inject";

/// `None` for conversational turns or when nothing can be dispatched.
pub fn build_plan(classification: &Classification, assignment: &SlotAssignment) -> Option<WorkflowPlan> {
    if classification.is_conversational() {
        return None;
    }
    let operations: Vec<PlannedOperation> = if classification.family == OperationFamily::MultiStep {
        classification.steps.clone()
    } else {
        vec![PlannedOperation {
            family: classification.family,
            parameters: classification.parameters.clone(),
        }]
    };
    let operations: Vec<PlannedOperation> = operations
        .into_iter()
        .filter(|operation| operation.family.is_dispatchable())
        .collect();
    if operations.is_empty() {
        return None;
    }

    let steps: Vec<Step> = operations
        .into_iter()
        .enumerate()
        .map(|(index, operation)| {
            if index == 0 {
                first_step(operation, assignment)
            } else {
                chained_step(index, operation, assignment)
            }
        })
        .collect();

    Some(if steps.len() == 1 {
        let mut steps = steps;
        WorkflowPlan::single(steps.remove(0))
    } else {
        WorkflowPlan::chained(steps)
    })
}

fn bindings_for(
    family: OperationFamily,
    assignment: &SlotAssignment,
) -> BTreeMap<SlotName, SlotBinding> {
    assignment
        .filled()
        .into_iter()
        .filter(|(slot, _)| !family.is_single_image() || *slot == SlotName::Subject)
        .filter_map(|(slot, resolved)| {
            resolved.value.as_ref().map(|url| {
                (
                    slot,
                    SlotBinding::Value {
                        source: resolved.filled_from,
                        url: url.clone(),
                    },
                )
            })
        })
        .collect()
}

fn first_step(operation: PlannedOperation, assignment: &SlotAssignment) -> Step {
    Step {
        index: 0,
        operation_id: operation.family,
        workflow: workflow_for(operation.family, assignment),
        slot_bindings: bindings_for(operation.family, assignment),
        parameters: operation.parameters,
    }
}

/// The previous step's output lands in the subject slot unless the step asks for
/// style or palette injection; other user-chosen slots carry over.
fn chained_step(index: usize, operation: PlannedOperation, assignment: &SlotAssignment) -> Step {
    let inject = injection_slot(&operation.parameters, operation.family);
    let mut slot_bindings = bindings_for(operation.family, assignment);
    if operation.family.is_single_image() {
        slot_bindings.clear();
    }
    slot_bindings.insert(inject, SlotBinding::PreviousOutput { step: index - 1 });

    let pattern = (
        slot_bindings.contains_key(&SlotName::Subject),
        slot_bindings.contains_key(&SlotName::Style),
        slot_bindings.contains_key(&SlotName::Palette),
    );
    Step {
        index,
        operation_id: operation.family,
        workflow: select_workflow(operation.family, pattern),
        slot_bindings,
        parameters: operation.parameters,
    }
}

fn injection_slot(parameters: &Map<String, Value>, family: OperationFamily) -> SlotName {
    if family.is_single_image() {
        return SlotName::Subject;
    }
    parameters
        .get(INJECT_PARAMETER)
        .and_then(Value::as_str)
        .and_then(SlotName::parse)
        .unwrap_or(SlotName::Subject)
}
