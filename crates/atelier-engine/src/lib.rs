pub mod assign;
pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod orchestrator;
pub mod planner;
pub mod reference;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use atelier_contracts::chat::parse_role_instruction;
use atelier_contracts::conversation::ConversationHistory;
use atelier_contracts::events::{EventWriter, TurnEvent};
use atelier_contracts::plan::{ExecutionResult, OperationFamily, WorkflowPlan};
use atelier_contracts::slots::SlotAssignment;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::assign::{assign_slots, AssignmentRequest, TurnInputs};
use crate::classifier::{
    Classification, ClassificationContext, Classifier, DelegateClassifier, FallbackClassifier,
    HeuristicClassifier,
};
use crate::config::EngineConfig;
use crate::dispatch::CapabilityDispatcher;
use crate::orchestrator::{AbortReason, CancellationToken, PlanOutcome, PlanState, StepOrchestrator};
use crate::reference::{ReferenceRequest, ReferenceResolver, ResolvedReference};

/// One inbound turn as handed to the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub text: String,
    #[serde(default)]
    pub inputs: TurnInputs,
    /// Explicit reference payload, possibly serialized JSON.
    #[serde(default)]
    pub reference: Option<String>,
}

impl TurnRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_inputs(mut self, inputs: TurnInputs) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_reference(mut self, payload: impl Into<String>) -> Self {
        self.reference = Some(payload.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Partial,
    Failed,
    Conversational,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    pub explanation: String,
    pub reference: ResolvedReference,
    pub classification: Classification,
    pub assignment: SlotAssignment,
    pub plan: Option<WorkflowPlan>,
    pub results: Vec<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<AbortReason>,
}

impl TurnOutcome {
    /// Artifacts produced by successful steps, in execution order.
    pub fn artifacts(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter_map(|result| result.artifact.as_deref())
            .collect()
    }

    /// Operation that produced the last artifact, for later "again" requests.
    pub fn last_operation(&self) -> Option<OperationFamily> {
        self.results
            .iter()
            .rev()
            .find(|result| result.is_success())
            .map(|result| result.operation_id)
    }
}

/// Resolve, classify, assign, plan and execute one turn.
pub struct TurnPipeline {
    resolver: ReferenceResolver,
    classifier: FallbackClassifier,
    orchestrator: StepOrchestrator,
    events: EventWriter,
}

impl TurnPipeline {
    pub fn new(
        resolver: ReferenceResolver,
        classifier: FallbackClassifier,
        orchestrator: StepOrchestrator,
        events: EventWriter,
    ) -> Self {
        Self {
            resolver,
            classifier,
            orchestrator,
            events,
        }
    }

    /// Builds every component from config; the delegate joins only when enabled
    /// and an API key is present.
    pub fn from_config(
        config: &EngineConfig,
        dispatcher: Arc<dyn CapabilityDispatcher>,
        events: EventWriter,
    ) -> Result<Self> {
        let delegate = DelegateClassifier::from_config(&config.delegate)?
            .map(|delegate| Box::new(delegate) as Box<dyn Classifier>);
        let classifier =
            FallbackClassifier::new(Box::new(HeuristicClassifier), delegate, &config.classifier);
        Ok(Self::new(
            ReferenceResolver::new(config.resolver.clone(), config.preset_catalog()),
            classifier,
            StepOrchestrator::new(
                dispatcher,
                Duration::from_secs(config.dispatch.timeout_secs),
                events.clone(),
            ),
            events,
        ))
    }

    pub fn resolve_reference(
        &self,
        request: &TurnRequest,
        history: &ConversationHistory,
    ) -> ResolvedReference {
        let supplied = request.inputs.supplied_slots();
        self.resolver.resolve(
            &ReferenceRequest {
                payload: request.reference.as_deref(),
                text: &request.text,
                current_slots: &supplied,
            },
            history,
        )
    }

    /// Classifies against a provisional `generate` assignment, then recomputes
    /// the assignment with the family that came back.
    pub fn classify(
        &self,
        request: &TurnRequest,
        history: &ConversationHistory,
        reference: &ResolvedReference,
    ) -> (Classification, SlotAssignment) {
        let instruction = parse_role_instruction(&request.text);
        let provisional = assign_slots(&AssignmentRequest {
            inputs: &request.inputs,
            reference,
            family: OperationFamily::Generate,
            instruction,
        });
        let classification = self.classifier.decide(&ClassificationContext {
            text: &request.text,
            inputs: &request.inputs,
            assignment: &provisional,
            reference,
            last_operation: history.last_operation(),
            prior: None,
        });
        let assignment = assign_slots(&AssignmentRequest {
            inputs: &request.inputs,
            reference,
            family: classification.leading_family(),
            instruction,
        });
        (classification, assignment)
    }

    pub fn run_turn(&self, request: &TurnRequest, history: &ConversationHistory) -> TurnOutcome {
        self.run_turn_with_cancel(request, history, &CancellationToken::new())
    }

    pub fn run_turn_with_cancel(
        &self,
        request: &TurnRequest,
        history: &ConversationHistory,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        self.emit(TurnEvent::TurnStarted {
            text: request.text.clone(),
            uploads: request.inputs.uploads.clone(),
            presets: request.inputs.presets.clone(),
            has_reference_payload: request.reference.is_some(),
            history_len: history.len(),
        });

        let reference = self.resolve_reference(request, history);
        self.emit(TurnEvent::ReferenceResolved {
            kind: reference.kind.as_str().to_string(),
            anchor_timestamp: reference.anchor_timestamp,
            artifacts: reference.artifact_urls.clone(),
            chain_length: reference.chain_length,
        });

        let (classification, assignment) = self.classify(request, history, &reference);
        info!(
            family = %classification.family,
            confidence = classification.confidence,
            matcher = %classification.matcher,
            workflow_hint = assignment.workflow_hint.as_str(),
            "turn classified"
        );
        self.emit(TurnEvent::Classified {
            family: classification.family,
            confidence: classification.confidence,
            matcher: classification.matcher.clone(),
            source: classification.source.as_str().to_string(),
            rule: assignment.rule,
            workflow_hint: assignment.workflow_hint,
        });

        let Some(plan) = planner::build_plan(&classification, &assignment) else {
            let explanation = if classification.family == OperationFamily::Casual {
                "Conversational message; nothing to run.".to_string()
            } else {
                "No operation was identified for this message.".to_string()
            };
            return TurnOutcome {
                status: TurnStatus::Conversational,
                explanation,
                reference,
                classification,
                assignment,
                plan: None,
                results: Vec::new(),
                aborted: None,
            };
        };
        self.emit(TurnEvent::PlanCreated {
            steps: plan.steps.clone(),
            chained: plan.chained,
            dispatcher: self.orchestrator.dispatcher_name().to_string(),
        });

        let PlanOutcome { state, results } = self.orchestrator.execute(&plan, cancel);
        let (status, aborted) = match state {
            PlanState::Aborted { cause } => {
                let succeeded = results.iter().filter(|result| result.is_success()).count();
                let status = if succeeded > 0 {
                    TurnStatus::Partial
                } else {
                    TurnStatus::Failed
                };
                (status, Some(cause))
            }
            _ => (TurnStatus::Completed, None),
        };
        let explanation = explain(&plan, &results, aborted);
        if status != TurnStatus::Completed {
            warn!(?status, %explanation, "turn did not complete");
        }

        TurnOutcome {
            status,
            explanation,
            reference,
            classification,
            assignment,
            plan: Some(plan),
            results,
            aborted,
        }
    }

    fn emit(&self, event: TurnEvent) {
        if let Err(err) = self.events.emit(&event) {
            warn!(event = event.name(), error = %err, "failed to append event");
        }
    }
}

fn explain(plan: &WorkflowPlan, results: &[ExecutionResult], aborted: Option<AbortReason>) -> String {
    let total = plan.len();
    let done = results.iter().filter(|result| result.is_success()).count();
    match aborted {
        None => {
            let operations: Vec<&str> = plan
                .steps
                .iter()
                .map(|step| step.operation_id.as_str())
                .collect();
            format!("Completed {total} step(s): {}.", operations.join(" -> "))
        }
        Some(AbortReason::Cancelled { before_step }) => format!(
            "Cancelled before step {} of {total}; {done} step(s) completed.",
            before_step + 1
        ),
        Some(AbortReason::StepFailed { step }) => {
            let failure = results
                .iter()
                .find(|result| result.step_index == step)
                .and_then(|result| result.error.as_deref())
                .unwrap_or("unknown error");
            let operation = plan
                .steps
                .get(step)
                .map(|candidate| candidate.operation_id.as_str())
                .unwrap_or("unknown");
            if done == 0 {
                format!("Step {} ({operation}) failed: {failure}.", step + 1)
            } else {
                format!(
                    "Completed {done} of {total} step(s); step {} ({operation}) failed: {failure}.",
                    step + 1
                )
            }
        }
    }
}
