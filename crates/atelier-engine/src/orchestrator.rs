//! Sequential plan execution.
//!
//! ```text
//! pending -> running(0) -> running(1) -> ... -> completed
//!                 \-> aborted(step_failed | cancelled)
//! ```
//!
//! A step's output is threaded into the slot its successor declared as
//! `PreviousOutput`. The first failure halts the plan; completed results are kept.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use atelier_contracts::events::{EventWriter, TurnEvent};
use atelier_contracts::plan::{ExecutionResult, SlotBinding, Step, StepStatus, WorkflowPlan};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dispatch::{CapabilityDispatcher, DispatchError, DispatchRequest, DispatchResponse};

/// Turn-scoped cancellation flag shared with the caller.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    StepFailed { step: usize },
    Cancelled { before_step: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PlanState {
    Pending,
    Running { step: usize },
    Completed,
    Aborted { cause: AbortReason },
}

impl PlanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanState::Completed | PlanState::Aborted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOutcome {
    pub state: PlanState,
    pub results: Vec<ExecutionResult>,
}

impl PlanOutcome {
    pub fn succeeded_steps(&self) -> usize {
        self.results.iter().filter(|result| result.is_success()).count()
    }

    pub fn final_artifact(&self) -> Option<&str> {
        match self.state {
            PlanState::Completed => self.results.last().and_then(|result| result.artifact.as_deref()),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&ExecutionResult> {
        self.results.iter().find(|result| !result.is_success())
    }
}

pub struct StepOrchestrator {
    dispatcher: Arc<dyn CapabilityDispatcher>,
    step_timeout: Duration,
    events: EventWriter,
}

impl StepOrchestrator {
    pub fn new(
        dispatcher: Arc<dyn CapabilityDispatcher>,
        step_timeout: Duration,
        events: EventWriter,
    ) -> Self {
        Self {
            dispatcher,
            step_timeout,
            events,
        }
    }

    pub fn dispatcher_name(&self) -> &str {
        self.dispatcher.name()
    }

    pub fn execute(&self, plan: &WorkflowPlan, cancel: &CancellationToken) -> PlanOutcome {
        let mut state = PlanState::Pending;
        let mut results: Vec<ExecutionResult> = Vec::with_capacity(plan.len());
        let mut outputs: Vec<String> = Vec::with_capacity(plan.len());

        while !state.is_terminal() {
            state = match state {
                PlanState::Pending if plan.is_empty() => PlanState::Completed,
                PlanState::Pending => PlanState::Running { step: 0 },
                PlanState::Running { step } if cancel.is_cancelled() => {
                    info!(step, "plan cancelled before step");
                    PlanState::Aborted {
                        cause: AbortReason::Cancelled { before_step: step },
                    }
                }
                PlanState::Running { step } => {
                    let result = self.run_step(&plan.steps[step], &outputs);
                    let succeeded = result.is_success();
                    if let Some(artifact) = result.artifact.clone() {
                        outputs.push(artifact);
                    }
                    results.push(result);
                    if !succeeded {
                        PlanState::Aborted {
                            cause: AbortReason::StepFailed { step },
                        }
                    } else if step + 1 < plan.len() {
                        PlanState::Running { step: step + 1 }
                    } else {
                        PlanState::Completed
                    }
                }
                terminal => terminal,
            };
        }

        let (cancelled, stopped_at) = match state {
            PlanState::Aborted {
                cause: AbortReason::Cancelled { before_step },
            } => (true, Some(before_step)),
            PlanState::Aborted {
                cause: AbortReason::StepFailed { step },
            } => (false, Some(step)),
            _ => (false, None),
        };
        self.emit(TurnEvent::PlanFinished {
            completed: state == PlanState::Completed,
            cancelled,
            stopped_at,
            steps_total: plan.len(),
            steps_succeeded: results.iter().filter(|result| result.is_success()).count(),
        });
        PlanOutcome { state, results }
    }

    fn run_step(&self, step: &Step, outputs: &[String]) -> ExecutionResult {
        let started = Instant::now();
        self.emit(TurnEvent::StepStarted {
            step: step.index,
            operation: step.operation_id,
            workflow: step.workflow,
        });

        let outcome = bind_slots(step, outputs).and_then(|slot_bindings| {
            let request = DispatchRequest {
                workflow_id: step.workflow,
                operation: step.operation_id,
                slot_bindings,
                parameters: step.parameters.clone(),
            };
            self.dispatch_with_timeout(request)
        });
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = match outcome {
            Ok(response) => {
                debug!(step = step.index, workflow = %step.workflow, artifact = %response.artifact_url, "step succeeded");
                ExecutionResult {
                    step_index: step.index,
                    operation_id: step.operation_id,
                    workflow: step.workflow,
                    status: StepStatus::Success,
                    artifact: Some(response.artifact_url),
                    error: None,
                    elapsed_ms,
                }
            }
            Err(err) => {
                warn!(step = step.index, workflow = %step.workflow, error = %err, "step failed");
                ExecutionResult {
                    step_index: step.index,
                    operation_id: step.operation_id,
                    workflow: step.workflow,
                    status: StepStatus::Error,
                    artifact: None,
                    error: Some(err.to_string()),
                    elapsed_ms,
                }
            }
        };

        self.emit(TurnEvent::StepFinished {
            step: result.step_index,
            status: result.status,
            artifact: result.artifact.clone(),
            error: result.error.clone(),
            elapsed_ms: result.elapsed_ms,
        });
        result
    }

    /// Runs the dispatch on a worker thread; a slow backend fails only this step.
    fn dispatch_with_timeout(
        &self,
        request: DispatchRequest,
    ) -> Result<DispatchResponse, DispatchError> {
        let (tx, rx) = mpsc::channel();
        let dispatcher = Arc::clone(&self.dispatcher);
        thread::Builder::new()
            .name(format!("atelier-dispatch-{}", request.workflow_id))
            .spawn(move || {
                let _ = tx.send(dispatcher.dispatch(&request));
            })
            .map_err(|err| DispatchError::Transport(format!("spawning dispatch worker: {err}")))?;

        match rx.recv_timeout(self.step_timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(DispatchError::Timeout(self.step_timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(DispatchError::Transport(
                "dispatch worker exited without a response".to_string(),
            )),
        }
    }

    fn emit(&self, event: TurnEvent) {
        if let Err(err) = self.events.emit(&event) {
            warn!(event = event.name(), error = %err, "failed to append event");
        }
    }
}

fn bind_slots(
    step: &Step,
    outputs: &[String],
) -> Result<BTreeMap<atelier_contracts::slots::SlotName, String>, DispatchError> {
    step.slot_bindings
        .iter()
        .map(|(slot, binding)| {
            let url = match binding {
                SlotBinding::Value { url, .. } => url.clone(),
                SlotBinding::PreviousOutput { step: source } => outputs
                    .get(*source)
                    .cloned()
                    .ok_or_else(|| {
                        DispatchError::InvalidResponse(format!(
                            "step {source} produced no artifact for {slot}"
                        ))
                    })?,
            };
            Ok((*slot, url))
        })
        .collect()
}
