//! Operation-family classification.
//!
//! [`HeuristicClassifier`] runs an ordered keyword battery, [`DelegateClassifier`]
//! asks an external model, and [`FallbackClassifier`] composes the two: the
//! delegate is consulted only when the heuristic answer is not both confident
//! and allow-listed, and any delegate failure falls back to the heuristic.

pub mod delegate;
pub mod fallback;
pub mod heuristic;
pub mod repair;

use anyhow::Result;
use atelier_contracts::plan::OperationFamily;
use atelier_contracts::slots::SlotAssignment;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::assign::TurnInputs;
use crate::reference::ResolvedReference;

pub use delegate::{DelegateClassifier, DelegateError, DelegateTransport, OpenAiResponsesTransport};
pub use fallback::FallbackClassifier;
pub use heuristic::HeuristicClassifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Heuristic,
    Delegate,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationSource::Heuristic => "heuristic",
            ClassificationSource::Delegate => "delegate",
        }
    }
}

/// One step of a multi-step answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedOperation {
    pub family: OperationFamily,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl PlannedOperation {
    pub fn new(family: OperationFamily) -> Self {
        Self {
            family,
            parameters: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub family: OperationFamily,
    pub confidence: f64,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Ordered operations when `family` is `multi_step`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<PlannedOperation>,
    /// Name of the heuristic matcher that fired, or `delegate`.
    pub matcher: String,
    pub source: ClassificationSource,
    #[serde(default)]
    pub explanation: String,
}

impl Classification {
    pub fn heuristic(family: OperationFamily, confidence: f64, matcher: &str) -> Self {
        Self {
            family,
            confidence,
            parameters: Map::new(),
            steps: Vec::new(),
            matcher: matcher.to_string(),
            source: ClassificationSource::Heuristic,
            explanation: format!("heuristic matcher '{matcher}' fired"),
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_steps(mut self, steps: Vec<PlannedOperation>) -> Self {
        self.steps = steps;
        self
    }

    pub fn is_conversational(&self) -> bool {
        matches!(self.family, OperationFamily::Casual | OperationFamily::None)
    }

    /// Family whose slot rules govern the first step.
    pub fn leading_family(&self) -> OperationFamily {
        if self.family == OperationFamily::MultiStep {
            self.steps
                .first()
                .map(|step| step.family)
                .unwrap_or(OperationFamily::Generate)
        } else {
            self.family
        }
    }
}

/// Everything a classifier may look at for one turn.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationContext<'a> {
    pub text: &'a str,
    pub inputs: &'a TurnInputs,
    pub assignment: &'a SlotAssignment,
    pub reference: &'a ResolvedReference,
    pub last_operation: Option<OperationFamily>,
    /// Earlier tier's answer, passed on to later tiers.
    pub prior: Option<&'a Classification>,
}

impl<'a> ClassificationContext<'a> {
    pub fn with_prior(self, prior: &'a Classification) -> Self {
        Self {
            prior: Some(prior),
            ..self
        }
    }

    pub fn has_reference_artifact(&self) -> bool {
        self.reference.has_artifact()
    }

    /// Structured view handed to the delegate.
    pub fn to_payload(&self) -> Value {
        let (subject, style, palette) = self.assignment.pattern();
        json!({
            "text": self.text,
            "uploads": self.inputs.uploads,
            "presets": self.inputs.presets,
            "reference": {
                "kind": self.reference.kind,
                "artifacts": self.reference.artifact_urls,
                "text": self.reference.text,
            },
            "filledSlots": {
                "subject": subject,
                "style": style,
                "palette": palette,
            },
            "lastOperation": self.last_operation,
            "heuristic": self.prior.map(|prior| json!({
                "intent": prior.family,
                "confidence": prior.confidence,
                "matcher": prior.matcher,
            })),
        })
    }
}

pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;
    fn classify(&self, context: &ClassificationContext<'_>) -> Result<Classification>;
}
