use anyhow::Result;
use atelier_contracts::plan::OperationFamily;
use tracing::{debug, warn};

use super::{Classification, ClassificationContext, Classifier, HeuristicClassifier};
use crate::config::ClassifierConfig;

/// Tries `primary`; falls through to `secondary` unless the first answer is both
/// confident enough and produced by an allow-listed matcher.
pub struct FallbackClassifier {
    primary: Box<dyn Classifier>,
    secondary: Option<Box<dyn Classifier>>,
    bypass_threshold: f64,
    bypass_matchers: Vec<String>,
}

impl FallbackClassifier {
    pub fn new(
        primary: Box<dyn Classifier>,
        secondary: Option<Box<dyn Classifier>>,
        config: &ClassifierConfig,
    ) -> Self {
        Self {
            primary,
            secondary,
            bypass_threshold: config.bypass_threshold,
            bypass_matchers: config.bypass_matchers.clone(),
        }
    }

    pub fn heuristic_only(config: &ClassifierConfig) -> Self {
        Self::new(Box::new(HeuristicClassifier), None, config)
    }

    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }

    pub fn bypasses(&self, classification: &Classification) -> bool {
        classification.confidence >= self.bypass_threshold
            && self
                .bypass_matchers
                .iter()
                .any(|matcher| matcher == &classification.matcher)
    }

    /// Infallible entry point used by the pipeline.
    pub fn decide(&self, context: &ClassificationContext<'_>) -> Classification {
        match self.classify(context) {
            Ok(classification) => classification,
            Err(err) => {
                warn!(error = %err, "classification failed; treating turn as unclassified");
                let mut unclassified = Classification::heuristic(OperationFamily::None, 0.0, "none");
                unclassified.explanation = format!("classification failed: {err}");
                unclassified
            }
        }
    }
}

impl Classifier for FallbackClassifier {
    fn name(&self) -> &str {
        "fallback"
    }

    fn classify(&self, context: &ClassificationContext<'_>) -> Result<Classification> {
        let first = self.primary.classify(context)?;
        if self.bypasses(&first) {
            debug!(
                matcher = %first.matcher,
                confidence = first.confidence,
                "confident heuristic; delegate skipped"
            );
            return Ok(first);
        }
        let Some(secondary) = self.secondary.as_ref() else {
            return Ok(first);
        };

        match secondary.classify(&context.with_prior(&first)) {
            Ok(second) => {
                debug!(
                    classifier = secondary.name(),
                    family = %second.family,
                    confidence = second.confidence,
                    "delegate classification accepted"
                );
                Ok(second)
            }
            Err(err) => {
                warn!(
                    classifier = secondary.name(),
                    error = %err,
                    matcher = %first.matcher,
                    "delegate classification failed; using heuristic result"
                );
                Ok(first)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::{anyhow, Result};
    use atelier_contracts::plan::OperationFamily;

    use super::FallbackClassifier;
    use crate::assign::{assign_slots, AssignmentRequest, TurnInputs};
    use crate::classifier::{
        Classification, ClassificationContext, ClassificationSource, Classifier,
        HeuristicClassifier,
    };
    use crate::config::ClassifierConfig;
    use crate::reference::ResolvedReference;

    struct CountingDelegate {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Classifier for CountingDelegate {
        fn name(&self) -> &str {
            "counting"
        }

        fn classify(&self, context: &ClassificationContext<'_>) -> Result<Classification> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("unreachable host"));
            }
            assert!(context.prior.is_some());
            let mut answer = Classification::heuristic(OperationFamily::Edit, 0.8, "delegate");
            answer.source = ClassificationSource::Delegate;
            Ok(answer)
        }
    }

    fn run(text: &str, fail: bool) -> (Classification, usize) {
        let calls = Arc::new(AtomicUsize::new(0));
        let classifier = FallbackClassifier::new(
            Box::new(HeuristicClassifier),
            Some(Box::new(CountingDelegate {
                calls: Arc::clone(&calls),
                fail,
            })),
            &ClassifierConfig::default(),
        );
        let inputs = TurnInputs::default();
        let reference = ResolvedReference::none();
        let assignment = assign_slots(&AssignmentRequest {
            inputs: &inputs,
            reference: &reference,
            family: OperationFamily::Generate,
            instruction: None,
        });
        let result = classifier.decide(&ClassificationContext {
            text,
            inputs: &inputs,
            assignment: &assignment,
            reference: &reference,
            last_operation: None,
            prior: None,
        });
        (result, calls.load(Ordering::SeqCst))
    }

    #[test]
    fn allow_listed_confident_matchers_skip_delegate() {
        let (greeting, calls) = run("hi there", false);
        assert_eq!(greeting.family, OperationFamily::Casual);
        assert_eq!(calls, 0);

        let (upscale, calls) = run("upscale", false);
        assert_eq!(upscale.family, OperationFamily::Upscale);
        assert_eq!(calls, 0);
    }

    #[test]
    fn confident_but_not_allow_listed_consults_delegate() {
        // crop_verb fires at 0.95 but is not on the default allow-list.
        let (result, calls) = run("crop to square", false);
        assert_eq!(calls, 1);
        assert_eq!(result.source, ClassificationSource::Delegate);
    }

    #[test]
    fn delegate_failure_keeps_heuristic_answer() {
        let (result, calls) = run("a teapot shaped like a whale", true);
        assert_eq!(calls, 1);
        assert_eq!(result.source, ClassificationSource::Heuristic);
        assert_eq!(result.family, OperationFamily::Generate);
    }

    #[test]
    fn without_secondary_heuristic_is_final() {
        let classifier = FallbackClassifier::heuristic_only(&ClassifierConfig::default());
        assert!(!classifier.has_secondary());
        let low = Classification::heuristic(OperationFamily::Generate, 0.5, "default");
        assert!(!classifier.bypasses(&low));
    }
}
