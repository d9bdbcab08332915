use anyhow::Result;
use atelier_contracts::chat::phrases::{
    CROP_PHRASES, EDIT_PHRASES, ENLARGE_MODIFIERS, GENERATE_PHRASES, GREETINGS,
    REMOVE_BACKGROUND_PHRASES, REPEAT_MODIFIERS, TIGHTEN_MODIFIERS, UPSCALE_PHRASES,
};
use atelier_contracts::chat::request_parser::{contains_any, tokens};
use atelier_contracts::chat::{parse_crop_aspect, parse_slash_command, split_sequence};
use atelier_contracts::plan::OperationFamily;
use serde_json::{Map, Value};
use tracing::debug;

use super::{Classification, ClassificationContext, Classifier, PlannedOperation};

pub const DEFAULT_MATCHER: &str = "default";

struct Signals<'a> {
    text: &'a str,
    tokens: Vec<String>,
    has_uploads: bool,
    has_inputs: bool,
    has_reference_artifact: bool,
    last_operation: Option<OperationFamily>,
}

type Hit = (OperationFamily, f64, Map<String, Value>);
type Matcher = fn(&Signals<'_>) -> Option<Hit>;

/// Ordered most specific first; the first matcher that fires decides.
pub const MATCHERS: &[(&str, Matcher)] = &[
    ("slash_command", match_slash_command),
    ("greeting", match_greeting),
    ("multi_step_sequence", match_sequence),
    ("remove_background_verb", match_remove_background),
    ("upscale_verb", match_upscale),
    ("crop_verb", match_crop),
    ("contextual_modifier", match_contextual_modifier),
    ("edit_verb", match_edit),
    ("generate_verb", match_generate),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    pub fn matcher_names() -> Vec<&'static str> {
        MATCHERS.iter().map(|(name, _)| *name).collect()
    }

    pub fn evaluate(&self, context: &ClassificationContext<'_>) -> Classification {
        let signals = Signals {
            text: context.text,
            tokens: tokens(context.text),
            has_uploads: context.inputs.has_uploads(),
            has_inputs: !context.inputs.is_empty(),
            has_reference_artifact: context.has_reference_artifact(),
            last_operation: context.last_operation,
        };

        for (name, matcher) in MATCHERS {
            if let Some((family, confidence, parameters)) = matcher(&signals) {
                debug!(matcher = *name, %family, confidence, "heuristic matcher fired");
                let classification = Classification::heuristic(family, confidence, name)
                    .with_parameters(parameters);
                return match family {
                    OperationFamily::MultiStep => {
                        let steps = sequence_steps(signals.text).unwrap_or_default();
                        classification.with_steps(steps)
                    }
                    _ => classification,
                };
            }
        }

        let fallback = if signals.tokens.is_empty() && !signals.has_inputs {
            Classification::heuristic(OperationFamily::None, 0.2, DEFAULT_MATCHER)
        } else {
            Classification::heuristic(OperationFamily::Generate, 0.5, DEFAULT_MATCHER)
        };
        debug!(family = %fallback.family, "no heuristic matcher fired");
        fallback
    }
}

impl Classifier for HeuristicClassifier {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn classify(&self, context: &ClassificationContext<'_>) -> Result<Classification> {
        Ok(self.evaluate(context))
    }
}

fn hit(family: OperationFamily, confidence: f64) -> Option<Hit> {
    Some((family, confidence, Map::new()))
}

fn crop_parameters(text: &str) -> Map<String, Value> {
    let mut parameters = Map::new();
    if let Some(aspect) = parse_crop_aspect(text) {
        parameters.insert("aspect".to_string(), Value::String(aspect));
    }
    parameters
}

fn match_slash_command(signals: &Signals<'_>) -> Option<Hit> {
    let command = parse_slash_command(signals.text)?;
    let family = command.family?;
    let parameters = if family == OperationFamily::Crop {
        crop_parameters(&command.args.join(" "))
    } else {
        Map::new()
    };
    Some((family, 0.98, parameters))
}

fn match_greeting(signals: &Signals<'_>) -> Option<Hit> {
    if signals.has_inputs || signals.tokens.is_empty() {
        return None;
    }
    let opens_with_greeting = GREETINGS.iter().any(|greeting| {
        let words: Vec<&str> = greeting.split_whitespace().collect();
        signals.tokens.len() >= words.len()
            && signals.tokens.iter().zip(&words).all(|(token, word)| token == word)
    });
    opens_with_greeting.then(|| (OperationFamily::Casual, 0.97, Map::new()))
}

fn match_sequence(signals: &Signals<'_>) -> Option<Hit> {
    sequence_steps(signals.text).map(|_| (OperationFamily::MultiStep, 0.95, Map::new()))
}

/// Every clause must name an operation, and there must be at least two.
fn sequence_steps(text: &str) -> Option<Vec<PlannedOperation>> {
    let clauses = split_sequence(text);
    if clauses.len() < 2 {
        return None;
    }
    clauses
        .iter()
        .map(|clause| clause_operation(clause))
        .collect::<Option<Vec<PlannedOperation>>>()
}

fn clause_operation(clause: &str) -> Option<PlannedOperation> {
    let words = tokens(clause);
    let family = if contains_any(&words, REMOVE_BACKGROUND_PHRASES) {
        OperationFamily::RemoveBackground
    } else if contains_any(&words, UPSCALE_PHRASES) {
        OperationFamily::Upscale
    } else if contains_any(&words, CROP_PHRASES) || contains_any(&words, TIGHTEN_MODIFIERS) {
        OperationFamily::Crop
    } else if contains_any(&words, ENLARGE_MODIFIERS) {
        OperationFamily::Enlarge
    } else if contains_any(&words, EDIT_PHRASES) {
        OperationFamily::Edit
    } else if contains_any(&words, GENERATE_PHRASES) {
        OperationFamily::Generate
    } else {
        return None;
    };
    let parameters = if family == OperationFamily::Crop {
        crop_parameters(clause)
    } else {
        Map::new()
    };
    Some(PlannedOperation { family, parameters })
}

fn match_remove_background(signals: &Signals<'_>) -> Option<Hit> {
    if contains_any(&signals.tokens, REMOVE_BACKGROUND_PHRASES) {
        return hit(OperationFamily::RemoveBackground, 0.96);
    }
    None
}

fn match_upscale(signals: &Signals<'_>) -> Option<Hit> {
    if contains_any(&signals.tokens, UPSCALE_PHRASES) {
        return hit(OperationFamily::Upscale, 0.96);
    }
    None
}

fn match_crop(signals: &Signals<'_>) -> Option<Hit> {
    if contains_any(&signals.tokens, CROP_PHRASES) {
        return Some((OperationFamily::Crop, 0.95, crop_parameters(signals.text)));
    }
    None
}

/// "bigger", "tighter", "again": only meaningful against an earlier result and
/// with no fresh upload competing for the subject.
fn match_contextual_modifier(signals: &Signals<'_>) -> Option<Hit> {
    if signals.has_uploads || !signals.has_reference_artifact {
        return None;
    }
    if contains_any(&signals.tokens, ENLARGE_MODIFIERS) {
        return hit(OperationFamily::Enlarge, 0.92);
    }
    if contains_any(&signals.tokens, TIGHTEN_MODIFIERS) {
        let mut parameters = crop_parameters(signals.text);
        parameters.insert("mode".to_string(), Value::String("tighten".to_string()));
        return Some((OperationFamily::Crop, 0.92, parameters));
    }
    if contains_any(&signals.tokens, REPEAT_MODIFIERS) {
        let last = signals
            .last_operation
            .filter(|family| family.is_dispatchable())?;
        return hit(last, 0.9);
    }
    None
}

fn match_edit(signals: &Signals<'_>) -> Option<Hit> {
    let has_target = signals.has_uploads || signals.has_reference_artifact;
    if has_target && contains_any(&signals.tokens, EDIT_PHRASES) {
        return hit(OperationFamily::Edit, 0.9);
    }
    None
}

fn match_generate(signals: &Signals<'_>) -> Option<Hit> {
    if contains_any(&signals.tokens, GENERATE_PHRASES) {
        return hit(OperationFamily::Generate, 0.9);
    }
    None
}

#[cfg(test)]
mod tests {
    use atelier_contracts::plan::OperationFamily;
    use atelier_contracts::slots::{SlotAssignment, SlotName};
    use serde_json::json;

    use super::{HeuristicClassifier, DEFAULT_MATCHER};
    use crate::assign::{assign_slots, AssignmentRequest, TurnInputs};
    use crate::classifier::{Classification, ClassificationContext};
    use crate::reference::{ReferenceKind, ResolvedReference};

    struct Fixture {
        inputs: TurnInputs,
        reference: ResolvedReference,
        assignment: SlotAssignment,
        last_operation: Option<OperationFamily>,
    }

    impl Fixture {
        fn new(inputs: TurnInputs, reference: ResolvedReference) -> Self {
            let assignment = assign_slots(&AssignmentRequest {
                inputs: &inputs,
                reference: &reference,
                family: OperationFamily::Generate,
                instruction: None,
            });
            Self {
                inputs,
                reference,
                assignment,
                last_operation: None,
            }
        }

        fn bare() -> Self {
            Self::new(TurnInputs::default(), ResolvedReference::none())
        }

        fn with_previous_artifact() -> Self {
            Self::new(
                TurnInputs::default(),
                ResolvedReference {
                    kind: ReferenceKind::AutoPrevious,
                    artifact_urls: vec!["https://cdn/out/1.png".to_string()],
                    ..ResolvedReference::none()
                },
            )
        }

        fn classify(&self, text: &str) -> Classification {
            HeuristicClassifier.evaluate(&ClassificationContext {
                text,
                inputs: &self.inputs,
                assignment: &self.assignment,
                reference: &self.reference,
                last_operation: self.last_operation,
                prior: None,
            })
        }
    }

    #[test]
    fn greeting_is_casual_and_confident() {
        let result = Fixture::bare().classify("hi there");
        assert_eq!(result.family, OperationFamily::Casual);
        assert!(result.confidence >= 0.9);
        assert_eq!(result.matcher, "greeting");
    }

    #[test]
    fn earlier_matcher_wins_over_later_ones() {
        let fixture = Fixture::bare();
        let hello = fixture.classify("hello, can you upscale my photo");
        assert_eq!(hello.family, OperationFamily::Casual);

        let both = fixture.classify("upscale and crop");
        assert_eq!(both.family, OperationFamily::Upscale);
        assert_eq!(both.matcher, "upscale_verb");
    }

    #[test]
    fn greeting_requires_no_inputs() {
        let fixture = Fixture::new(
            TurnInputs::default().with_upload(SlotName::Subject, "https://cdn/u/1.png"),
            ResolvedReference::none(),
        );
        let result = fixture.classify("hey, remove the background");
        assert_eq!(result.family, OperationFamily::RemoveBackground);
    }

    #[test]
    fn contextual_modifier_needs_previous_artifact() {
        let result = Fixture::with_previous_artifact().classify("make it bigger");
        assert_eq!(result.family, OperationFamily::Enlarge);
        assert_eq!(result.matcher, "contextual_modifier");

        let without = Fixture::bare().classify("make it bigger");
        assert_eq!(without.family, OperationFamily::Generate);
    }

    #[test]
    fn repeat_modifier_reuses_last_operation() {
        let mut fixture = Fixture::with_previous_artifact();
        fixture.last_operation = Some(OperationFamily::RemoveBackground);
        let result = fixture.classify("again please");
        assert_eq!(result.family, OperationFamily::RemoveBackground);
        assert_eq!(result.confidence, 0.9);
    }

    #[test]
    fn crop_carries_aspect() {
        let result = Fixture::bare().classify("crop it to 4:5");
        assert_eq!(result.family, OperationFamily::Crop);
        assert_eq!(result.parameters.get("aspect"), Some(&json!("4:5")));

        let slash = Fixture::bare().classify("/crop portrait");
        assert_eq!(slash.confidence, 0.98);
        assert_eq!(slash.parameters.get("aspect"), Some(&json!("portrait")));
    }

    #[test]
    fn sequences_become_multi_step() {
        let result = Fixture::bare().classify("upscale then crop to landscape");
        assert_eq!(result.family, OperationFamily::MultiStep);
        let families: Vec<OperationFamily> = result.steps.iter().map(|step| step.family).collect();
        assert_eq!(families, vec![OperationFamily::Upscale, OperationFamily::Crop]);
        assert_eq!(result.steps[1].parameters.get("aspect"), Some(&json!("landscape")));
    }

    #[test]
    fn unknown_clause_is_not_a_sequence() {
        let result = Fixture::bare().classify("upscale then we will see");
        assert_eq!(result.family, OperationFamily::Upscale);
    }

    #[test]
    fn edit_requires_something_to_edit() {
        let with_target = Fixture::with_previous_artifact().classify("change the handle to gold");
        assert_eq!(with_target.family, OperationFamily::Edit);

        let nothing = Fixture::bare().classify("change the handle to gold");
        assert_eq!(nothing.family, OperationFamily::Generate);
        assert_eq!(nothing.matcher, DEFAULT_MATCHER);
    }

    #[test]
    fn empty_turn_is_none() {
        let result = Fixture::bare().classify("   ");
        assert_eq!(result.family, OperationFamily::None);
        assert!(result.confidence < 0.5);
    }
}
