use std::time::Duration;

use anyhow::{Context, Result};
use atelier_contracts::plan::OperationFamily;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use super::repair::parse_json_object;
use super::{
    Classification, ClassificationContext, ClassificationSource, Classifier, PlannedOperation,
};
use crate::config::{delegate_api_key, DelegateConfig};

pub const REQUIRED_FIELDS: &[&str] = &[
    "intent",
    "confidence",
    "endpoint",
    "parameters",
    "requiresFiles",
    "explanation",
];

const INSTRUCTION: &str = "You classify requests sent to an image studio assistant.\n\
Return JSON only (no markdown) with exactly these fields:\n\
{\n  \"intent\": \"casual|generate|edit|upscale|enlarge|crop|remove_background|none|multi_step\",\n  \
\"confidence\": 0.0,\n  \"endpoint\": \"workflow name\",\n  \"parameters\": {},\n  \
\"requiresFiles\": false,\n  \"explanation\": \"one sentence\"\n}\n\
For requests that chain several operations, set intent to multi_step and add\n\
\"steps\": [{\"intent\": \"upscale\", \"parameters\": {}}] in execution order.\n\
CONTEXT_JSON describes the message, its attachments, any referenced earlier result and a heuristic guess.";

#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("delegate unavailable: {0}")]
    Unavailable(String),
    #[error("delegate transport failed: {0}")]
    Transport(String),
    #[error("delegate output could not be parsed: {0}")]
    Parse(String),
    #[error("delegate answer failed validation: {0}")]
    Invalid(String),
}

/// One request/response exchange with the external model.
pub trait DelegateTransport: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, instruction: &str, context: &Value) -> Result<String, DelegateError>;
}

pub struct OpenAiResponsesTransport {
    api_base: String,
    model: String,
    api_key: Option<String>,
    max_output_tokens: u64,
    http: HttpClient,
}

impl OpenAiResponsesTransport {
    pub fn new(config: &DelegateConfig, api_key: Option<String>) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building delegate http client")?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            max_output_tokens: config.max_output_tokens,
            http,
        })
    }
}

impl DelegateTransport for OpenAiResponsesTransport {
    fn name(&self) -> &str {
        "openai_responses"
    }

    fn complete(&self, instruction: &str, context: &Value) -> Result<String, DelegateError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| DelegateError::Unavailable("OPENAI_API_KEY not set".to_string()))?;
        let endpoint = format!("{}/responses", self.api_base);
        let payload = json!({
            "model": self.model,
            "input": [{
                "role": "user",
                "content": [{
                    "type": "input_text",
                    "text": format!("{instruction}\nCONTEXT_JSON:\n{context}"),
                }],
            }],
            "max_output_tokens": self.max_output_tokens,
        });

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .map_err(|err| DelegateError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(DelegateError::Transport(format!(
                "{} returned {}: {}",
                endpoint,
                status.as_u16(),
                body.chars().take(512).collect::<String>()
            )));
        }
        let parsed: Value = response
            .json()
            .map_err(|err| DelegateError::Parse(err.to_string()))?;
        let text = extract_output_text(&parsed);
        if text.is_empty() {
            return Err(DelegateError::Parse("response carried no output text".to_string()));
        }
        Ok(text)
    }
}

fn extract_output_text(response: &Value) -> String {
    if let Some(text) = response
        .get("output_text")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return text.to_string();
    }
    let mut parts: Vec<&str> = Vec::new();
    let rows = response
        .get("output")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for row in rows {
        let content = row
            .get("content")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for chunk in content {
            let kind = chunk.get("type").and_then(Value::as_str).unwrap_or_default();
            if !matches!(kind, "output_text" | "text") {
                continue;
            }
            if let Some(text) = chunk
                .get("text")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
            {
                parts.push(text);
            }
        }
    }
    parts.join("\n").trim().to_string()
}

pub struct DelegateClassifier {
    transport: Box<dyn DelegateTransport>,
}

impl DelegateClassifier {
    pub fn new<T: DelegateTransport + 'static>(transport: T) -> Self {
        Self {
            transport: Box::new(transport),
        }
    }

    /// `None` when disabled or when no API key is available.
    pub fn from_config(config: &DelegateConfig) -> Result<Option<Self>> {
        if !config.enabled {
            debug!("delegate classifier disabled by config");
            return Ok(None);
        }
        let Some(api_key) = delegate_api_key() else {
            debug!("no delegate API key; heuristic classification only");
            return Ok(None);
        };
        let transport = OpenAiResponsesTransport::new(config, Some(api_key))?;
        Ok(Some(Self::new(transport)))
    }

    pub fn request(
        &self,
        context: &ClassificationContext<'_>,
    ) -> Result<Classification, DelegateError> {
        let raw = self.transport.complete(INSTRUCTION, &context.to_payload())?;
        let object = parse_json_object(&raw).map_err(DelegateError::Parse)?;
        validate_answer(&object)
    }
}

impl Classifier for DelegateClassifier {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn classify(&self, context: &ClassificationContext<'_>) -> Result<Classification> {
        Ok(self.request(context)?)
    }
}

fn invalid(message: impl Into<String>) -> DelegateError {
    DelegateError::Invalid(message.into())
}

fn parse_family(value: Option<&Value>, field: &str) -> Result<OperationFamily, DelegateError> {
    let raw = value
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(format!("'{field}' must be a string")))?;
    OperationFamily::parse(raw).ok_or_else(|| invalid(format!("unknown intent '{raw}'")))
}

fn parse_confidence(value: Option<&Value>) -> Result<f64, DelegateError> {
    let confidence = value
        .and_then(Value::as_f64)
        .ok_or_else(|| invalid("'confidence' must be a number"))?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(invalid(format!("confidence {confidence} outside [0, 1]")));
    }
    Ok(confidence)
}

fn parse_parameters(value: Option<&Value>) -> Result<Map<String, Value>, DelegateError> {
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(invalid("'parameters' must be an object")),
    }
}

fn parse_steps(value: &Value) -> Result<Vec<PlannedOperation>, DelegateError> {
    let rows = value
        .as_array()
        .ok_or_else(|| invalid("'steps' must be an array"))?;
    if rows.is_empty() {
        return Err(invalid("'steps' is empty"));
    }
    rows.iter()
        .map(|row| {
            let family = parse_family(row.get("intent"), "steps[].intent")?;
            if !family.is_dispatchable() {
                return Err(invalid(format!("step intent '{family}' cannot be executed")));
            }
            Ok(PlannedOperation {
                family,
                parameters: parse_parameters(row.get("parameters"))?,
            })
        })
        .collect()
}

/// Every required field must be present; extra fields are ignored.
fn validate_answer(object: &Map<String, Value>) -> Result<Classification, DelegateError> {
    let steps = match object.get("steps") {
        Some(value) => parse_steps(value)?,
        None => Vec::new(),
    };
    let single_required = if steps.is_empty() {
        REQUIRED_FIELDS
    } else {
        &["confidence", "explanation"][..]
    };
    if let Some(missing) = single_required
        .iter()
        .find(|field| !object.contains_key(**field))
    {
        return Err(invalid(format!("missing required field '{missing}'")));
    }

    let family = if steps.is_empty() {
        parse_family(object.get("intent"), "intent")?
    } else {
        OperationFamily::MultiStep
    };
    if family == OperationFamily::MultiStep && steps.is_empty() {
        return Err(invalid("multi_step intent without steps"));
    }
    if object.contains_key("requiresFiles") && !object["requiresFiles"].is_boolean() {
        return Err(invalid("'requiresFiles' must be a boolean"));
    }
    let confidence = parse_confidence(object.get("confidence"))?;
    let parameters = parse_parameters(object.get("parameters"))?;
    let explanation = object
        .get("explanation")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    Ok(Classification {
        family,
        confidence,
        parameters,
        steps,
        matcher: "delegate".to_string(),
        source: ClassificationSource::Delegate,
        explanation,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use atelier_contracts::plan::OperationFamily;
    use serde_json::{json, Value};

    use super::{
        extract_output_text, validate_answer, DelegateClassifier, DelegateError, DelegateTransport,
    };
    use crate::assign::TurnInputs;
    use crate::classifier::{ClassificationContext, ClassificationSource};
    use crate::reference::ResolvedReference;

    struct CannedTransport {
        reply: String,
        seen: Arc<Mutex<Vec<Value>>>,
    }

    impl DelegateTransport for CannedTransport {
        fn name(&self) -> &str {
            "canned"
        }

        fn complete(&self, _instruction: &str, context: &Value) -> Result<String, DelegateError> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(context.clone());
            }
            Ok(self.reply.clone())
        }
    }

    fn object(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn complete_answer_validates() -> anyhow::Result<()> {
        let answer = validate_answer(&object(json!({
            "intent": "edit",
            "confidence": 0.81,
            "endpoint": "subject_style",
            "parameters": {"strength": 0.4},
            "requiresFiles": true,
            "explanation": "wants the mug recolored",
            "extra": "ignored"
        })))?;
        assert_eq!(answer.family, OperationFamily::Edit);
        assert_eq!(answer.source, ClassificationSource::Delegate);
        assert_eq!(answer.parameters.get("strength"), Some(&json!(0.4)));
        Ok(())
    }

    #[test]
    fn violations_are_rejected() {
        let base = json!({
            "intent": "edit",
            "confidence": 0.8,
            "endpoint": "x",
            "parameters": {},
            "requiresFiles": false,
            "explanation": "y"
        });
        let mut missing = object(base.clone());
        missing.remove("endpoint");
        assert!(matches!(validate_answer(&missing), Err(DelegateError::Invalid(_))));

        let mut out_of_range = object(base.clone());
        out_of_range.insert("confidence".to_string(), json!(1.4));
        assert!(validate_answer(&out_of_range).is_err());

        let mut unknown = object(base.clone());
        unknown.insert("intent".to_string(), json!("teleport"));
        assert!(validate_answer(&unknown).is_err());

        let mut bare_multi = object(base);
        bare_multi.insert("intent".to_string(), json!("multi_step"));
        assert!(validate_answer(&bare_multi).is_err());
    }

    #[test]
    fn steps_answer_becomes_multi_step() -> anyhow::Result<()> {
        let answer = validate_answer(&object(json!({
            "intent": "multi_step",
            "confidence": 0.7,
            "explanation": "two operations",
            "steps": [
                {"intent": "remove_background"},
                {"intent": "crop", "parameters": {"aspect": "square"}}
            ]
        })))?;
        assert_eq!(answer.family, OperationFamily::MultiStep);
        assert_eq!(answer.steps.len(), 2);
        assert_eq!(answer.steps[1].parameters.get("aspect"), Some(&json!("square")));
        Ok(())
    }

    #[test]
    fn fenced_reply_is_repaired_and_context_is_sent() -> anyhow::Result<()> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let transport = CannedTransport {
            reply: "```json\n{intent: \"upscale\", confidence: 0.9, endpoint: \"upscale\", parameters: {}, requiresFiles: true, explanation: \"sharper\",}\n```".to_string(),
            seen: Arc::clone(&seen),
        };
        let delegate = DelegateClassifier::new(transport);
        let inputs = TurnInputs::default();
        let reference = ResolvedReference::none();
        let assignment = crate::assign::assign_slots(&crate::assign::AssignmentRequest {
            inputs: &inputs,
            reference: &reference,
            family: OperationFamily::Generate,
            instruction: None,
        });
        let context = ClassificationContext {
            text: "sharpen this up",
            inputs: &inputs,
            assignment: &assignment,
            reference: &reference,
            last_operation: None,
            prior: None,
        };
        let answer = delegate.request(&context)?;
        assert_eq!(answer.family, OperationFamily::Upscale);

        let seen = seen.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["text"], json!("sharpen this up"));
        Ok(())
    }

    #[test]
    fn output_text_from_content_chunks() {
        let response = json!({
            "output": [{
                "type": "message",
                "content": [
                    {"type": "output_text", "text": "{\"intent\":"},
                    {"type": "refusal", "text": "ignored"},
                    {"type": "output_text", "text": "\"none\"}"}
                ]
            }]
        });
        assert_eq!(extract_output_text(&response), "{\"intent\":\n\"none\"}");
        assert_eq!(extract_output_text(&json!({"output_text": " hi "})), "hi");
    }
}
