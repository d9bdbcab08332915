//! Reference resolution: turns "this", "it" or an explicit pointer into concrete
//! prior artifacts by walking the conversation history backwards.
//!
//! The walk indexes into the immutable history slice and records every visited
//! anchor, so cyclic back-references and long chains both terminate.

use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, bail, Result};
use atelier_contracts::catalog::PresetCatalog;
use atelier_contracts::chat::{has_back_reference, has_contextual_modifier};
use atelier_contracts::conversation::{ConversationHistory, Turn};
use atelier_contracts::slots::SlotName;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::ResolverConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Explicit,
    AutoPrevious,
    None,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Explicit => "explicit",
            ReferenceKind::AutoPrevious => "auto_previous",
            ReferenceKind::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedReference {
    pub kind: ReferenceKind,
    pub anchor_timestamp: Option<i64>,
    /// Deduplicated, in walk order starting at the anchor.
    pub artifact_urls: Vec<String>,
    /// Request text along the chain, oldest first.
    pub text: String,
    pub inherited_slots: BTreeMap<SlotName, String>,
    /// Inherited values dropped because the current turn supplies that slot.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub superseded_slots: BTreeMap<SlotName, String>,
    pub chain_length: usize,
}

impl ResolvedReference {
    pub fn none() -> Self {
        Self {
            kind: ReferenceKind::None,
            anchor_timestamp: None,
            artifact_urls: Vec::new(),
            text: String::new(),
            inherited_slots: BTreeMap::new(),
            superseded_slots: BTreeMap::new(),
            chain_length: 0,
        }
    }

    pub fn is_none(&self) -> bool {
        self.kind == ReferenceKind::None
    }

    pub fn has_artifact(&self) -> bool {
        !self.artifact_urls.is_empty()
    }

    pub fn primary_artifact(&self) -> Option<&str> {
        self.artifact_urls.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceRequest<'a> {
    /// Explicit reference payload as received; may be serialized JSON.
    pub payload: Option<&'a str>,
    /// Current turn text, used to detect implicit back-references.
    pub text: &'a str,
    /// Slots the current turn already supplies; inheritance never overrides them.
    pub current_slots: &'a [SlotName],
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct ReferencePayload {
    timestamp: Option<i64>,
    url: Option<String>,
}

enum Start {
    Turn(usize),
    Detached(String),
}

#[derive(Default)]
struct Walk {
    artifacts: Vec<String>,
    texts: Vec<String>,
    inherited: BTreeMap<SlotName, String>,
    chain_length: usize,
}

impl Walk {
    fn push_artifact(&mut self, url: &str) {
        if !self.artifacts.iter().any(|existing| existing == url) {
            self.artifacts.push(url.to_string());
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceResolver {
    config: ResolverConfig,
    catalog: PresetCatalog,
}

impl ReferenceResolver {
    pub fn new(config: ResolverConfig, catalog: PresetCatalog) -> Self {
        Self { config, catalog }
    }

    /// Never fails: any parse or lookup problem degrades to `ReferenceKind::None`.
    pub fn resolve(
        &self,
        request: &ReferenceRequest<'_>,
        history: &ConversationHistory,
    ) -> ResolvedReference {
        match self.try_resolve(request, history) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(error = %err, "reference resolution failed; continuing without reference");
                ResolvedReference::none()
            }
        }
    }

    fn try_resolve(
        &self,
        request: &ReferenceRequest<'_>,
        history: &ConversationHistory,
    ) -> Result<ResolvedReference> {
        let explicit = request
            .payload
            .map(str::trim)
            .filter(|payload| !payload.is_empty());

        let (kind, start) = match explicit {
            Some(raw) => {
                let payload = parse_payload(raw)?;
                (ReferenceKind::Explicit, self.locate(&payload, history)?)
            }
            None => {
                if !has_back_reference(request.text) && !has_contextual_modifier(request.text) {
                    return Ok(ResolvedReference::none());
                }
                let Some(index) = history.last_assistant_with_artifacts() else {
                    return Ok(ResolvedReference::none());
                };
                (ReferenceKind::AutoPrevious, Start::Turn(index))
            }
        };

        let mut resolved = match start {
            Start::Detached(url) => ResolvedReference {
                kind,
                anchor_timestamp: None,
                artifact_urls: vec![url],
                text: String::new(),
                inherited_slots: BTreeMap::new(),
                superseded_slots: BTreeMap::new(),
                chain_length: 0,
            },
            Start::Turn(index) => self.walk_chain(kind, index, history),
        };

        for slot in request.current_slots {
            if let Some(value) = resolved.inherited_slots.remove(slot) {
                resolved.superseded_slots.insert(*slot, value);
            }
        }
        if resolved.artifact_urls.is_empty() && resolved.inherited_slots.is_empty() {
            debug!(
                chain_length = resolved.chain_length,
                "reference chain produced nothing usable"
            );
            return Ok(ResolvedReference::none());
        }
        debug!(
            kind = ?resolved.kind,
            chain_length = resolved.chain_length,
            artifacts = resolved.artifact_urls.len(),
            inherited = resolved.inherited_slots.len(),
            "reference resolved"
        );
        Ok(resolved)
    }

    fn locate(&self, payload: &ReferencePayload, history: &ConversationHistory) -> Result<Start> {
        if let Some(timestamp) = payload.timestamp {
            if let Some(index) = history.nearest_to(timestamp, self.config.anchor_window_ms) {
                return Ok(Start::Turn(index));
            }
            if payload.url.is_none() {
                bail!("no turn within {}ms of timestamp {timestamp}", self.config.anchor_window_ms);
            }
        }
        if let Some(url) = &payload.url {
            return Ok(match history.find_artifact(url) {
                Some(index) => Start::Turn(index),
                None => Start::Detached(url.clone()),
            });
        }
        Err(anyhow!("reference payload carries neither timestamp nor url"))
    }

    fn walk_chain(
        &self,
        kind: ReferenceKind,
        index: usize,
        history: &ConversationHistory,
    ) -> ResolvedReference {
        let turns = history.turns();
        let target = &turns[index];
        let mut walk = Walk::default();
        let mut visited: HashSet<usize> = HashSet::new();

        // An assistant target is already the response; chase its request.
        let (mut anchor, mut known_response) = if target.is_assistant() {
            (history.request_for(index), Some(index))
        } else {
            (Some(index), None)
        };

        if anchor.is_none() {
            if let Some(response) = known_response {
                walk.chain_length = 1;
                for url in turns[response].artifact_urls() {
                    walk.push_artifact(url);
                }
            }
        }

        while let Some(current) = anchor {
            if walk.chain_length >= self.config.max_chain_depth {
                debug!(
                    max_depth = self.config.max_chain_depth,
                    "reference chain depth limit reached"
                );
                break;
            }
            if !visited.insert(current) {
                debug!(anchor = current, "reference chain revisited an anchor; stopping");
                break;
            }
            walk.chain_length += 1;

            let turn = &turns[current];
            let response = known_response
                .take()
                .or_else(|| self.find_response(history, current));
            match response {
                Some(response) => {
                    for url in turns[response].artifact_urls() {
                        walk.push_artifact(url);
                    }
                }
                None => {
                    for url in turn.artifact_urls() {
                        if !self.catalog.is_preset(url) {
                            walk.push_artifact(url);
                        }
                    }
                }
            }
            if !turn.text.trim().is_empty() {
                walk.texts.push(turn.text.trim().to_string());
            }
            for url in turn.artifact_urls() {
                if let Some(slot) = self.catalog.slot_for(url) {
                    walk.inherited.entry(slot).or_insert_with(|| url.to_string());
                }
            }

            anchor = self.next_anchor(history, current, turn);
        }

        walk.texts.reverse();
        ResolvedReference {
            kind,
            anchor_timestamp: Some(target.timestamp),
            artifact_urls: walk.artifacts,
            text: walk.texts.join("\n"),
            inherited_slots: walk.inherited,
            superseded_slots: BTreeMap::new(),
            chain_length: walk.chain_length,
        }
    }

    /// Assistant turn with artifacts whose timestamp lands closest after the request.
    fn find_response(&self, history: &ConversationHistory, anchor: usize) -> Option<usize> {
        let anchor_ts = history.get(anchor)?.timestamp;
        let earliest = anchor_ts.saturating_sub(self.config.clock_skew_ms);
        let latest = anchor_ts.saturating_add(self.config.response_window_ms);
        history
            .turns()
            .iter()
            .enumerate()
            .filter(|(idx, turn)| {
                *idx != anchor
                    && turn.is_assistant()
                    && turn.has_artifacts()
                    && turn.timestamp >= earliest
                    && turn.timestamp <= latest
            })
            .min_by_key(|(_, turn)| turn.timestamp.abs_diff(anchor_ts))
            .map(|(idx, _)| idx)
    }

    fn next_anchor(
        &self,
        history: &ConversationHistory,
        current: usize,
        turn: &Turn,
    ) -> Option<usize> {
        if let Some(timestamp) = turn.reference {
            if let Some(index) = history.nearest_to(timestamp, self.config.anchor_window_ms) {
                return self.request_anchor(history, index);
            }
        }
        if !has_back_reference(&turn.text) {
            return None;
        }
        let earlier = (0..current)
            .rev()
            .find(|idx| history.get(*idx).is_some_and(Turn::has_artifacts))?;
        self.request_anchor(history, earlier)
    }

    fn request_anchor(&self, history: &ConversationHistory, index: usize) -> Option<usize> {
        match history.get(index) {
            Some(turn) if turn.is_assistant() => history.request_for(index),
            Some(_) => Some(index),
            None => None,
        }
    }
}

fn parse_payload(raw: &str) -> Result<ReferencePayload> {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => payload_from_value(value, true),
        Err(_) => bare_payload(raw),
    }
}

fn payload_from_value(value: Value, allow_nested: bool) -> Result<ReferencePayload> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .map(|timestamp| ReferencePayload {
                timestamp: Some(timestamp),
                url: None,
            })
            .ok_or_else(|| anyhow!("reference timestamp is not an integer")),
        Value::String(inner) => {
            if allow_nested {
                if let Ok(nested) = serde_json::from_str::<Value>(&inner) {
                    return payload_from_value(nested, false);
                }
            }
            bare_payload(&inner)
        }
        Value::Object(map) => payload_from_object(&map),
        other => bail!("unsupported reference payload: {other}"),
    }
}

fn payload_from_object(map: &Map<String, Value>) -> Result<ReferencePayload> {
    let timestamp = ["timestamp", "anchorTimestamp", "anchor_timestamp"]
        .iter()
        .find_map(|key| map.get(*key))
        .and_then(|value| match value {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.trim().parse::<i64>().ok(),
            _ => None,
        });
    let url = ["url", "artifactUrl", "artifact_url"]
        .iter()
        .find_map(|key| map.get(*key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    if timestamp.is_none() && url.is_none() {
        bail!("reference object has no timestamp or url");
    }
    Ok(ReferencePayload { timestamp, url })
}

fn bare_payload(raw: &str) -> Result<ReferencePayload> {
    let trimmed = raw.trim();
    if let Ok(timestamp) = trimmed.parse::<i64>() {
        return Ok(ReferencePayload {
            timestamp: Some(timestamp),
            url: None,
        });
    }
    if trimmed.contains("://") || trimmed.starts_with('/') {
        return Ok(ReferencePayload {
            timestamp: None,
            url: Some(trimmed.to_string()),
        });
    }
    bail!("unrecognized reference payload '{trimmed}'")
}

#[cfg(test)]
mod tests {
    use atelier_contracts::catalog::PresetCatalog;
    use atelier_contracts::conversation::{Attachment, ConversationHistory, Turn};
    use atelier_contracts::slots::SlotName;

    use super::{parse_payload, ReferenceKind, ReferenceRequest, ReferenceResolver};
    use crate::config::ResolverConfig;

    fn resolver() -> ReferenceResolver {
        ReferenceResolver::new(ResolverConfig::default(), PresetCatalog::default())
    }

    fn request(text: &str) -> ReferenceRequest<'_> {
        ReferenceRequest {
            payload: None,
            text,
            current_slots: &[],
        }
    }

    fn mug_history() -> ConversationHistory {
        ConversationHistory::new(vec![
            Turn::user("a red mug", 1_000)
                .with_attachment(Attachment::new("https://cdn/presets/objects/mug.png"))
                .with_attachment(Attachment::new("https://cdn/library/styles/floral.png")),
            Turn::assistant("here it is", 6_000)
                .with_attachment(Attachment::new("https://cdn/out/mug-1.png")),
        ])
    }

    #[test]
    fn back_reference_picks_latest_output() {
        let resolved = resolver().resolve(&request("make it bigger"), &mug_history());
        assert_eq!(resolved.kind, ReferenceKind::AutoPrevious);
        assert_eq!(resolved.artifact_urls, vec!["https://cdn/out/mug-1.png"]);
        assert_eq!(resolved.anchor_timestamp, Some(6_000));
        assert_eq!(resolved.text, "a red mug");
        assert_eq!(resolved.chain_length, 1);
        assert_eq!(
            resolved.inherited_slots.get(&SlotName::Style).map(String::as_str),
            Some("https://cdn/library/styles/floral.png")
        );
    }

    #[test]
    fn fresh_prompt_without_cue_has_no_reference() {
        let resolved = resolver().resolve(&request("a blue teapot"), &mug_history());
        assert!(resolved.is_none());

        let modifier_only = resolver().resolve(&request("bigger please"), &mug_history());
        assert_eq!(modifier_only.kind, ReferenceKind::AutoPrevious);
    }

    #[test]
    fn current_slots_suppress_inheritance() {
        let req = ReferenceRequest {
            payload: None,
            text: "now do this in watercolor",
            current_slots: &[SlotName::Style],
        };
        let resolved = resolver().resolve(&req, &mug_history());
        assert!(!resolved.inherited_slots.contains_key(&SlotName::Style));
        assert!(resolved.superseded_slots.contains_key(&SlotName::Style));
        assert!(resolved.inherited_slots.contains_key(&SlotName::Subject));
    }

    #[test]
    fn explicit_timestamp_matches_response_within_window() {
        let req = ReferenceRequest {
            payload: Some(r#"{"timestamp": 1200}"#),
            text: "a new idea",
            current_slots: &[],
        };
        let resolved = resolver().resolve(&req, &mug_history());
        assert_eq!(resolved.kind, ReferenceKind::Explicit);
        assert_eq!(resolved.anchor_timestamp, Some(1_000));
        assert_eq!(resolved.artifact_urls, vec!["https://cdn/out/mug-1.png"]);
    }

    #[test]
    fn double_serialized_payload_is_accepted() -> anyhow::Result<()> {
        let inner = serde_json::to_string(&serde_json::json!({"url": "https://cdn/out/mug-1.png"}))?;
        let outer = serde_json::to_string(&inner)?;
        let payload = parse_payload(&outer)?;
        assert_eq!(payload.url.as_deref(), Some("https://cdn/out/mug-1.png"));
        assert_eq!(parse_payload("6000")?.timestamp, Some(6_000));
        assert!(parse_payload("{not json").is_err());
        Ok(())
    }

    #[test]
    fn malformed_or_dangling_payload_degrades_to_none() {
        for payload in ["[1, 2]", "just words", r#"{"timestamp": 999999}"#] {
            let req = ReferenceRequest {
                payload: Some(payload),
                text: "use it",
                current_slots: &[],
            };
            assert!(resolver().resolve(&req, &mug_history()).is_none(), "{payload}");
        }
    }

    #[test]
    fn unknown_url_is_used_as_detached_artifact() {
        let req = ReferenceRequest {
            payload: Some("https://elsewhere/cat.png"),
            text: "",
            current_slots: &[],
        };
        let resolved = resolver().resolve(&req, &mug_history());
        assert_eq!(resolved.kind, ReferenceKind::Explicit);
        assert_eq!(resolved.chain_length, 0);
        assert_eq!(resolved.primary_artifact(), Some("https://elsewhere/cat.png"));
    }

    #[test]
    fn pronoun_chain_collects_earlier_outputs() {
        let history = ConversationHistory::new(vec![
            Turn::user("a mug", 1_000),
            Turn::assistant("ok", 3_000).with_attachment(Attachment::new("https://cdn/out/1.png")),
            Turn::user("make it blue", 10_000),
            Turn::assistant("ok", 12_000).with_attachment(Attachment::new("https://cdn/out/2.png")),
        ]);
        let resolved = resolver().resolve(&request("upscale it"), &history);
        assert_eq!(
            resolved.artifact_urls,
            vec!["https://cdn/out/2.png", "https://cdn/out/1.png"]
        );
        assert_eq!(resolved.chain_length, 2);
        assert_eq!(resolved.text, "a mug\nmake it blue");
    }

    #[test]
    fn user_upload_without_response_is_the_artifact() {
        let history = ConversationHistory::new(vec![
            Turn::user("here is my photo", 1_000)
                .with_attachment(Attachment::new("https://cdn/uploads/me.png")),
            Turn::assistant("nice photo", 2_000),
        ]);
        let req = ReferenceRequest {
            payload: Some("1000"),
            text: "",
            current_slots: &[],
        };
        let resolved = resolver().resolve(&req, &history);
        assert_eq!(resolved.artifact_urls, vec!["https://cdn/uploads/me.png"]);
    }

    #[test]
    fn extreme_timestamp_payloads_degrade_to_none() {
        for payload in [
            "-9223372036854775808",
            "9223372036854775807",
            r#"{"timestamp": -9223372036854775808}"#,
        ] {
            let req = ReferenceRequest {
                payload: Some(payload),
                text: "use it",
                current_slots: &[],
            };
            assert!(resolver().resolve(&req, &mug_history()).is_none(), "{payload}");
        }
    }

    #[test]
    fn response_lookup_survives_turns_at_the_clock_edges() {
        let history = ConversationHistory::new(vec![
            Turn::user("a mug", i64::MIN),
            Turn::assistant("ok", i64::MIN + 10)
                .with_attachment(Attachment::new("https://cdn/out/early.png")),
            Turn::user("make it taller", i64::MAX - 10),
            Turn::assistant("ok", i64::MAX).with_attachment(Attachment::new("https://cdn/out/late.png")),
        ]);
        let req = ReferenceRequest {
            payload: Some("-9223372036854775808"),
            text: "",
            current_slots: &[],
        };
        let resolved = resolver().resolve(&req, &history);
        assert_eq!(resolved.kind, ReferenceKind::Explicit);
        assert_eq!(resolved.artifact_urls, vec!["https://cdn/out/early.png"]);

        let latest = resolver().resolve(&request("upscale it"), &history);
        assert_eq!(latest.primary_artifact(), Some("https://cdn/out/late.png"));
    }

    #[test]
    fn long_pronoun_chain_stops_at_depth_limit() {
        let mut turns = Vec::new();
        for step in 0..14_i64 {
            let at = step * 10_000 + 1_000;
            turns.push(Turn::user(format!("make it variant {step}"), at));
            turns.push(
                Turn::assistant("ok", at + 2_000)
                    .with_attachment(Attachment::new(format!("https://cdn/out/{step}.png"))),
            );
        }
        let history = ConversationHistory::new(turns);
        let resolver = ReferenceResolver::new(
            ResolverConfig {
                max_chain_depth: 3,
                ..ResolverConfig::default()
            },
            PresetCatalog::default(),
        );
        let resolved = resolver.resolve(&request("upscale it"), &history);
        assert_eq!(resolved.kind, ReferenceKind::AutoPrevious);
        assert_eq!(resolved.chain_length, 3);
        assert_eq!(
            resolved.artifact_urls,
            vec![
                "https://cdn/out/13.png",
                "https://cdn/out/12.png",
                "https://cdn/out/11.png"
            ]
        );
        assert_eq!(
            resolved.text,
            "make it variant 11\nmake it variant 12\nmake it variant 13"
        );
    }
}
