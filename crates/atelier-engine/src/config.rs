use std::env;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use atelier_contracts::catalog::{PresetCatalog, PrefixRule};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_MAX_CHAIN_DEPTH: usize = 10;
pub const DEFAULT_BYPASS_THRESHOLD: f64 = 0.95;
pub const DEFAULT_DELEGATE_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_DELEGATE_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub resolver: ResolverConfig,
    pub classifier: ClassifierConfig,
    pub delegate: DelegateConfig,
    pub dispatch: DispatchConfig,
    pub catalog: Option<Vec<PrefixRule>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub max_chain_depth: usize,
    /// How long after a request its assistant response may land and still match.
    pub response_window_ms: i64,
    /// Tolerated negative drift between a request and its response.
    pub clock_skew_ms: i64,
    /// Window used to locate the turn an explicit timestamp points at.
    pub anchor_window_ms: i64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
            response_window_ms: 120_000,
            clock_skew_ms: 2_000,
            anchor_window_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub bypass_threshold: f64,
    /// Heuristic matchers trusted enough to skip the delegate.
    pub bypass_matchers: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            bypass_threshold: DEFAULT_BYPASS_THRESHOLD,
            bypass_matchers: ["slash_command", "greeting", "upscale_verb", "remove_background_verb"]
                .iter()
                .map(|item| (*item).to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegateConfig {
    pub enabled: bool,
    pub model: String,
    pub api_base: String,
    pub timeout_secs: u64,
    pub max_output_tokens: u64,
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: DEFAULT_DELEGATE_MODEL.to_string(),
            api_base: DEFAULT_DELEGATE_API_BASE.to_string(),
            timeout_secs: 20,
            max_output_tokens: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchKind {
    #[default]
    Dryrun,
    Http,
}

impl FromStr for DispatchKind {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dryrun" | "dry-run" | "dry_run" => Ok(DispatchKind::Dryrun),
            "http" => Ok(DispatchKind::Http),
            other => Err(format!("unknown dispatch kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub kind: DispatchKind,
    pub endpoint: Option<String>,
    /// Per-step timeout.
    pub timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            kind: DispatchKind::Dryrun,
            endpoint: None,
            timeout_secs: 120,
        }
    }
}

impl EngineConfig {
    /// Defaults, then the optional JSON file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = parse_override(&read, "ATELIER_MAX_CHAIN_DEPTH") {
            self.resolver.max_chain_depth = value;
        }
        if let Some(value) = parse_override(&read, "ATELIER_RESPONSE_WINDOW_MS") {
            self.resolver.response_window_ms = value;
        }
        if let Some(value) = parse_override::<f64, _>(&read, "ATELIER_BYPASS_THRESHOLD") {
            self.classifier.bypass_threshold = value.clamp(0.0, 1.0);
        }
        if let Some(value) = read("ATELIER_DELEGATE_MODEL") {
            self.delegate.model = value;
        }
        if let Some(value) = read("ATELIER_DELEGATE_API_BASE")
            .or_else(|| read("OPENAI_API_BASE"))
            .or_else(|| read("OPENAI_BASE_URL"))
        {
            self.delegate.api_base = value.trim_end_matches('/').to_string();
        }
        if let Some(value) = parse_override(&read, "ATELIER_DELEGATE_TIMEOUT_SECS") {
            self.delegate.timeout_secs = value;
        }
        if let Some(value) = parse_override(&read, "ATELIER_DISPATCH_KIND") {
            self.dispatch.kind = value;
        }
        if let Some(value) = read("ATELIER_DISPATCH_ENDPOINT") {
            self.dispatch.endpoint = Some(value);
        }
        if let Some(value) = parse_override(&read, "ATELIER_DISPATCH_TIMEOUT_SECS") {
            self.dispatch.timeout_secs = value;
        }
    }

    pub fn preset_catalog(&self) -> PresetCatalog {
        PresetCatalog::new(self.catalog.clone())
    }
}

fn parse_override<T, R>(read: &R, key: &str) -> Option<T>
where
    T: FromStr,
    R: Fn(&str) -> Option<String>,
{
    let raw = read(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring invalid environment override");
            None
        }
    }
}

pub fn delegate_api_key() -> Option<String> {
    first_non_empty_env(&["OPENAI_API_KEY", "OPENAI_API_KEY_BACKUP"])
}

fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}
