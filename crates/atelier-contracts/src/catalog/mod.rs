use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::slots::SlotName;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixRule {
    pub prefix: String,
    pub slot: SlotName,
}

/// Path conventions that mark an artifact as a preset or library selection.
///
/// Rules are checked in insertion order; the first prefix found anywhere in the
/// artifact URL decides the slot.
#[derive(Debug, Clone)]
pub struct PresetCatalog {
    prefixes: IndexMap<String, SlotName>,
}

impl PresetCatalog {
    pub fn new(rules: Option<Vec<PrefixRule>>) -> Self {
        let prefixes: IndexMap<String, SlotName> = rules
            .unwrap_or_default()
            .into_iter()
            .filter(|rule| !rule.prefix.trim().is_empty())
            .map(|rule| (rule.prefix, rule.slot))
            .collect();
        if prefixes.is_empty() {
            return Self {
                prefixes: default_prefixes(),
            };
        }
        Self { prefixes }
    }

    pub fn slot_for(&self, url: &str) -> Option<SlotName> {
        self.prefixes
            .iter()
            .find(|(prefix, _)| url.contains(prefix.as_str()))
            .map(|(_, slot)| *slot)
    }

    pub fn is_preset(&self, url: &str) -> bool {
        self.slot_for(url).is_some()
    }
}

impl Default for PresetCatalog {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_prefixes() -> IndexMap<String, SlotName> {
    let mut map = IndexMap::new();
    let mut insert = |prefix: &str, slot: SlotName| {
        map.insert(prefix.to_string(), slot);
    };

    insert("/presets/objects/", SlotName::Subject);
    insert("/catalog/products/", SlotName::Subject);
    insert("/library/styles/", SlotName::Style);
    insert("/presets/styles/", SlotName::Style);
    insert("/library/palettes/", SlotName::Palette);
    insert("/presets/palettes/", SlotName::Palette);

    map
}
