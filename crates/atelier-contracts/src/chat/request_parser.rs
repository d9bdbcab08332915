use super::phrases::{
    CommandSpec, BACK_REFERENCE_CUES, ENLARGE_MODIFIERS, REFERENCE_NOUNS, REPEAT_MODIFIERS,
    SEQUENCE_SEPARATORS, SLASH_COMMANDS, TIGHTEN_MODIFIERS,
};
use crate::plan::OperationFamily;
use crate::slots::SlotName;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashCommand {
    pub command: String,
    pub family: Option<OperationFamily>,
    pub args: Vec<String>,
}

/// Lowercased word tokens. Ratio tokens such as `16:9` survive intact.
pub fn tokens(text: &str) -> Vec<String> {
    text.to_ascii_lowercase()
        .split(|ch: char| !(ch.is_ascii_alphanumeric() || ch == ':'))
        .map(|token| token.trim_matches(':'))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn contains_phrase(tokens: &[String], phrase: &str) -> bool {
    let needle: Vec<&str> = phrase.split_whitespace().collect();
    if needle.is_empty() || needle.len() > tokens.len() {
        return false;
    }
    tokens
        .windows(needle.len())
        .any(|window| window.iter().zip(&needle).all(|(left, right)| left == right))
}

pub fn first_phrase<'a>(tokens: &[String], phrases: &[&'a str]) -> Option<&'a str> {
    phrases
        .iter()
        .copied()
        .find(|phrase| contains_phrase(tokens, phrase))
}

pub fn contains_any(tokens: &[String], phrases: &[&str]) -> bool {
    first_phrase(tokens, phrases).is_some()
}

/// True when the text points back at earlier content ("it", "this", "that"...).
pub fn has_back_reference(text: &str) -> bool {
    contains_any(&tokens(text), BACK_REFERENCE_CUES)
}

/// Modifier words ("bigger", "again") that only make sense against an earlier result.
pub fn has_contextual_modifier(text: &str) -> bool {
    let tokens = tokens(text);
    [ENLARGE_MODIFIERS, TIGHTEN_MODIFIERS, REPEAT_MODIFIERS]
        .iter()
        .any(|phrases| contains_any(&tokens, phrases))
}

/// Extracts "use the reference for <slot> only" style instructions.
pub fn parse_role_instruction(text: &str) -> Option<SlotName> {
    let tokens = tokens(text);
    let restrictive = tokens
        .iter()
        .any(|token| matches!(token.as_str(), "use" | "only" | "just"));
    if !restrictive {
        return None;
    }

    for (idx, token) in tokens.iter().enumerate() {
        if token != "for" && token != "as" {
            continue;
        }
        let window_start = idx.saturating_sub(4);
        let mentions_reference = tokens[window_start..idx]
            .iter()
            .any(|candidate| REFERENCE_NOUNS.contains(&candidate.as_str()));
        if !mentions_reference {
            continue;
        }
        let slot = tokens[idx + 1..]
            .iter()
            .find(|candidate| !matches!(candidate.as_str(), "the" | "its" | "a" | "my"))
            .and_then(|candidate| SlotName::parse(candidate));
        if slot.is_some() {
            return slot;
        }
    }
    None
}

/// Splits "upscale then crop to landscape" into ordered clauses.
/// Returns a single clause when no sequencing word is present.
pub fn split_sequence(text: &str) -> Vec<String> {
    let mut clauses = vec![format!(" {} ", text.trim().to_ascii_lowercase())];
    for separator in SEQUENCE_SEPARATORS {
        clauses = clauses
            .into_iter()
            .flat_map(|clause| {
                clause
                    .split(separator)
                    .map(|part| format!(" {} ", part.trim()))
                    .collect::<Vec<String>>()
            })
            .collect();
    }
    clauses
        .into_iter()
        .map(|clause| {
            clause
                .trim()
                .trim_matches(|ch: char| ch == ',' || ch == '.' || ch == ';')
                .trim()
                .to_string()
        })
        .filter(|clause| !clause.is_empty())
        .collect()
}

/// Aspect requested by a crop clause: `landscape`, `portrait`, `square` or a `W:H` ratio.
pub fn parse_crop_aspect(text: &str) -> Option<String> {
    let tokens = tokens(text);
    for token in &tokens {
        let aspect = match token.as_str() {
            "landscape" | "wide" | "widescreen" | "horizontal" => Some("landscape"),
            "portrait" | "vertical" | "tall" => Some("portrait"),
            "square" => Some("square"),
            _ => None,
        };
        if let Some(aspect) = aspect {
            return Some(aspect.to_string());
        }
        if let Some((left, right)) = token.split_once(':') {
            let valid = |part: &str| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit());
            if valid(left) && valid(right) {
                return Some(token.clone());
            }
        }
    }
    None
}

fn parse_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn find_family(command: &str, specs: &[CommandSpec]) -> Option<OperationFamily> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.family)
}

pub fn parse_slash_command(text: &str) -> Option<SlashCommand> {
    let slash_tail = text.trim().strip_prefix('/')?;
    let command_len = slash_tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    if command_len == 0 {
        return None;
    }
    let command = slash_tail[..command_len].to_ascii_lowercase();
    let args = parse_args(&slash_tail[command_len..]);
    Some(SlashCommand {
        family: find_family(&command, SLASH_COMMANDS),
        command,
        args,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        contains_phrase, has_back_reference, has_contextual_modifier, parse_crop_aspect,
        parse_role_instruction, parse_slash_command, split_sequence, tokens,
    };
    use crate::plan::OperationFamily;
    use crate::slots::SlotName;

    #[test]
    fn phrases_match_on_word_boundaries() {
        let words = tokens("Please upscale it, thanks!");
        assert!(contains_phrase(&words, "upscale"));
        assert!(contains_phrase(&words, "upscale it"));
        assert!(!contains_phrase(&tokens("hitherto"), "hi"));
    }

    #[test]
    fn role_instruction_variants() {
        assert_eq!(
            parse_role_instruction("use reference for palette only"),
            Some(SlotName::Palette)
        );
        assert_eq!(
            parse_role_instruction("Use this image as the style"),
            Some(SlotName::Style)
        );
        assert_eq!(
            parse_role_instruction("only use it for the colors"),
            Some(SlotName::Palette)
        );
        assert_eq!(parse_role_instruction("a mug for palette lovers"), None);
        assert_eq!(parse_role_instruction("make it for the style contest"), None);
    }

    #[test]
    fn sequence_split_keeps_order() {
        assert_eq!(
            split_sequence("Upscale then crop to landscape."),
            vec!["upscale", "crop to landscape"]
        );
        assert_eq!(
            split_sequence("remove the background, and then upscale it"),
            vec!["remove the background", "upscale it"]
        );
        assert_eq!(split_sequence("a mug with flowers"), vec!["a mug with flowers"]);
    }

    #[test]
    fn crop_aspect_words_and_ratios() {
        assert_eq!(parse_crop_aspect("crop to landscape").as_deref(), Some("landscape"));
        assert_eq!(parse_crop_aspect("crop it 16:9").as_deref(), Some("16:9"));
        assert_eq!(parse_crop_aspect("crop to: square").as_deref(), Some("square"));
        assert_eq!(parse_crop_aspect("crop the edges"), None);
    }

    #[test]
    fn back_reference_cues() {
        assert!(has_back_reference("make it bigger"));
        assert!(has_back_reference("use the previous"));
        assert!(!has_back_reference("a cat on a mug"));
        assert!(has_contextual_modifier("bigger please"));
        assert!(has_contextual_modifier("one more"));
        assert!(!has_contextual_modifier("a big mug"));
    }

    #[test]
    fn slash_commands_resolve_families() {
        let crop = parse_slash_command("/crop \"16:9\"").unwrap();
        assert_eq!(crop.family, Some(OperationFamily::Crop));
        assert_eq!(crop.args, vec!["16:9"]);

        let unknown = parse_slash_command("/magic wand").unwrap();
        assert_eq!(unknown.command, "magic");
        assert_eq!(unknown.family, None);

        assert!(parse_slash_command("no slash").is_none());
        assert!(parse_slash_command("/ upscale").is_none());
    }
}
