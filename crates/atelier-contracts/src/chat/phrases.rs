use crate::plan::OperationFamily;

#[derive(Clone, Copy, Debug)]
pub struct CommandSpec {
    pub command: &'static str,
    pub family: OperationFamily,
}

pub const SLASH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "upscale",
        family: OperationFamily::Upscale,
    },
    CommandSpec {
        command: "enlarge",
        family: OperationFamily::Enlarge,
    },
    CommandSpec {
        command: "crop",
        family: OperationFamily::Crop,
    },
    CommandSpec {
        command: "remove_background",
        family: OperationFamily::RemoveBackground,
    },
    CommandSpec {
        command: "remove_bg",
        family: OperationFamily::RemoveBackground,
    },
    CommandSpec {
        command: "edit",
        family: OperationFamily::Edit,
    },
    CommandSpec {
        command: "generate",
        family: OperationFamily::Generate,
    },
];

pub const GREETINGS: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "hiya",
    "howdy",
    "yo",
    "good morning",
    "good afternoon",
    "good evening",
    "thanks",
    "thank you",
];

pub const REMOVE_BACKGROUND_PHRASES: &[&str] = &[
    "remove background",
    "remove the background",
    "remove its background",
    "remove bg",
    "background removal",
    "cut out",
    "cutout",
    "transparent background",
    "no background",
];

pub const UPSCALE_PHRASES: &[&str] = &[
    "upscale",
    "upres",
    "increase resolution",
    "increase the resolution",
    "higher resolution",
    "enhance resolution",
    "hd version",
    "4k",
];

pub const CROP_PHRASES: &[&str] = &["crop", "reframe", "trim the edges"];

/// Modifiers that need a previous artifact and no fresh upload.
pub const ENLARGE_MODIFIERS: &[&str] = &[
    "bigger",
    "larger",
    "enlarge",
    "blow it up",
    "zoom out",
    "expand",
    "extend",
];

pub const TIGHTEN_MODIFIERS: &[&str] = &["smaller", "tighter", "zoom in", "closer"];

pub const REPEAT_MODIFIERS: &[&str] = &[
    "again",
    "another one",
    "one more",
    "same again",
    "redo",
    "retry",
    "try again",
];

pub const EDIT_PHRASES: &[&str] = &[
    "make it",
    "make the",
    "turn it into",
    "turn this into",
    "change",
    "replace",
    "swap",
    "recolor",
    "recolour",
    "edit",
    "add",
    "remove",
    "apply",
];

pub const GENERATE_PHRASES: &[&str] = &[
    "show me",
    "mock up",
    "mockup",
    "create",
    "generate",
    "make",
    "draw",
    "design",
    "render",
    "imagine",
    "paint",
    "produce",
];

pub const BACK_REFERENCE_CUES: &[&str] = &[
    "it",
    "this",
    "that",
    "these",
    "those",
    "previous",
    "last one",
    "the result",
    "same",
];

pub const SEQUENCE_SEPARATORS: &[&str] = &[
    " and then ",
    " after that ",
    " afterwards ",
    " followed by ",
    " then ",
    ", next ",
];

pub const REFERENCE_NOUNS: &[&str] = &[
    "reference",
    "ref",
    "it",
    "this",
    "that",
    "image",
    "result",
    "previous",
];
