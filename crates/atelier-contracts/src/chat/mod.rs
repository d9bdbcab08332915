pub mod phrases;
pub mod request_parser;

pub use request_parser::{
    has_back_reference, has_contextual_modifier, parse_crop_aspect, parse_role_instruction,
    parse_slash_command, split_sequence, SlashCommand,
};
