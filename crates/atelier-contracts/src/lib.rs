pub mod catalog;
pub mod chat;
pub mod conversation;
pub mod events;
pub mod plan;
pub mod slots;
