mod log;
mod turn;

pub use log::{ConversationLog, ExecutionRecord};
pub use turn::{Attachment, ConversationHistory, Role, Turn};

/// Current time as Unix epoch milliseconds, the unit of `Turn::timestamp`.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
