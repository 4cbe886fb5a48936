//! Model client module: request building, endpoint fallback and reply parsing.

mod client;
mod extract;
mod messages;

pub use client::{
    CallMode, DecisionProvider, ModelClient, ModelConfig, ModelDecision, ModelError,
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS,
};
pub use extract::{decide, extract_json_object, RawReply, ToolCall};
pub use messages::{MessageBuilder, StepContext};
