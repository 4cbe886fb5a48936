//! Actions module: the typed action union and its normalizer.

mod action;
mod normalize;

pub use action::{
    Action, ActionKind, Capability, DEFAULT_HUMAN_AUTH_TIMEOUT_SECS, DEFAULT_SCRIPT_TIMEOUT_SECS,
    DEFAULT_SWIPE_DURATION_MS, DEFAULT_WAIT_DURATION_MS,
};
pub use normalize::{normalize, to_number};
