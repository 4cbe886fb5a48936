//! Human authorization: requests, decisions, channels and delegation.

mod coordinator;
pub mod delegation;
pub mod relay;
mod relay_client;
pub mod token;
mod types;

pub use coordinator::{
    AuthCoordinator, AuthError, AuthNotifier, CoordinatorConfig, PendingAuth,
    MIN_AUTH_TIMEOUT_SECS,
};
pub use relay::{RelayConfig, RelayError, RelayState, RelayStatus, RelayTicket};
pub use relay_client::{RelayClient, DEFAULT_POLL_INTERVAL_MS};
pub use types::{Artifact, DecisionStatus, HumanAuthDecision, HumanAuthRequest};
