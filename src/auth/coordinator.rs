//! Human-authorization coordinator.
//!
//! Each open request owns a oneshot channel. The operator command channel and
//! the relay poll task both resolve through the same pending registry, so the
//! first resolution wins and any later one finds nothing to resolve.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::relay::RelayTicket;
use super::relay_client::RelayClient;
use super::types::{HumanAuthDecision, HumanAuthRequest};

/// Requests never wait less than this.
pub const MIN_AUTH_TIMEOUT_SECS: u64 = 30;

/// Coordinator errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("No pending authorization request '{0}'")]
    NotPending(String),
    #[error("Request id '{0}' is ambiguous")]
    Ambiguous(String),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

/// Receives newly opened requests, e.g. to print them for an operator.
#[async_trait]
pub trait AuthNotifier: Send + Sync {
    async fn announce(&self, request: &HumanAuthRequest, open_url: Option<&str>)
        -> anyhow::Result<()>;
}

/// Coordinator configuration.
#[derive(Clone, Default)]
pub struct CoordinatorConfig {
    pub relay: Option<RelayClient>,
    pub notifier: Option<Arc<dyn AuthNotifier>>,
}

impl CoordinatorConfig {
    pub fn with_relay(mut self, relay: RelayClient) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AuthNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

struct PendingEntry {
    request: HumanAuthRequest,
    tx: oneshot::Sender<HumanAuthDecision>,
}

type Registry = Arc<Mutex<HashMap<String, PendingEntry>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Remove the entry and deliver the decision. Only the first caller succeeds.
fn resolve_in(registry: &Registry, id: &str, decision: HumanAuthDecision) -> Result<(), AuthError> {
    let entry = lock(registry)
        .remove(id)
        .ok_or_else(|| AuthError::NotPending(id.to_string()))?;
    info!(
        request_id = %id,
        capability = %entry.request.capability,
        status = decision.status.as_str(),
        "authorization request resolved"
    );
    // The waiter may already have given up; the entry is gone either way.
    let _ = entry.tx.send(decision);
    Ok(())
}

/// A request that has been opened and not yet waited on.
pub struct PendingAuth {
    request: HumanAuthRequest,
    rx: oneshot::Receiver<HumanAuthDecision>,
    open_url: Option<String>,
    relay_ticket: Option<RelayTicket>,
    relay_task: Option<JoinHandle<()>>,
}

impl PendingAuth {
    pub fn request(&self) -> &HumanAuthRequest {
        &self.request
    }

    /// Relay page for the human, when a relay is configured.
    pub fn open_url(&self) -> Option<&str> {
        self.open_url.as_deref()
    }
}

/// Issues authorization requests and collects their decisions.
pub struct AuthCoordinator {
    registry: Registry,
    config: CoordinatorConfig,
}

impl AuthCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Effective wait for a request.
    pub fn effective_timeout(timeout_sec: u64) -> u64 {
        timeout_sec.max(MIN_AUTH_TIMEOUT_SECS)
    }

    /// Register a request and expose it on every configured channel.
    pub async fn open(&self, request: HumanAuthRequest) -> PendingAuth {
        let (tx, rx) = oneshot::channel();
        lock(&self.registry).insert(
            request.id.clone(),
            PendingEntry {
                request: request.clone(),
                tx,
            },
        );
        info!(
            request_id = %request.id,
            task_id = %request.task_id,
            capability = %request.capability,
            "authorization requested: {}",
            request.instruction
        );

        let mut open_url = None;
        let mut relay_ticket = None;
        let mut relay_task = None;
        if let Some(relay) = &self.config.relay {
            let timeout = Self::effective_timeout(request.timeout_sec);
            match relay.create(&request, timeout).await {
                Ok(ticket) => {
                    open_url = Some(ticket.open_url.clone());
                    relay_ticket = Some(ticket.clone());
                    let relay = relay.clone();
                    let registry = self.registry.clone();
                    let id = request.id.clone();
                    relay_task = Some(tokio::spawn(async move {
                        match relay.wait_for_decision(&ticket).await {
                            Ok(decision) => {
                                if let Err(e) = resolve_in(&registry, &id, decision) {
                                    debug!("Relay decision arrived late: {}", e);
                                }
                            }
                            Err(e) => warn!("Relay polling for {} stopped: {}", id, e),
                        }
                    }));
                }
                Err(e) => warn!("Failed to create relay request: {}", e),
            }
        }

        if let Some(notifier) = &self.config.notifier {
            if let Err(e) = notifier.announce(&request, open_url.as_deref()).await {
                debug!("Authorization notifier failed: {}", e);
            }
        }

        PendingAuth {
            request,
            rx,
            open_url,
            relay_ticket,
            relay_task,
        }
    }

    /// Wait for a decision or the deadline, whichever comes first.
    pub async fn wait(&self, pending: PendingAuth) -> HumanAuthDecision {
        let PendingAuth {
            request,
            mut rx,
            relay_ticket,
            relay_task,
            ..
        } = pending;
        let timeout = Self::effective_timeout(request.timeout_sec);

        let received = tokio::select! {
            received = &mut rx => Some(received),
            _ = sleep(Duration::from_secs(timeout)) => None,
        };

        let decision = match received {
            Some(Ok(decision)) => decision,
            Some(Err(_)) => HumanAuthDecision::timeout(),
            None => {
                if lock(&self.registry).remove(&request.id).is_some() {
                    info!(request_id = %request.id, "authorization request timed out after {}s", timeout);
                    HumanAuthDecision::timeout()
                } else {
                    // Resolved in the same instant the deadline fired.
                    rx.try_recv().unwrap_or_else(|_| HumanAuthDecision::timeout())
                }
            }
        };

        if let Some(task) = relay_task {
            task.abort();
        }
        // The open link must not outlive a decision made on another channel.
        if let (Some(relay), Some(ticket)) = (&self.config.relay, &relay_ticket) {
            if let Err(e) = relay.close(ticket, decision.status.into()).await {
                warn!("Failed to close relay request {}: {}", ticket.id, e);
            }
        }
        decision
    }

    /// Open a request and wait for its decision.
    pub async fn request(&self, request: HumanAuthRequest) -> HumanAuthDecision {
        let pending = self.open(request).await;
        self.wait(pending).await
    }

    /// Resolve a pending request by its full id.
    pub fn resolve(&self, id: &str, decision: HumanAuthDecision) -> Result<(), AuthError> {
        resolve_in(&self.registry, id, decision)
    }

    /// Requests still waiting, oldest first.
    pub fn pending(&self) -> Vec<HumanAuthRequest> {
        let mut requests: Vec<_> = lock(&self.registry)
            .values()
            .map(|entry| entry.request.clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Expand a full id or unique prefix to a pending id.
    fn find_id(&self, needle: &str) -> Result<String, AuthError> {
        let registry = lock(&self.registry);
        if registry.contains_key(needle) {
            return Ok(needle.to_string());
        }
        let mut matches = registry.keys().filter(|id| id.starts_with(needle));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id.clone()),
            (Some(_), Some(_)) => Err(AuthError::Ambiguous(needle.to_string())),
            (None, _) => Err(AuthError::NotPending(needle.to_string())),
        }
    }

    /// Handle an operator command: `approve <id> [note]` or `reject <id> [note]`.
    ///
    /// The id may be shortened to any unique prefix.
    pub fn handle_command(&self, line: &str) -> Result<String, AuthError> {
        let mut parts = line.trim().splitn(3, char::is_whitespace);
        let verb = parts.next().unwrap_or_default().to_ascii_lowercase();
        let id = parts.next().map(str::trim).unwrap_or_default();
        let note = parts
            .next()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        let approve = match verb.as_str() {
            "approve" | "allow" => true,
            "reject" | "deny" => false,
            _ => {
                return Err(AuthError::InvalidCommand(format!(
                    "expected 'approve <id> [note]' or 'reject <id> [note]', got '{}'",
                    line.trim()
                )))
            }
        };
        if id.is_empty() {
            return Err(AuthError::InvalidCommand(format!("missing request id after '{}'", verb)));
        }

        let id = self.find_id(id)?;
        let decision = if approve {
            HumanAuthDecision::approved(note, None)
        } else {
            HumanAuthDecision::rejected(note)
        };
        self.resolve(&id, decision)?;
        Ok(format!(
            "{} {}",
            if approve { "Approved" } else { "Rejected" },
            id
        ))
    }
}
