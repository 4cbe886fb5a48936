//! Agent-side client for the authorization relay.

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::debug;

use super::relay::{CloseBody, CreateRelayRequest, RelayError, RelayStatus, RelayStatusView, RelayTicket};
use super::types::{HumanAuthDecision, HumanAuthRequest};

/// Default interval between status polls.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// Client that creates relay requests and polls them.
#[derive(Debug, Clone)]
pub struct RelayClient {
    base_url: String,
    api_key: Option<String>,
    poll_interval: Duration,
    client: Client,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            client: Client::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let key = api_key.into();
        self.api_key = (!key.is_empty()).then_some(key);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register a request with the relay.
    pub async fn create(
        &self,
        request: &HumanAuthRequest,
        timeout_sec: u64,
    ) -> Result<RelayTicket, RelayError> {
        let body = CreateRelayRequest {
            capability: request.capability,
            instruction: request.instruction.clone(),
            timeout_sec,
            task_id: Some(request.task_id.clone()),
        };
        let mut builder = self
            .client
            .post(format!("{}/requests", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        Self::read_json(builder.send().await?).await
    }

    /// Fetch the current status of a relay request.
    pub async fn poll(&self, ticket: &RelayTicket) -> Result<RelayStatusView, RelayError> {
        let response = self
            .client
            .get(format!("{}/requests/{}", self.base_url, ticket.id))
            .query(&[("pollToken", ticket.poll_token.as_str())])
            .send()
            .await?;
        Self::read_json(response).await
    }

    /// Settle a request on the relay so its open link stops working.
    pub async fn close(
        &self,
        ticket: &RelayTicket,
        status: RelayStatus,
    ) -> Result<RelayStatusView, RelayError> {
        let body = CloseBody {
            poll_token: ticket.poll_token.clone(),
            status,
        };
        let response = self
            .client
            .post(format!("{}/requests/{}/close", self.base_url, ticket.id))
            .json(&body)
            .send()
            .await?;
        Self::read_json(response).await
    }

    /// Poll until the relay reports a terminal state.
    ///
    /// Transient poll failures are logged and retried. A missing record or a
    /// rejected poll token ends the wait with an error.
    pub async fn wait_for_decision(
        &self,
        ticket: &RelayTicket,
    ) -> Result<HumanAuthDecision, RelayError> {
        loop {
            match self.poll(ticket).await {
                Ok(view) => {
                    if let Some(decision) = view.to_decision() {
                        return Ok(decision);
                    }
                }
                Err(e @ (RelayError::NotFound | RelayError::Unauthorized)) => return Err(e),
                Err(e) => debug!("Relay poll for {} failed: {}", ticket.id, e),
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RelayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            401 => RelayError::Unauthorized,
            404 => RelayError::NotFound,
            409 => RelayError::Conflict,
            410 => RelayError::Expired,
            code => RelayError::Status { status: code, body },
        })
    }
}
