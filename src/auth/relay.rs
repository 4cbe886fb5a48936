//! HTTP relay exposing authorization requests through tokenized pages.
//!
//! The agent creates a request with its API key and receives a single-use
//! open URL for the human plus a poll token for itself. Only SHA-256 hashes
//! of tokens are kept.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::token;
use super::types::{Artifact, DecisionStatus, HumanAuthDecision};
use crate::actions::Capability;

/// Terminal records older than this are dropped.
const RETENTION_SECS: i64 = 3600;

/// Upper bound on a request's lifetime.
const MAX_TTL_SECS: u64 = 7 * 24 * 3600;

/// Relay errors, shared by the server and its client.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("request not found")]
    NotFound,
    #[error("invalid or missing token")]
    Unauthorized,
    #[error("request already resolved")]
    Conflict,
    #[error("request expired")]
    Expired,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("relay HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("relay returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

impl RelayError {
    fn status_code(&self) -> StatusCode {
        match self {
            RelayError::NotFound => StatusCode::NOT_FOUND,
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::Conflict => StatusCode::CONFLICT,
            RelayError::Expired => StatusCode::GONE,
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::Transport(_) | RelayError::Status { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Status of a relay record as reported to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl From<DecisionStatus> for RelayStatus {
    fn from(status: DecisionStatus) -> Self {
        match status {
            DecisionStatus::Approved => RelayStatus::Approved,
            DecisionStatus::Rejected => RelayStatus::Rejected,
            DecisionStatus::Timeout => RelayStatus::Timeout,
        }
    }
}

/// `POST /requests` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRelayRequest {
    pub capability: Capability,
    pub instruction: String,
    pub timeout_sec: u64,
    #[serde(default)]
    pub task_id: Option<String>,
}

/// `POST /requests` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayTicket {
    pub id: String,
    pub open_url: String,
    pub poll_token: String,
    pub expires_at: DateTime<Utc>,
}

/// `GET /requests/{id}` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatusView {
    pub id: String,
    pub status: RelayStatus,
    pub note: Option<String>,
    pub artifact: Option<Artifact>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl RelayStatusView {
    /// The decision this view represents, if terminal.
    pub fn to_decision(&self) -> Option<HumanAuthDecision> {
        let status = match self.status {
            RelayStatus::Pending => return None,
            RelayStatus::Approved => DecisionStatus::Approved,
            RelayStatus::Rejected => DecisionStatus::Rejected,
            RelayStatus::Timeout => DecisionStatus::Timeout,
        };
        Some(HumanAuthDecision {
            status,
            note: self.note.clone(),
            artifact: self.artifact.clone(),
            decided_at: self.decided_at.unwrap_or_else(Utc::now),
        })
    }
}

/// `POST /requests/{id}/resolve` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveBody {
    pub token: String,
    pub decision: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub artifact: Option<Artifact>,
}

/// `POST /requests/{id}/close` body, sent by the agent once the request was
/// settled on another channel or timed out locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseBody {
    pub poll_token: String,
    pub status: RelayStatus,
}

#[derive(Debug, Deserialize)]
struct PollParams {
    #[serde(rename = "pollToken")]
    poll_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageParams {
    token: Option<String>,
}

#[derive(Debug, Clone)]
struct RelayRecord {
    capability: Capability,
    instruction: String,
    /// Cleared once the open token has been used.
    open_token_hash: Option<String>,
    poll_token_hash: String,
    expires_at: DateTime<Utc>,
    status: RelayStatus,
    note: Option<String>,
    artifact: Option<Artifact>,
    decided_at: Option<DateTime<Utc>>,
}

impl RelayRecord {
    /// Flip an overdue pending record to timeout.
    fn refresh(&mut self, now: DateTime<Utc>) {
        if self.status == RelayStatus::Pending && now >= self.expires_at {
            self.status = RelayStatus::Timeout;
            self.decided_at = Some(self.expires_at);
            self.open_token_hash = None;
        }
    }

    fn view(&self, id: &str) -> RelayStatusView {
        RelayStatusView {
            id: id.to_string(),
            status: self.status,
            note: self.note.clone(),
            artifact: self.artifact.clone(),
            decided_at: self.decided_at,
        }
    }
}

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base URL humans reach the relay on, used to build open URLs.
    pub public_url: String,
    /// SHA-256 of the API key agents must present, if any.
    pub api_key_hash: Option<String>,
}

impl RelayConfig {
    pub fn new(public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into().trim_end_matches('/').to_string(),
            api_key_hash: None,
        }
    }

    /// Require agents to present this API key. Only its hash is kept.
    pub fn with_api_key(mut self, api_key: &str) -> Self {
        if !api_key.is_empty() {
            self.api_key_hash = Some(token::sha256_hex(api_key));
        }
        self
    }
}

/// Shared state for relay handlers.
pub struct RelayState {
    config: RelayConfig,
    records: Mutex<HashMap<String, RelayRecord>>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            records: Mutex::new(HashMap::new()),
        })
    }

    fn check_api_key(&self, headers: &HeaderMap) -> Result<(), RelayError> {
        let Some(expected) = &self.config.api_key_hash else {
            return Ok(());
        };
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");
        if presented.is_empty() || !token::verify(presented, expected) {
            return Err(RelayError::Unauthorized);
        }
        Ok(())
    }

    async fn create(&self, body: CreateRelayRequest) -> RelayTicket {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let open_token = token::generate();
        let poll_token = token::generate();
        let expires_at = now + ChronoDuration::seconds(body.timeout_sec.min(MAX_TTL_SECS) as i64);

        let record = RelayRecord {
            capability: body.capability,
            instruction: body.instruction,
            open_token_hash: Some(token::sha256_hex(&open_token)),
            poll_token_hash: token::sha256_hex(&poll_token),
            expires_at,
            status: RelayStatus::Pending,
            note: None,
            artifact: None,
            decided_at: None,
        };

        let mut records = self.records.lock().await;
        records.retain(|_, r| {
            r.status == RelayStatus::Pending
                || r.decided_at
                    .map(|t| now - t < ChronoDuration::seconds(RETENTION_SECS))
                    .unwrap_or(true)
        });
        records.insert(id.clone(), record);

        info!(request_id = %id, capability = %body.capability, "relay request created");
        RelayTicket {
            open_url: format!("{}/requests/{}/page?token={}", self.config.public_url, id, open_token),
            id,
            poll_token,
            expires_at,
        }
    }

    async fn poll(&self, id: &str, poll_token: &str) -> Result<RelayStatusView, RelayError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(id).ok_or(RelayError::NotFound)?;
        if !token::verify(poll_token, &record.poll_token_hash) {
            return Err(RelayError::Unauthorized);
        }
        record.refresh(Utc::now());
        Ok(record.view(id))
    }

    async fn resolve(&self, id: &str, body: ResolveBody) -> Result<RelayStatusView, RelayError> {
        let status = match body.decision.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => RelayStatus::Approved,
            "reject" | "rejected" | "deny" => RelayStatus::Rejected,
            other => return Err(RelayError::BadRequest(format!("unknown decision '{}'", other))),
        };

        let mut records = self.records.lock().await;
        let record = records.get_mut(id).ok_or(RelayError::NotFound)?;
        let now = Utc::now();

        let Some(open_hash) = record.open_token_hash.as_deref() else {
            return Err(if record.status == RelayStatus::Timeout {
                RelayError::Expired
            } else {
                RelayError::Conflict
            });
        };
        if !token::verify(&body.token, open_hash) {
            return Err(RelayError::Unauthorized);
        }
        record.refresh(now);
        if record.status == RelayStatus::Timeout {
            return Err(RelayError::Expired);
        }

        record.open_token_hash = None;
        record.status = status;
        record.note = body.note.filter(|n| !n.trim().is_empty());
        record.artifact = if status == RelayStatus::Approved {
            body.artifact
        } else {
            None
        };
        record.decided_at = Some(now);
        info!(request_id = %id, status = ?status, "relay request resolved");
        Ok(record.view(id))
    }

    /// Settle a record from the agent side and invalidate its open token.
    ///
    /// A record that is already terminal keeps its decision.
    async fn close(&self, id: &str, body: CloseBody) -> Result<RelayStatusView, RelayError> {
        if body.status == RelayStatus::Pending {
            return Err(RelayError::BadRequest("cannot close a request as pending".into()));
        }
        let mut records = self.records.lock().await;
        let record = records.get_mut(id).ok_or(RelayError::NotFound)?;
        if !token::verify(&body.poll_token, &record.poll_token_hash) {
            return Err(RelayError::Unauthorized);
        }
        let now = Utc::now();
        record.refresh(now);
        record.open_token_hash = None;
        if record.status == RelayStatus::Pending {
            record.status = body.status;
            record.decided_at = Some(now);
            info!(request_id = %id, status = ?body.status, "relay request closed by agent");
        }
        Ok(record.view(id))
    }

    async fn page(&self, id: &str, open_token: &str) -> Result<String, RelayError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(id).ok_or(RelayError::NotFound)?;
        record.refresh(Utc::now());
        match (&record.open_token_hash, record.status) {
            (_, RelayStatus::Timeout) => Err(RelayError::Expired),
            (None, _) => Err(RelayError::Conflict),
            (Some(hash), _) if !token::verify(open_token, hash) => Err(RelayError::Unauthorized),
            (Some(_), _) => Ok(render_page(id, record, open_token)),
        }
    }
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn render_page(id: &str, record: &RelayRecord, open_token: &str) -> String {
    let geo_fields = if record.capability == Capability::Location {
        r#"<p><input id="lat" placeholder="Latitude" inputmode="decimal" style="width:48%;padding:.5rem">
<input id="lon" placeholder="Longitude" inputmode="decimal" style="width:48%;padding:.5rem"></p>"#
    } else {
        ""
    };
    format!(
        r#"<!doctype html>
<html><head><meta charset="utf-8"><meta name="viewport" content="width=device-width,initial-scale=1">
<title>Authorization request</title></head>
<body style="font-family:sans-serif;max-width:32rem;margin:2rem auto;padding:0 1rem">
<h2>Authorization needed: {capability}</h2>
<p>{instruction}</p>
<p><small>Expires {expires}</small></p>
<input id="note" placeholder="Code or note (optional)" style="width:100%;padding:.5rem">
{geo_fields}
<p><label>Image (optional) <input id="image" type="file" accept="image/*"></label></p>
<p><button onclick="send('approve')">Approve</button> <button onclick="send('reject')">Reject</button></p>
<p id="out"></p>
<script>
function value(id) {{
  const el = document.getElementById(id);
  return el ? el.value.trim() : "";
}}
async function artifact() {{
  const file = document.getElementById("image").files[0];
  if (file) {{
    const url = await new Promise((ok, fail) => {{
      const reader = new FileReader();
      reader.onload = () => ok(reader.result);
      reader.onerror = fail;
      reader.readAsDataURL(file);
    }});
    return {{kind: "image", mime: file.type || "image/png", bytes: url.split(",")[1]}};
  }}
  const lat = parseFloat(value("lat")), lon = parseFloat(value("lon"));
  if (!isNaN(lat) && !isNaN(lon)) return {{kind: "geo", lat, lon}};
  return null;
}}
async function send(decision) {{
  const res = await fetch("/requests/{id}/resolve", {{
    method: "POST",
    headers: {{"Content-Type": "application/json"}},
    body: JSON.stringify({{
      token: "{token}",
      decision,
      note: value("note"),
      artifact: decision === "approve" ? await artifact() : null
    }})
  }});
  document.getElementById("out").textContent = res.ok ? "Sent: " + decision : "Failed: HTTP " + res.status;
}}
</script>
</body></html>"#,
        capability = record.capability,
        instruction = html_escape(&record.instruction),
        expires = record.expires_at.to_rfc3339(),
        geo_fields = geo_fields,
        id = html_escape(id),
        token = html_escape(open_token),
    )
}

/// Build the relay router.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/requests", post(create_handler))
        .route("/requests/:id", get(poll_handler))
        .route("/requests/:id/page", get(page_handler))
        .route("/requests/:id/resolve", post(resolve_handler))
        .route("/requests/:id/close", post(close_handler))
        .with_state(state)
}

/// Bind and serve the relay until the process exits.
pub async fn serve(listen_addr: &str, state: Arc<RelayState>) -> std::io::Result<()> {
    let addr: SocketAddr = listen_addr.parse().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid listen address {listen_addr:?}: {e}"),
        )
    })?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "starting authorization relay");
    axum::serve(listener, router(state)).await
}

async fn create_handler(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(body): Json<CreateRelayRequest>,
) -> Result<(StatusCode, Json<RelayTicket>), RelayError> {
    state.check_api_key(&headers)?;
    let ticket = state.create(body).await;
    Ok((StatusCode::CREATED, Json(ticket)))
}

async fn poll_handler(
    State(state): State<Arc<RelayState>>,
    Path(id): Path<String>,
    Query(params): Query<PollParams>,
) -> Result<Json<RelayStatusView>, RelayError> {
    let poll_token = params.poll_token.unwrap_or_default();
    let view = state.poll(&id, &poll_token).await?;
    debug!(request_id = %id, status = ?view.status, "relay poll");
    Ok(Json(view))
}

async fn page_handler(
    State(state): State<Arc<RelayState>>,
    Path(id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Html<String>, RelayError> {
    let token = params.token.unwrap_or_default();
    state.page(&id, &token).await.map(Html)
}

async fn resolve_handler(
    State(state): State<Arc<RelayState>>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<RelayStatusView>, RelayError> {
    state.resolve(&id, body).await.map(Json)
}

async fn close_handler(
    State(state): State<Arc<RelayState>>,
    Path(id): Path<String>,
    Json(body): Json<CloseBody>,
) -> Result<Json<RelayStatusView>, RelayError> {
    state.close(&id, body).await.map(Json)
}
