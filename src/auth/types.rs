//! Authorization request and decision types.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::actions::Capability;

/// A pending request for a human to grant a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanAuthRequest {
    pub id: String,
    pub task_id: String,
    pub step: u32,
    pub capability: Capability,
    pub instruction: String,
    pub timeout_sec: u64,
    pub created_at: DateTime<Utc>,
    /// Foreground package when the request was raised.
    pub origin_app: Option<String>,
}

impl HumanAuthRequest {
    pub fn new(
        task_id: impl Into<String>,
        step: u32,
        capability: Capability,
        instruction: impl Into<String>,
        timeout_sec: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            step,
            capability,
            instruction: instruction.into(),
            timeout_sec,
            created_at: Utc::now(),
            origin_app: None,
        }
    }

    pub fn with_origin_app(mut self, app: impl Into<String>) -> Self {
        self.origin_app = Some(app.into());
        self
    }

    /// Short id shown to operators.
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }
}

/// Terminal status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Approved,
    Rejected,
    Timeout,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Approved => "approved",
            DecisionStatus::Rejected => "rejected",
            DecisionStatus::Timeout => "timeout",
        }
    }
}

/// Something a human hands back along with an approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Artifact {
    Text {
        value: String,
    },
    Geo {
        lat: f64,
        lon: f64,
    },
    Image {
        mime: String,
        #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
        bytes: Vec<u8>,
    },
}

impl Artifact {
    pub fn describe(&self) -> String {
        match self {
            Artifact::Text { value } => format!("text ({} chars)", value.chars().count()),
            Artifact::Geo { lat, lon } => format!("location {:.6},{:.6}", lat, lon),
            Artifact::Image { mime, bytes } => format!("image {} ({} bytes)", mime, bytes.len()),
        }
    }
}

fn to_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    BASE64
        .decode(encoded.trim())
        .map_err(serde::de::Error::custom)
}

/// The terminal outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanAuthDecision {
    pub status: DecisionStatus,
    pub note: Option<String>,
    pub artifact: Option<Artifact>,
    pub decided_at: DateTime<Utc>,
}

impl HumanAuthDecision {
    pub fn approved(note: Option<String>, artifact: Option<Artifact>) -> Self {
        Self {
            status: DecisionStatus::Approved,
            note,
            artifact,
            decided_at: Utc::now(),
        }
    }

    pub fn rejected(note: Option<String>) -> Self {
        Self {
            status: DecisionStatus::Rejected,
            note,
            artifact: None,
            decided_at: Utc::now(),
        }
    }

    pub fn timeout() -> Self {
        Self {
            status: DecisionStatus::Timeout,
            note: None,
            artifact: None,
            decided_at: Utc::now(),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status == DecisionStatus::Approved
    }
}
