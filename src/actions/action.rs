//! Typed device actions produced by the model.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default swipe duration in milliseconds.
pub const DEFAULT_SWIPE_DURATION_MS: u64 = 300;

/// Default wait duration in milliseconds.
pub const DEFAULT_WAIT_DURATION_MS: u64 = 1000;

/// Default script timeout in seconds.
pub const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 60;

/// Default human authorization timeout in seconds.
pub const DEFAULT_HUMAN_AUTH_TIMEOUT_SECS: u64 = 300;

/// Category of real-world proof a step may require from a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Camera,
    Qr,
    Microphone,
    Voice,
    Nfc,
    Sms,
    #[serde(rename = "2fa")]
    TwoFactor,
    Location,
    Biometric,
    Notification,
    Contacts,
    Calendar,
    Files,
    Oauth,
    Payment,
    Permission,
    Unknown,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 17] = [
        Capability::Camera,
        Capability::Qr,
        Capability::Microphone,
        Capability::Voice,
        Capability::Nfc,
        Capability::Sms,
        Capability::TwoFactor,
        Capability::Location,
        Capability::Biometric,
        Capability::Notification,
        Capability::Contacts,
        Capability::Calendar,
        Capability::Files,
        Capability::Oauth,
        Capability::Payment,
        Capability::Permission,
        Capability::Unknown,
    ];

    /// Wire name of the capability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Camera => "camera",
            Capability::Qr => "qr",
            Capability::Microphone => "microphone",
            Capability::Voice => "voice",
            Capability::Nfc => "nfc",
            Capability::Sms => "sms",
            Capability::TwoFactor => "2fa",
            Capability::Location => "location",
            Capability::Biometric => "biometric",
            Capability::Notification => "notification",
            Capability::Contacts => "contacts",
            Capability::Calendar => "calendar",
            Capability::Files => "files",
            Capability::Oauth => "oauth",
            Capability::Payment => "payment",
            Capability::Permission => "permission",
            Capability::Unknown => "unknown",
        }
    }

    /// Look up a capability by its exact (already normalized) wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == name)
    }

    /// Whether an approved decision for this capability may carry a code
    /// that should be typed into the focused field.
    pub fn accepts_code(&self) -> bool {
        matches!(
            self,
            Capability::Sms | Capability::TwoFactor | Capability::Qr | Capability::Voice
        )
    }

    /// Instruction shown to the operator when the model did not provide one.
    pub fn default_instruction(&self) -> &'static str {
        match self {
            Capability::Camera => "Point the device camera at the requested subject, then approve.",
            Capability::Qr => "Scan the QR code shown on the device, or reply with its contents.",
            Capability::Microphone | Capability::Voice => {
                "Provide the requested voice input on the device, or reply with the spoken text."
            }
            Capability::Nfc => "Hold the NFC card or tag against the device, then approve.",
            Capability::Sms => "Reply with the verification code received by SMS.",
            Capability::TwoFactor => "Reply with the current two-factor authentication code.",
            Capability::Location => "Approve to share a location with the device.",
            Capability::Biometric => "Complete the fingerprint or face check on the device.",
            Capability::Notification => "Review the notification on the device, then decide.",
            Capability::Contacts => "Approve access to contacts on the device.",
            Capability::Calendar => "Approve access to the calendar on the device.",
            Capability::Files => "Approve file access, or attach the requested image.",
            Capability::Oauth => "Complete the sign-in flow on the device, then approve.",
            Capability::Payment => "Confirm the payment on the device, then approve.",
            Capability::Permission => "A system permission dialog is showing. Approve to allow it.",
            Capability::Unknown => "Review the device screen and decide whether to continue.",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of things the agent can do in one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Tap {
        x: i32,
        y: i32,
    },
    Swipe {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
    Type {
        text: String,
    },
    Keyevent {
        keycode: String,
    },
    LaunchApp {
        #[serde(rename = "packageName")]
        package_name: String,
    },
    Shell {
        command: String,
    },
    RunScript {
        script: String,
        #[serde(rename = "timeoutSec")]
        timeout_sec: u64,
    },
    RequestHumanAuth {
        capability: Capability,
        instruction: String,
        #[serde(rename = "timeoutSec")]
        timeout_sec: u64,
    },
    Wait {
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
    Finish {
        message: String,
    },
}

/// One action plus the model's optional justification for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self { kind, reason: None }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// A harmless wait carrying a diagnostic reason.
    pub fn wait_because(reason: impl Into<String>) -> Self {
        Self::new(ActionKind::Wait {
            duration_ms: DEFAULT_WAIT_DURATION_MS,
        })
        .with_reason(reason)
    }

    /// Tag name as used on the wire.
    pub fn tag(&self) -> &'static str {
        match self.kind {
            ActionKind::Tap { .. } => "tap",
            ActionKind::Swipe { .. } => "swipe",
            ActionKind::Type { .. } => "type",
            ActionKind::Keyevent { .. } => "keyevent",
            ActionKind::LaunchApp { .. } => "launch_app",
            ActionKind::Shell { .. } => "shell",
            ActionKind::RunScript { .. } => "run_script",
            ActionKind::RequestHumanAuth { .. } => "request_human_auth",
            ActionKind::Wait { .. } => "wait",
            ActionKind::Finish { .. } => "finish",
        }
    }

    /// Multiply screen coordinates by the given factors.
    ///
    /// Used to map positions from the model's working resolution back to the
    /// device-native resolution.
    pub fn scaled(&self, scale_x: f64, scale_y: f64) -> Self {
        let sx = |v: i32| (v as f64 * scale_x).round() as i32;
        let sy = |v: i32| (v as f64 * scale_y).round() as i32;
        let kind = match &self.kind {
            ActionKind::Tap { x, y } => ActionKind::Tap { x: sx(*x), y: sy(*y) },
            ActionKind::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
            } => ActionKind::Swipe {
                x1: sx(*x1),
                y1: sy(*y1),
                x2: sx(*x2),
                y2: sy(*y2),
                duration_ms: *duration_ms,
            },
            other => other.clone(),
        };
        Self {
            kind,
            reason: self.reason.clone(),
        }
    }

    /// Compact JSON rendering for history and journals.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"type\":\"{}\"}}", self.tag()))
    }
}
