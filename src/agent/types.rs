//! Runtime configuration, task outcomes and progress events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::actions::Action;
use crate::auth::HumanAuthRequest;
use crate::device::SnapshotRef;
use crate::dialog::DEFAULT_PERMISSION_DIALOG_PACKAGES;

/// Name of the profile used when a task does not pick one.
pub const DEFAULT_PROFILE: &str = "default";

/// Configuration for the agent runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default step bound for tasks that do not set one.
    pub max_steps: u32,
    /// Pause after each device action, except `wait`.
    pub step_delay_ms: u64,
    /// Number of recent history lines sent to the model.
    pub history_window: usize,
    /// Minimum gap between two synthesized permission requests.
    pub auto_escalation_interval_secs: u64,
    /// Foreground packages treated as system permission dialogs.
    pub permission_dialog_packages: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            step_delay_ms: 1000,
            history_window: 8,
            auto_escalation_interval_secs: 15,
            permission_dialog_packages: DEFAULT_PERMISSION_DIALOG_PACKAGES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_step_delay(mut self, delay_ms: u64) -> Self {
        self.step_delay_ms = delay_ms;
        self
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    pub fn with_permission_dialog_packages(mut self, packages: Vec<String>) -> Self {
        self.permission_dialog_packages = packages;
        self
    }
}

/// A task submitted to the runtime.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub goal: String,
    pub profile: String,
    pub max_steps: Option<u32>,
}

impl TaskRequest {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            profile: DEFAULT_PROFILE.to_string(),
            max_steps: None,
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = Some(max_steps);
        self
    }
}

/// Terminal state of a `run_task` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Stopped,
    /// Another task was already running; nothing happened.
    Busy,
}

/// Result of one `run_task` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub ok: bool,
    pub status: TaskStatus,
    pub message: String,
    pub steps: u32,
    pub device_actions: u32,
    /// Empty for busy rejections.
    pub task_id: String,
}

impl TaskOutcome {
    pub(crate) fn busy() -> Self {
        Self {
            ok: false,
            status: TaskStatus::Busy,
            message: "Agent is busy with another task".to_string(),
            steps: 0,
            device_actions: 0,
            task_id: String::new(),
        }
    }
}

/// One iteration of the step loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub number: u32,
    pub snapshot: Option<SnapshotRef>,
    pub thought: String,
    pub action: Action,
    pub result: String,
    pub recorded_at: DateTime<Utc>,
}

impl Step {
    /// One-line form kept in the model's history.
    pub fn history_line(&self) -> String {
        format!(
            "step {}: {} -> {}",
            self.number,
            self.action.to_json_string(),
            self.result.replace('\n', " ")
        )
    }
}

/// Events published while a task runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    TaskStarted {
        task_id: String,
        task: String,
        profile: String,
    },
    StepRecorded {
        task_id: String,
        step: Step,
    },
    AuthRequested {
        request: HumanAuthRequest,
        open_url: Option<String>,
    },
    TaskFinished {
        outcome: TaskOutcome,
    },
}

/// Receives progress events. Failures are ignored by the runtime.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_event(&self, event: &ProgressEvent) -> anyhow::Result<()>;
}
