//! Markdown task journals.
//!
//! Layout under the workspace root:
//! - `tasks/<YYYY-MM-DD>_<task-id>.md`: one file per task with every step
//! - `memory/<YYYY-MM-DD>.md`: one summary line per finished task

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::types::{Step, TaskOutcome};

/// Everything a journal needs to record about one task.
#[derive(Debug, Clone, Copy)]
pub struct TaskRecord<'a> {
    pub task_id: &'a str,
    pub task: &'a str,
    pub profile: &'a str,
    pub started_at: DateTime<Utc>,
    pub steps: &'a [Step],
    pub outcome: &'a TaskOutcome,
}

/// Persists task history.
#[async_trait]
pub trait TaskJournal: Send + Sync {
    /// Write the full step history of a task.
    async fn save_history(&self, record: &TaskRecord<'_>) -> anyhow::Result<()>;

    /// Append a one-line summary of a task.
    async fn append_summary(&self, record: &TaskRecord<'_>) -> anyhow::Result<()>;
}

/// Journal writing markdown files under a workspace directory.
#[derive(Debug, Clone)]
pub struct MarkdownJournal {
    root: PathBuf,
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `[HH:MM:SS] [OK|FAIL] [profile] task: <text> | result: <text>`
pub fn summary_line(record: &TaskRecord<'_>, at: DateTime<Local>) -> String {
    format!(
        "[{}] [{}] [{}] task: {} | result: {}",
        at.format("%H:%M:%S"),
        if record.outcome.ok { "OK" } else { "FAIL" },
        record.profile,
        single_line(record.task),
        single_line(&record.outcome.message)
    )
}

fn render_history(record: &TaskRecord<'_>) -> String {
    let mut doc = format!(
        "# Task {}\n\n- Goal: {}\n- Profile: {}\n- Started: {}\n\n",
        record.task_id,
        single_line(record.task),
        record.profile,
        record.started_at.to_rfc3339()
    );

    for step in record.steps {
        doc.push_str(&format!("## Step {}\n\n", step.number));
        match &step.snapshot {
            Some(snapshot) => doc.push_str(&format!(
                "- App: {} ({}x{})\n",
                if snapshot.current_app.is_empty() { "unknown" } else { &snapshot.current_app },
                snapshot.width,
                snapshot.height
            )),
            None => doc.push_str("- App: (no snapshot)\n"),
        }
        if !step.thought.is_empty() {
            doc.push_str(&format!("- Thought: {}\n", single_line(&step.thought)));
        }
        doc.push_str(&format!("- Action: `{}`\n", step.action.to_json_string()));
        doc.push_str(&format!("- Result: {}\n\n", single_line(&step.result)));
    }

    doc.push_str(&format!(
        "## Result\n\n- Status: {:?}\n- Message: {}\n- Steps: {}\n- Device actions: {}\n",
        record.outcome.status,
        single_line(&record.outcome.message),
        record.outcome.steps,
        record.outcome.device_actions
    ));
    doc
}

impl MarkdownJournal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the history file for a task.
    pub fn history_path(&self, record: &TaskRecord<'_>) -> PathBuf {
        let date = record.started_at.with_timezone(&Local).format("%Y-%m-%d");
        self.root
            .join("tasks")
            .join(format!("{}_{}.md", date, record.task_id))
    }

    /// Path of the summary file for a day.
    pub fn summary_path(&self, day: DateTime<Local>) -> PathBuf {
        self.root
            .join("memory")
            .join(format!("{}.md", day.format("%Y-%m-%d")))
    }
}

#[async_trait]
impl TaskJournal for MarkdownJournal {
    async fn save_history(&self, record: &TaskRecord<'_>) -> anyhow::Result<()> {
        let path = self.history_path(record);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, render_history(record)).await?;
        Ok(())
    }

    async fn append_summary(&self, record: &TaskRecord<'_>) -> anyhow::Result<()> {
        let now = Local::now();
        let path = self.summary_path(now);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(format!("{}\n", summary_line(record, now)).as_bytes())
            .await?;
        file.flush().await?;
        Ok(())
    }
}
