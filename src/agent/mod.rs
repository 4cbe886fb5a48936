//! Agent module: the task runtime, its configuration and journals.

mod journal;
mod runtime;
mod types;

pub use journal::{summary_line, MarkdownJournal, TaskJournal, TaskRecord};
pub use runtime::AgentRuntime;
pub use types::{
    ProgressEvent, ProgressSink, RuntimeConfig, Step, TaskOutcome, TaskRequest, TaskStatus,
    DEFAULT_PROFILE,
};
