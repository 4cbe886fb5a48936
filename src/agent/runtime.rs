//! The step loop that drives one task to completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::journal::{TaskJournal, TaskRecord};
use super::types::{
    ProgressEvent, ProgressSink, RuntimeConfig, Step, TaskOutcome, TaskRequest, TaskStatus,
    DEFAULT_PROFILE,
};
use crate::actions::{Action, ActionKind, Capability, DEFAULT_HUMAN_AUTH_TIMEOUT_SECS};
use crate::auth::delegation;
use crate::auth::{AuthCoordinator, DecisionStatus, HumanAuthRequest};
use crate::device::{DeviceController, Snapshot};
use crate::dialog::{is_permission_dialog, DialogIntent};
use crate::model::{DecisionProvider, ModelDecision, StepContext};

/// Clears the busy flag on every exit path.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Mutable state of the task being run.
struct TaskRun {
    task_id: String,
    goal: String,
    profile: String,
    max_steps: u32,
    started_at: DateTime<Utc>,
    steps: Vec<Step>,
    history: Vec<String>,
    device_actions: u32,
    captured_snapshot: bool,
}

/// How the step loop ended.
struct Termination {
    status: TaskStatus,
    message: String,
}

impl Termination {
    fn new(status: TaskStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self::new(TaskStatus::Failed, message)
    }
}

/// Runs tasks against one device, one task at a time.
pub struct AgentRuntime {
    device: Arc<dyn DeviceController>,
    profiles: HashMap<String, Arc<dyn DecisionProvider>>,
    coordinator: Option<Arc<AuthCoordinator>>,
    journal: Option<Arc<dyn TaskJournal>>,
    progress: Option<Arc<dyn ProgressSink>>,
    config: RuntimeConfig,
    busy: AtomicBool,
    stop_requested: AtomicBool,
    last_auto_escalation: Mutex<Option<Instant>>,
}

impl AgentRuntime {
    /// Create a runtime whose default profile uses `provider`.
    pub fn new(
        device: Arc<dyn DeviceController>,
        provider: Arc<dyn DecisionProvider>,
        config: RuntimeConfig,
    ) -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(DEFAULT_PROFILE.to_string(), provider);
        Self {
            device,
            profiles,
            coordinator: None,
            journal: None,
            progress: None,
            config,
            busy: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            last_auto_escalation: Mutex::new(None),
        }
    }

    /// Register an additional named model profile.
    pub fn with_profile(mut self, name: impl Into<String>, provider: Arc<dyn DecisionProvider>) -> Self {
        self.profiles.insert(name.into(), provider);
        self
    }

    pub fn with_coordinator(mut self, coordinator: Arc<AuthCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn TaskJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn coordinator(&self) -> Option<&Arc<AuthCoordinator>> {
        self.coordinator.as_ref()
    }

    /// Whether a task is currently running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Ask the running task to stop at the top of its next step.
    pub fn request_stop(&self) {
        if self.is_busy() {
            info!("Stop requested");
            self.stop_requested.store(true, Ordering::SeqCst);
        }
    }

    /// Run a task to completion.
    ///
    /// Returns immediately with [`TaskStatus::Busy`] when another task is
    /// already running.
    pub async fn run_task(&self, request: TaskRequest) -> TaskOutcome {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Rejected task '{}': agent is busy", request.goal);
            return TaskOutcome::busy();
        }
        let _guard = BusyGuard(&self.busy);
        self.stop_requested.store(false, Ordering::SeqCst);

        let mut run = TaskRun {
            task_id: uuid::Uuid::new_v4().to_string(),
            goal: request.goal,
            profile: request.profile,
            max_steps: request.max_steps.unwrap_or(self.config.max_steps),
            started_at: Utc::now(),
            steps: Vec::new(),
            history: Vec::new(),
            device_actions: 0,
            captured_snapshot: false,
        };

        info!(task_id = %run.task_id, profile = %run.profile, "Starting task: {}", run.goal);
        self.emit(ProgressEvent::TaskStarted {
            task_id: run.task_id.clone(),
            task: run.goal.clone(),
            profile: run.profile.clone(),
        })
        .await;

        let termination = match self.profiles.get(&run.profile).cloned() {
            Some(provider) => self.drive(&mut run, provider.as_ref()).await,
            None => Termination::failed(format!("Unknown model profile '{}'", run.profile)),
        };
        self.finalize(run, termination).await
    }

    async fn drive(&self, run: &mut TaskRun, provider: &dyn DecisionProvider) -> Termination {
        for number in 1..=run.max_steps {
            if self.stop_requested.load(Ordering::SeqCst) {
                return Termination::new(TaskStatus::Stopped, "Task stopped by user");
            }

            let snapshot = match self.device.capture_snapshot().await {
                Ok(snapshot) => {
                    run.captured_snapshot = true;
                    Some(snapshot)
                }
                Err(e) => {
                    warn!("Step {}: snapshot capture failed: {}", number, e);
                    None
                }
            };

            let decision = match self.auto_escalation(snapshot.as_ref()) {
                Some(decision) => decision,
                None => {
                    let history_start = run.history.len().saturating_sub(self.config.history_window);
                    let ctx = StepContext {
                        task: &run.goal,
                        step: number,
                        max_steps: run.max_steps,
                        current_app: snapshot.as_ref().map(|s| s.current_app.as_str()),
                        screen: snapshot
                            .as_ref()
                            .map(Snapshot::model_dimensions)
                            .unwrap_or((1080, 1920)),
                        image_png: snapshot.as_ref().map(|s| s.png.as_slice()),
                        history: &run.history[history_start..],
                    };
                    match provider.next_decision(&ctx).await {
                        Ok(decision) => decision,
                        Err(e) => return Termination::failed(format!("Model request failed: {}", e)),
                    }
                }
            };
            debug!(
                "Step {}: {} ({})",
                number,
                decision.action.to_json_string(),
                decision.thought
            );

            match &decision.action.kind {
                ActionKind::Finish { message } => {
                    self.record(run, number, snapshot.as_ref(), &decision, message.clone())
                        .await;
                    return Termination::new(TaskStatus::Succeeded, message.clone());
                }
                ActionKind::RequestHumanAuth {
                    capability,
                    instruction,
                    timeout_sec,
                } => {
                    if let Some(termination) = self
                        .escalate(
                            run,
                            number,
                            snapshot.as_ref(),
                            &decision,
                            *capability,
                            instruction,
                            *timeout_sec,
                        )
                        .await
                    {
                        return termination;
                    }
                }
                _ => {
                    let action = match &snapshot {
                        Some(s) => decision.action.scaled(s.scale_x, s.scale_y),
                        None => decision.action.clone(),
                    };
                    let result = match self.device.execute(&action).await {
                        Ok(result) => result,
                        Err(e) => {
                            warn!("Step {}: {} failed: {}", number, action.tag(), e);
                            format!("error: {}", e)
                        }
                    };
                    run.device_actions += 1;
                    self.record(run, number, snapshot.as_ref(), &decision, result)
                        .await;

                    if !matches!(action.kind, ActionKind::Wait { .. }) && self.config.step_delay_ms > 0 {
                        sleep(Duration::from_millis(self.config.step_delay_ms)).await;
                    }
                }
            }
        }

        Termination::failed(format!("Max steps reached ({})", run.max_steps))
    }

    /// A synthesized permission request when a known permission dialog is in
    /// front and the last one was long enough ago.
    fn auto_escalation(&self, snapshot: Option<&Snapshot>) -> Option<ModelDecision> {
        let snapshot = snapshot?;
        self.coordinator.as_ref()?;
        if !is_permission_dialog(&snapshot.current_app, &self.config.permission_dialog_packages) {
            return None;
        }

        let mut last = match self.last_auto_escalation.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let interval = Duration::from_secs(self.config.auto_escalation_interval_secs);
        if let Some(at) = *last {
            if at.elapsed() < interval {
                return None;
            }
        }
        *last = Some(Instant::now());

        info!("Permission dialog detected in {}, escalating", snapshot.current_app);
        Some(ModelDecision {
            thought: format!("System permission dialog detected in {}", snapshot.current_app),
            action: Action::new(ActionKind::RequestHumanAuth {
                capability: Capability::Permission,
                instruction: Capability::Permission.default_instruction().to_string(),
                timeout_sec: DEFAULT_HUMAN_AUTH_TIMEOUT_SECS,
            })
            .with_reason("permission dialog detected"),
            raw: String::new(),
            mode: None,
        })
    }

    /// Handle a `request_human_auth` step. `None` means the task continues.
    #[allow(clippy::too_many_arguments)]
    async fn escalate(
        &self,
        run: &mut TaskRun,
        number: u32,
        snapshot: Option<&Snapshot>,
        decision: &ModelDecision,
        capability: Capability,
        instruction: &str,
        timeout_sec: u64,
    ) -> Option<Termination> {
        let Some(coordinator) = &self.coordinator else {
            let message = format!(
                "Human authorization required ({}) but no authorization channel is configured",
                capability
            );
            self.record(run, number, snapshot, decision, message.clone()).await;
            return Some(Termination::failed(message));
        };

        let mut request =
            HumanAuthRequest::new(run.task_id.clone(), number, capability, instruction, timeout_sec);
        if let Some(snapshot) = snapshot {
            request = request.with_origin_app(snapshot.current_app.clone());
        }

        let pending = coordinator.open(request.clone()).await;
        self.emit(ProgressEvent::AuthRequested {
            request: request.clone(),
            open_url: pending.open_url().map(str::to_string),
        })
        .await;
        let outcome = coordinator.wait(pending).await;
        let from_dialog = request
            .origin_app
            .as_deref()
            .is_some_and(|app| is_permission_dialog(app, &self.config.permission_dialog_packages));

        match outcome.status {
            DecisionStatus::Approved => {
                let notes = delegation::apply(
                    self.device.as_ref(),
                    &request,
                    &outcome,
                    &self.config.permission_dialog_packages,
                )
                .await;
                let result = format!("Human authorization approved ({}): {}", capability, notes.join("; "));
                self.record(run, number, snapshot, decision, result).await;
                None
            }
            DecisionStatus::Rejected => {
                let mut message = format!("Human authorization rejected ({})", capability);
                if let Some(note) = outcome.note.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
                    message.push_str(": ");
                    message.push_str(note);
                }
                let mut result = message.clone();
                if from_dialog {
                    match delegation::press_dialog_button(self.device.as_ref(), DialogIntent::Deny).await {
                        Ok(note) => result = format!("{}; {}", result, note),
                        Err(e) => warn!("Could not press deny on permission dialog: {}", e),
                    }
                }
                self.record(run, number, snapshot, decision, result).await;
                Some(Termination::failed(message))
            }
            DecisionStatus::Timeout => {
                let message = format!("Human authorization timed out ({})", capability);
                self.record(run, number, snapshot, decision, message.clone()).await;
                Some(Termination::failed(message))
            }
        }
    }

    async fn record(
        &self,
        run: &mut TaskRun,
        number: u32,
        snapshot: Option<&Snapshot>,
        decision: &ModelDecision,
        result: String,
    ) {
        let step = Step {
            number,
            snapshot: snapshot.map(Snapshot::to_ref),
            thought: decision.thought.clone(),
            action: decision.action.clone(),
            result,
            recorded_at: Utc::now(),
        };
        run.history.push(step.history_line());
        run.steps.push(step.clone());
        self.emit(ProgressEvent::StepRecorded {
            task_id: run.task_id.clone(),
            step,
        })
        .await;
    }

    async fn finalize(&self, run: TaskRun, termination: Termination) -> TaskOutcome {
        let outcome = TaskOutcome {
            ok: termination.status == TaskStatus::Succeeded,
            status: termination.status,
            message: termination.message,
            steps: run.steps.len() as u32,
            device_actions: run.device_actions,
            task_id: run.task_id.clone(),
        };

        if let Some(journal) = &self.journal {
            let record = TaskRecord {
                task_id: &run.task_id,
                task: &run.goal,
                profile: &run.profile,
                started_at: run.started_at,
                steps: &run.steps,
                outcome: &outcome,
            };
            if let Err(e) = journal.save_history(&record).await {
                warn!("Failed to save task history: {}", e);
            }
            if let Err(e) = journal.append_summary(&record).await {
                warn!("Failed to append task summary: {}", e);
            }
        }

        if run.captured_snapshot {
            if let Err(e) = self.device.go_home().await {
                warn!("Failed to return home: {}", e);
            }
        }

        info!(
            task_id = %outcome.task_id,
            status = ?outcome.status,
            steps = outcome.steps,
            "Task finished: {}",
            outcome.message
        );
        self.emit(ProgressEvent::TaskFinished {
            outcome: outcome.clone(),
        })
        .await;
        outcome
    }

    async fn emit(&self, event: ProgressEvent) {
        if let Some(sink) = &self.progress {
            if let Err(e) = sink.on_event(&event).await {
                debug!("Progress sink failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::journal::MarkdownJournal;
    use crate::auth::{CoordinatorConfig, HumanAuthDecision};
    use crate::device::DeviceError;
    use crate::model::ModelError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Fake device that records executed actions.
    struct FakeDevice {
        snapshot_app: Option<String>,
        executed: Mutex<Vec<Action>>,
        homes: AtomicUsize,
        fail_execute: bool,
        ui_xml: String,
    }

    impl FakeDevice {
        fn without_screen() -> Self {
            Self {
                snapshot_app: None,
                executed: Mutex::new(Vec::new()),
                homes: AtomicUsize::new(0),
                fail_execute: false,
                ui_xml: String::new(),
            }
        }

        fn with_app(app: &str) -> Self {
            Self {
                snapshot_app: Some(app.to_string()),
                ..Self::without_screen()
            }
        }

        fn executed(&self) -> Vec<Action> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeviceController for FakeDevice {
        async fn capture_snapshot(&self) -> Result<Snapshot, DeviceError> {
            match &self.snapshot_app {
                Some(app) => Ok(Snapshot {
                    png: vec![0x89, b'P', b'N', b'G'],
                    current_app: app.clone(),
                    width: 1080,
                    height: 2400,
                    scale_x: 2.0,
                    scale_y: 2.0,
                    captured_at: Utc::now(),
                }),
                None => Err(DeviceError::CaptureFailed("no device".into())),
            }
        }

        async fn execute(&self, action: &Action) -> Result<String, DeviceError> {
            self.executed.lock().unwrap().push(action.clone());
            if self.fail_execute {
                return Err(DeviceError::CommandFailed("input failed".into()));
            }
            Ok(format!("{} ok", action.tag()))
        }

        async fn dump_ui(&self) -> Result<String, DeviceError> {
            Ok(self.ui_xml.clone())
        }

        async fn inject_location(&self, _: f64, _: f64) -> Result<String, DeviceError> {
            Ok("ok".into())
        }

        async fn push_image(&self, _: &[u8], name: &str) -> Result<String, DeviceError> {
            Ok(format!("/sdcard/{}", name))
        }

        async fn go_home(&self) -> Result<(), DeviceError> {
            self.homes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Returns scripted actions in order, then waits forever with `wait`.
    struct ScriptedProvider {
        actions: Mutex<VecDeque<Action>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(actions: Vec<Action>) -> Self {
            Self {
                actions: Mutex::new(actions.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DecisionProvider for ScriptedProvider {
        async fn next_decision(&self, _ctx: &StepContext<'_>) -> Result<ModelDecision, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            let action = self
                .actions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Action::new(ActionKind::Wait { duration_ms: 10 }));
            Ok(ModelDecision {
                thought: "scripted".into(),
                action,
                raw: String::new(),
                mode: None,
            })
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl DecisionProvider for FailingProvider {
        async fn next_decision(&self, _ctx: &StepContext<'_>) -> Result<ModelDecision, ModelError> {
            Err(ModelError::AllModesFailed("chat: HTTP 500: boom".into()))
        }
    }

    fn auth(capability: Capability) -> Action {
        Action::new(ActionKind::RequestHumanAuth {
            capability,
            instruction: "please".into(),
            timeout_sec: 60,
        })
    }

    fn finish(message: &str) -> Action {
        Action::new(ActionKind::Finish { message: message.into() })
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig::default().with_step_delay(0)
    }

    /// Resolves the next request as soon as it is announced.
    async fn auto_resolve(coordinator: Arc<AuthCoordinator>, decision: HumanAuthDecision) {
        resolve_times(coordinator, decision, 1).await;
    }

    async fn resolve_times(coordinator: Arc<AuthCoordinator>, decision: HumanAuthDecision, times: usize) {
        let mut resolved = 0;
        while resolved < times {
            if let Some(request) = coordinator.pending().first() {
                coordinator.resolve(&request.id, decision.clone()).unwrap();
                resolved += 1;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    const DIALOG_XML: &str = r#"<hierarchy>
<node text="Don't allow" resource-id="com.android.permissioncontroller:id/permission_deny_button" class="android.widget.Button" clickable="true" enabled="true" bounds="[0,1800][400,1900]" />
<node text="Allow" resource-id="com.android.permissioncontroller:id/permission_allow_button" class="android.widget.Button" clickable="true" enabled="true" bounds="[600,1800][1000,1900]" />
</hierarchy>"#;

    fn dialog_device() -> FakeDevice {
        FakeDevice {
            ui_xml: DIALOG_XML.into(),
            ..FakeDevice::with_app("com.android.permissioncontroller")
        }
    }

    #[tokio::test]
    async fn test_scenario_a_finish_without_snapshot() {
        let device = Arc::new(FakeDevice::without_screen());
        let provider = Arc::new(ScriptedProvider::new(vec![finish("all done")]));
        let runtime = AgentRuntime::new(device.clone(), provider, config());

        let outcome = runtime.run_task(TaskRequest::new("say done")).await;
        assert!(outcome.ok);
        assert_eq!(outcome.status, TaskStatus::Succeeded);
        assert_eq!(outcome.message, "all done");
        assert_eq!(outcome.steps, 1);
        assert_eq!(device.homes.load(Ordering::SeqCst), 0);
        assert!(!runtime.is_busy());
    }

    #[tokio::test]
    async fn test_scenario_b_approved_camera_resumes() {
        let device = Arc::new(FakeDevice::with_app("com.example.camera"));
        let provider = Arc::new(ScriptedProvider::new(vec![auth(Capability::Camera), finish("photo taken")]));
        let coordinator = Arc::new(AuthCoordinator::new(CoordinatorConfig::default()));
        let runtime = AgentRuntime::new(device.clone(), provider.clone(), config())
            .with_coordinator(coordinator.clone());

        let resolver = tokio::spawn(auto_resolve(coordinator, HumanAuthDecision::approved(None, None)));
        let outcome = runtime.run_task(TaskRequest::new("take a photo")).await;
        resolver.await.unwrap();

        assert!(outcome.ok, "{}", outcome.message);
        assert_eq!(outcome.steps, 2);
        assert_eq!(outcome.device_actions, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert!(device
            .executed()
            .iter()
            .all(|a| !matches!(a.kind, ActionKind::RequestHumanAuth { .. })));
        assert_eq!(device.homes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scenario_c_rejected_2fa_fails() {
        let device = Arc::new(FakeDevice::with_app("com.example.bank"));
        let provider = Arc::new(ScriptedProvider::new(vec![auth(Capability::TwoFactor)]));
        let coordinator = Arc::new(AuthCoordinator::new(CoordinatorConfig::default()));
        let runtime = AgentRuntime::new(device, provider, config()).with_coordinator(coordinator.clone());

        let resolver = tokio::spawn(auto_resolve(
            coordinator,
            HumanAuthDecision::rejected(Some("not mine".into())),
        ));
        let outcome = runtime.run_task(TaskRequest::new("log in")).await;
        resolver.await.unwrap();

        assert!(!outcome.ok);
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert!(outcome.message.starts_with("Human authorization rejected"));
        assert_eq!(outcome.message, "Human authorization rejected (2fa): not mine");
    }

    #[tokio::test]
    async fn test_scenario_d_max_steps() {
        let device = Arc::new(FakeDevice::with_app("com.example.app"));
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let runtime = AgentRuntime::new(device.clone(), provider, config().with_max_steps(10));

        let outcome = runtime.run_task(TaskRequest::new("never ends")).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.message, "Max steps reached (10)");
        assert_eq!(outcome.steps, 10);
        assert_eq!(outcome.device_actions, 10);
        assert_eq!(device.executed().len(), 10);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let device = Arc::new(FakeDevice::without_screen());
        let provider = Arc::new(ScriptedProvider::new(vec![
            Action::new(ActionKind::Wait { duration_ms: 1 }),
            finish("done"),
        ]));
        let runtime = AgentRuntime::new(device, provider, config());

        let (first, second) = tokio::join!(
            runtime.run_task(TaskRequest::new("one")),
            runtime.run_task(TaskRequest::new("two"))
        );
        let statuses = [first.status, second.status];
        assert_eq!(statuses.iter().filter(|s| **s == TaskStatus::Busy).count(), 1);
        assert_eq!(statuses.iter().filter(|s| **s == TaskStatus::Succeeded).count(), 1);
        let busy = if first.status == TaskStatus::Busy { &first } else { &second };
        assert_eq!(busy.message, "Agent is busy with another task");
        assert!(!runtime.is_busy());
    }

    #[tokio::test]
    async fn test_stop_request() {
        let device = Arc::new(FakeDevice::without_screen());
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let runtime = Arc::new(AgentRuntime::new(
            device,
            provider,
            config().with_step_delay(20).with_max_steps(1000),
        ));

        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.run_task(TaskRequest::new("loop")).await }
        });
        while !runtime.is_busy() {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        runtime.request_stop();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Stopped);
        assert_eq!(outcome.message, "Task stopped by user");
        assert!(outcome.steps < 1000);
    }

    #[tokio::test]
    async fn test_model_failure_and_device_errors() {
        let runtime = AgentRuntime::new(
            Arc::new(FakeDevice::without_screen()),
            Arc::new(FailingProvider),
            config(),
        );
        let outcome = runtime.run_task(TaskRequest::new("x")).await;
        assert_eq!(
            outcome.message,
            "Model request failed: All calling conventions failed: chat: HTTP 500: boom"
        );

        let device = Arc::new(FakeDevice {
            fail_execute: true,
            ..FakeDevice::with_app("com.example.app")
        });
        let provider = Arc::new(ScriptedProvider::new(vec![
            Action::new(ActionKind::Tap { x: 10, y: 20 }),
            finish("recovered"),
        ]));
        let runtime = AgentRuntime::new(device.clone(), provider, config());
        let outcome = runtime.run_task(TaskRequest::new("tap")).await;
        assert!(outcome.ok);
        // Model coordinates are scaled to device pixels.
        assert_eq!(device.executed()[0].kind, ActionKind::Tap { x: 20, y: 40 });
    }

    #[tokio::test]
    async fn test_auth_without_channel_fails() {
        let provider = Arc::new(ScriptedProvider::new(vec![auth(Capability::Biometric)]));
        let runtime = AgentRuntime::new(Arc::new(FakeDevice::without_screen()), provider, config());
        let outcome = runtime.run_task(TaskRequest::new("unlock")).await;
        assert_eq!(
            outcome.message,
            "Human authorization required (biometric) but no authorization channel is configured"
        );
    }

    #[tokio::test]
    async fn test_unknown_profile_fails() {
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let runtime = AgentRuntime::new(Arc::new(FakeDevice::without_screen()), provider, config());
        let outcome = runtime
            .run_task(TaskRequest::new("x").with_profile("missing"))
            .await;
        assert_eq!(outcome.message, "Unknown model profile 'missing'");
        assert!(!runtime.is_busy());
    }

    #[tokio::test]
    async fn test_permission_dialog_auto_escalation() {
        let device = Arc::new(FakeDevice {
            ui_xml: r#"<node text="Allow" resource-id="com.android.permissioncontroller:id/permission_allow_button" class="android.widget.Button" clickable="true" enabled="true" bounds="[600,1800][1000,1900]" />"#.into(),
            ..FakeDevice::with_app("com.android.permissioncontroller")
        });
        let provider = Arc::new(ScriptedProvider::new(vec![finish("granted")]));
        let coordinator = Arc::new(AuthCoordinator::new(CoordinatorConfig::default()));
        let runtime = AgentRuntime::new(device.clone(), provider.clone(), config())
            .with_coordinator(coordinator.clone());

        let resolver = tokio::spawn(auto_resolve(coordinator, HumanAuthDecision::approved(None, None)));
        let outcome = runtime.run_task(TaskRequest::new("open camera app")).await;
        resolver.await.unwrap();

        assert!(outcome.ok);
        // Step 1 was synthesized; the model was only asked once, at step 2
        // when the dialog was still showing but inside the cooldown.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(device.executed()[0].kind, ActionKind::Tap { x: 800, y: 1850 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timeout_fails_task() {
        let device = Arc::new(FakeDevice::with_app("com.example.bank"));
        let provider = Arc::new(ScriptedProvider::new(vec![auth(Capability::Sms)]));
        let coordinator = Arc::new(AuthCoordinator::new(CoordinatorConfig::default()));
        let runtime = AgentRuntime::new(device, provider.clone(), config())
            .with_coordinator(coordinator.clone());

        let started = Instant::now();
        let outcome = runtime.run_task(TaskRequest::new("read the code")).await;
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.message, "Human authorization timed out (sms)");
        assert_eq!(outcome.steps, 1);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_permission_dialog_presses_deny() {
        let device = Arc::new(dialog_device());
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let coordinator = Arc::new(AuthCoordinator::new(CoordinatorConfig::default()));
        let runtime = AgentRuntime::new(device.clone(), provider.clone(), config())
            .with_coordinator(coordinator.clone());

        let resolver = tokio::spawn(auto_resolve(coordinator, HumanAuthDecision::rejected(None)));
        let outcome = runtime.run_task(TaskRequest::new("open maps")).await;
        resolver.await.unwrap();

        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.message, "Human authorization rejected (permission)");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(device.executed().len(), 1);
        assert_eq!(device.executed()[0].kind, ActionKind::Tap { x: 200, y: 1850 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_escalation_fires_again_after_interval() {
        let device = Arc::new(dialog_device());
        let provider = Arc::new(ScriptedProvider::new(vec![
            Action::new(ActionKind::Tap { x: 10, y: 10 }),
            finish("granted twice"),
        ]));
        let coordinator = Arc::new(AuthCoordinator::new(CoordinatorConfig::default()));
        let runtime = AgentRuntime::new(
            device.clone(),
            provider.clone(),
            config().with_step_delay(16_000),
        )
        .with_coordinator(coordinator.clone());

        let resolver = tokio::spawn(resolve_times(
            coordinator,
            HumanAuthDecision::approved(None, None),
            2,
        ));
        let outcome = runtime.run_task(TaskRequest::new("open camera app")).await;
        resolver.await.unwrap();

        assert!(outcome.ok, "{}", outcome.message);
        assert_eq!(outcome.steps, 4);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        let taps: Vec<_> = device.executed().into_iter().map(|a| a.kind).collect();
        assert_eq!(
            taps,
            vec![
                ActionKind::Tap { x: 800, y: 1850 },
                ActionKind::Tap { x: 20, y: 20 },
                ActionKind::Tap { x: 800, y: 1850 },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_pending_authorization() {
        let device = Arc::new(FakeDevice::with_app("com.example.camera"));
        let provider = Arc::new(ScriptedProvider::new(vec![auth(Capability::Camera), finish("never")]));
        let coordinator = Arc::new(AuthCoordinator::new(CoordinatorConfig::default()));
        let runtime = Arc::new(
            AgentRuntime::new(device, provider.clone(), config()).with_coordinator(coordinator.clone()),
        );

        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.run_task(TaskRequest::new("take a photo")).await }
        });
        while coordinator.pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        runtime.request_stop();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(runtime.is_busy());
        assert_eq!(coordinator.pending().len(), 1);

        let id = coordinator.pending()[0].id.clone();
        coordinator
            .resolve(&id, HumanAuthDecision::approved(None, None))
            .unwrap();
        let outcome = task.await.unwrap();

        assert_eq!(outcome.status, TaskStatus::Stopped);
        assert_eq!(outcome.steps, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_journal_written_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![finish("ok")]));
        let runtime = AgentRuntime::new(Arc::new(FakeDevice::without_screen()), provider, config())
            .with_journal(Arc::new(MarkdownJournal::new(dir.path())));
        let outcome = runtime.run_task(TaskRequest::new("write")).await;

        let tasks: Vec<_> = std::fs::read_dir(dir.path().join("tasks")).unwrap().collect();
        assert_eq!(tasks.len(), 1);
        let name = tasks[0].as_ref().unwrap().file_name();
        assert!(name.to_string_lossy().ends_with(&format!("_{}.md", outcome.task_id)));
        assert!(dir.path().join("memory").is_dir());
    }

    struct BrokenSink;

    #[async_trait]
    impl ProgressSink for BrokenSink {
        async fn on_event(&self, _: &ProgressEvent) -> anyhow::Result<()> {
            anyhow::bail!("sink down")
        }
    }

    #[tokio::test]
    async fn test_progress_failures_are_swallowed() {
        let provider = Arc::new(ScriptedProvider::new(vec![finish("fine")]));
        let runtime = AgentRuntime::new(Arc::new(FakeDevice::without_screen()), provider, config())
            .with_progress(Arc::new(BrokenSink));
        let outcome = runtime.run_task(TaskRequest::new("x")).await;
        assert!(outcome.ok);
    }
}
