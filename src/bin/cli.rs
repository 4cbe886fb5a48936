//! Phone Pilot - Android automation with human authorization
//!
//! This is the CLI entry point for the phone-pilot tool.
//! Run with: cargo run --bin phone-pilot -- [task]
//!
//! While a task runs, stdin accepts operator commands:
//! `approve <id> [note]`, `reject <id> [note]`, `pending`, `stop`.

use async_trait::async_trait;
use phone_pilot::agent::{ProgressEvent, ProgressSink, DEFAULT_PROFILE};
use phone_pilot::auth::{AuthNotifier, HumanAuthRequest};
use phone_pilot::{
    AdbConnection, AdbController, AgentRuntime, AppSettings, AuthCoordinator, CoordinatorConfig,
    MarkdownJournal, ModelClient, RelayClient, TaskOutcome, TaskRequest,
};
use std::env;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Prints authorization requests for the operator.
struct ConsoleNotifier;

#[async_trait]
impl AuthNotifier for ConsoleNotifier {
    async fn announce(
        &self,
        request: &HumanAuthRequest,
        open_url: Option<&str>,
    ) -> anyhow::Result<()> {
        println!("\n🔐 Authorization needed [{}] ({})", request.short_id(), request.capability);
        println!("   {}", request.instruction);
        if let Some(url) = open_url {
            println!("   Open: {}", url);
        }
        println!(
            "   Reply: approve {} [code or note] | reject {} [reason]",
            request.short_id(),
            request.short_id()
        );
        Ok(())
    }
}

/// Prints each recorded step.
struct ConsoleProgress;

#[async_trait]
impl ProgressSink for ConsoleProgress {
    async fn on_event(&self, event: &ProgressEvent) -> anyhow::Result<()> {
        match event {
            ProgressEvent::TaskStarted { task, profile, .. } => {
                println!("\n🚀 Starting: {} (profile: {})", task, profile);
            }
            ProgressEvent::StepRecorded { step, .. } => {
                if !step.thought.is_empty() {
                    println!("💭 {}", step.thought);
                }
                println!(
                    "▶️  Step {}: {} -> {}",
                    step.number,
                    step.action.to_json_string(),
                    step.result
                );
            }
            ProgressEvent::AuthRequested { .. } | ProgressEvent::TaskFinished { .. } => {}
        }
        io::stdout().flush()?;
        Ok(())
    }
}

fn print_outcome(outcome: &TaskOutcome) {
    if outcome.ok {
        println!("\n✅ Result: {} ({} steps)\n", outcome.message, outcome.steps);
    } else {
        eprintln!("\n❌ {:?}: {} ({} steps)\n", outcome.status, outcome.message, outcome.steps);
    }
}

/// `@profile goal` picks a profile; anything else uses the default one.
fn parse_task_line(line: &str, default_profile: &str) -> TaskRequest {
    if let Some(rest) = line.strip_prefix('@') {
        let mut parts = rest.splitn(2, char::is_whitespace);
        let profile = parts.next().unwrap_or(default_profile);
        let goal = parts.next().unwrap_or_default().trim();
        return TaskRequest::new(goal).with_profile(profile);
    }
    TaskRequest::new(line).with_profile(default_profile)
}

/// Handle operator commands. Returns false when the line is not a command.
fn handle_operator_command(runtime: &AgentRuntime, line: &str) -> bool {
    let verb = line
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();
    match verb.as_str() {
        "approve" | "allow" | "reject" | "deny" => {
            match runtime.coordinator() {
                Some(coordinator) => match coordinator.handle_command(line) {
                    Ok(message) => println!("✅ {}", message),
                    Err(e) => eprintln!("❌ {}", e),
                },
                None => eprintln!("❌ No authorization channel is configured"),
            }
            true
        }
        "pending" => {
            let pending = runtime
                .coordinator()
                .map(|c| c.pending())
                .unwrap_or_default();
            if pending.is_empty() {
                println!("No pending authorization requests");
            }
            for request in pending {
                println!(
                    "  [{}] {} step {}: {}",
                    request.short_id(),
                    request.capability,
                    request.step,
                    request.instruction
                );
            }
            true
        }
        "stop" => {
            runtime.request_stop();
            println!("⏹️  Stop requested");
            true
        }
        _ => false,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let settings = AppSettings::load().with_env_overrides();

    let device_id = (!settings.device_id.is_empty()).then(|| settings.device_id.clone());
    let device = Arc::new(
        AdbController::new(AdbConnection::with_path(&settings.adb_path, device_id))
            .with_max_model_edge((settings.max_model_edge > 0).then_some(settings.max_model_edge)),
    );

    let mut coordinator_config = CoordinatorConfig::default().with_notifier(Arc::new(ConsoleNotifier));
    if !settings.relay_url.is_empty() {
        coordinator_config = coordinator_config
            .with_relay(RelayClient::new(&settings.relay_url).with_api_key(&settings.relay_api_key));
    }
    let coordinator = Arc::new(AuthCoordinator::new(coordinator_config));

    let default_profile = settings
        .profiles
        .get(&settings.default_profile)
        .cloned()
        .unwrap_or_default();
    let mut runtime = AgentRuntime::new(
        device,
        Arc::new(ModelClient::new(default_profile.to_model_config(&settings.lang))),
        settings.runtime_config(),
    );
    for (name, profile) in &settings.profiles {
        runtime = runtime.with_profile(
            name.clone(),
            Arc::new(ModelClient::new(profile.to_model_config(&settings.lang))),
        );
    }
    let workspace = settings.workspace_path();
    let runtime = Arc::new(
        runtime
            .with_coordinator(coordinator)
            .with_journal(Arc::new(MarkdownJournal::new(&workspace)))
            .with_progress(Arc::new(ConsoleProgress)),
    );

    println!("🤖 Phone Pilot - Android Automation");
    println!("================================================");
    println!(
        "Model: {} @ {} ({})",
        default_profile.model_name, default_profile.base_url, default_profile.mode
    );
    println!("Profiles: {}", settings.profiles.keys().cloned().collect::<Vec<_>>().join(", "));
    println!("Language: {}", settings.lang);
    println!("Max steps: {}", settings.max_steps);
    if !settings.device_id.is_empty() {
        println!("Device: {}", settings.device_id);
    }
    if !settings.relay_url.is_empty() {
        println!("Relay: {}", settings.relay_url);
    }
    println!("Workspace: {}", workspace.display());
    println!("================================================\n");

    let profile_name = if settings.default_profile.is_empty() {
        DEFAULT_PROFILE.to_string()
    } else {
        settings.default_profile.clone()
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // One-shot mode: run the task from the arguments, taking commands meanwhile.
    if !args.is_empty() {
        let request = parse_task_line(&args.join(" "), &profile_name);
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.run_task(request).await }
        });
        tokio::pin!(task);

        loop {
            tokio::select! {
                outcome = &mut task => {
                    let outcome = outcome?;
                    print_outcome(&outcome);
                    std::process::exit(if outcome.ok { 0 } else { 1 });
                }
                line = lines.next_line() => {
                    match line? {
                        Some(line) => {
                            let line = line.trim();
                            if !line.is_empty() && !handle_operator_command(&runtime, line) {
                                println!("A task is running. Commands: approve, reject, pending, stop");
                            }
                        }
                        None => {
                            let outcome = (&mut task).await?;
                            print_outcome(&outcome);
                            std::process::exit(if outcome.ok { 0 } else { 1 });
                        }
                    }
                }
            }
        }
    }

    // Interactive mode
    println!("Interactive mode. Type your task and press Enter.");
    println!("Prefix with @profile to pick a model profile.");
    println!("While a task runs: approve <id> [note], reject <id> [note], pending, stop.");
    println!("Type 'quit' or 'exit' to exit.\n");

    loop {
        if !runtime.is_busy() {
            print!("📝 Task: ");
            io::stdout().flush()?;
        }

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() || handle_operator_command(&runtime, line) {
            continue;
        }

        if line == "quit" || line == "exit" {
            runtime.request_stop();
            println!("Goodbye! 👋");
            break;
        }

        if runtime.is_busy() {
            println!("A task is running. Commands: approve, reject, pending, stop");
            continue;
        }

        let request = parse_task_line(line, &profile_name);
        let runtime = runtime.clone();
        tokio::spawn(async move {
            let outcome = runtime.run_task(request).await;
            print_outcome(&outcome);
        });
        tokio::task::yield_now().await;
    }

    Ok(())
}
