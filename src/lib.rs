// Copyright 2025 Zhipu AI (Original Python implementation)
// Copyright 2025 ModerRAS (Rust implementation)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Phone Pilot
//!
//! Local agent that drives an Android device through perceive-decide-act
//! steps, asking a language model for each action and a human for anything
//! that needs real-world proof (SMS codes, biometrics, permission dialogs).
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use phone_pilot::{
//!     AdbConnection, AdbController, AgentRuntime, AuthCoordinator, CoordinatorConfig,
//!     ModelClient, ModelConfig, RuntimeConfig, TaskRequest,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let device = Arc::new(AdbController::new(AdbConnection::new(None)));
//!     let model = Arc::new(ModelClient::new(ModelConfig::default()));
//!     let coordinator = Arc::new(AuthCoordinator::new(CoordinatorConfig::default()));
//!
//!     let runtime = AgentRuntime::new(device, model, RuntimeConfig::default())
//!         .with_coordinator(coordinator);
//!     let outcome = runtime.run_task(TaskRequest::new("Open Settings and enable Wi-Fi")).await;
//!
//!     println!("{}: {}", if outcome.ok { "done" } else { "failed" }, outcome.message);
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod adb;
pub mod agent;
pub mod auth;
pub mod config;
pub mod device;
pub mod dialog;
pub mod model;
pub mod settings;

pub use actions::{normalize, Action, ActionKind, Capability};
pub use adb::{AdbConnection, AdbController};
pub use agent::{
    AgentRuntime, MarkdownJournal, ProgressEvent, ProgressSink, RuntimeConfig, TaskOutcome,
    TaskRequest, TaskStatus,
};
pub use auth::{
    AuthCoordinator, AuthNotifier, CoordinatorConfig, HumanAuthDecision, HumanAuthRequest,
    RelayClient,
};
pub use device::{DeviceController, DeviceError, Snapshot};
pub use model::{CallMode, DecisionProvider, ModelClient, ModelConfig, ModelDecision, ModelError};
pub use settings::AppSettings;
