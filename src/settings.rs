//! Persisted settings shared by the CLI and the relay.
//! Stored in the platform-specific config directory via `directories::ProjectDirs`,
//! then overridden by environment variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::agent::{RuntimeConfig, DEFAULT_PROFILE};
use crate::dialog::DEFAULT_PERMISSION_DIALOG_PACKAGES;
use crate::model::{CallMode, ModelConfig, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS};

/// Settings errors.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Cannot determine config directory")]
    NoConfigDir,
    #[error("Failed to access settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One model endpoint the agent can use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelProfile {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    /// Calling convention tried first: "chat", "responses" or "completions".
    pub mode: String,
    pub use_tools: bool,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_retries: u32,
    /// Retry delay in seconds
    pub retry_delay: u64,
}

impl Default for ModelProfile {
    fn default() -> Self {
        let defaults = ModelConfig::default();
        Self {
            base_url: defaults.base_url,
            api_key: defaults.api_key,
            model_name: defaults.model_name,
            mode: CallMode::Chat.as_str().to_string(),
            use_tools: false,
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

impl ModelProfile {
    /// Build the client configuration for this profile.
    pub fn to_model_config(&self, lang: &str) -> ModelConfig {
        let mut config = ModelConfig::default()
            .with_base_url(&self.base_url)
            .with_api_key(&self.api_key)
            .with_model_name(&self.model_name)
            .with_max_retries(self.max_retries)
            .with_retry_delay(self.retry_delay)
            .with_preferred_mode(CallMode::from_name(&self.mode).unwrap_or(CallMode::Chat))
            .with_tools(self.use_tools)
            .with_lang(lang);
        config.max_tokens = self.max_tokens;
        config.temperature = self.temperature;
        config
    }
}

/// Application settings that can be saved and loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Named model profiles
    pub profiles: BTreeMap<String, ModelProfile>,
    /// Profile used when a task does not name one
    pub default_profile: String,
    /// ADB device ID (optional)
    pub device_id: String,
    /// Path to the adb binary
    pub adb_path: String,
    /// Language code ("cn" or "en")
    pub lang: String,
    /// Maximum steps per task
    pub max_steps: u32,
    /// Pause after each device action in milliseconds
    pub step_delay_ms: u64,
    /// History lines sent to the model
    pub history_window: usize,
    /// Longest screenshot edge sent to the model (0 keeps native size)
    pub max_model_edge: u32,
    /// Foreground packages treated as permission dialogs
    pub permission_dialog_packages: Vec<String>,
    /// Authorization relay URL (empty disables the relay)
    pub relay_url: String,
    /// API key presented to the relay
    pub relay_api_key: String,
    /// Directory for task journals (empty uses the data directory)
    pub workspace_dir: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        let runtime = RuntimeConfig::default();
        let mut profiles = BTreeMap::new();
        profiles.insert(DEFAULT_PROFILE.to_string(), ModelProfile::default());
        Self {
            profiles,
            default_profile: DEFAULT_PROFILE.to_string(),
            device_id: String::new(),
            adb_path: "adb".to_string(),
            lang: "en".to_string(),
            max_steps: runtime.max_steps,
            step_delay_ms: runtime.step_delay_ms,
            history_window: runtime.history_window,
            max_model_edge: crate::adb::DEFAULT_MAX_MODEL_EDGE,
            permission_dialog_packages: DEFAULT_PERMISSION_DIALOG_PACKAGES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            relay_url: String::new(),
            relay_api_key: String::new(),
            workspace_dir: String::new(),
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "moderras", "phone-pilot")
}

impl AppSettings {
    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Load settings from the config file, falling back to defaults.
    pub fn load() -> Self {
        Self::settings_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load settings from a specific file.
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        let mut loaded: Self = serde_json::from_str(&content)?;
        loaded.backfill();
        Ok(loaded)
    }

    /// Fill fields that older config files leave empty.
    fn backfill(&mut self) {
        let defaults = Self::default();
        if self.profiles.is_empty() {
            self.profiles = defaults.profiles;
        }
        if self.default_profile.is_empty() || !self.profiles.contains_key(&self.default_profile) {
            if let Some(first) = self.profiles.keys().next() {
                self.default_profile = first.clone();
            }
        }
        if self.adb_path.is_empty() {
            self.adb_path = defaults.adb_path;
        }
        if self.max_steps == 0 {
            self.max_steps = defaults.max_steps;
        }
        if self.history_window == 0 {
            self.history_window = defaults.history_window;
        }
    }

    /// Save settings to the config file.
    pub fn save(&self) -> Result<(), SettingsError> {
        let path = Self::settings_path().ok_or(SettingsError::NoConfigDir)?;
        self.save_to(&path)
    }

    /// Save settings to a specific file.
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply environment overrides. `MODEL_*` variables update the default profile.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let default_profile = self.default_profile.clone();
        let profile = self.profiles.entry(default_profile).or_default();
        if let Some(v) = var("MODEL_BASE_URL") {
            profile.base_url = v;
        }
        if let Some(v) = var("MODEL_API_KEY") {
            profile.api_key = v;
        }
        if let Some(v) = var("MODEL_NAME") {
            profile.model_name = v;
        }
        if let Some(v) = var("MODEL_MODE").filter(|v| CallMode::from_name(v).is_some()) {
            profile.mode = v.to_lowercase();
        }
        if let Some(v) = var("MODEL_USE_TOOLS") {
            profile.use_tools = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = var("MODEL_MAX_RETRIES").and_then(|s| s.parse().ok()) {
            profile.max_retries = v;
        }
        if let Some(v) = var("MODEL_RETRY_DELAY").and_then(|s| s.parse().ok()) {
            profile.retry_delay = v;
        }

        if let Some(v) = var("ADB_DEVICE_ID") {
            self.device_id = v;
        }
        if let Some(v) = var("AGENT_LANG") {
            self.lang = v;
        }
        if let Some(v) = var("AGENT_MAX_STEPS").and_then(|s| s.parse().ok()) {
            self.max_steps = v;
        }
        if let Some(v) = var("RELAY_URL") {
            self.relay_url = v;
        }
        if let Some(v) = var("RELAY_API_KEY") {
            self.relay_api_key = v;
        }
        if let Some(v) = var("AGENT_WORKSPACE") {
            self.workspace_dir = v;
        }
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_env(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
        self
    }

    /// Runtime configuration derived from these settings.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig::default()
            .with_max_steps(self.max_steps)
            .with_step_delay(self.step_delay_ms)
            .with_history_window(self.history_window)
            .with_permission_dialog_packages(self.permission_dialog_packages.clone())
    }

    /// Directory for task journals.
    pub fn workspace_path(&self) -> PathBuf {
        if !self.workspace_dir.is_empty() {
            return PathBuf::from(&self.workspace_dir);
        }
        project_dirs()
            .map(|dirs| dirs.data_dir().join("workspace"))
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = AppSettings::default();
        assert_eq!(settings.default_profile, DEFAULT_PROFILE);
        assert!(settings.profiles.contains_key(DEFAULT_PROFILE));
        assert_eq!(settings.adb_path, "adb");
        assert!(!settings.permission_dialog_packages.is_empty());
        assert_eq!(settings.runtime_config().max_steps, settings.max_steps);
    }

    #[test]
    fn test_env_overrides_default_profile() {
        let env: HashMap<&str, &str> = [
            ("MODEL_BASE_URL", "https://api.example.com/v1"),
            ("MODEL_MODE", "Responses"),
            ("MODEL_USE_TOOLS", "true"),
            ("AGENT_MAX_STEPS", "12"),
            ("RELAY_URL", "https://relay.example"),
        ]
        .into_iter()
        .collect();

        let mut settings = AppSettings::default();
        settings.apply_env(|key| env.get(key).map(|v| v.to_string()));

        let profile = &settings.profiles[DEFAULT_PROFILE];
        assert_eq!(profile.base_url, "https://api.example.com/v1");
        assert!(profile.use_tools);
        assert_eq!(settings.max_steps, 12);
        assert_eq!(settings.relay_url, "https://relay.example");

        let config = profile.to_model_config("en");
        assert_eq!(config.preferred_mode, CallMode::Responses);
        assert!(config.use_tools);
    }

    #[test]
    fn test_invalid_mode_is_ignored() {
        let mut settings = AppSettings::default();
        settings.apply_env(|key| (key == "MODEL_MODE").then(|| "grpc".to_string()));
        assert_eq!(settings.profiles[DEFAULT_PROFILE].mode, "chat");
    }

    #[test]
    fn test_save_and_load_backfills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"lang": "cn", "profiles": {}, "max_steps": 0}"#).unwrap();

        let loaded = AppSettings::load_from(&path).unwrap();
        assert_eq!(loaded.lang, "cn");
        assert_eq!(loaded.max_steps, AppSettings::default().max_steps);
        assert!(loaded.profiles.contains_key(DEFAULT_PROFILE));

        loaded.save_to(&path).unwrap();
        assert_eq!(AppSettings::load_from(&path).unwrap(), loaded);
    }
}
