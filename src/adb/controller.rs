//! [`DeviceController`] implementation backed by ADB.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

use super::connection::AdbConnection;
use super::{device, input, screenshot};
use crate::actions::{Action, ActionKind};
use crate::device::{DeviceController, DeviceError, Snapshot};

/// Default longest edge of the screenshot handed to the model.
pub const DEFAULT_MAX_MODEL_EDGE: u32 = 1280;

/// Drives an Android device through the `adb` binary.
pub struct AdbController {
    conn: AdbConnection,
    max_model_edge: Option<u32>,
}

impl AdbController {
    pub fn new(conn: AdbConnection) -> Self {
        Self {
            conn,
            max_model_edge: Some(DEFAULT_MAX_MODEL_EDGE),
        }
    }

    /// Set the longest screenshot edge sent to the model (`None` keeps full size).
    pub fn with_max_model_edge(mut self, max_edge: Option<u32>) -> Self {
        self.max_model_edge = max_edge;
        self
    }

    pub fn connection(&self) -> &AdbConnection {
        &self.conn
    }
}

#[async_trait]
impl DeviceController for AdbController {
    async fn capture_snapshot(&self) -> Result<Snapshot, DeviceError> {
        let current_app = device::current_app(&self.conn).await;
        screenshot::capture(&self.conn, current_app, self.max_model_edge).await
    }

    async fn execute(&self, action: &Action) -> Result<String, DeviceError> {
        match &action.kind {
            ActionKind::Tap { x, y } => device::tap(&self.conn, *x, *y).await,
            ActionKind::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
            } => device::swipe(&self.conn, (*x1, *y1), (*x2, *y2), *duration_ms).await,
            ActionKind::Type { text } => {
                input::type_text(&self.conn, text).await?;
                Ok(format!("typed {} characters", text.chars().count()))
            }
            ActionKind::Keyevent { keycode } => device::keyevent(&self.conn, keycode).await,
            ActionKind::LaunchApp { package_name } => {
                device::launch_app(&self.conn, package_name).await
            }
            ActionKind::Shell { command } => self.conn.shell(&[command.as_str()]).await,
            ActionKind::RunScript {
                script,
                timeout_sec,
            } => {
                self.conn
                    .shell_with_timeout(&["sh", "-c", &shell_quote(script)], *timeout_sec)
                    .await
            }
            ActionKind::Wait { duration_ms } => {
                sleep(Duration::from_millis(*duration_ms)).await;
                Ok(format!("waited {}ms", duration_ms))
            }
            ActionKind::RequestHumanAuth { .. } | ActionKind::Finish { .. } => Err(
                DeviceError::Unsupported(format!("{} is not a device action", action.tag())),
            ),
        }
    }

    async fn dump_ui(&self) -> Result<String, DeviceError> {
        device::dump_ui(&self.conn).await
    }

    async fn inject_location(&self, latitude: f64, longitude: f64) -> Result<String, DeviceError> {
        device::inject_location(&self.conn, latitude, longitude).await
    }

    async fn push_image(&self, bytes: &[u8], file_name: &str) -> Result<String, DeviceError> {
        let local = std::env::temp_dir().join(format!("phone-pilot-{}-{}", uuid::Uuid::new_v4(), file_name));
        tokio::fs::write(&local, bytes).await?;
        let result = device::push_image(&self.conn, &local, file_name).await;
        if let Err(e) = tokio::fs::remove_file(&local).await {
            tracing::debug!("Failed to remove {}: {}", local.display(), e);
        }
        result
    }
}

/// Quote a script so the device shell receives it as a single argument.
fn shell_quote(script: &str) -> String {
    format!("'{}'", script.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
        assert_eq!(shell_quote("echo 'x'"), r"'echo '\''x'\'''");
    }

    #[tokio::test]
    async fn test_non_device_actions_are_rejected() {
        let controller = AdbController::new(AdbConnection::with_path("adb-not-installed", None));
        let finish = Action::new(ActionKind::Finish { message: "done".into() });
        assert!(matches!(
            controller.execute(&finish).await,
            Err(DeviceError::Unsupported(_))
        ));
    }
}
