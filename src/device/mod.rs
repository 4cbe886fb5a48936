//! Device controller abstraction.
//!
//! The runtime only talks to a device through [`DeviceController`]. The ADB
//! implementation lives in [`crate::adb`]; tests use in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::actions::{Action, ActionKind};

/// Device controller errors.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Command execution failed: {0}")]
    CommandFailed(String),
    #[error("Command timed out after {0}s")]
    Timeout(u64),
    #[error("Failed to capture screenshot: {0}")]
    CaptureFailed(String),
    #[error("Unsupported action: {0}")]
    Unsupported(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A captured image of the screen plus the metadata needed to act on it.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// PNG bytes as sent to the model (possibly downscaled).
    pub png: Vec<u8>,
    /// Package name of the foreground app.
    pub current_app: String,
    /// Device-native width in pixels.
    pub width: u32,
    /// Device-native height in pixels.
    pub height: u32,
    /// Model x coordinate * `scale_x` = device x coordinate.
    pub scale_x: f64,
    /// Model y coordinate * `scale_y` = device y coordinate.
    pub scale_y: f64,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    /// Lightweight reference kept in step history.
    pub fn to_ref(&self) -> SnapshotRef {
        SnapshotRef {
            current_app: self.current_app.clone(),
            width: self.width,
            height: self.height,
            captured_at: self.captured_at,
        }
    }

    /// Dimensions of the image the model actually sees.
    pub fn model_dimensions(&self) -> (u32, u32) {
        let w = (self.width as f64 / self.scale_x.max(f64::EPSILON)).round() as u32;
        let h = (self.height as f64 / self.scale_y.max(f64::EPSILON)).round() as u32;
        (w, h)
    }
}

/// Snapshot metadata without the image bytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRef {
    pub current_app: String,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

/// Something that can observe and drive a device.
#[async_trait]
pub trait DeviceController: Send + Sync {
    /// Capture the current screen.
    async fn capture_snapshot(&self) -> Result<Snapshot, DeviceError>;

    /// Perform an action, returning a human-readable result.
    async fn execute(&self, action: &Action) -> Result<String, DeviceError>;

    /// Dump the UI hierarchy of the visible screen as uiautomator XML.
    async fn dump_ui(&self) -> Result<String, DeviceError>;

    /// Feed a coordinate into the device's location provider.
    async fn inject_location(&self, latitude: f64, longitude: f64) -> Result<String, DeviceError>;

    /// Copy an image into device storage, returning its device path.
    async fn push_image(&self, bytes: &[u8], file_name: &str) -> Result<String, DeviceError>;

    /// Return the device to its home screen.
    async fn go_home(&self) -> Result<(), DeviceError> {
        self.execute(&Action::new(ActionKind::Keyevent {
            keycode: "KEYCODE_HOME".to_string(),
        }))
        .await
        .map(|_| ())
    }
}
