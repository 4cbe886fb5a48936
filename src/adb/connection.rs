//! ADB process plumbing for local and remote devices.

use std::process::Output;
use std::time::Duration;

use tokio::process::Command;

use crate::device::DeviceError;

/// Type of ADB connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionType {
    Usb,
    Remote,
}

/// Information about a connected device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_id: String,
    pub status: String,
    pub connection_type: ConnectionType,
    pub model: Option<String>,
}

/// Handle to one device reachable through the `adb` binary.
///
/// # Example
/// ```rust,no_run
/// use phone_pilot::adb::AdbConnection;
///
/// # async fn demo() -> Result<(), phone_pilot::device::DeviceError> {
/// let conn = AdbConnection::new(Some("192.168.1.100:5555".to_string()));
/// conn.connect().await?;
/// let out = conn.shell(&["getprop", "ro.product.model"]).await?;
/// println!("{}", out);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AdbConnection {
    adb_path: String,
    device_id: Option<String>,
}

impl AdbConnection {
    /// Create a connection using `adb` from `PATH`.
    pub fn new(device_id: Option<String>) -> Self {
        Self::with_path("adb", device_id)
    }

    /// Create a connection with a custom ADB binary path.
    pub fn with_path(adb_path: impl Into<String>, device_id: Option<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
            device_id,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Arguments that select the target device.
    pub(crate) fn prefix_args(&self) -> Vec<String> {
        match &self.device_id {
            Some(id) => vec!["-s".to_string(), id.clone()],
            None => Vec::new(),
        }
    }

    /// Run `adb [-s id] <args>` and return the raw process output.
    pub async fn run(&self, args: &[&str]) -> Result<Output, DeviceError> {
        Command::new(&self.adb_path)
            .args(self.prefix_args())
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DeviceError::CommandFailed(format!("{} {}: {}", self.adb_path, args.join(" "), e)))
    }

    /// Run `adb shell <args>` and return trimmed stdout+stderr.
    pub async fn shell(&self, args: &[&str]) -> Result<String, DeviceError> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        let output = self.run(&full).await?;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() {
            return Err(DeviceError::CommandFailed(combined.trim().to_string()));
        }
        Ok(combined.trim().to_string())
    }

    /// Like [`shell`](Self::shell) but bounded by a timeout.
    pub async fn shell_with_timeout(&self, args: &[&str], timeout_secs: u64) -> Result<String, DeviceError> {
        tokio::time::timeout(Duration::from_secs(timeout_secs.max(1)), self.shell(args))
            .await
            .map_err(|_| DeviceError::Timeout(timeout_secs))?
    }

    /// Connect to the configured device over TCP/IP when it is a network address.
    pub async fn connect(&self) -> Result<String, DeviceError> {
        let address = match &self.device_id {
            Some(id) if id.contains(':') || id.contains('.') => {
                if id.contains(':') {
                    id.clone()
                } else {
                    format!("{}:5555", id)
                }
            }
            _ => return Ok("USB device, no connect needed".to_string()),
        };

        let output = Command::new(&self.adb_path)
            .args(["connect", &address])
            .output()
            .await
            .map_err(|e| DeviceError::CommandFailed(e.to_string()))?;

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let lower = combined.to_lowercase();
        if lower.contains("connected") && !lower.contains("cannot") {
            Ok(format!("Connected to {}", address))
        } else {
            Err(DeviceError::CommandFailed(combined.trim().to_string()))
        }
    }

    /// List all devices known to the ADB server.
    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let output = Command::new(&self.adb_path)
            .args(["devices", "-l"])
            .output()
            .await
            .map_err(|e| DeviceError::CommandFailed(e.to_string()))?;
        Ok(parse_device_list(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn parse_device_list(stdout: &str) -> Vec<DeviceInfo> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 {
                return None;
            }
            let device_id = parts[0].to_string();
            let connection_type = if device_id.contains(':') {
                ConnectionType::Remote
            } else {
                ConnectionType::Usb
            };
            let model = parts
                .iter()
                .find_map(|p| p.strip_prefix("model:"))
                .map(str::to_string);
            Some(DeviceInfo {
                device_id,
                status: parts[1].to_string(),
                connection_type,
                model,
            })
        })
        .collect()
}
