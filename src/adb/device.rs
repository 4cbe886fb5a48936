//! Device control primitives over `adb shell`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

use super::connection::AdbConnection;
use crate::device::DeviceError;

static FOCUS_PACKAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z][\w.]*)/[\w.$]+").expect("valid focus regex"));

/// Device-side path used for UI hierarchy dumps.
const UI_DUMP_PATH: &str = "/sdcard/window_dump.xml";

/// Directory images are pushed into so the gallery picks them up.
pub const IMAGE_DIR: &str = "/sdcard/Pictures/PhonePilot";

/// Get the package name of the currently focused window.
///
/// Returns an empty string when the focus cannot be determined.
pub async fn current_app(conn: &AdbConnection) -> String {
    match conn.shell(&["dumpsys", "window"]).await {
        Ok(stdout) => parse_focused_package(&stdout).unwrap_or_default(),
        Err(e) => {
            tracing::debug!("dumpsys window failed: {}", e);
            String::new()
        }
    }
}

fn parse_focused_package(dumpsys: &str) -> Option<String> {
    dumpsys
        .lines()
        .filter(|line| line.contains("mCurrentFocus") || line.contains("mFocusedApp"))
        .find_map(|line| FOCUS_PACKAGE.captures(line))
        .map(|caps| caps[1].to_string())
}

/// Tap at the specified coordinates.
pub async fn tap(conn: &AdbConnection, x: i32, y: i32) -> Result<String, DeviceError> {
    conn.shell(&["input", "tap", &x.to_string(), &y.to_string()]).await?;
    Ok(format!("tapped ({}, {})", x, y))
}

/// Swipe from start to end coordinates.
pub async fn swipe(
    conn: &AdbConnection,
    start: (i32, i32),
    end: (i32, i32),
    duration_ms: u64,
) -> Result<String, DeviceError> {
    conn.shell(&[
        "input",
        "swipe",
        &start.0.to_string(),
        &start.1.to_string(),
        &end.0.to_string(),
        &end.1.to_string(),
        &duration_ms.to_string(),
    ])
    .await?;
    Ok(format!(
        "swiped ({}, {}) -> ({}, {}) in {}ms",
        start.0, start.1, end.0, end.1, duration_ms
    ))
}

/// Send a key event such as `KEYCODE_BACK` or `4`.
pub async fn keyevent(conn: &AdbConnection, keycode: &str) -> Result<String, DeviceError> {
    conn.shell(&["input", "keyevent", keycode]).await?;
    Ok(format!("sent keyevent {}", keycode))
}

/// Launch an app by package name through its launcher intent.
pub async fn launch_app(conn: &AdbConnection, package: &str) -> Result<String, DeviceError> {
    let out = conn
        .shell(&[
            "monkey",
            "-p",
            package,
            "-c",
            "android.intent.category.LAUNCHER",
            "1",
        ])
        .await?;
    if out.contains("No activities found") {
        return Err(DeviceError::CommandFailed(format!("App not found: {}", package)));
    }
    Ok(format!("launched {}", package))
}

/// Dump the current UI hierarchy as XML.
pub async fn dump_ui(conn: &AdbConnection) -> Result<String, DeviceError> {
    conn.shell(&["uiautomator", "dump", UI_DUMP_PATH]).await?;
    let output = conn.run(&["exec-out", "cat", UI_DUMP_PATH]).await?;
    let xml = String::from_utf8_lossy(&output.stdout).to_string();
    if !xml.contains("<hierarchy") {
        return Err(DeviceError::CommandFailed("uiautomator dump returned no hierarchy".into()));
    }
    Ok(xml)
}

/// Inject a GPS fix through a location test provider (Android 12+).
pub async fn inject_location(
    conn: &AdbConnection,
    latitude: f64,
    longitude: f64,
) -> Result<String, DeviceError> {
    // add-test-provider fails harmlessly when the provider already exists
    let _ = conn
        .shell(&["cmd", "location", "providers", "add-test-provider", "gps"])
        .await;
    conn.shell(&[
        "cmd",
        "location",
        "providers",
        "set-test-provider-enabled",
        "gps",
        "true",
    ])
    .await?;
    let fix = format!("{},{}", latitude, longitude);
    conn.shell(&[
        "cmd",
        "location",
        "providers",
        "set-test-provider-location",
        "gps",
        "--location",
        &fix,
    ])
    .await?;
    Ok(format!("location set to {}", fix))
}

/// Push a local file into the device image directory and trigger a media scan.
pub async fn push_image(
    conn: &AdbConnection,
    local: &Path,
    file_name: &str,
) -> Result<String, DeviceError> {
    conn.shell(&["mkdir", "-p", IMAGE_DIR]).await?;
    let remote = format!("{}/{}", IMAGE_DIR, file_name);
    let local_str = local.to_string_lossy();
    let output = conn.run(&["push", local_str.as_ref(), &remote]).await?;
    if !output.status.success() {
        return Err(DeviceError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    conn.shell(&[
        "am",
        "broadcast",
        "-a",
        "android.intent.action.MEDIA_SCANNER_SCAN_FILE",
        "-d",
        &format!("file://{}", remote),
    ])
    .await?;
    Ok(remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_focused_package() {
        let dump = "  mCurrentFocus=Window{3c1 u0 com.android.permissioncontroller/com.android.permissioncontroller.permission.ui.GrantPermissionsActivity}\n";
        assert_eq!(
            parse_focused_package(dump).as_deref(),
            Some("com.android.permissioncontroller")
        );
        assert_eq!(parse_focused_package("nothing focused"), None);
    }
}
