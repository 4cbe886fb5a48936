//! Text input through ADB Keyboard.

use base64::{engine::general_purpose::STANDARD, Engine};
use std::time::Duration;
use tokio::time::sleep;

use super::connection::AdbConnection;
use crate::device::DeviceError;

const ADB_KEYBOARD_IME: &str = "com.android.adbkeyboard/.AdbIME";

/// Type text into the focused field, switching to ADB Keyboard for the
/// duration and restoring the previous IME afterwards.
///
/// Requires ADB Keyboard on the device: https://github.com/senzhk/ADBKeyBoard
pub async fn type_text(conn: &AdbConnection, text: &str) -> Result<(), DeviceError> {
    let original_ime = switch_to_adb_keyboard(conn).await?;
    sleep(Duration::from_millis(500)).await;

    conn.shell(&["am", "broadcast", "-a", "ADB_CLEAR_TEXT"]).await?;
    sleep(Duration::from_millis(300)).await;

    let encoded = STANDARD.encode(text.as_bytes());
    let result = conn
        .shell(&["am", "broadcast", "-a", "ADB_INPUT_B64", "--es", "msg", &encoded])
        .await;
    sleep(Duration::from_millis(300)).await;

    restore_keyboard(conn, &original_ime).await;
    result.map(|_| ())
}

/// Switch to ADB Keyboard if needed, returning the original IME id.
async fn switch_to_adb_keyboard(conn: &AdbConnection) -> Result<String, DeviceError> {
    let current = conn
        .shell(&["settings", "get", "secure", "default_input_method"])
        .await
        .unwrap_or_default();

    if !current.contains(ADB_KEYBOARD_IME) {
        conn.shell(&["ime", "set", ADB_KEYBOARD_IME]).await?;
    }
    Ok(current)
}

async fn restore_keyboard(conn: &AdbConnection, ime: &str) {
    if ime.is_empty() || ime.contains(ADB_KEYBOARD_IME) || ime == "null" {
        return;
    }
    if let Err(e) = conn.shell(&["ime", "set", ime]).await {
        tracing::warn!("Failed to restore keyboard {}: {}", ime, e);
    }
}
