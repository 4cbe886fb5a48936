//! Carries an approved decision back into the device.
//!
//! Every step is best-effort: failures become notes in the step result and
//! never fail the task.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use super::types::{Artifact, HumanAuthDecision, HumanAuthRequest};
use crate::actions::{Action, ActionKind, Capability};
use crate::device::DeviceController;
use crate::dialog::{is_permission_dialog, parse_ui_dump, resolve_button, DialogIntent};

/// Operator notes that look like a one-time code are typed.
static CODE_NOTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9-]{3,16}$").expect("valid code regex"));

/// Whether a free-text note should be typed as a code.
pub fn is_code_note(note: &str) -> bool {
    CODE_NOTE.is_match(note.trim())
}

fn image_extension(mime: &str) -> &'static str {
    match mime.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

/// Find the approve or deny control on the visible dialog and tap it.
pub async fn press_dialog_button(
    device: &dyn DeviceController,
    intent: DialogIntent,
) -> Result<String, String> {
    let xml = device
        .dump_ui()
        .await
        .map_err(|e| format!("UI dump failed: {}", e))?;
    let nodes = parse_ui_dump(&xml);
    let node = resolve_button(&nodes, intent)
        .ok_or_else(|| "no actionable button detected".to_string())?;
    let (x, y) = node.bounds.center();
    let label = node.label();

    device
        .execute(&Action::new(ActionKind::Tap { x, y }).with_reason("permission dialog"))
        .await
        .map_err(|e| format!("tap on '{}' failed: {}", label, e))?;
    Ok(format!("Tapped '{}' at ({}, {}) on the permission dialog", label, x, y))
}

/// Apply an approved decision. Returns human-readable notes for the step.
pub async fn apply(
    device: &dyn DeviceController,
    request: &HumanAuthRequest,
    decision: &HumanAuthDecision,
    dialog_packages: &[String],
) -> Vec<String> {
    if !decision.is_approved() {
        return Vec::new();
    }

    let mut notes = Vec::new();
    let capability = request.capability;
    let mut typed = false;

    match &decision.artifact {
        Some(Artifact::Geo { lat, lon }) if capability == Capability::Location => {
            match device.inject_location(*lat, *lon).await {
                Ok(_) => notes.push(format!("Injected location {:.6},{:.6}", lat, lon)),
                Err(e) => notes.push(format!("location injection failed: {}", e)),
            }
        }
        Some(Artifact::Text { value }) if capability.accepts_code() => {
            notes.push(type_text(device, value, "provided text").await);
            typed = true;
        }
        Some(Artifact::Image { mime, bytes }) => {
            let file_name = format!("auth_{}.{}", request.short_id(), image_extension(mime));
            match device.push_image(bytes, &file_name).await {
                Ok(path) => notes.push(format!(
                    "Image from human saved to {}; import it through the gallery or file picker",
                    path
                )),
                Err(e) => notes.push(format!("image push failed: {}", e)),
            }
        }
        Some(other) => {
            debug!("Artifact {} not applicable to {}", other.describe(), capability);
            notes.push(format!("Received {} (not applied)", other.describe()));
        }
        None => {}
    }

    if !typed && capability.accepts_code() {
        if let Some(note) = decision.note.as_deref().filter(|n| is_code_note(n)) {
            notes.push(type_text(device, note.trim(), "code").await);
        }
    }

    if let Some(origin) = request.origin_app.as_deref() {
        if is_permission_dialog(origin, dialog_packages) {
            match press_dialog_button(device, DialogIntent::Approve).await {
                Ok(note) => notes.push(note),
                Err(e) => {
                    warn!("Could not press approve on permission dialog: {}", e);
                    notes.push(format!("permission dialog tap failed: {}", e));
                }
            }
        }
    }

    if let Some(note) = decision.note.as_deref().map(str::trim) {
        if !note.is_empty() && !(capability.accepts_code() && is_code_note(note)) {
            notes.push(format!("Operator note: {}", note));
        }
    }

    if notes.is_empty() {
        notes.push(format!("Human approved {}", capability));
    }
    notes
}

async fn type_text(device: &dyn DeviceController, text: &str, what: &str) -> String {
    let action = Action::new(ActionKind::Type {
        text: text.to_string(),
    })
    .with_reason("human authorization");
    match device.execute(&action).await {
        Ok(_) => format!("Typed {} ({} chars) into the focused field", what, text.chars().count()),
        Err(e) => format!("typing {} failed: {}", what, e),
    }
}
