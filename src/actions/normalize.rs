//! Conversion of untrusted model output into typed actions.
//!
//! [`normalize`] is total: whatever the model produced, the result is one of
//! the [`ActionKind`] variants. Anything that cannot be interpreted safely
//! becomes a `wait` carrying a diagnostic reason.

use serde_json::{Map, Value};

use super::action::{
    Action, ActionKind, Capability, DEFAULT_HUMAN_AUTH_TIMEOUT_SECS, DEFAULT_SCRIPT_TIMEOUT_SECS,
    DEFAULT_SWIPE_DURATION_MS, DEFAULT_WAIT_DURATION_MS,
};

/// Normalize an arbitrary JSON value into an [`Action`].
pub fn normalize(raw: &Value) -> Action {
    let obj = match raw.as_object() {
        Some(obj) => obj,
        None => return Action::wait_because("invalid action payload"),
    };

    let tag = tag_of(obj);
    let reason = string_field(obj, &["reason"]).filter(|r| !r.trim().is_empty());

    let kind = match tag.as_str() {
        "tap" => {
            let point = array_field(obj, &["element", "point"]);
            ActionKind::Tap {
                x: coord(obj, &["x"], point, 0),
                y: coord(obj, &["y"], point, 1),
            }
        }
        "swipe" => {
            let start = array_field(obj, &["start"]);
            let end = array_field(obj, &["end"]);
            ActionKind::Swipe {
                x1: coord(obj, &["x1"], start, 0),
                y1: coord(obj, &["y1"], start, 1),
                x2: coord(obj, &["x2"], end, 0),
                y2: coord(obj, &["y2"], end, 1),
                duration_ms: duration(
                    obj,
                    &["durationMs", "duration_ms", "duration"],
                    DEFAULT_SWIPE_DURATION_MS,
                ),
            }
        }
        "type" | "type_text" => ActionKind::Type {
            text: string_field(obj, &["text", "value"]).unwrap_or_default(),
        },
        "keyevent" => match keycode(obj) {
            Some(keycode) => ActionKind::Keyevent { keycode },
            None => return Action::wait_because("keyevent without keycode"),
        },
        "launch_app" => match non_blank(obj, &["packageName", "package_name", "package", "app"]) {
            Some(package_name) => ActionKind::LaunchApp { package_name },
            None => return Action::wait_because("launch_app without packageName"),
        },
        "shell" => match non_blank(obj, &["command", "cmd"]) {
            Some(command) => ActionKind::Shell { command },
            None => return Action::wait_because("shell without command"),
        },
        "run_script" => match non_blank(obj, &["script"]) {
            Some(script) => ActionKind::RunScript {
                script,
                timeout_sec: duration(
                    obj,
                    &["timeoutSec", "timeout_sec", "timeout"],
                    DEFAULT_SCRIPT_TIMEOUT_SECS,
                ),
            },
            None => return Action::wait_because("run_script without script"),
        },
        "request_human_auth" => human_auth(obj),
        "wait" => ActionKind::Wait {
            duration_ms: duration(
                obj,
                &["durationMs", "duration_ms", "duration"],
                DEFAULT_WAIT_DURATION_MS,
            ),
        },
        "finish" => ActionKind::Finish {
            message: non_blank(obj, &["message", "result", "text"])
                .unwrap_or_else(|| "Task completed".to_string()),
        },
        other => return Action::wait_because(format!("unknown action type '{}'", other)),
    };

    Action { kind, reason }
}

fn human_auth(obj: &Map<String, Value>) -> ActionKind {
    let raw_capability = string_field(obj, &["capability"])
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    let given = non_blank(obj, &["instruction", "message"]);
    let timeout_sec = duration(
        obj,
        &["timeoutSec", "timeout_sec", "timeout"],
        DEFAULT_HUMAN_AUTH_TIMEOUT_SECS,
    );

    let (capability, instruction) = match Capability::from_name(&raw_capability) {
        Some(cap) if cap != Capability::Unknown => (
            cap,
            given.unwrap_or_else(|| cap.default_instruction().to_string()),
        ),
        _ => (
            Capability::Unknown,
            format!(
                "Unrecognized capability '{}'. {}",
                raw_capability,
                given.unwrap_or_else(|| Capability::Unknown.default_instruction().to_string())
            ),
        ),
    };

    ActionKind::RequestHumanAuth {
        capability,
        instruction,
        timeout_sec,
    }
}

fn tag_of(obj: &Map<String, Value>) -> String {
    let raw = ["type", "action", "name"]
        .iter()
        .find_map(|key| obj.get(*key))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    raw.trim().to_lowercase()
}

fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| obj.get(*key))
}

fn string_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    lookup(obj, keys).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn non_blank(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    string_field(obj, keys)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn array_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Vec<Value>> {
    lookup(obj, keys).and_then(Value::as_array)
}

fn keycode(obj: &Map<String, Value>) -> Option<String> {
    match lookup(obj, &["keycode", "keyCode", "key_code", "key"])? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        other => to_number(other).map(|n| format!("{}", n.round() as i64)),
    }
}

fn coord(obj: &Map<String, Value>, keys: &[&str], pair: Option<&Vec<Value>>, index: usize) -> i32 {
    lookup(obj, keys)
        .and_then(to_number)
        .or_else(|| pair.and_then(|p| p.get(index)).and_then(to_number))
        .map(|n| n.round() as i32)
        .unwrap_or(0)
}

fn duration(obj: &Map<String, Value>, keys: &[&str], default: u64) -> u64 {
    lookup(obj, keys)
        .and_then(to_number)
        .map(|n| n.max(0.0).round() as u64)
        .unwrap_or(default)
}

/// Coerce a JSON value to a finite number the way JavaScript's `Number()`
/// would, returning `None` for anything that would be `NaN` or infinite.
pub fn to_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Null => 0.0,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                0.0
            } else {
                s.parse::<f64>().ok()?
            }
        }
        Value::Array(items) => match items.as_slice() {
            [] => 0.0,
            [single] => return to_number(single),
            _ => return None,
        },
        Value::Object(_) => return None,
    };
    n.is_finite().then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reason_of(action: &Action) -> &str {
        action.reason.as_deref().unwrap_or("")
    }

    #[test]
    fn test_non_object_becomes_wait() {
        for raw in [json!(null), json!("tap"), json!(42), json!([1, 2]), json!(true)] {
            let action = normalize(&raw);
            assert!(matches!(action.kind, ActionKind::Wait { .. }));
            assert_eq!(reason_of(&action), "invalid action payload");
        }
    }

    #[test]
    fn test_unknown_type_becomes_wait() {
        let action = normalize(&json!({"type": "teleport", "x": 1}));
        assert!(matches!(action.kind, ActionKind::Wait { duration_ms: 1000 }));
        assert_eq!(reason_of(&action), "unknown action type 'teleport'");

        let action = normalize(&json!({"x": 1}));
        assert_eq!(reason_of(&action), "unknown action type ''");
    }

    #[test]
    fn test_tap_coerces_strings_and_arrays() {
        let action = normalize(&json!({"type": "tap", "x": "120.6", "y": [300]}));
        assert_eq!(action.kind, ActionKind::Tap { x: 121, y: 300 });

        let action = normalize(&json!({"type": "TAP", "element": [10, 20]}));
        assert_eq!(action.kind, ActionKind::Tap { x: 10, y: 20 });
    }

    #[test]
    fn test_numeric_fields_fall_back_on_garbage() {
        let garbage = json!({"nested": true});
        let swipe = normalize(&json!({
            "type": "swipe", "x1": garbage, "y1": "abc", "x2": [1, 2], "y2": null,
            "durationMs": "soon"
        }));
        assert_eq!(
            swipe.kind,
            ActionKind::Swipe { x1: 0, y1: 0, x2: 0, y2: 0, duration_ms: 300 }
        );

        let wait = normalize(&json!({"type": "wait", "durationMs": "Infinity"}));
        assert_eq!(wait.kind, ActionKind::Wait { duration_ms: 1000 });

        let script = normalize(&json!({"type": "run_script", "script": "ls", "timeoutSec": {}}));
        assert_eq!(
            script.kind,
            ActionKind::RunScript { script: "ls".into(), timeout_sec: 60 }
        );

        let auth = normalize(&json!({
            "type": "request_human_auth", "capability": "sms", "timeoutSec": "later"
        }));
        match auth.kind {
            ActionKind::RequestHumanAuth { timeout_sec, .. } => assert_eq!(timeout_sec, 300),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_negative_durations_clamp_to_zero() {
        let wait = normalize(&json!({"type": "wait", "duration_ms": -50}));
        assert_eq!(wait.kind, ActionKind::Wait { duration_ms: 0 });
    }

    #[test]
    fn test_capability_is_trimmed_and_lowercased() {
        let action = normalize(&json!({
            "type": "request_human_auth", "capability": "  2FA ", "instruction": "Enter code"
        }));
        assert_eq!(
            action.kind,
            ActionKind::RequestHumanAuth {
                capability: Capability::TwoFactor,
                instruction: "Enter code".into(),
                timeout_sec: 300,
            }
        );
    }

    #[test]
    fn test_unknown_capability_generates_instruction() {
        let action = normalize(&json!({"type": "request_human_auth", "capability": "telepathy"}));
        match action.kind {
            ActionKind::RequestHumanAuth { capability, instruction, .. } => {
                assert_eq!(capability, Capability::Unknown);
                assert!(instruction.contains("telepathy"));
                assert!(!instruction.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }

        let action = normalize(&json!({"type": "request_human_auth"}));
        match action.kind {
            ActionKind::RequestHumanAuth { capability, instruction, .. } => {
                assert_eq!(capability, Capability::Unknown);
                assert!(instruction.starts_with("Unrecognized capability"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_type_text_alias_and_reason() {
        let action = normalize(&json!({"type": "type_text", "text": "hello", "reason": "search"}));
        assert_eq!(action.kind, ActionKind::Type { text: "hello".into() });
        assert_eq!(action.reason.as_deref(), Some("search"));
    }

    #[test]
    fn test_missing_required_strings_become_wait() {
        assert!(matches!(
            normalize(&json!({"type": "launch_app"})).kind,
            ActionKind::Wait { .. }
        ));
        assert!(matches!(
            normalize(&json!({"type": "shell", "command": "  "})).kind,
            ActionKind::Wait { .. }
        ));
        let key = normalize(&json!({"type": "keyevent", "keycode": 4}));
        assert_eq!(key.kind, ActionKind::Keyevent { keycode: "4".into() });
    }

    #[test]
    fn test_finish_message_default() {
        let action = normalize(&json!({"type": "finish"}));
        assert_eq!(action.kind, ActionKind::Finish { message: "Task completed".into() });
    }

    #[test]
    fn test_to_number_follows_js_rules() {
        assert_eq!(to_number(&json!("")), Some(0.0));
        assert_eq!(to_number(&json!(" 12 ")), Some(12.0));
        assert_eq!(to_number(&json!(true)), Some(1.0));
        assert_eq!(to_number(&json!([])), Some(0.0));
        assert_eq!(to_number(&json!(["7"])), Some(7.0));
        assert_eq!(to_number(&json!("12px")), None);
        assert_eq!(to_number(&json!({})), None);
    }
}
