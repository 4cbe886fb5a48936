//! Extraction of one decision from raw model responses.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::actions::{normalize, Action};

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("valid fence regex"));
static THINK_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>(.*?)</think>").expect("valid think regex"));

/// A tool invocation returned by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Text and optional tool call pulled out of one response body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawReply {
    pub text: String,
    pub tool_call: Option<ToolCall>,
}

/// Map a tool name to the action tag it stands for.
pub fn tool_to_action_tag(name: &str) -> &str {
    match name {
        "type_text" => "type",
        other => other,
    }
}

/// Find the first JSON object in free text.
///
/// Fenced code blocks are tried first, then a brace-depth scan over the whole
/// text that ignores braces inside string literals.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    for caps in FENCED_BLOCK.captures_iter(text) {
        let block = caps[1].trim();
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(block) {
            return Some(obj);
        }
        if let Some((obj, _)) = scan_for_object(block) {
            return Some(obj);
        }
    }
    scan_for_object(text).map(|(obj, _)| obj)
}

/// Brace-depth scan returning the first parseable top-level object and the
/// byte offset where it starts.
fn scan_for_object(text: &str) -> Option<(Map<String, Value>, usize)> {
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(rel) = text[search_from..].find('{') {
        let start = search_from + rel;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;

        for (i, &b) in bytes.iter().enumerate().skip(start) {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }

        let Some(end) = end else {
            search_from = start + 1;
            continue;
        };
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(&text[start..=end]) {
            return Some((obj, start));
        }
        search_from = start + 1;
    }
    None
}

/// Turn a raw reply into `(thought, action)`.
pub fn decide(reply: &RawReply) -> (String, Action) {
    if let Some(call) = &reply.tool_call {
        return decide_from_tool_call(call, &reply.text);
    }
    decide_from_text(&reply.text)
}

fn decide_from_tool_call(call: &ToolCall, text: &str) -> (String, Action) {
    let mut args = match &call.arguments {
        Value::Object(map) => map.clone(),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        _ => Map::new(),
    };
    let thought = take_thought(&mut args).unwrap_or_else(|| clean_thought(text));
    args.insert(
        "type".to_string(),
        Value::String(tool_to_action_tag(&call.name).to_string()),
    );
    (thought, normalize(&Value::Object(args)))
}

fn decide_from_text(text: &str) -> (String, Action) {
    let tagged_thought = THINK_BLOCK
        .captures(text)
        .map(|caps| caps[1].trim().to_string());

    match extract_json_object(text) {
        Some(mut obj) => {
            let thought = take_thought(&mut obj)
                .or(tagged_thought)
                .unwrap_or_else(|| clean_thought(&text_before_object(text)));
            let action_value = match obj.remove("action") {
                Some(Value::Object(inner)) => Value::Object(inner),
                Some(other) => {
                    obj.insert("action".to_string(), other);
                    Value::Object(obj)
                }
                None => Value::Object(obj),
            };
            (thought, normalize(&action_value))
        }
        None => (
            tagged_thought.unwrap_or_else(|| clean_thought(text)),
            normalize(&Value::Null),
        ),
    }
}

fn take_thought(obj: &mut Map<String, Value>) -> Option<String> {
    match obj.remove("thought").or_else(|| obj.remove("thinking")) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn text_before_object(text: &str) -> String {
    let head = match text.find("```") {
        Some(i) => &text[..i],
        None => text.find('{').map(|i| &text[..i]).unwrap_or(text),
    };
    head.to_string()
}

fn clean_thought(text: &str) -> String {
    THINK_BLOCK
        .replace_all(text, "$1")
        .replace("<answer>", "")
        .replace("</answer>", "")
        .trim()
        .to_string()
}

/// Pull text and tool call from a chat-completions body.
pub fn parse_chat_reply(body: &Value) -> Option<RawReply> {
    let message = body.get("choices")?.get(0)?.get("message")?;
    let text = content_text(message.get("content"));
    let tool_call = message
        .get("tool_calls")
        .and_then(|calls| calls.get(0))
        .and_then(|call| call.get("function"))
        .and_then(|f| {
            Some(ToolCall {
                name: f.get("name")?.as_str()?.to_string(),
                arguments: f.get("arguments").cloned().unwrap_or(Value::Null),
            })
        });
    Some(RawReply { text, tool_call })
}

/// Pull text and tool call from a responses-convention body.
pub fn parse_responses_reply(body: &Value) -> Option<RawReply> {
    let output = body.get("output").and_then(Value::as_array);
    if output.is_none() && body.get("output_text").is_none() {
        return None;
    }

    let mut text = body
        .get("output_text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let mut tool_call = None;

    for item in output.into_iter().flatten() {
        match item.get("type").and_then(Value::as_str) {
            Some("function_call") if tool_call.is_none() => {
                if let Some(name) = item.get("name").and_then(Value::as_str) {
                    tool_call = Some(ToolCall {
                        name: name.to_string(),
                        arguments: item.get("arguments").cloned().unwrap_or(Value::Null),
                    });
                }
            }
            Some("message") if text.is_empty() => {
                text = content_text(item.get("content"));
            }
            _ => {}
        }
    }
    Some(RawReply { text, tool_call })
}

/// Pull text from a bare completions body.
pub fn parse_completion_reply(body: &Value) -> Option<RawReply> {
    let text = body.get("choices")?.get(0)?.get("text")?.as_str()?.to_string();
    Some(RawReply {
        text,
        tool_call: None,
    })
}

/// Content may be a plain string or an array of typed parts.
fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionKind;
    use serde_json::json;

    #[test]
    fn test_prefers_fenced_block() {
        let text = "Thinking about {braces} here.\n```json\n{\"type\": \"tap\", \"x\": 5, \"y\": 6}\n```";
        let obj = extract_json_object(text).unwrap();
        assert_eq!(obj["type"], "tap");
    }

    #[test]
    fn test_scan_skips_braces_in_strings() {
        let text = r#"I will type now {"type":"type","text":"a } tricky \" {string"} trailing"#;
        let obj = extract_json_object(text).unwrap();
        assert_eq!(obj["text"], "a } tricky \" {string");
    }

    #[test]
    fn test_scan_skips_unparseable_candidates() {
        let text = r#"{not json} then {"type":"wait"}"#;
        let obj = extract_json_object(text).unwrap();
        assert_eq!(obj["type"], "wait");
    }

    #[test]
    fn test_scan_skips_unclosed_prose_brace() {
        let text = r#"I will press the {search button now. {"type":"tap","x":1,"y":2}"#;
        let obj = extract_json_object(text).unwrap();
        assert_eq!(obj["x"], 1);

        let (_, action) = decide(&RawReply {
            text: text.into(),
            tool_call: None,
        });
        assert!(matches!(action.kind, ActionKind::Tap { x: 1, y: 2 }));
    }

    #[test]
    fn test_no_object_yields_wait() {
        let (thought, action) = decide(&RawReply {
            text: "I am not sure what to do".into(),
            tool_call: None,
        });
        assert_eq!(thought, "I am not sure what to do");
        assert!(matches!(action.kind, ActionKind::Wait { .. }));
    }

    #[test]
    fn test_text_decision_with_nested_action() {
        let (thought, action) = decide(&RawReply {
            text: r#"{"thought":"open settings","action":{"type":"launch_app","packageName":"com.android.settings"}}"#.into(),
            tool_call: None,
        });
        assert_eq!(thought, "open settings");
        assert_eq!(
            action.kind,
            ActionKind::LaunchApp { package_name: "com.android.settings".into() }
        );
    }

    #[test]
    fn test_think_tags_become_thought() {
        let (thought, action) = decide(&RawReply {
            text: "<think>Need to go back</think><answer>{\"type\":\"keyevent\",\"keycode\":\"KEYCODE_BACK\"}</answer>".into(),
            tool_call: None,
        });
        assert_eq!(thought, "Need to go back");
        assert_eq!(action.kind, ActionKind::Keyevent { keycode: "KEYCODE_BACK".into() });
    }

    #[test]
    fn test_tool_call_maps_type_text() {
        let (thought, action) = decide(&RawReply {
            text: String::new(),
            tool_call: Some(ToolCall {
                name: "type_text".into(),
                arguments: json!("{\"text\":\"hello\",\"thought\":\"fill search\"}"),
            }),
        });
        assert_eq!(thought, "fill search");
        assert_eq!(action.kind, ActionKind::Type { text: "hello".into() });
    }

    #[test]
    fn test_parse_chat_reply_with_tool_call() {
        let body = json!({"choices": [{"message": {
            "content": null,
            "tool_calls": [{"type": "function", "function": {"name": "tap", "arguments": "{\"x\":1,\"y\":2}"}}]
        }}]});
        let reply = parse_chat_reply(&body).unwrap();
        assert_eq!(reply.tool_call.unwrap().name, "tap");
        assert!(reply.text.is_empty());
    }

    #[test]
    fn test_parse_responses_reply() {
        let body = json!({"output": [
            {"type": "reasoning", "summary": []},
            {"type": "message", "content": [{"type": "output_text", "text": "done"}]},
            {"type": "function_call", "name": "finish", "arguments": "{\"message\":\"ok\"}"}
        ]});
        let reply = parse_responses_reply(&body).unwrap();
        assert_eq!(reply.text, "done");
        assert_eq!(reply.tool_call.unwrap().name, "finish");
        assert!(parse_responses_reply(&json!({"choices": []})).is_none());
    }

    #[test]
    fn test_parse_completion_reply() {
        let body = json!({"choices": [{"text": "{\"type\":\"wait\"}"}]});
        assert_eq!(parse_completion_reply(&body).unwrap().text, "{\"type\":\"wait\"}");
        assert!(parse_completion_reply(&json!({})).is_none());
    }
}
