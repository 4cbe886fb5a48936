//! Request body builders for the three calling conventions.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Map, Value};

/// Everything the model sees for one step.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub task: &'a str,
    pub step: u32,
    pub max_steps: u32,
    /// Foreground package, `None` when no snapshot was captured.
    pub current_app: Option<&'a str>,
    /// Size of the image the model sees (width, height).
    pub screen: (u32, u32),
    pub image_png: Option<&'a [u8]>,
    /// Most recent history lines, oldest first.
    pub history: &'a [String],
}

impl<'a> StepContext<'a> {
    /// Context for a step without a snapshot.
    pub fn text_only(task: &'a str, step: u32, max_steps: u32, history: &'a [String]) -> Self {
        Self {
            task,
            step,
            max_steps,
            current_app: None,
            screen: (1080, 1920),
            image_png: None,
            history,
        }
    }

    /// The textual part of the user turn.
    pub fn user_text(&self) -> String {
        let mut text = format!(
            "Task: {}\nStep: {}/{}\n",
            self.task, self.step, self.max_steps
        );
        match self.current_app {
            Some(app) if !app.is_empty() => {
                text.push_str(&format!("Current app: {}\n", app));
            }
            Some(_) => text.push_str("Current app: unknown\n"),
            None => text.push_str("No screenshot is available for this step.\n"),
        }
        if self.history.is_empty() {
            text.push_str("History: (none)\n");
        } else {
            text.push_str("History:\n");
            for line in self.history {
                text.push_str("- ");
                text.push_str(line);
                text.push('\n');
            }
        }
        text.push_str("Decide the next single action.");
        text
    }

    fn image_data_uri(&self) -> Option<String> {
        self.image_png
            .map(|png| format!("data:image/png;base64,{}", BASE64.encode(png)))
    }
}

/// Helper for building conversation messages.
pub struct MessageBuilder;

impl MessageBuilder {
    /// Create a system message.
    pub fn create_system_message(content: &str) -> Value {
        json!({
            "role": "system",
            "content": content
        })
    }

    /// Create a chat user message with an optional image data URI.
    pub fn create_user_message(text: &str, image_uri: Option<&str>) -> Value {
        let mut content = Vec::new();

        if let Some(uri) = image_uri {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": uri }
            }));
        }

        content.push(json!({
            "type": "text",
            "text": text
        }));

        json!({
            "role": "user",
            "content": content
        })
    }
}

/// Sampling parameters shared by every convention.
#[derive(Debug, Clone)]
pub struct Sampling<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub extra_body: &'a Map<String, Value>,
}

fn merge_extra(body: &mut Value, extra: &Map<String, Value>) {
    if let Value::Object(map) = body {
        for (key, value) in extra {
            map.insert(key.clone(), value.clone());
        }
    }
}

/// `POST /chat/completions` body.
pub fn chat_body(system: &str, ctx: &StepContext<'_>, sampling: &Sampling<'_>, use_tools: bool) -> Value {
    let image = ctx.image_data_uri();
    let messages = vec![
        MessageBuilder::create_system_message(system),
        MessageBuilder::create_user_message(&ctx.user_text(), image.as_deref()),
    ];

    let mut body = json!({
        "model": sampling.model,
        "messages": messages,
        "max_tokens": sampling.max_tokens,
        "temperature": sampling.temperature,
        "top_p": sampling.top_p,
    });
    if use_tools {
        body["tools"] = Value::Array(
            tool_definitions()
                .into_iter()
                .map(|(name, description, parameters)| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": name,
                            "description": description,
                            "parameters": parameters
                        }
                    })
                })
                .collect(),
        );
        body["tool_choice"] = json!("auto");
    }
    merge_extra(&mut body, sampling.extra_body);
    body
}

/// `POST /responses` body.
pub fn responses_body(
    system: &str,
    ctx: &StepContext<'_>,
    sampling: &Sampling<'_>,
    use_tools: bool,
) -> Value {
    let mut content = vec![json!({ "type": "input_text", "text": ctx.user_text() })];
    if let Some(uri) = ctx.image_data_uri() {
        content.push(json!({ "type": "input_image", "image_url": uri }));
    }

    let mut body = json!({
        "model": sampling.model,
        "instructions": system,
        "input": [{ "role": "user", "content": content }],
        "max_output_tokens": sampling.max_tokens,
        "temperature": sampling.temperature,
        "top_p": sampling.top_p,
    });
    if use_tools {
        body["tools"] = Value::Array(
            tool_definitions()
                .into_iter()
                .map(|(name, description, parameters)| {
                    json!({
                        "type": "function",
                        "name": name,
                        "description": description,
                        "parameters": parameters
                    })
                })
                .collect(),
        );
    }
    merge_extra(&mut body, sampling.extra_body);
    body
}

/// `POST /completions` body. Text only, the image is never sent.
pub fn completions_body(system: &str, ctx: &StepContext<'_>, sampling: &Sampling<'_>) -> Value {
    let prompt = format!(
        "{}\n\n{}\nReply with a short thought and one JSON action object.\n",
        system,
        ctx.user_text()
    );
    let mut body = json!({
        "model": sampling.model,
        "prompt": prompt,
        "max_tokens": sampling.max_tokens,
        "temperature": sampling.temperature,
        "top_p": sampling.top_p,
    });
    merge_extra(&mut body, sampling.extra_body);
    body
}

fn params(mut properties: Map<String, Value>, required: &[&str]) -> Value {
    properties.insert(
        "thought".to_string(),
        json!({ "type": "string", "description": "Short reasoning for this step" }),
    );
    properties.insert(
        "reason".to_string(),
        json!({ "type": "string", "description": "Why this action is taken" }),
    );
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn props(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// One function tool per action tag. `type` is exposed as `type_text`.
pub fn tool_definitions() -> Vec<(&'static str, &'static str, Value)> {
    let int = json!({ "type": "integer" });
    let string = json!({ "type": "string" });

    vec![
        (
            "tap",
            "Tap a point on the screen",
            params(props(&[("x", int.clone()), ("y", int.clone())]), &["x", "y"]),
        ),
        (
            "swipe",
            "Swipe from one point to another",
            params(
                props(&[
                    ("x1", int.clone()),
                    ("y1", int.clone()),
                    ("x2", int.clone()),
                    ("y2", int.clone()),
                    ("durationMs", int.clone()),
                ]),
                &["x1", "y1", "x2", "y2"],
            ),
        ),
        (
            "type_text",
            "Type text into the focused field",
            params(props(&[("text", string.clone())]), &["text"]),
        ),
        (
            "keyevent",
            "Send an Android key event such as KEYCODE_BACK",
            params(props(&[("keycode", string.clone())]), &["keycode"]),
        ),
        (
            "launch_app",
            "Launch an app by package name",
            params(props(&[("packageName", string.clone())]), &["packageName"]),
        ),
        (
            "shell",
            "Run an adb shell command",
            params(props(&[("command", string.clone())]), &["command"]),
        ),
        (
            "run_script",
            "Run a shell script on the device",
            params(
                props(&[("script", string.clone()), ("timeoutSec", int.clone())]),
                &["script"],
            ),
        ),
        (
            "request_human_auth",
            "Ask a human to perform or approve a step that needs real-world proof",
            params(
                props(&[
                    (
                        "capability",
                        json!({
                            "type": "string",
                            "enum": [
                                "camera", "qr", "microphone", "voice", "nfc", "sms", "2fa",
                                "location", "biometric", "notification", "contacts",
                                "calendar", "files", "oauth", "payment", "permission"
                            ]
                        }),
                    ),
                    ("instruction", string.clone()),
                    ("timeoutSec", int.clone()),
                ]),
                &["capability", "instruction"],
            ),
        ),
        (
            "wait",
            "Wait for the screen to settle",
            params(props(&[("durationMs", int)]), &[]),
        ),
        (
            "finish",
            "Finish the task with a summary message",
            params(props(&[("message", string)]), &["message"]),
        ),
    ]
}
