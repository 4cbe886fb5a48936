//! System prompts for the agent.

use chrono::{Datelike, Local};

/// Build the system prompt with the current date and the screen size the
/// model is looking at.
pub fn get_system_prompt(lang: &str, width: u32, height: u32, use_tools: bool) -> String {
    let today = Local::now();
    let header = match lang {
        "cn" | "zh" => {
            let weekday_names = ["星期一", "星期二", "星期三", "星期四", "星期五", "星期六", "星期日"];
            let weekday = weekday_names[today.weekday().num_days_from_monday() as usize];
            format!(
                "今天的日期是: {} {}\n当前屏幕分辨率: {}x{} (宽x高)\n请用中文写 thought。\n",
                today.format("%Y年%m月%d日"),
                weekday,
                width,
                height
            )
        }
        _ => format!(
            "Today's date is: {}\nCurrent screen resolution: {}x{} (width x height)\n",
            today.format("%B %d, %Y"),
            width,
            height
        ),
    };

    let output_format = if use_tools {
        TOOL_OUTPUT_FORMAT
    } else {
        JSON_OUTPUT_FORMAT
    };

    format!("{}{}\n{}\n{}", header, SYSTEM_PROMPT, output_format, RULES)
}

static SYSTEM_PROMPT: &str = r#"You are a phone automation agent. Each turn you see the task, the most recent history and a screenshot of the device, and you choose exactly ONE next action.

Coordinates are absolute pixels in the screenshot you are given. Origin (0, 0) is the top-left corner.

Available actions:
- tap: {"type":"tap","x":X,"y":Y}
- swipe: {"type":"swipe","x1":X1,"y1":Y1,"x2":X2,"y2":Y2,"durationMs":300}
- type: {"type":"type","text":"..."} types into the focused field, replacing its content
- keyevent: {"type":"keyevent","keycode":"KEYCODE_BACK"} (also KEYCODE_HOME, KEYCODE_ENTER, ...)
- launch_app: {"type":"launch_app","packageName":"com.example.app"}
- shell: {"type":"shell","command":"..."} runs an adb shell command
- run_script: {"type":"run_script","script":"...","timeoutSec":60}
- request_human_auth: {"type":"request_human_auth","capability":"sms","instruction":"...","timeoutSec":300}
    Use this whenever the next step needs something only a human can provide: a fingerprint or face check, an SMS or 2FA code, scanning a QR code, a camera or microphone action, an NFC card, a payment confirmation, an OAuth sign-in, a location, a photo, or a system permission decision.
    capability is one of: camera, qr, microphone, voice, nfc, sms, 2fa, location, biometric, notification, contacts, calendar, files, oauth, payment, permission.
- wait: {"type":"wait","durationMs":1000}
- finish: {"type":"finish","message":"..."} when the task is complete, or cannot be completed (explain why)

Every action may carry a short "reason"."#;

static JSON_OUTPUT_FORMAT: &str = r#"Output format: a short thought followed by a single JSON object, for example:
```json
{"thought":"The search box is at the top","type":"tap","x":540,"y":180,"reason":"focus search"}
```
Output exactly one JSON object."#;

static TOOL_OUTPUT_FORMAT: &str = r#"Output format: call exactly one of the provided tools. Put your short reasoning in the tool's "thought" argument."#;

static RULES: &str = r#"Rules:
1. Check the current app first. If it is not the target app, launch it.
2. If a page did not load, wait at most three times before going back.
3. After each action, check in the next screenshot whether it took effect before moving on.
4. If a human approved an authorization request, the history says what was delivered (typed code, location, image path). Continue from there.
5. Never guess verification codes or passwords. Request human authorization instead.
6. Before finishing, verify that the task is completely and accurately done."#;
