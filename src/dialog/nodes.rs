//! On-screen nodes parsed from a uiautomator hierarchy dump.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

static NODE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<node\b([^>]*?)/?>").expect("valid node regex"));
static ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([\w:-]+)\s*=\s*"([^"]*)""#).expect("valid attribute regex"));
static BOUNDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[(-?\d+),(-?\d+)\]\[(-?\d+),(-?\d+)\]").expect("valid bounds regex")
});

/// Rectangle in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    /// Build bounds, rejecting empty or inverted rectangles.
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Option<Self> {
        (right > left && bottom > top).then_some(Self {
            left,
            top,
            right,
            bottom,
        })
    }

    pub fn center(&self) -> (i32, i32) {
        let mid = |a: i32, b: i32| ((i64::from(a) + i64::from(b)) / 2) as i32;
        (mid(self.left, self.right), mid(self.top, self.bottom))
    }

    fn parse(raw: &str) -> Option<Self> {
        let caps = BOUNDS.captures(raw)?;
        let n = |i: usize| caps[i].parse::<i32>().ok();
        Self::new(n(1)?, n(2)?, n(3)?, n(4)?)
    }
}

/// One control on screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiNode {
    pub text: String,
    pub content_desc: String,
    pub resource_id: String,
    pub class_name: String,
    pub package: String,
    pub clickable: bool,
    pub enabled: bool,
    pub bounds: Bounds,
}

impl UiNode {
    /// Whether the class name looks like a button widget.
    pub fn is_button_class(&self) -> bool {
        self.class_name.to_lowercase().contains("button")
    }

    /// Text and accessibility label joined for keyword matching.
    pub fn label(&self) -> String {
        match (self.text.trim(), self.content_desc.trim()) {
            (t, "") => t.to_string(),
            ("", d) => d.to_string(),
            (t, d) => format!("{} {}", t, d),
        }
    }
}

/// Parse every `<node>` of a uiautomator XML dump.
///
/// Nodes without valid bounds are discarded.
pub fn parse_ui_dump(xml: &str) -> Vec<UiNode> {
    NODE_TAG
        .captures_iter(xml)
        .filter_map(|caps| {
            let attrs: HashMap<&str, String> = ATTRIBUTE
                .captures_iter(&caps[1])
                .filter_map(|a| {
                    let key = a.get(1)?.as_str();
                    Some((key, unescape(a.get(2)?.as_str())))
                })
                .collect();
            let get = |key: &str| attrs.get(key).cloned().unwrap_or_default();
            let flag = |key: &str, default: bool| {
                attrs.get(key).map(|v| v == "true").unwrap_or(default)
            };

            Some(UiNode {
                text: get("text"),
                content_desc: get("content-desc"),
                resource_id: get("resource-id"),
                class_name: get("class"),
                package: get("package"),
                clickable: flag("clickable", false),
                enabled: flag("enabled", true),
                bounds: Bounds::parse(attrs.get("bounds")?)?,
            })
        })
        .collect()
}

fn unescape(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    raw.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&#10;", "\n")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.android.permissioncontroller" content-desc="" clickable="false" enabled="true" bounds="[0,0][1080,2400]">
    <node index="1" text="Allow Maps to access this device&apos;s location?" resource-id="com.android.permissioncontroller:id/permission_message" class="android.widget.TextView" package="com.android.permissioncontroller" content-desc="" clickable="false" enabled="true" bounds="[84,1200][996,1300]" />
    <node index="2" text="While using the app" resource-id="com.android.permissioncontroller:id/permission_allow_foreground_only_button" class="android.widget.Button" package="com.android.permissioncontroller" content-desc="" clickable="true" enabled="true" bounds="[84,1704][996,1836]" />
    <node index="3" text="Broken" resource-id="" class="android.widget.Button" package="x" content-desc="" clickable="true" enabled="true" bounds="[500,10][400,20]" />
  </node>
</hierarchy>"#;

    #[test]
    fn test_parse_ui_dump() {
        let nodes = parse_ui_dump(DUMP);
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[1].text, "Allow Maps to access this device's location?");
        assert!(nodes[2].clickable);
        assert!(nodes[2].is_button_class());
        assert_eq!(nodes[2].bounds.center(), (540, 1770));
    }

    #[test]
    fn test_bounds_reject_inverted() {
        assert!(Bounds::new(10, 10, 10, 20).is_none());
        assert!(Bounds::new(10, 20, 30, 5).is_none());
        assert!(Bounds::new(0, 0, 1, 1).is_some());
    }

    #[test]
    fn test_center_of_huge_bounds() {
        let wide = Bounds::new(-2_000_000_000, 0, 2_000_000_000, 10).unwrap();
        assert_eq!(wide.center(), (0, 5));
        let far = Bounds::new(2_000_000_000, 0, 2_100_000_000, 10).unwrap();
        assert_eq!(far.center(), (2_050_000_000, 5));
    }

    #[test]
    fn test_label_joins_text_and_description() {
        let node = UiNode {
            text: "OK".into(),
            content_desc: "Confirm".into(),
            resource_id: String::new(),
            class_name: String::new(),
            package: String::new(),
            clickable: true,
            enabled: true,
            bounds: Bounds::new(0, 0, 10, 10).unwrap(),
        };
        assert_eq!(node.label(), "OK Confirm");
    }
}
