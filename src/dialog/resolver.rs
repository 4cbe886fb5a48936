//! Picks which on-screen control enacts an approve or deny decision.
//!
//! Scoring is keyword based. Resource identifiers beat visible text because
//! platform permission ids do not change with the locale.

use std::cmp::Ordering;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use super::nodes::UiNode;

/// Which decision the tap should enact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogIntent {
    Approve,
    Deny,
}

/// Vertical band (pixels) above the lowest row that still counts as the
/// bottom action row in fallback mode.
pub const BOTTOM_ROW_BAND: i32 = 160;

const TEXT_EXACT_SCORE: i32 = 80;
const TEXT_CONTAINS_SCORE: i32 = 50;
const ID_PLATFORM_SCORE: i32 = 100;
const ID_GENERIC_SCORE: i32 = 90;
const NON_BUTTON_PENALTY: i32 = 40;

const APPROVE_TEXT: &[&str] = &[
    "allow",
    "while using the app",
    "only this time",
    "allow all the time",
    "allow only while using the app",
    "ok",
    "accept",
    "agree",
    "continue",
    "confirm",
    "grant",
    "yes",
    "turn on",
    "允许",
    "仅在使用中允许",
    "仅使用期间允许",
    "本次运行允许",
    "始终允许",
    "确定",
    "同意",
    "permitir",
    "autoriser",
    "zulassen",
    "erlauben",
    "consenti",
    "permitir somente desta vez",
];

const DENY_TEXT: &[&str] = &[
    "deny",
    "don't allow",
    "dont allow",
    "do not allow",
    "don't allow again",
    "reject",
    "decline",
    "cancel",
    "no thanks",
    "not now",
    "no",
    "拒绝",
    "不允许",
    "禁止",
    "取消",
    "denegar",
    "no permitir",
    "refuser",
    "ne pas autoriser",
    "ablehnen",
    "nicht zulassen",
    "rifiuta",
];

const APPROVE_ID_PLATFORM: &[&str] = &[
    "permission_allow_button",
    "permission_allow_foreground_only_button",
    "permission_allow_one_time_button",
    "permission_allow_always_button",
    "permission_allow_all_button",
    "permission_allow_selected_button",
];

const DENY_ID_PLATFORM: &[&str] = &[
    "permission_deny_button",
    "permission_deny_and_dont_ask_again_button",
    "permission_no_upgrade_button",
    "permission_no_upgrade_and_dont_ask_again_button",
];

const APPROVE_ID_GENERIC: &[&str] = &["button1", "allow", "accept", "positive", "confirm", "ok_button"];
const DENY_ID_GENERIC: &[&str] = &[
    "button2",
    "deny",
    "reject",
    "negative",
    "cancel",
    "dont_allow",
    "not_allow",
];

/// Lower-case and strip combining marks so "Autorisér" matches "autoriser".
pub fn fold_text(raw: &str) -> String {
    raw.nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .replace('\u{2019}', "'")
        .trim()
        .to_string()
}

fn keyword_score(folded: &str, keywords: &[&str]) -> i32 {
    if folded.is_empty() {
        return 0;
    }
    keywords
        .iter()
        .map(|kw| {
            if folded == *kw {
                TEXT_EXACT_SCORE
            } else if kw.len() > 2 && contains_phrase(folded, kw) {
                TEXT_CONTAINS_SCORE
            } else {
                0
            }
        })
        .max()
        .unwrap_or(0)
}

/// Phrase match that does not fire inside a longer word ("no" in "know").
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    haystack.match_indices(phrase).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + phrase.len()..].chars().next();
        let is_word = |c: Option<char>| c.map(|c| c.is_alphanumeric() && c.is_ascii()).unwrap_or(false);
        !is_word(before) && !is_word(after)
    })
}

fn text_score(node: &UiNode, intent: DialogIntent) -> i32 {
    let folded = fold_text(&node.label());
    let approve = keyword_score(&folded, APPROVE_TEXT);
    let deny = keyword_score(&folded, DENY_TEXT);
    match intent {
        // "Don't allow" contains "allow": a deny match vetoes the approve match
        DialogIntent::Approve if deny >= approve => 0,
        DialogIntent::Approve => approve,
        DialogIntent::Deny if approve > deny => 0,
        DialogIntent::Deny => deny,
    }
}

fn id_score(node: &UiNode, intent: DialogIntent) -> i32 {
    let id = node.resource_id.to_lowercase();
    if id.is_empty() {
        return 0;
    }
    let name = id.rsplit('/').next().unwrap_or(&id);
    let (platform, opposite_platform, generic) = match intent {
        DialogIntent::Approve => (APPROVE_ID_PLATFORM, DENY_ID_PLATFORM, APPROVE_ID_GENERIC),
        DialogIntent::Deny => (DENY_ID_PLATFORM, APPROVE_ID_PLATFORM, DENY_ID_GENERIC),
    };
    if platform.iter().any(|p| name == *p) {
        return ID_PLATFORM_SCORE;
    }
    if opposite_platform.iter().any(|p| name == *p) {
        return 0;
    }
    // "dont_allow" contains "allow": a deny id vetoes the approve match
    if intent == DialogIntent::Approve && DENY_ID_GENERIC.iter().any(|g| name.contains(g)) {
        return 0;
    }
    if generic.iter().any(|g| name.contains(g)) {
        ID_GENERIC_SCORE
    } else {
        0
    }
}

/// Score a single node for the given intent.
pub fn score_node(node: &UiNode, intent: DialogIntent) -> i32 {
    let base = text_score(node, intent).max(id_score(node, intent));
    if base > 0 && !node.clickable && !node.is_button_class() {
        base - NON_BUTTON_PENALTY
    } else {
        base
    }
}

/// Directional preference: primary actions sit on the right, secondary ones
/// on the left. Returns `Less` when `a` should be chosen over `b`.
fn directional(a: &UiNode, b: &UiNode, intent: DialogIntent) -> Ordering {
    let (ax, ay) = a.bounds.center();
    let (bx, by) = b.bounds.center();
    let horizontal = match intent {
        DialogIntent::Approve => bx.cmp(&ax),
        DialogIntent::Deny => ax.cmp(&bx),
    };
    horizontal.then(by.cmp(&ay))
}

/// Choose the node to tap for `intent`, or `None` when nothing fits.
pub fn resolve_button(nodes: &[UiNode], intent: DialogIntent) -> Option<&UiNode> {
    let mut scored: Vec<(usize, i32, &UiNode)> = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.enabled)
        .map(|(i, n)| (i, score_node(n, intent), n))
        .filter(|(_, score, _)| *score > 0)
        .collect();

    if !scored.is_empty() {
        scored.sort_by(|(ia, sa, a), (ib, sb, b)| {
            sb.cmp(sa)
                .then_with(|| directional(a, b, intent))
                .then(ia.cmp(ib))
        });
        return scored.first().map(|(_, _, n)| *n);
    }

    fallback_bottom_row(nodes, intent)
}

fn fallback_bottom_row(nodes: &[UiNode], intent: DialogIntent) -> Option<&UiNode> {
    let candidates: Vec<(usize, &UiNode)> = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.enabled && (n.clickable || n.is_button_class()))
        .collect();
    let max_top = candidates.iter().map(|(_, n)| n.bounds.top).max()?;

    let mut row: Vec<(usize, &UiNode)> = candidates
        .into_iter()
        .filter(|(_, n)| n.bounds.top >= max_top.saturating_sub(BOTTOM_ROW_BAND))
        .collect();
    row.sort_by(|(ia, a), (ib, b)| directional(a, b, intent).then(ia.cmp(ib)));
    row.first().map(|(_, n)| *n)
}
