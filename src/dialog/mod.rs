//! Permission dialog handling: UI dump parsing and button selection.

mod nodes;
mod resolver;

pub use nodes::{parse_ui_dump, Bounds, UiNode};
pub use resolver::{fold_text, resolve_button, score_node, DialogIntent, BOTTOM_ROW_BAND};

/// Default foreground packages that indicate a system permission dialog.
pub const DEFAULT_PERMISSION_DIALOG_PACKAGES: &[&str] = &[
    "com.android.permissioncontroller",
    "com.google.android.permissioncontroller",
    "com.android.packageinstaller",
    "com.google.android.packageinstaller",
    "com.samsung.android.permissioncontroller",
    "com.lbe.security.miui",
    "com.miui.securitycenter",
    "com.coloros.securitypermission",
    "com.huawei.systemmanager",
];

/// Whether `package` is one of the configured permission dialog packages.
pub fn is_permission_dialog(package: &str, packages: &[String]) -> bool {
    !package.is_empty() && packages.iter().any(|p| p == package)
}
