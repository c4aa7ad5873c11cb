//! Filesystem predicates. Payload field: `path`.

use super::{not_in_payload, policy, Policy};
use crate::models::{PolicyResult, WorkflowContext};
use std::path::{Component, Path, PathBuf};

/// Unconditional. Register on clients that must never delete files.
pub fn no_delete_file(_context: &WorkflowContext) -> PolicyResult {
    PolicyResult::fail("no_delete_file", "File deletion is not permitted on this client")
}

/// Collapse `.` and `..` without touching the disk. Leading `..` that cannot
/// be collapsed are kept, so `a/../../etc` stays outside `a`.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let last_is_normal = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if last_is_normal {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Only paths under one of `allowed_dirs`. An empty list blocks every path.
pub fn restrict_paths(allowed_dirs: Vec<String>) -> Policy {
    let allowed: Vec<PathBuf> = allowed_dirs.iter().map(|d| normalize(Path::new(d))).collect();
    policy(move |context| {
        const NAME: &str = "restrict_paths";
        let Some(raw) = context.payload_str("path") else {
            return not_in_payload(NAME, "path");
        };
        let target = normalize(Path::new(raw));
        match allowed.iter().find(|dir| target.starts_with(dir)) {
            Some(dir) => PolicyResult::pass(
                NAME,
                format!("Path '{raw}' is within allowed directory '{}'", dir.display()),
            ),
            None => PolicyResult::fail(
                NAME,
                format!(
                    "Path '{raw}' is outside all allowed directories. Allowed: {:?}",
                    allowed.iter().map(|d| d.display().to_string()).collect::<Vec<_>>()
                ),
            ),
        }
    })
}

/// Case-insensitive. Dotfiles such as `.env` count their whole name as the
/// extension.
pub fn block_extensions(extensions: Vec<String>) -> Policy {
    let blocked: Vec<String> = extensions.iter().map(|e| e.to_lowercase()).collect();
    policy(move |context| {
        const NAME: &str = "block_extensions";
        let Some(raw) = context.payload_str("path") else {
            return not_in_payload(NAME, "path");
        };
        let path = Path::new(raw);
        let suffix = match path.extension() {
            Some(ext) => format!(".{}", ext.to_string_lossy().to_lowercase()),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .filter(|n| n.starts_with('.'))
                .unwrap_or_default(),
        };
        if !suffix.is_empty() && blocked.contains(&suffix) {
            PolicyResult::fail(
                NAME,
                format!("File extension '{suffix}' is blocked: operations on '{raw}' not permitted"),
            )
        } else {
            PolicyResult::pass(NAME, format!("File extension of '{raw}' is allowed"))
        }
    })
}
