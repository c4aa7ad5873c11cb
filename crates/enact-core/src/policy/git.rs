//! Git predicates. Payload fields: `branch`, `base`, `file_count`.

use super::{not_in_payload, policy, Policy};
use crate::models::{PolicyResult, WorkflowContext};
use serde_json::Value;

fn is_protected(branch: &str) -> bool {
    branch.eq_ignore_ascii_case("main") || branch.eq_ignore_ascii_case("master")
}

/// Block any workflow whose `branch` is main or master (any case).
pub fn no_push_to_main(context: &WorkflowContext) -> PolicyResult {
    const NAME: &str = "no_push_to_main";
    let Some(branch) = context.payload_str("branch") else {
        return not_in_payload(NAME, "branch");
    };
    if is_protected(branch) {
        PolicyResult::fail(NAME, format!("Direct push to '{branch}' is blocked"))
    } else {
        PolicyResult::pass(NAME, "Branch is not main/master")
    }
}

/// Block merges whose target `base` is main or master.
pub fn no_merge_to_main(context: &WorkflowContext) -> PolicyResult {
    const NAME: &str = "no_merge_to_main";
    let Some(base) = context.payload_str("base") else {
        return not_in_payload(NAME, "base");
    };
    if is_protected(base) {
        PolicyResult::fail(
            NAME,
            format!("Merge into '{base}' is blocked: PRs must target a non-protected branch"),
        )
    } else {
        PolicyResult::pass(NAME, "Merge target is not main/master")
    }
}

/// Unconditional. Register on clients that must never delete branches.
pub fn no_delete_branch(_context: &WorkflowContext) -> PolicyResult {
    PolicyResult::fail(
        "no_delete_branch",
        "Branch deletion is not permitted on this client",
    )
}

pub fn require_branch_prefix(prefix: impl Into<String>) -> Policy {
    let prefix = prefix.into();
    policy(move |context| {
        const NAME: &str = "require_branch_prefix";
        let Some(branch) = context.payload_str("branch") else {
            return not_in_payload(NAME, "branch");
        };
        if branch.starts_with(&prefix) {
            PolicyResult::pass(NAME, format!("Branch '{branch}' has required prefix '{prefix}'"))
        } else {
            PolicyResult::fail(NAME, format!("Branch '{branch}' must start with '{prefix}'"))
        }
    })
}

/// Blast-radius limit on `file_count` (inclusive).
pub fn max_files_per_commit(max_files: u64) -> Policy {
    policy(move |context| {
        const NAME: &str = "max_files_per_commit";
        let Some(count) = context.payload.get("file_count").and_then(Value::as_u64) else {
            return not_in_payload(NAME, "file_count");
        };
        PolicyResult::check(
            NAME,
            count <= max_files,
            if count <= max_files {
                format!("File count {count} within limit of {max_files}")
            } else {
                format!("Commit touches {count} files (max {max_files})")
            },
        )
    })
}
