//! Policy gate: pure predicates over a [`WorkflowContext`].
//!
//! Predicates read only the payload, never call out, and are evaluated in
//! full for every run so the receipt shows every check, not only the first
//! failing one. A predicate whose governed field is missing passes and says
//! so in its reason.

pub mod access;
pub mod db;
pub mod filesystem;
pub mod git;
pub mod slack;
pub mod time;

use crate::models::{PolicyResult, WorkflowContext};
use std::sync::Arc;

pub type Policy = Arc<dyn Fn(&WorkflowContext) -> PolicyResult + Send + Sync>;

/// Wrap a plain function or a configured closure as a [`Policy`].
pub fn policy<F>(f: F) -> Policy
where
    F: Fn(&WorkflowContext) -> PolicyResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Every predicate runs, in order, even after a failure.
pub fn evaluate_all(context: &WorkflowContext, policies: &[Policy]) -> Vec<PolicyResult> {
    policies
        .iter()
        .map(|p| {
            let result = p(context);
            if !result.passed {
                tracing::info!(
                    workflow = %context.workflow,
                    policy = %result.policy,
                    reason = %result.reason,
                    "policy failed"
                );
            }
            result
        })
        .collect()
}

/// True when nothing failed. No policies means nothing to fail.
pub fn all_passed(results: &[PolicyResult]) -> bool {
    results.iter().all(|r| r.passed)
}

pub(crate) fn not_in_payload(policy: &str, field: &str) -> PolicyResult {
    PolicyResult::pass(policy, format!("No {field} in payload to check"))
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::models::{fields, WorkflowContext};
    use serde_json::Value;

    pub fn ctx(payload: Value) -> WorkflowContext {
        WorkflowContext::detached("test_workflow", "agent@example.com", fields(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ctx;
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn evaluates_every_policy_after_a_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = {
            let calls = Arc::clone(&calls);
            policy(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                PolicyResult::pass("counted", "ok")
            })
        };
        let policies = vec![
            policy(git::no_delete_branch),
            counted.clone(),
            policy(git::no_push_to_main),
            counted,
        ];

        let results = evaluate_all(&ctx(json!({"branch": "main"})), &policies);
        assert_eq!(results.len(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let failed: Vec<_> = results.iter().filter(|r| !r.passed).map(|r| r.policy.as_str()).collect();
        assert_eq!(failed, vec!["no_delete_branch", "no_push_to_main"]);
        assert!(!all_passed(&results));
    }

    #[test]
    fn empty_policy_list_passes() {
        let results = evaluate_all(&ctx(json!({})), &[]);
        assert!(results.is_empty());
        assert!(all_passed(&results));
    }

    #[test]
    fn governed_fields_absent_pass_through() {
        let empty = ctx(json!({}));
        let policies = vec![
            policy(git::no_push_to_main),
            policy(git::no_merge_to_main),
            git::require_branch_prefix("agent/"),
            git::max_files_per_commit(5),
            slack::require_channel_allowlist(vec!["C1".into()]),
            policy(slack::block_dms),
            policy(db::dont_delete_without_where),
            policy(db::dont_update_without_where),
            db::protect_tables(vec!["users".into()]),
            filesystem::restrict_paths(vec!["workspace".into()]),
            filesystem::block_extensions(vec![".env".into()]),
            policy(access::contractor_cannot_write_pii),
            access::require_actor_role(vec!["admin".into()]),
        ];
        for result in evaluate_all(&empty, &policies) {
            assert!(result.passed, "{} blocked an empty payload: {}", result.policy, result.reason);
        }
    }
}
