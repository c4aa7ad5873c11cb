//! Relational predicates. Payload fields: `table`, `where`.
//!
//! The where-clause checks govern `table`: a payload that names no table is
//! not a database operation and passes. Once a table is named, a missing or
//! empty `where` object blocks.

use super::{not_in_payload, policy, Policy};
use crate::models::{PolicyResult, WorkflowContext};
use serde_json::Value;

/// Unconditional. Register on clients that must never delete rows.
pub fn dont_delete_row(_context: &WorkflowContext) -> PolicyResult {
    PolicyResult::fail("dont_delete_row", "Row deletion is not permitted on this client")
}

pub fn dont_delete_without_where(context: &WorkflowContext) -> PolicyResult {
    require_where(context, "dont_delete_without_where", "delete_row", "deleting")
}

pub fn dont_update_without_where(context: &WorkflowContext) -> PolicyResult {
    require_where(context, "dont_update_without_where", "update_row", "updating")
}

fn require_where(context: &WorkflowContext, name: &str, action: &str, verb: &str) -> PolicyResult {
    if context.payload_str("table").is_none() {
        return not_in_payload(name, "table");
    }
    match context.payload.get("where").and_then(Value::as_object) {
        Some(filter) if !filter.is_empty() => PolicyResult::pass(
            name,
            format!("WHERE clause present with {} condition(s)", filter.len()),
        ),
        _ => PolicyResult::fail(
            name,
            format!("{action} blocked: a non-empty where clause is required to prevent {verb} all rows"),
        ),
    }
}

/// Exact, case-sensitive table names.
pub fn protect_tables(protected: Vec<String>) -> Policy {
    policy(move |context| {
        const NAME: &str = "protect_tables";
        let Some(table) = context.payload_str("table") else {
            return not_in_payload(NAME, "table");
        };
        if protected.iter().any(|t| t == table) {
            PolicyResult::fail(NAME, format!("Table '{table}' is protected: operations not permitted"))
        } else {
            PolicyResult::pass(NAME, format!("Table '{table}' is not protected"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::testing::ctx;
    use serde_json::json;

    #[test]
    fn delete_requires_where_once_a_table_is_named() {
        assert!(!dont_delete_without_where(&ctx(json!({"table": "users"}))).passed);
        assert!(!dont_delete_without_where(&ctx(json!({"table": "users", "where": {}}))).passed);
        let ok = dont_delete_without_where(&ctx(json!({"table": "users", "where": {"id": 1}})));
        assert!(ok.passed);
        assert_eq!(ok.reason, "WHERE clause present with 1 condition(s)");
    }

    #[test]
    fn update_requires_where() {
        let r = dont_update_without_where(&ctx(json!({"table": "users", "data": {"role": "x"}})));
        assert!(!r.passed);
        assert!(r.reason.starts_with("update_row blocked"));
    }

    #[test]
    fn delete_row_always_blocked() {
        assert!(!dont_delete_row(&ctx(json!({}))).passed);
    }

    #[test]
    fn protected_tables_are_case_sensitive() {
        let p = protect_tables(vec!["users".into(), "payments".into()]);
        assert!(!p(&ctx(json!({"table": "payments"}))).passed);
        assert!(p(&ctx(json!({"table": "Payments"}))).passed);
        assert!(p(&ctx(json!({"table": "notes"}))).passed);
    }
}
