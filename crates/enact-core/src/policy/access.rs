//! Role checks. The caller vouches for `actor_role`; nothing here verifies
//! identity.

use super::{not_in_payload, policy, Policy};
use crate::models::{PolicyResult, WorkflowContext};
use serde_json::Value;

/// Blocks only when `actor_role == "contractor"` and `data` carries a key
/// listed in `pii_fields`.
pub fn contractor_cannot_write_pii(context: &WorkflowContext) -> PolicyResult {
    const NAME: &str = "contractor_cannot_write_pii";
    let is_contractor = context.payload_str("actor_role") == Some("contractor");
    let pii: Vec<&str> = context
        .payload
        .get("pii_fields")
        .and_then(Value::as_array)
        .map(|fields| fields.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let touched: Vec<&str> = match context.payload.get("data").and_then(Value::as_object) {
        Some(data) => pii.into_iter().filter(|f| data.contains_key(*f)).collect(),
        None => Vec::new(),
    };

    if is_contractor && !touched.is_empty() {
        PolicyResult::fail(
            NAME,
            format!("Contractors cannot write to PII fields: {touched:?}"),
        )
    } else {
        PolicyResult::pass(NAME, "No PII violation")
    }
}

pub fn require_actor_role(allowed_roles: Vec<String>) -> Policy {
    policy(move |context| {
        const NAME: &str = "require_actor_role";
        let Some(role) = context.payload_str("actor_role") else {
            return not_in_payload(NAME, "actor_role");
        };
        if allowed_roles.iter().any(|r| r == role) {
            PolicyResult::pass(NAME, format!("Role '{role}' is authorized"))
        } else {
            PolicyResult::fail(
                NAME,
                format!("Role '{role}' not in allowed roles: {allowed_roles:?}"),
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::testing::ctx;
    use serde_json::json;

    #[test]
    fn contractor_writing_pii_is_blocked() {
        let r = contractor_cannot_write_pii(&ctx(json!({
            "actor_role": "contractor",
            "pii_fields": ["ssn", "dob"],
            "data": {"name": "x", "ssn": "123"},
        })));
        assert!(!r.passed);
        assert!(r.reason.contains("ssn"));
    }

    #[test]
    fn other_roles_and_clean_writes_pass() {
        let employee = ctx(json!({
            "actor_role": "engineer",
            "pii_fields": ["ssn"],
            "data": {"ssn": "123"},
        }));
        assert!(contractor_cannot_write_pii(&employee).passed);

        let clean = ctx(json!({
            "actor_role": "contractor",
            "pii_fields": ["ssn"],
            "data": {"name": "x"},
        }));
        assert!(contractor_cannot_write_pii(&clean).passed);
    }

    #[test]
    fn role_allowlist() {
        let p = require_actor_role(vec!["admin".into(), "engineer".into()]);
        assert!(p(&ctx(json!({"actor_role": "admin"}))).passed);
        let r = p(&ctx(json!({"actor_role": "viewer"})));
        assert!(!r.passed);
        assert_eq!(r.reason, r#"Role 'viewer' not in allowed roles: ["admin", "engineer"]"#);
    }
}
