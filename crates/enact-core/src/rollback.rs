//! Compensation for recorded actions.
//!
//! Each `(system, action)` pair maps to a handler that reads the
//! `rollback_data` captured at mutation time and calls the inverse
//! operation on the same connector. Dispatch never raises: every outcome,
//! including a missing handler or a panicking connector, is an
//! [`ActionResult`].

use crate::connector::Connector;
use crate::error::Result;
use crate::models::{fields, ActionResult, SKIPPED};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

pub type RollbackHandler = fn(&dyn Connector, &Map<String, Value>) -> Result<ActionResult>;

/// Forward action → the operations its compensation may call.
const INVERSES: &[(&str, &str, &[&str])] = &[
    ("github", "create_branch", &["delete_branch"]),
    ("github", "create_branch_from_sha", &["delete_branch"]),
    ("github", "delete_branch", &["create_branch_from_sha"]),
    ("github", "create_pr", &["close_pr"]),
    ("github", "create_issue", &["close_issue"]),
    ("github", "merge_pr", &["revert_commit"]),
    ("slack", "post_message", &["delete_message"]),
    ("sqlite", "insert_row", &["delete_row"]),
    ("sqlite", "update_row", &["update_row"]),
    ("sqlite", "delete_row", &["insert_row"]),
    ("filesystem", "write_file", &["write_file", "delete_file"]),
    ("filesystem", "delete_file", &["write_file"]),
];

/// The compensating operations for `system.action`, empty when there is no
/// built-in inverse.
pub fn inverse_actions(system: &str, action: &str) -> &'static [&'static str] {
    INVERSES
        .iter()
        .find(|(s, a, _)| *s == system && *a == action)
        .map(|(_, _, inverse)| *inverse)
        .unwrap_or(&[])
}

/// The no-op result for an action that needs no compensation: it failed in
/// the first place, or captured nothing to undo.
pub fn skipped(original: &ActionResult) -> Option<ActionResult> {
    let reason = if !original.success {
        "original action failed"
    } else if original.rollback_data.is_empty() {
        "nothing to undo"
    } else {
        return None;
    };
    Some(ActionResult::already(
        &original.system,
        &original.action,
        SKIPPED,
        fields(json!({"reason": reason})),
    ))
}

pub struct RollbackRegistry {
    handlers: HashMap<(String, String), RollbackHandler>,
}

impl Default for RollbackRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl RollbackRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Handlers for every built-in connector action that can be undone.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("github", "create_branch", |c, d| forward(c, "delete_branch", d));
        registry.register("github", "create_branch_from_sha", |c, d| forward(c, "delete_branch", d));
        registry.register("github", "delete_branch", |c, d| forward(c, "create_branch_from_sha", d));
        registry.register("github", "create_pr", |c, d| forward(c, "close_pr", d));
        registry.register("github", "create_issue", |c, d| forward(c, "close_issue", d));
        registry.register("github", "merge_pr", |c, d| forward(c, "revert_commit", d));
        registry.register("slack", "post_message", |c, d| forward(c, "delete_message", d));
        registry.register("sqlite", "insert_row", undo_insert_row);
        registry.register("sqlite", "update_row", undo_update_row);
        registry.register("sqlite", "delete_row", undo_delete_row);
        registry.register("filesystem", "write_file", undo_write_file);
        registry.register("filesystem", "delete_file", undo_delete_file);
        registry
    }

    pub fn register(&mut self, system: &str, action: &str, handler: RollbackHandler) {
        self.handlers
            .insert((system.to_string(), action.to_string()), handler);
    }

    pub fn has_handler(&self, system: &str, action: &str) -> bool {
        self.handlers
            .contains_key(&(system.to_string(), action.to_string()))
    }

    /// Undo one recorded action.
    pub fn dispatch(&self, original: &ActionResult, connector: &dyn Connector) -> ActionResult {
        let system = original.system.as_str();
        let action = original.action.as_str();

        if let Some(skip) = skipped(original) {
            return skip;
        }
        let Some(handler) = self.handlers.get(&(system.to_string(), action.to_string())) else {
            tracing::warn!(system, action, "no rollback handler");
            return ActionResult::failure(
                system,
                action,
                format!("No rollback handler for {system}.{action}"),
            );
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            handler(connector, &original.rollback_data)
        }));
        let error = match outcome {
            Ok(Ok(result)) if result.success => {
                tracing::info!(system, action, undo = %result.action, "rolled back");
                return result;
            }
            Ok(Ok(result)) => result.error().unwrap_or("unknown error").to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connector panicked".to_string(),
        };
        tracing::warn!(system, action, error = %error, "rollback failed");
        ActionResult::failure(
            system,
            action,
            format!("Rollback failed for {system}.{action}: {error}"),
        )
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// The captured data is already the inverse operation's argument set.
fn forward(connector: &dyn Connector, action: &str, data: &Map<String, Value>) -> Result<ActionResult> {
    connector.invoke(action, &Value::Object(data.clone()))
}

/// Run `action` once per argument set, stopping at the first failure.
fn each(connector: &dyn Connector, action: &str, steps: Vec<Value>) -> Result<ActionResult> {
    let total = steps.len();
    for args in steps {
        let result = connector.invoke(action, &args)?;
        if !result.success {
            return Ok(result);
        }
    }
    Ok(ActionResult::mutated(
        connector.system(),
        action,
        fields(json!({"rows_restored": total})),
        Map::new(),
    ))
}

fn entries<'a>(data: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    data.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn undo_insert_row(connector: &dyn Connector, data: &Map<String, Value>) -> Result<ActionResult> {
    connector.invoke(
        "delete_row",
        &json!({"table": data.get("table"), "where": data.get("key")}),
    )
}

fn undo_update_row(connector: &dyn Connector, data: &Map<String, Value>) -> Result<ActionResult> {
    let table = data.get("table").cloned().unwrap_or(Value::Null);
    let steps = entries(data, "rows")
        .iter()
        .map(|row| {
            json!({
                "table": table,
                "data": row.get("previous"),
                "where": row.get("key"),
            })
        })
        .collect();
    each(connector, "update_row", steps)
}

fn undo_delete_row(connector: &dyn Connector, data: &Map<String, Value>) -> Result<ActionResult> {
    let table = data.get("table").cloned().unwrap_or(Value::Null);
    let steps = entries(data, "deleted_rows")
        .iter()
        .map(|row| json!({"table": table, "data": row}))
        .collect();
    each(connector, "insert_row", steps)
}

fn undo_write_file(connector: &dyn Connector, data: &Map<String, Value>) -> Result<ActionResult> {
    let path = data.get("path").cloned().unwrap_or(Value::Null);
    match data.get("previous_content") {
        Some(Value::String(previous)) => {
            connector.invoke("write_file", &json!({"path": path, "content": previous}))
        }
        // the write created the file
        _ => connector.invoke("delete_file", &json!({"path": path})),
    }
}

fn undo_delete_file(connector: &dyn Connector, data: &Map<String, Value>) -> Result<ActionResult> {
    connector.invoke(
        "write_file",
        &json!({"path": data.get("path"), "content": data.get("content")}),
    )
}
