//! Single-action execution boundary.
//!
//! `execute` runs exactly one connector operation and turns every failure
//! mode into an `ActionResult` with `success == false`, except the allowlist
//! violation, which is returned as `Err` so the caller sees its own bug.

use crate::connector::Connector;
use crate::error::Result;
use crate::models::{ActionResult, ALREADY_DONE, NOT_DONE};
use serde_json::Value;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

pub fn execute(connector: &dyn Connector, action: &str, args: &Value) -> Result<ActionResult> {
    let system = connector.system();
    tracing::debug!(system, action, "executing action");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| connector.invoke(action, args)));

    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) if e.is_not_allowed() => {
            tracing::error!(system, action, error = %e, "action rejected by allowlist");
            return Err(e);
        }
        Ok(Err(e)) => ActionResult::failure(system, action, e),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(system, action, error = %message, "connector panicked");
            ActionResult::failure(system, action, format!("connector panicked: {message}"))
        }
    };

    let result = enforce_marker(connector, result);

    if result.success {
        tracing::info!(
            system,
            action,
            already_done = result.already_done().unwrap_or("no"),
            "action succeeded"
        );
    } else {
        tracing::warn!(
            system,
            action,
            error = result.error().unwrap_or("unknown"),
            "action failed"
        );
    }
    Ok(result)
}

/// A successful mutation must say whether it actually mutated.
fn enforce_marker(connector: &dyn Connector, mut result: ActionResult) -> ActionResult {
    if result.success
        && !connector.is_read_only(&result.action)
        && !result.output.contains_key(ALREADY_DONE)
    {
        tracing::warn!(
            system = %result.system,
            action = %result.action,
            "connector omitted already_done; recording as a real mutation"
        );
        result.output.insert(ALREADY_DONE.to_string(), NOT_DONE);
    }
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
