//! Data that flows through a single run.
//!
//! ```text
//! WorkflowContext  → every policy and the workflow see the same picture
//! PolicyResult     → one per predicate, all kept for the receipt
//! ActionResult     → one per connector call; empty list when blocked
//! Receipt          → signed, persisted record of the run
//! RunResult        → the lightweight answer handed back to the caller
//! ```

use crate::connector::{Connector, Systems};
use crate::error::{EnactError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Output key carrying the idempotency marker.
pub const ALREADY_DONE: &str = "already_done";

/// The "nothing was found, the mutation really happened" marker.
pub const NOT_DONE: Value = Value::Bool(false);

/// Marker written by the rollback dispatcher when there was nothing to undo.
pub const SKIPPED: &str = "skipped";

/// Turn a `json!({...})` literal into an ordered field map. Anything other
/// than an object yields an empty map.
pub fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// ---------------------------------------------------------------------------
// ActionResult
// ---------------------------------------------------------------------------

/// Outcome of one connector operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: String,
    pub system: String,
    pub success: bool,
    #[serde(default)]
    pub output: Map<String, Value>,
    /// State captured before the mutation, enough to compute the inverse.
    /// Empty when the action is read-only, irreversible, or was a no-op.
    #[serde(default)]
    pub rollback_data: Map<String, Value>,
}

impl ActionResult {
    /// A mutation that actually happened.
    pub fn mutated(
        system: &str,
        action: &str,
        mut output: Map<String, Value>,
        rollback_data: Map<String, Value>,
    ) -> Self {
        output.insert(ALREADY_DONE.to_string(), NOT_DONE);
        Self {
            action: action.to_string(),
            system: system.to_string(),
            success: true,
            output,
            rollback_data,
        }
    }

    /// The idempotency guard found the goal state already in place.
    pub fn already(system: &str, action: &str, marker: &str, mut output: Map<String, Value>) -> Self {
        output.insert(ALREADY_DONE.to_string(), Value::String(marker.to_string()));
        Self {
            action: action.to_string(),
            system: system.to_string(),
            success: true,
            output,
            rollback_data: Map::new(),
        }
    }

    /// A successful read-only operation.
    pub fn read(system: &str, action: &str, output: Map<String, Value>) -> Self {
        Self {
            action: action.to_string(),
            system: system.to_string(),
            success: true,
            output,
            rollback_data: Map::new(),
        }
    }

    pub fn failure(system: &str, action: &str, error: impl fmt::Display) -> Self {
        let mut output = Map::new();
        output.insert("error".to_string(), Value::String(error.to_string()));
        Self {
            action: action.to_string(),
            system: system.to_string(),
            success: false,
            output,
            rollback_data: Map::new(),
        }
    }

    /// The descriptive marker when the guard short-circuited, `None` when the
    /// mutation happened (or the field is absent).
    pub fn already_done(&self) -> Option<&str> {
        self.output
            .get(ALREADY_DONE)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn is_already_done(&self) -> bool {
        self.already_done().is_some()
    }

    pub fn error(&self) -> Option<&str> {
        self.output.get("error").and_then(Value::as_str)
    }

    pub fn is_reversible(&self) -> bool {
        self.success && !self.rollback_data.is_empty()
    }
}

// ---------------------------------------------------------------------------
// PolicyResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub policy: String,
    pub passed: bool,
    pub reason: String,
}

impl PolicyResult {
    pub fn pass(policy: &str, reason: impl Into<String>) -> Self {
        Self {
            policy: policy.to_string(),
            passed: true,
            reason: reason.into(),
        }
    }

    pub fn fail(policy: &str, reason: impl Into<String>) -> Self {
        Self {
            policy: policy.to_string(),
            passed: false,
            reason: reason.into(),
        }
    }

    pub fn check(policy: &str, passed: bool, reason: impl Into<String>) -> Self {
        Self {
            policy: policy.to_string(),
            passed,
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// The request envelope handed to every policy and to the workflow.
#[derive(Clone)]
pub struct WorkflowContext {
    pub workflow: String,
    pub actor: String,
    pub payload: Map<String, Value>,
    systems: Arc<Systems>,
}

impl WorkflowContext {
    pub fn new(
        workflow: impl Into<String>,
        actor: impl Into<String>,
        payload: Map<String, Value>,
        systems: Arc<Systems>,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            actor: actor.into(),
            payload,
            systems,
        }
    }

    /// A context with no connectors attached. Enough for evaluating policies.
    pub fn detached(
        workflow: impl Into<String>,
        actor: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self::new(workflow, actor, payload, Arc::new(Systems::new()))
    }

    /// Non-empty string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.payload_str(key)
            .ok_or_else(|| self.missing(key))
    }

    /// Decode the whole payload into a workflow's typed input.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|e| EnactError::InvalidPayload {
            workflow: self.workflow.clone(),
            reason: e.to_string(),
        })
    }

    fn missing(&self, key: &str) -> EnactError {
        EnactError::MissingPayloadField {
            workflow: self.workflow.clone(),
            field: key.to_string(),
        }
    }

    pub fn connector(&self, system: &str) -> Result<&dyn Connector> {
        self.systems
            .get(system)
            .map(|c| c.as_ref())
            .ok_or_else(|| EnactError::SystemNotFound(system.to_string()))
    }

    /// Run one connector action through the executor.
    pub fn execute(&self, system: &str, action: &str, args: Value) -> Result<ActionResult> {
        let connector = self.connector(system)?;
        crate::executor::execute(connector, action, &args)
    }
}

impl fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("workflow", &self.workflow)
            .field("actor", &self.actor)
            .field("payload", &self.payload)
            .field("systems", &self.systems.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Decision / Receipt / RunResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    /// Every policy passed and the workflow ran.
    Pass,
    /// At least one policy failed; nothing ran.
    Block,
    /// A rollback stopped before compensating every action.
    Partial,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Pass => "PASS",
            Decision::Block => "BLOCK",
            Decision::Partial => "PARTIAL",
        };
        f.write_str(s)
    }
}

/// Permanent record of a run. `signature` covers every other field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub run_id: Uuid,
    pub workflow: String,
    pub actor: String,
    pub payload: Map<String, Value>,
    pub policy_results: Vec<PolicyResult>,
    pub decision: Decision,
    #[serde(default)]
    pub actions_taken: Vec<ActionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub signature: String,
}

/// What the calling agent gets back from a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub success: bool,
    pub workflow: String,
    pub run_id: Uuid,
    /// Action name → output, successful actions only.
    #[serde(default)]
    pub output: Map<String, Value>,
}

impl RunResult {
    pub fn from_receipt(receipt: &Receipt) -> Self {
        let success = receipt.decision == Decision::Pass
            && receipt.actions_taken.iter().all(|a| a.success);
        let output = receipt
            .actions_taken
            .iter()
            .filter(|a| a.success)
            .map(|a| (a.action.clone(), Value::Object(a.output.clone())))
            .collect();
        Self {
            success,
            workflow: receipt.workflow.clone(),
            run_id: receipt.run_id,
            output,
        }
    }
}
