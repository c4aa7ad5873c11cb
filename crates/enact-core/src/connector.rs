//! The capability contract every external-system adapter implements.
//!
//! The rest of the crate only ever sees `dyn Connector`. A connector owns a
//! fixed allowlist, exposes typed methods for each operation, and routes the
//! same operations through [`Connector::invoke`] so workflows and rollback
//! handlers can call them by name.
//!
//! Every typed method returns `Result<ActionResult>` where the `Err` arm is
//! reserved for [`EnactError::ActionNotAllowed`]. Remote failures are data:
//! they come back as `ActionResult { success: false, .. }`.

use crate::error::{EnactError, Result};
use crate::models::ActionResult;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Connector instances keyed by the name workflows use to find them.
pub type Systems = BTreeMap<String, Arc<dyn Connector>>;

pub trait Connector: Send + Sync {
    /// System family identifier recorded on every result (e.g. `"github"`).
    fn system(&self) -> &'static str;

    fn allowlist(&self) -> &Allowlist;

    fn check_allowed(&self, action: &str) -> Result<()> {
        self.allowlist().check(self.system(), action)
    }

    /// Read-only actions carry no `already_done` marker and have nothing to
    /// roll back.
    fn is_read_only(&self, _action: &str) -> bool {
        false
    }

    /// Dispatch `action` with JSON arguments to the matching typed method.
    fn invoke(&self, action: &str, args: &Value) -> Result<ActionResult>;
}

// ---------------------------------------------------------------------------
// Allowlist
// ---------------------------------------------------------------------------

/// The explicit set of actions a connector instance may execute. Fixed at
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowlist {
    actions: BTreeSet<String>,
}

impl Allowlist {
    pub fn new<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    /// `configured` when given, `defaults` otherwise.
    pub fn or_defaults(configured: Option<Vec<String>>, defaults: &[&str]) -> Self {
        match configured {
            Some(actions) => Self::new(actions),
            None => Self::new(defaults.iter().copied()),
        }
    }

    pub fn contains(&self, action: &str) -> bool {
        self.actions.contains(action)
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.iter().cloned().collect()
    }

    pub fn check(&self, system: &str, action: &str) -> Result<()> {
        if self.contains(action) {
            Ok(())
        } else {
            Err(EnactError::not_allowed(system, action, self.actions()))
        }
    }
}

/// Decode `invoke` arguments into the typed argument struct of one action.
pub fn parse_args<T: DeserializeOwned>(system: &str, action: &str, args: &Value) -> Result<T> {
    serde_json::from_value(args.clone()).map_err(|e| EnactError::InvalidArgs {
        system: system.to_string(),
        action: action.to_string(),
        reason: e.to_string(),
    })
}

pub fn unknown_action(system: &str, action: &str) -> EnactError {
    EnactError::UnknownAction {
        system: system.to_string(),
        action: action.to_string(),
    }
}
