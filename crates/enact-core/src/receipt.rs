//! Signed, persisted run records.
//!
//! A receipt's `signature` is an HMAC-SHA256 over the JSON encoding of every
//! other field, so tampering with any recorded action, policy result or the
//! payload invalidates it. Receipts live one file per run under the receipt
//! directory, named `<run_id>.json`.

use crate::error::{EnactError, Result};
use crate::io::{atomic_write, ensure_dir};
use crate::models::{ActionResult, Decision, PolicyResult, Receipt};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::Sha256;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Unsigned receipt for a fresh run.
pub fn build_receipt(
    workflow: &str,
    actor: &str,
    payload: Map<String, Value>,
    policy_results: Vec<PolicyResult>,
    decision: Decision,
    actions_taken: Vec<ActionResult>,
) -> Receipt {
    Receipt {
        run_id: Uuid::new_v4(),
        workflow: workflow.to_string(),
        actor: actor.to_string(),
        payload,
        policy_results,
        decision,
        actions_taken,
        rollback_of: None,
        timestamp: Utc::now(),
        signature: String::new(),
    }
}

/// Unsigned receipt recording the compensation of `original`.
pub fn build_rollback_receipt(
    original: &Receipt,
    actor: &str,
    decision: Decision,
    actions_taken: Vec<ActionResult>,
) -> Receipt {
    Receipt {
        rollback_of: Some(original.run_id),
        ..build_receipt(
            &original.workflow,
            actor,
            original.payload.clone(),
            Vec::new(),
            decision,
            actions_taken,
        )
    }
}

/// Every field but the signature.
#[derive(Serialize)]
struct ReceiptBinding<'a> {
    run_id: &'a Uuid,
    workflow: &'a str,
    actor: &'a str,
    payload: &'a Map<String, Value>,
    policy_results: &'a [PolicyResult],
    decision: Decision,
    actions_taken: &'a [ActionResult],
    rollback_of: Option<&'a Uuid>,
    timestamp: &'a DateTime<Utc>,
}

fn binding_payload(receipt: &Receipt) -> Result<Vec<u8>> {
    let binding = ReceiptBinding {
        run_id: &receipt.run_id,
        workflow: &receipt.workflow,
        actor: &receipt.actor,
        payload: &receipt.payload,
        policy_results: &receipt.policy_results,
        decision: receipt.decision,
        actions_taken: &receipt.actions_taken,
        rollback_of: receipt.rollback_of.as_ref(),
        timestamp: &receipt.timestamp,
    };
    Ok(serde_json::to_vec(&binding)?)
}

fn mac(secret: &[u8], receipt: &Receipt) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| EnactError::InvalidSecret(e.to_string()))?;
    mac.update(&binding_payload(receipt)?);
    Ok(mac)
}

pub fn sign_receipt(receipt: &mut Receipt, secret: &[u8]) -> Result<()> {
    let mac = mac(secret, receipt)?;
    receipt.signature = hex::encode(mac.finalize().into_bytes());
    Ok(())
}

/// Constant-time comparison. Malformed signatures are simply invalid.
pub fn verify_signature(receipt: &Receipt, secret: &[u8]) -> bool {
    let Ok(expected) = hex::decode(&receipt.signature) else {
        return false;
    };
    match mac(secret, receipt) {
        Ok(mac) => mac.verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReceiptStore {
    dir: PathBuf,
}

impl ReceiptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    pub fn write(&self, receipt: &Receipt) -> Result<PathBuf> {
        ensure_dir(&self.dir)?;
        let path = self.path_for(receipt.run_id);
        let json = serde_json::to_string_pretty(receipt)?;
        atomic_write(&path, json.as_bytes())?;
        tracing::debug!(run_id = %receipt.run_id, path = %path.display(), "receipt written");
        Ok(path)
    }

    pub fn load(&self, run_id: Uuid) -> Result<Receipt> {
        let path = self.path_for(run_id);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EnactError::ReceiptNotFound(run_id))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&data)?)
    }

    /// All receipts, newest first. Files that do not parse are skipped.
    pub fn list(&self) -> Result<Vec<Receipt>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut receipts = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(EnactError::from)
                .and_then(|data| serde_json::from_str::<Receipt>(&data).map_err(EnactError::from));
            match parsed {
                Ok(receipt) => receipts.push(receipt),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable receipt")
                }
            }
        }
        receipts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(receipts)
    }

    /// Rollback receipts recorded against `run_id`, newest first.
    pub fn rollbacks_of(&self, run_id: Uuid) -> Result<Vec<Receipt>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.rollback_of == Some(run_id))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Human-readable view
// ---------------------------------------------------------------------------

/// Plain-text projection for terminals. Derived from the receipt; never
/// parsed back.
pub fn render_receipt(receipt: &Receipt) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Run:       {}", receipt.run_id);
    let _ = writeln!(out, "Workflow:  {}", receipt.workflow);
    let _ = writeln!(out, "Actor:     {}", receipt.actor);
    let _ = writeln!(out, "Decision:  {}", receipt.decision);
    let _ = writeln!(out, "Time:      {}", receipt.timestamp.to_rfc3339());
    if let Some(original) = receipt.rollback_of {
        let _ = writeln!(out, "Rollback:  of run {original}");
    }

    if !receipt.payload.is_empty() {
        let _ = writeln!(out, "\nPayload:");
        for (key, value) in &receipt.payload {
            let _ = writeln!(out, "  {key}: {value}");
        }
    }

    if !receipt.policy_results.is_empty() {
        let _ = writeln!(out, "\nPolicies:");
        for p in &receipt.policy_results {
            let mark = if p.passed { "pass" } else { "FAIL" };
            let _ = writeln!(out, "  [{mark}] {}: {}", p.policy, p.reason);
        }
    }

    let _ = writeln!(out, "\nActions:");
    if receipt.actions_taken.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for a in &receipt.actions_taken {
        let note = if !a.success {
            format!(" error: {}", a.error().unwrap_or("unknown"))
        } else if let Some(done) = a.already_done() {
            format!(" (already done: {done})")
        } else {
            String::new()
        };
        let mark = if a.success { "ok" } else { "FAIL" };
        let _ = writeln!(out, "  [{mark}] {}.{}{note}", a.system, a.action);
    }

    let short = receipt.signature.get(..16).unwrap_or(&receipt.signature);
    let _ = write!(out, "\nSignature: {short}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fields;
    use serde_json::json;
    use tempfile::TempDir;

    const SECRET: &[u8] = b"test-secret";

    fn sample() -> Receipt {
        build_receipt(
            "agent_pr_workflow",
            "agent@example.com",
            fields(json!({"repo": "o/r", "branch": "agent/x"})),
            vec![PolicyResult::pass("no_push_to_main", "Branch is not main/master")],
            Decision::Pass,
            vec![ActionResult::mutated(
                "github",
                "create_branch",
                fields(json!({"branch": "agent/x"})),
                fields(json!({"repo": "o/r", "branch": "agent/x"})),
            )],
        )
    }

    #[test]
    fn signature_verifies_and_detects_tampering() {
        let mut receipt = sample();
        sign_receipt(&mut receipt, SECRET).unwrap();
        assert_eq!(receipt.signature.len(), 64);
        assert!(verify_signature(&receipt, SECRET));
        assert!(!verify_signature(&receipt, b"other-secret"));

        let mut tampered = receipt.clone();
        tampered.actions_taken[0].output.insert("branch".into(), json!("agent/y"));
        assert!(!verify_signature(&tampered, SECRET));

        let mut tampered = receipt.clone();
        tampered.payload.insert("extra".into(), json!(true));
        assert!(!verify_signature(&tampered, SECRET));

        let mut tampered = receipt;
        tampered.decision = Decision::Block;
        assert!(!verify_signature(&tampered, SECRET));
    }

    #[test]
    fn malformed_signature_is_invalid() {
        let mut receipt = sample();
        receipt.signature = "not-hex".into();
        assert!(!verify_signature(&receipt, SECRET));
        receipt.signature = String::new();
        assert!(!verify_signature(&receipt, SECRET));
    }

    #[test]
    fn signature_survives_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ReceiptStore::new(dir.path().join("receipts"));
        let mut receipt = sample();
        sign_receipt(&mut receipt, SECRET).unwrap();

        let path = store.write(&receipt).unwrap();
        assert!(path.ends_with(format!("{}.json", receipt.run_id)));
        let loaded = store.load(receipt.run_id).unwrap();
        assert_eq!(loaded, receipt);
        assert!(verify_signature(&loaded, SECRET));
    }

    #[test]
    fn load_missing_receipt() {
        let dir = TempDir::new().unwrap();
        let store = ReceiptStore::new(dir.path());
        let id = Uuid::new_v4();
        assert!(matches!(store.load(id), Err(EnactError::ReceiptNotFound(r)) if r == id));
    }

    #[test]
    fn list_is_newest_first_and_finds_rollbacks() {
        let dir = TempDir::new().unwrap();
        let store = ReceiptStore::new(dir.path());
        assert!(store.list().unwrap().is_empty());

        let mut first = sample();
        first.timestamp = Utc::now() - chrono::Duration::minutes(5);
        store.write(&first).unwrap();
        let rollback = build_rollback_receipt(&first, "ops@example.com", Decision::Pass, vec![]);
        store.write(&rollback).unwrap();
        std::fs::write(dir.path().join("garbage.json"), "{").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].run_id, rollback.run_id);

        let rollbacks = store.rollbacks_of(first.run_id).unwrap();
        assert_eq!(rollbacks.len(), 1);
        assert_eq!(rollbacks[0].actor, "ops@example.com");
        assert!(rollbacks[0].policy_results.is_empty());
    }

    #[test]
    fn render_shows_decision_policies_and_actions() {
        let mut receipt = sample();
        receipt.actions_taken.push(ActionResult::already(
            "github",
            "create_pr",
            "created",
            Map::new(),
        ));
        receipt.actions_taken.push(ActionResult::failure("slack", "post_message", "not_in_channel"));
        let text = render_receipt(&receipt);
        assert!(text.contains("Decision:  PASS"));
        assert!(text.contains("[pass] no_push_to_main: Branch is not main/master"));
        assert!(text.contains("[ok] github.create_branch\n"));
        assert!(text.contains("github.create_pr (already done: created)"));
        assert!(text.contains("[FAIL] slack.post_message error: not_in_channel"));
    }

    #[test]
    fn render_blocked_run_has_no_actions() {
        let receipt = build_receipt("wf", "a", Map::new(), vec![], Decision::Block, vec![]);
        assert!(render_receipt(&receipt).contains("(none)"));
    }
}
