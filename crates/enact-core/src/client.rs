//! The runner agents talk to.
//!
//! `run` is gate → workflow → signed receipt. `rollback` is receipt →
//! reverse compensation → signed rollback receipt. Both always persist a
//! receipt once they get past argument checks, including for blocked runs
//! and partial rollbacks.

use crate::config::Config;
use crate::connector::{Connector, Systems};
use crate::error::{EnactError, Result};
use crate::models::{ActionResult, Decision, Receipt, RunResult, WorkflowContext};
use crate::policy::{all_passed, evaluate_all, Policy};
use crate::receipt::{build_receipt, build_rollback_receipt, sign_receipt, verify_signature, ReceiptStore};
use crate::rollback::{skipped, RollbackRegistry};
use crate::workflow::WorkflowRegistry;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub struct EnactClient {
    systems: Arc<Systems>,
    policies: Vec<Policy>,
    workflows: WorkflowRegistry,
    rollbacks: RollbackRegistry,
    store: ReceiptStore,
    secret: Vec<u8>,
}

impl EnactClient {
    pub fn builder(receipt_dir: impl Into<PathBuf>, secret: impl Into<Vec<u8>>) -> EnactClientBuilder {
        EnactClientBuilder {
            systems: Systems::new(),
            policies: Vec::new(),
            workflows: WorkflowRegistry::with_builtins(),
            rollbacks: RollbackRegistry::with_defaults(),
            receipt_dir: receipt_dir.into(),
            secret: secret.into(),
        }
    }

    /// A client wired from `.enact/config.yaml` under `root`.
    pub fn from_config(config: &Config, root: &Path) -> Result<Self> {
        Self::builder(config.receipts_dir(root), config.secret())
            .systems(config.build_systems(root)?)
            .policies(config.build_policies())
            .build()
    }

    pub fn store(&self) -> &ReceiptStore {
        &self.store
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    pub fn verify(&self, receipt: &Receipt) -> bool {
        verify_signature(receipt, &self.secret)
    }

    /// Evaluate every policy, then run `workflow` only if all of them passed.
    pub fn run(&self, workflow: &str, actor: &str, payload: Map<String, Value>) -> Result<(RunResult, Receipt)> {
        let run_workflow = self.workflows.get(workflow)?;
        let ctx = WorkflowContext::new(workflow, actor, payload, Arc::clone(&self.systems));

        let policy_results = evaluate_all(&ctx, &self.policies);
        if !all_passed(&policy_results) {
            tracing::info!(workflow, actor, "run blocked by policy");
            let receipt = self.record(build_receipt(
                workflow,
                actor,
                ctx.payload,
                policy_results,
                Decision::Block,
                Vec::new(),
            ))?;
            return Ok((RunResult::from_receipt(&receipt), receipt));
        }

        tracing::info!(workflow, actor, "policies passed; running workflow");
        let actions = run_workflow(&ctx)?;
        let receipt = self.record(build_receipt(
            workflow,
            actor,
            ctx.payload,
            policy_results,
            Decision::Pass,
            actions,
        ))?;
        let result = RunResult::from_receipt(&receipt);
        tracing::info!(
            workflow,
            actor,
            run_id = %receipt.run_id,
            success = result.success,
            "run finished"
        );
        Ok((result, receipt))
    }

    /// Compensate the actions of a recorded run, newest first, stopping at
    /// the first compensation that fails.
    pub fn rollback(&self, run_id: Uuid, actor: &str) -> Result<(RunResult, Receipt)> {
        let original = self.store.load(run_id)?;
        if !self.verify(&original) {
            return Err(EnactError::InvalidSignature(run_id));
        }
        if original.rollback_of.is_some() {
            return Err(EnactError::NotRollbackable(run_id));
        }
        let completed = self
            .store
            .rollbacks_of(run_id)?
            .iter()
            .any(|r| r.decision == Decision::Pass && self.verify(r));
        if completed {
            return Err(EnactError::AlreadyRolledBack(run_id));
        }

        tracing::info!(run_id = %run_id, actor, actions = original.actions_taken.len(), "rolling back");
        let mut compensations = Vec::new();
        let mut decision = Decision::Pass;
        for action in original.actions_taken.iter().rev() {
            let result = self.compensate(action);
            let failed = !result.success;
            compensations.push(result);
            if failed {
                tracing::warn!(
                    run_id = %run_id,
                    system = %action.system,
                    action = %action.action,
                    "rollback stopped at failed compensation"
                );
                decision = Decision::Partial;
                break;
            }
        }

        let receipt = self.record(build_rollback_receipt(&original, actor, decision, compensations))?;
        tracing::info!(run_id = %run_id, rollback_id = %receipt.run_id, decision = %decision, "rollback recorded");
        Ok((RunResult::from_receipt(&receipt), receipt))
    }

    fn compensate(&self, action: &ActionResult) -> ActionResult {
        if let Some(skip) = skipped(action) {
            return skip;
        }
        match self.connector(&action.system) {
            Some(connector) => self.rollbacks.dispatch(action, connector),
            None => ActionResult::failure(
                &action.system,
                &action.action,
                format!(
                    "Rollback failed for {}.{}: {}",
                    action.system,
                    action.action,
                    EnactError::SystemNotFound(action.system.clone())
                ),
            ),
        }
    }

    fn connector(&self, system: &str) -> Option<&dyn Connector> {
        self.systems.get(system).map(|c| c.as_ref())
    }

    fn record(&self, mut receipt: Receipt) -> Result<Receipt> {
        sign_receipt(&mut receipt, &self.secret)?;
        self.store.write(&receipt)?;
        Ok(receipt)
    }
}

pub struct EnactClientBuilder {
    systems: Systems,
    policies: Vec<Policy>,
    workflows: WorkflowRegistry,
    rollbacks: RollbackRegistry,
    receipt_dir: PathBuf,
    secret: Vec<u8>,
}

impl EnactClientBuilder {
    pub fn system(mut self, name: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        self.systems.insert(name.into(), connector);
        self
    }

    pub fn systems(mut self, systems: Systems) -> Self {
        self.systems.extend(systems);
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn policies(mut self, policies: Vec<Policy>) -> Self {
        self.policies.extend(policies);
        self
    }

    /// Replaces the built-in workflows.
    pub fn workflows(mut self, workflows: WorkflowRegistry) -> Self {
        self.workflows = workflows;
        self
    }

    pub fn workflow<F>(mut self, name: &str, workflow: F) -> Self
    where
        F: Fn(&WorkflowContext) -> Result<Vec<ActionResult>> + Send + Sync + 'static,
    {
        self.workflows.register(name, workflow);
        self
    }

    pub fn rollbacks(mut self, rollbacks: RollbackRegistry) -> Self {
        self.rollbacks = rollbacks;
        self
    }

    pub fn build(self) -> Result<EnactClient> {
        if self.secret.is_empty() {
            return Err(EnactError::InvalidSecret("signing secret is empty".to_string()));
        }
        Ok(EnactClient {
            systems: Arc::new(self.systems),
            policies: self.policies,
            workflows: self.workflows,
            rollbacks: self.rollbacks,
            store: ReceiptStore::new(self.receipt_dir),
            secret: self.secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{filesystem, FilesystemConnector};
    use crate::models::fields;
    use crate::policy::{self, filesystem::no_delete_file};
    use serde_json::json;
    use tempfile::TempDir;

    const SECRET: &[u8] = b"client-test-secret";

    fn client(dir: &TempDir) -> EnactClient {
        let fs = FilesystemConnector::new(
            dir.path().join("work"),
            Some(filesystem::ACTIONS.iter().map(|a| a.to_string()).collect()),
        );
        EnactClient::builder(dir.path().join("receipts"), SECRET)
            .system(filesystem::SYSTEM, Arc::new(fs))
            .build()
            .unwrap()
    }

    #[test]
    fn empty_secret_is_rejected() {
        let err = EnactClient::builder("receipts", Vec::<u8>::new()).build().err().unwrap();
        assert!(matches!(err, EnactError::InvalidSecret(_)));
    }

    #[test]
    fn unknown_workflow_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let c = client(&dir);
        let err = c.run("push_to_main", "agent", Map::new()).unwrap_err();
        assert!(matches!(err, EnactError::UnknownWorkflow { .. }));
        assert!(c.store().list().unwrap().is_empty());
    }

    #[test]
    fn pass_run_is_signed_and_persisted() {
        let dir = TempDir::new().unwrap();
        let c = client(&dir);
        let (result, receipt) = c
            .run("fs_write_file", "agent", fields(json!({"path": "a.txt", "content": "hi"})))
            .unwrap();
        assert!(result.success);
        assert_eq!(receipt.decision, Decision::Pass);
        assert!(result.output.contains_key("write_file"));
        assert!(c.verify(&receipt));
        assert_eq!(c.store().load(receipt.run_id).unwrap(), receipt);
    }

    #[test]
    fn blocked_run_records_zero_actions() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("work")).unwrap();
        std::fs::write(dir.path().join("work/keep.txt"), "keep").unwrap();
        let fs = FilesystemConnector::new(
            dir.path().join("work"),
            Some(filesystem::ACTIONS.iter().map(|a| a.to_string()).collect()),
        );
        let c = EnactClient::builder(dir.path().join("receipts"), SECRET)
            .system(filesystem::SYSTEM, Arc::new(fs))
            .policy(policy::policy(no_delete_file))
            .build()
            .unwrap();

        let (result, receipt) = c
            .run("fs_delete_file", "agent", fields(json!({"path": "keep.txt"})))
            .unwrap();
        assert!(!result.success);
        assert_eq!(receipt.decision, Decision::Block);
        assert!(receipt.actions_taken.is_empty());
        assert!(dir.path().join("work/keep.txt").exists());
    }

    #[test]
    fn rollback_is_recorded_once() {
        let dir = TempDir::new().unwrap();
        let c = client(&dir);
        let (_, run) = c
            .run("fs_write_file", "agent", fields(json!({"path": "a.txt", "content": "hi"})))
            .unwrap();

        let (result, undo) = c.rollback(run.run_id, "operator").unwrap();
        assert!(result.success);
        assert_eq!(undo.rollback_of, Some(run.run_id));
        assert_eq!(undo.actor, "operator");
        assert!(!dir.path().join("work/a.txt").exists());

        assert!(matches!(
            c.rollback(run.run_id, "operator"),
            Err(EnactError::AlreadyRolledBack(id)) if id == run.run_id
        ));
        assert!(matches!(
            c.rollback(undo.run_id, "operator"),
            Err(EnactError::NotRollbackable(_))
        ));
    }

    #[test]
    fn tampered_receipt_is_refused() {
        let dir = TempDir::new().unwrap();
        let c = client(&dir);
        let (_, mut run) = c
            .run("fs_write_file", "agent", fields(json!({"path": "a.txt", "content": "hi"})))
            .unwrap();
        run.actor = "someone-else".to_string();
        c.store().write(&run).unwrap();

        assert!(matches!(
            c.rollback(run.run_id, "operator"),
            Err(EnactError::InvalidSignature(_))
        ));
        assert!(dir.path().join("work/a.txt").exists());
    }

    #[test]
    fn missing_connector_makes_rollback_partial() {
        let dir = TempDir::new().unwrap();
        let (_, run) = client(&dir)
            .run("fs_write_file", "agent", fields(json!({"path": "a.txt", "content": "hi"})))
            .unwrap();

        let bare = EnactClient::builder(dir.path().join("receipts"), SECRET).build().unwrap();
        let (result, undo) = bare.rollback(run.run_id, "operator").unwrap();
        assert!(!result.success);
        assert_eq!(undo.decision, Decision::Partial);
        assert_eq!(
            undo.actions_taken[0].error(),
            Some("Rollback failed for filesystem.write_file: system not registered: filesystem")
        );
    }

    #[test]
    fn unknown_run_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let id = Uuid::new_v4();
        assert!(matches!(
            client(&dir).rollback(id, "operator"),
            Err(EnactError::ReceiptNotFound(found)) if found == id
        ));
    }

    #[test]
    fn starter_config_cannot_rewrite_its_own_state() {
        let dir = TempDir::new().unwrap();
        Config::starter().save(dir.path()).unwrap();
        let config = Config::load(dir.path()).unwrap();
        let c = EnactClient::from_config(&config, dir.path()).unwrap();

        let (result, receipt) = c
            .run(
                "fs_write_file",
                "agent",
                fields(json!({"path": ".enact/config.yaml", "content": "version: 1\npolicies: []\n"})),
            )
            .unwrap();
        assert!(!result.success);
        assert!(receipt.actions_taken[0]
            .error()
            .unwrap()
            .contains("protected directory"));
        assert_eq!(Config::load(dir.path()).unwrap().policies.len(), config.policies.len());

        // the rest of the project is still writable
        let (ok, _) = c
            .run("fs_write_file", "agent", fields(json!({"path": "notes.md", "content": "hi"})))
            .unwrap();
        assert!(ok.success);
    }
}
