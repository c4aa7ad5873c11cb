//! Named workflows: thin, policy-free compositions of connector calls.
//!
//! A workflow reads its typed input from the payload, checks up front that
//! every system it needs is registered and allows every action it will take,
//! then runs those actions in order through the executor. Caller bugs
//! (missing systems, refused actions, malformed payloads) therefore surface
//! as `Err` before anything is mutated.

use crate::connectors::sqlite::Row;
use crate::connectors::{filesystem, github, slack, sqlite};
use crate::error::{EnactError, Result};
use crate::models::{ActionResult, WorkflowContext};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type Workflow = Arc<dyn Fn(&WorkflowContext) -> Result<Vec<ActionResult>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: BTreeMap<String, Workflow>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("agent_pr_workflow", agent_pr_workflow);
        registry.register("merge_agent_pr", merge_agent_pr);
        registry.register("post_slack_message", post_slack_message);
        registry.register("db_safe_insert", db_safe_insert);
        registry.register("db_update_rows", db_update_rows);
        registry.register("db_delete_rows", db_delete_rows);
        registry.register("fs_write_file", fs_write_file);
        registry.register("fs_delete_file", fs_delete_file);
        registry
    }

    pub fn register<F>(&mut self, name: &str, workflow: F)
    where
        F: Fn(&WorkflowContext) -> Result<Vec<ActionResult>> + Send + Sync + 'static,
    {
        self.workflows.insert(name.to_string(), Arc::new(workflow));
    }

    pub fn get(&self, name: &str) -> Result<Workflow> {
        self.workflows
            .get(name)
            .cloned()
            .ok_or_else(|| EnactError::UnknownWorkflow {
                name: name.to_string(),
                registered: self.names(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.workflows.keys().cloned().collect()
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.workflows.keys()).finish()
    }
}

/// Fail before the first action if `system` is missing or refuses any of
/// `actions`.
fn preflight(ctx: &WorkflowContext, system: &str, actions: &[&str]) -> Result<()> {
    let connector = ctx.connector(system)?;
    for action in actions {
        connector.check_allowed(action)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AgentPrPayload {
    repo: String,
    branch: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default = "default_base")]
    base: String,
}

fn default_base() -> String {
    "main".to_string()
}

/// Create a branch, then open a PR from it. Never touches the base branch.
pub fn agent_pr_workflow(ctx: &WorkflowContext) -> Result<Vec<ActionResult>> {
    let p: AgentPrPayload = ctx.parse_payload()?;
    preflight(ctx, github::SYSTEM, &["create_branch", "create_pr"])?;

    let mut results = Vec::new();
    let branch = ctx.execute(
        github::SYSTEM,
        "create_branch",
        json!({"repo": p.repo, "branch": p.branch, "from_branch": p.base}),
    )?;
    let created = branch.success;
    results.push(branch);
    if !created {
        return Ok(results);
    }

    let title = p.title.unwrap_or_else(|| format!("Agent PR: {}", p.branch));
    let body = p
        .body
        .unwrap_or_else(|| "Automated PR created by an agent via enact".to_string());
    results.push(ctx.execute(
        github::SYSTEM,
        "create_pr",
        json!({"repo": p.repo, "title": title, "body": body, "head": p.branch, "base": p.base}),
    )?);
    Ok(results)
}

#[derive(Deserialize)]
struct MergePayload {
    repo: String,
    pr_number: u64,
}

pub fn merge_agent_pr(ctx: &WorkflowContext) -> Result<Vec<ActionResult>> {
    let p: MergePayload = ctx.parse_payload()?;
    preflight(ctx, github::SYSTEM, &["merge_pr"])?;
    let merged = ctx.execute(
        github::SYSTEM,
        "merge_pr",
        json!({"repo": p.repo, "pr_number": p.pr_number}),
    )?;
    Ok(vec![merged])
}

// ---------------------------------------------------------------------------
// Slack
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SlackPayload {
    channel: String,
    text: String,
}

pub fn post_slack_message(ctx: &WorkflowContext) -> Result<Vec<ActionResult>> {
    let p: SlackPayload = ctx.parse_payload()?;
    preflight(ctx, slack::SYSTEM, &["post_message"])?;
    let posted = ctx.execute(
        slack::SYSTEM,
        "post_message",
        json!({"channel": p.channel, "text": p.text}),
    )?;
    Ok(vec![posted])
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct InsertPayload {
    table: String,
    data: Row,
    #[serde(default)]
    unique_key: Option<String>,
}

/// Insert a row, refusing when a row with the same `unique_key` value is
/// already present.
pub fn db_safe_insert(ctx: &WorkflowContext) -> Result<Vec<ActionResult>> {
    let p: InsertPayload = ctx.parse_payload()?;
    let unique = p
        .unique_key
        .as_ref()
        .and_then(|key| p.data.get(key).map(|value| (key.clone(), value.clone())));

    match unique {
        Some(_) => preflight(ctx, sqlite::SYSTEM, &["select_rows", "insert_row"])?,
        None => preflight(ctx, sqlite::SYSTEM, &["insert_row"])?,
    }

    let mut results = Vec::new();
    if let Some((key, value)) = unique {
        let mut filter = Row::new();
        filter.insert(key.clone(), value.clone());
        let check = ctx.execute(
            sqlite::SYSTEM,
            "select_rows",
            json!({"table": p.table, "where": filter}),
        )?;
        let exists = check.success
            && check
                .output
                .get("rows")
                .and_then(Value::as_array)
                .is_some_and(|rows| !rows.is_empty());
        results.push(check);
        if exists {
            results.push(ActionResult::failure(
                sqlite::SYSTEM,
                "insert_row",
                format!("Row with {key}={} already exists", display_value(&value)),
            ));
            return Ok(results);
        }
    }

    results.push(ctx.execute(
        sqlite::SYSTEM,
        "insert_row",
        json!({"table": p.table, "data": p.data}),
    )?);
    Ok(results)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Deserialize)]
struct UpdatePayload {
    table: String,
    data: Row,
    #[serde(default, rename = "where")]
    filter: Row,
}

pub fn db_update_rows(ctx: &WorkflowContext) -> Result<Vec<ActionResult>> {
    let p: UpdatePayload = ctx.parse_payload()?;
    preflight(ctx, sqlite::SYSTEM, &["update_row"])?;
    let updated = ctx.execute(
        sqlite::SYSTEM,
        "update_row",
        json!({"table": p.table, "data": p.data, "where": p.filter}),
    )?;
    Ok(vec![updated])
}

#[derive(Deserialize)]
struct DeletePayload {
    table: String,
    #[serde(default, rename = "where")]
    filter: Row,
}

pub fn db_delete_rows(ctx: &WorkflowContext) -> Result<Vec<ActionResult>> {
    let p: DeletePayload = ctx.parse_payload()?;
    preflight(ctx, sqlite::SYSTEM, &["delete_row"])?;
    let deleted = ctx.execute(
        sqlite::SYSTEM,
        "delete_row",
        json!({"table": p.table, "where": p.filter}),
    )?;
    Ok(vec![deleted])
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WritePayload {
    path: String,
    content: String,
}

pub fn fs_write_file(ctx: &WorkflowContext) -> Result<Vec<ActionResult>> {
    let p: WritePayload = ctx.parse_payload()?;
    preflight(ctx, filesystem::SYSTEM, &["write_file"])?;
    let written = ctx.execute(
        filesystem::SYSTEM,
        "write_file",
        json!({"path": p.path, "content": p.content}),
    )?;
    Ok(vec![written])
}

#[derive(Deserialize)]
struct PathPayload {
    path: String,
}

pub fn fs_delete_file(ctx: &WorkflowContext) -> Result<Vec<ActionResult>> {
    let p: PathPayload = ctx.parse_payload()?;
    preflight(ctx, filesystem::SYSTEM, &["delete_file"])?;
    let deleted = ctx.execute(filesystem::SYSTEM, "delete_file", json!({"path": p.path}))?;
    Ok(vec![deleted])
}
