//! GitHub REST connector.
//!
//! Every mutating call first reads the current state of the repository so a
//! repeated call with the same arguments is a no-op. Lookups that fail are
//! logged and the mutation is attempted anyway.

use super::detected;
use super::http::{build_client, send_json, str_field, u64_field, HttpError, HttpResult};
use crate::connector::{parse_args, unknown_action, Allowlist, Connector};
use crate::error::{EnactError, Result};
use crate::models::{fields, ActionResult};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};

pub const SYSTEM: &str = "github";

pub const DEFAULT_BASE_URL: &str = "https://api.github.com";

pub const DEFAULT_ACTIONS: &[&str] = &["create_branch", "create_pr", "create_issue"];

pub const ACTIONS: &[&str] = &[
    "create_branch",
    "create_branch_from_sha",
    "delete_branch",
    "create_pr",
    "close_pr",
    "create_issue",
    "close_issue",
    "merge_pr",
    "revert_commit",
];

pub struct GitHubConnector {
    client: Client,
    base_url: String,
    token: String,
    allowlist: Allowlist,
}

impl GitHubConnector {
    /// `allowed_actions: None` selects [`DEFAULT_ACTIONS`].
    pub fn new(token: impl Into<String>, allowed_actions: Option<Vec<String>>) -> Result<Self> {
        let client = build_client().map_err(|e| EnactError::ConnectorSetup {
            system: SYSTEM.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
            allowlist: Allowlist::or_defaults(allowed_actions, DEFAULT_ACTIONS),
        })
    }

    /// Point at GitHub Enterprise or a test server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    // -----------------------------------------------------------------------
    // Branches
    // -----------------------------------------------------------------------

    pub fn create_branch(&self, repo: &str, branch: &str, from_branch: &str) -> Result<ActionResult> {
        const ACTION: &str = "create_branch";
        self.check_allowed(ACTION)?;
        Ok(self
            .create_branch_inner(repo, branch, from_branch)
            .unwrap_or_else(|e| ActionResult::failure(SYSTEM, ACTION, e)))
    }

    fn create_branch_inner(&self, repo: &str, branch: &str, from_branch: &str) -> HttpResult<ActionResult> {
        const ACTION: &str = "create_branch";
        if let Some(sha) = detected(SYSTEM, ACTION, self.branch_sha(repo, branch)) {
            return Ok(ActionResult::already(
                SYSTEM,
                ACTION,
                "created",
                fields(json!({"branch": branch, "sha": sha})),
            ));
        }
        let source = self
            .branch_sha(repo, from_branch)?
            .ok_or_else(|| HttpError::Api(format!("source branch '{from_branch}' not found")))?;
        self.create_ref(repo, branch, &source)?;
        Ok(ActionResult::mutated(
            SYSTEM,
            ACTION,
            fields(json!({"branch": branch, "sha": source})),
            fields(json!({"repo": repo, "branch": branch})),
        ))
    }

    /// Recreate a branch at an exact commit. The inverse of `delete_branch`.
    pub fn create_branch_from_sha(&self, repo: &str, branch: &str, sha: &str) -> Result<ActionResult> {
        const ACTION: &str = "create_branch_from_sha";
        self.check_allowed(ACTION)?;
        let run = || -> HttpResult<ActionResult> {
            if let Some(existing) = detected(SYSTEM, ACTION, self.branch_sha(repo, branch)) {
                return Ok(ActionResult::already(
                    SYSTEM,
                    ACTION,
                    "created",
                    fields(json!({"branch": branch, "sha": existing})),
                ));
            }
            self.create_ref(repo, branch, sha)?;
            Ok(ActionResult::mutated(
                SYSTEM,
                ACTION,
                fields(json!({"branch": branch, "sha": sha})),
                fields(json!({"repo": repo, "branch": branch})),
            ))
        };
        Ok(run().unwrap_or_else(|e| ActionResult::failure(SYSTEM, ACTION, e)))
    }

    pub fn delete_branch(&self, repo: &str, branch: &str) -> Result<ActionResult> {
        const ACTION: &str = "delete_branch";
        self.check_allowed(ACTION)?;
        let run = || -> HttpResult<ActionResult> {
            let sha = match self.branch_sha(repo, branch) {
                Ok(None) => {
                    return Ok(ActionResult::already(
                        SYSTEM,
                        ACTION,
                        "deleted",
                        fields(json!({"branch": branch})),
                    ))
                }
                Ok(Some(sha)) => Some(sha),
                Err(e) => {
                    tracing::warn!(system = SYSTEM, action = ACTION, error = %e, "idempotency check failed; attempting the action");
                    None
                }
            };
            self.request(Method::DELETE, &format!("/repos/{repo}/git/refs/heads/{branch}"), None)?;
            // without the sha there is nothing to recreate the branch from
            let rollback = match &sha {
                Some(sha) => fields(json!({"repo": repo, "branch": branch, "sha": sha})),
                None => Map::new(),
            };
            Ok(ActionResult::mutated(
                SYSTEM,
                ACTION,
                fields(json!({"branch": branch, "sha": sha})),
                rollback,
            ))
        };
        Ok(run().unwrap_or_else(|e| ActionResult::failure(SYSTEM, ACTION, e)))
    }

    // -----------------------------------------------------------------------
    // Pull requests
    // -----------------------------------------------------------------------

    pub fn create_pr(&self, repo: &str, title: &str, body: &str, head: &str, base: &str) -> Result<ActionResult> {
        const ACTION: &str = "create_pr";
        self.check_allowed(ACTION)?;
        let run = || -> HttpResult<ActionResult> {
            if let Some(existing) = detected(SYSTEM, ACTION, self.open_pr(repo, head, base)) {
                return Ok(ActionResult::already(SYSTEM, ACTION, "created", pr_output(&existing)?));
            }
            let created = self.request(
                Method::POST,
                &format!("/repos/{repo}/pulls"),
                Some(json!({"title": title, "body": body, "head": head, "base": base})),
            )?;
            let number = u64_field(&created, "/number")?;
            Ok(ActionResult::mutated(
                SYSTEM,
                ACTION,
                pr_output(&created)?,
                fields(json!({"repo": repo, "pr_number": number})),
            ))
        };
        Ok(run().unwrap_or_else(|e| ActionResult::failure(SYSTEM, ACTION, e)))
    }

    /// Open PRs only. A closed PR for the same head does not count as done.
    fn open_pr(&self, repo: &str, head: &str, base: &str) -> HttpResult<Option<Value>> {
        let owner = repo.split('/').next().unwrap_or(repo);
        let head_ref = if head.contains(':') {
            head.to_string()
        } else {
            format!("{owner}:{head}")
        };
        let list = send_json(self.build(Method::GET, &format!("/repos/{repo}/pulls")).query(&[
            ("state", "open"),
            ("head", head_ref.as_str()),
            ("base", base),
        ]))?;
        Ok(list.as_array().and_then(|prs| prs.first()).cloned())
    }

    pub fn close_pr(&self, repo: &str, pr_number: u64) -> Result<ActionResult> {
        const ACTION: &str = "close_pr";
        self.check_allowed(ACTION)?;
        let path = format!("/repos/{repo}/pulls/{pr_number}");
        Ok(self
            .close(ACTION, &path, json!({"pr_number": pr_number}))
            .unwrap_or_else(|e| ActionResult::failure(SYSTEM, ACTION, e)))
    }

    pub fn merge_pr(&self, repo: &str, pr_number: u64) -> Result<ActionResult> {
        const ACTION: &str = "merge_pr";
        self.check_allowed(ACTION)?;
        let run = || -> HttpResult<ActionResult> {
            let pr = detected(SYSTEM, ACTION, self.get(&format!("/repos/{repo}/pulls/{pr_number}")).map(Some));
            if let Some(pr) = &pr {
                if pr.get("merged").and_then(Value::as_bool).unwrap_or(false) {
                    let sha = pr.get("merge_commit_sha").cloned().unwrap_or(Value::Null);
                    return Ok(ActionResult::already(
                        SYSTEM,
                        ACTION,
                        "merged",
                        fields(json!({"pr_number": pr_number, "sha": sha})),
                    ));
                }
            }
            let base_branch = pr
                .as_ref()
                .and_then(|pr| pr.pointer("/base/ref"))
                .and_then(Value::as_str)
                .map(str::to_string);

            let merged = self.request(
                Method::PUT,
                &format!("/repos/{repo}/pulls/{pr_number}/merge"),
                Some(json!({})),
            )?;
            let sha = str_field(&merged, "/sha")?.to_string();
            let rollback = match base_branch {
                Some(base) => fields(json!({"repo": repo, "merge_sha": sha, "base_branch": base})),
                None => Map::new(),
            };
            Ok(ActionResult::mutated(
                SYSTEM,
                ACTION,
                fields(json!({"pr_number": pr_number, "merged": true, "sha": sha})),
                rollback,
            ))
        };
        Ok(run().unwrap_or_else(|e| ActionResult::failure(SYSTEM, ACTION, e)))
    }

    /// Undo a merge by committing the pre-merge tree on top of the base
    /// branch. Refuses when the branch has moved on since the merge, since
    /// that would silently discard later work.
    pub fn revert_commit(&self, repo: &str, merge_sha: &str, base_branch: &str) -> Result<ActionResult> {
        const ACTION: &str = "revert_commit";
        self.check_allowed(ACTION)?;
        let run = || -> HttpResult<ActionResult> {
            let merge = self.commit(repo, merge_sha)?;
            let parent = str_field(&merge, "/parents/0/sha")?.to_string();
            let parent_tree = str_field(&self.commit(repo, &parent)?, "/tree/sha")?.to_string();
            let head = self
                .branch_sha(repo, base_branch)?
                .ok_or_else(|| HttpError::Api(format!("base branch '{base_branch}' not found")))?;

            let head_tree = detected(
                SYSTEM,
                ACTION,
                self.commit(repo, &head)
                    .and_then(|c| str_field(&c, "/tree/sha").map(|s| Some(s.to_string()))),
            );
            if head_tree.as_deref() == Some(parent_tree.as_str()) {
                return Ok(ActionResult::already(
                    SYSTEM,
                    ACTION,
                    "reverted",
                    fields(json!({"base_branch": base_branch, "sha": head})),
                ));
            }
            if head != merge_sha {
                return Err(HttpError::Api(format!(
                    "'{base_branch}' has moved past {merge_sha}; revert it manually"
                )));
            }

            let short = merge_sha.get(..7).unwrap_or(merge_sha);
            let revert = self.request(
                Method::POST,
                &format!("/repos/{repo}/git/commits"),
                Some(json!({
                    "message": format!("Revert merge {short}"),
                    "tree": parent_tree,
                    "parents": [head],
                })),
            )?;
            let revert_sha = str_field(&revert, "/sha")?.to_string();
            self.request(
                Method::PATCH,
                &format!("/repos/{repo}/git/refs/heads/{base_branch}"),
                Some(json!({"sha": revert_sha, "force": false})),
            )?;
            Ok(ActionResult::mutated(
                SYSTEM,
                ACTION,
                fields(json!({"base_branch": base_branch, "revert_sha": revert_sha})),
                Map::new(),
            ))
        };
        Ok(run().unwrap_or_else(|e| ActionResult::failure(SYSTEM, ACTION, e)))
    }

    // -----------------------------------------------------------------------
    // Issues
    // -----------------------------------------------------------------------

    pub fn create_issue(&self, repo: &str, title: &str, body: &str) -> Result<ActionResult> {
        const ACTION: &str = "create_issue";
        self.check_allowed(ACTION)?;
        let run = || -> HttpResult<ActionResult> {
            if let Some(existing) = detected(SYSTEM, ACTION, self.open_issue(repo, title)) {
                return Ok(ActionResult::already(SYSTEM, ACTION, "created", issue_output(&existing)?));
            }
            let created = self.request(
                Method::POST,
                &format!("/repos/{repo}/issues"),
                Some(json!({"title": title, "body": body})),
            )?;
            let number = u64_field(&created, "/number")?;
            Ok(ActionResult::mutated(
                SYSTEM,
                ACTION,
                issue_output(&created)?,
                fields(json!({"repo": repo, "issue_number": number})),
            ))
        };
        Ok(run().unwrap_or_else(|e| ActionResult::failure(SYSTEM, ACTION, e)))
    }

    fn open_issue(&self, repo: &str, title: &str) -> HttpResult<Option<Value>> {
        let list = send_json(
            self.build(Method::GET, &format!("/repos/{repo}/issues"))
                .query(&[("state", "open"), ("per_page", "100")]),
        )?;
        // the issues endpoint also lists pull requests
        Ok(list.as_array().and_then(|items| {
            items
                .iter()
                .find(|i| i.get("pull_request").is_none() && i.get("title").and_then(Value::as_str) == Some(title))
                .cloned()
        }))
    }

    pub fn close_issue(&self, repo: &str, issue_number: u64) -> Result<ActionResult> {
        const ACTION: &str = "close_issue";
        self.check_allowed(ACTION)?;
        let path = format!("/repos/{repo}/issues/{issue_number}");
        Ok(self
            .close(ACTION, &path, json!({"issue_number": issue_number}))
            .unwrap_or_else(|e| ActionResult::failure(SYSTEM, ACTION, e)))
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    /// Shared by `close_pr` and `close_issue`: both resources carry `state`.
    fn close(&self, action: &str, path: &str, output: Value) -> HttpResult<ActionResult> {
        let state = detected(
            SYSTEM,
            action,
            self.get(path)
                .map(|r| r.get("state").and_then(Value::as_str).map(str::to_string)),
        );
        if state.as_deref() == Some("closed") {
            return Ok(ActionResult::already(SYSTEM, action, "closed", fields(output)));
        }
        self.request(Method::PATCH, path, Some(json!({"state": "closed"})))?;
        Ok(ActionResult::mutated(SYSTEM, action, fields(output), Map::new()))
    }

    fn branch_sha(&self, repo: &str, branch: &str) -> HttpResult<Option<String>> {
        match self.get(&format!("/repos/{repo}/git/ref/heads/{branch}")) {
            Ok(body) => Ok(Some(str_field(&body, "/object/sha")?.to_string())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_ref(&self, repo: &str, branch: &str, sha: &str) -> HttpResult<Value> {
        self.request(
            Method::POST,
            &format!("/repos/{repo}/git/refs"),
            Some(json!({"ref": format!("refs/heads/{branch}"), "sha": sha})),
        )
    }

    fn commit(&self, repo: &str, sha: &str) -> HttpResult<Value> {
        self.get(&format!("/repos/{repo}/git/commits/{sha}"))
    }

    fn build(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    fn get(&self, path: &str) -> HttpResult<Value> {
        send_json(self.build(Method::GET, path))
    }

    fn request(&self, method: Method, path: &str, body: Option<Value>) -> HttpResult<Value> {
        let builder = self.build(method, path);
        match body {
            Some(body) => send_json(builder.json(&body)),
            None => send_json(builder),
        }
    }
}

fn pr_output(pr: &Value) -> HttpResult<Map<String, Value>> {
    Ok(fields(json!({
        "pr_number": u64_field(pr, "/number")?,
        "url": pr.get("html_url").cloned().unwrap_or(Value::Null),
    })))
}

fn issue_output(issue: &Value) -> HttpResult<Map<String, Value>> {
    Ok(fields(json!({
        "issue_number": u64_field(issue, "/number")?,
        "url": issue.get("html_url").cloned().unwrap_or(Value::Null),
    })))
}

// ---------------------------------------------------------------------------
// Dynamic dispatch
// ---------------------------------------------------------------------------

fn default_base() -> String {
    "main".to_string()
}

#[derive(Deserialize)]
struct CreateBranchArgs {
    repo: String,
    branch: String,
    #[serde(default = "default_base")]
    from_branch: String,
}

#[derive(Deserialize)]
struct BranchShaArgs {
    repo: String,
    branch: String,
    sha: String,
}

#[derive(Deserialize)]
struct BranchArgs {
    repo: String,
    branch: String,
}

#[derive(Deserialize)]
struct CreatePrArgs {
    repo: String,
    title: String,
    #[serde(default)]
    body: String,
    head: String,
    #[serde(default = "default_base")]
    base: String,
}

#[derive(Deserialize)]
struct PrArgs {
    repo: String,
    pr_number: u64,
}

#[derive(Deserialize)]
struct CreateIssueArgs {
    repo: String,
    title: String,
    #[serde(default)]
    body: String,
}

#[derive(Deserialize)]
struct IssueArgs {
    repo: String,
    issue_number: u64,
}

#[derive(Deserialize)]
struct RevertArgs {
    repo: String,
    merge_sha: String,
    #[serde(default = "default_base")]
    base_branch: String,
}

impl Connector for GitHubConnector {
    fn system(&self) -> &'static str {
        SYSTEM
    }

    fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    fn invoke(&self, action: &str, args: &Value) -> Result<ActionResult> {
        self.check_allowed(action)?;
        match action {
            "create_branch" => {
                let a: CreateBranchArgs = parse_args(SYSTEM, action, args)?;
                self.create_branch(&a.repo, &a.branch, &a.from_branch)
            }
            "create_branch_from_sha" => {
                let a: BranchShaArgs = parse_args(SYSTEM, action, args)?;
                self.create_branch_from_sha(&a.repo, &a.branch, &a.sha)
            }
            "delete_branch" => {
                let a: BranchArgs = parse_args(SYSTEM, action, args)?;
                self.delete_branch(&a.repo, &a.branch)
            }
            "create_pr" => {
                let a: CreatePrArgs = parse_args(SYSTEM, action, args)?;
                self.create_pr(&a.repo, &a.title, &a.body, &a.head, &a.base)
            }
            "close_pr" => {
                let a: PrArgs = parse_args(SYSTEM, action, args)?;
                self.close_pr(&a.repo, a.pr_number)
            }
            "merge_pr" => {
                let a: PrArgs = parse_args(SYSTEM, action, args)?;
                self.merge_pr(&a.repo, a.pr_number)
            }
            "revert_commit" => {
                let a: RevertArgs = parse_args(SYSTEM, action, args)?;
                self.revert_commit(&a.repo, &a.merge_sha, &a.base_branch)
            }
            "create_issue" => {
                let a: CreateIssueArgs = parse_args(SYSTEM, action, args)?;
                self.create_issue(&a.repo, &a.title, &a.body)
            }
            "close_issue" => {
                let a: IssueArgs = parse_args(SYSTEM, action, args)?;
                self.close_issue(&a.repo, a.issue_number)
            }
            other => Err(unknown_action(SYSTEM, other)),
        }
    }
}
