use crate::connector::Systems;
use crate::connectors::{filesystem, github, slack, sqlite};
use crate::connectors::{FilesystemConnector, GitHubConnector, SlackConnector, SqliteConnector};
use crate::error::{EnactError, Result};
use crate::paths;
use crate::policy::{self, Policy};
use crate::rollback::inverse_actions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Signing key used when the configured environment variable is unset.
/// Receipts signed with it prove nothing outside a development checkout.
pub const DEV_SECRET: &str = "enact-dev-secret-do-not-use-in-production";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ReceiptsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptsConfig {
    #[serde(default = "default_receipts_dir")]
    pub dir: String,
    /// Environment variable holding the HMAC signing secret.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

fn default_receipts_dir() -> String {
    paths::RECEIPTS_DIR.to_string()
}

fn default_secret_env() -> String {
    "ENACT_SECRET".to_string()
}

impl Default for ReceiptsConfig {
    fn default() -> Self {
        Self {
            dir: default_receipts_dir(),
            secret_env: default_secret_env(),
        }
    }
}

// ---------------------------------------------------------------------------
// SystemsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_github_token_env")]
    pub token_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Omitted means the connector's conservative defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_actions: Option<Vec<String>>,
}

fn default_github_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default = "default_slack_token_env")]
    pub token_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_actions: Option<Vec<String>>,
}

fn default_slack_token_env() -> String {
    "SLACK_BOT_TOKEN".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_actions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemConfig {
    pub base_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_actions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<GitHubConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite: Option<SqliteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemConfig>,
}

impl SystemsConfig {
    /// `(system, allowed actions as configured, defaults, every known action)`
    /// for each configured system.
    fn allowlists(&self) -> Vec<(&'static str, Option<&Vec<String>>, &'static [&'static str], &'static [&'static str])> {
        let mut out = Vec::new();
        if let Some(c) = &self.github {
            out.push((github::SYSTEM, c.allowed_actions.as_ref(), github::DEFAULT_ACTIONS, github::ACTIONS));
        }
        if let Some(c) = &self.slack {
            out.push((slack::SYSTEM, c.allowed_actions.as_ref(), slack::DEFAULT_ACTIONS, slack::ACTIONS));
        }
        if let Some(c) = &self.sqlite {
            out.push((sqlite::SYSTEM, c.allowed_actions.as_ref(), sqlite::DEFAULT_ACTIONS, sqlite::ACTIONS));
        }
        if let Some(c) = &self.filesystem {
            out.push((
                filesystem::SYSTEM,
                c.allowed_actions.as_ref(),
                filesystem::DEFAULT_ACTIONS,
                filesystem::ACTIONS,
            ));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.github.is_none() && self.slack.is_none() && self.sqlite.is_none() && self.filesystem.is_none()
    }
}

// ---------------------------------------------------------------------------
// PolicySpec
// ---------------------------------------------------------------------------

/// One configured predicate.
///
/// ```yaml
/// policies:
///   - type: require_branch_prefix
///     prefix: agent/
///   - type: no_push_to_main
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicySpec {
    NoPushToMain,
    NoMergeToMain,
    NoDeleteBranch,
    RequireBranchPrefix {
        prefix: String,
    },
    MaxFilesPerCommit {
        max: u64,
    },
    RequireChannelAllowlist {
        channels: Vec<String>,
    },
    BlockDms,
    DontDeleteRow,
    DontDeleteWithoutWhere,
    DontUpdateWithoutWhere,
    ProtectTables {
        tables: Vec<String>,
    },
    NoDeleteFile,
    RestrictPaths {
        dirs: Vec<String>,
    },
    BlockExtensions {
        extensions: Vec<String>,
    },
    ContractorCannotWritePii,
    RequireActorRole {
        roles: Vec<String>,
    },
    WithinMaintenanceWindow {
        start_hour_utc: u32,
        end_hour_utc: u32,
    },
}

impl PolicySpec {
    pub fn build(&self) -> Policy {
        use policy::{access, db, filesystem as fs, git, slack as sl, time};
        match self {
            PolicySpec::NoPushToMain => policy::policy(git::no_push_to_main),
            PolicySpec::NoMergeToMain => policy::policy(git::no_merge_to_main),
            PolicySpec::NoDeleteBranch => policy::policy(git::no_delete_branch),
            PolicySpec::RequireBranchPrefix { prefix } => git::require_branch_prefix(prefix.clone()),
            PolicySpec::MaxFilesPerCommit { max } => git::max_files_per_commit(*max),
            PolicySpec::RequireChannelAllowlist { channels } => {
                sl::require_channel_allowlist(channels.clone())
            }
            PolicySpec::BlockDms => policy::policy(sl::block_dms),
            PolicySpec::DontDeleteRow => policy::policy(db::dont_delete_row),
            PolicySpec::DontDeleteWithoutWhere => policy::policy(db::dont_delete_without_where),
            PolicySpec::DontUpdateWithoutWhere => policy::policy(db::dont_update_without_where),
            PolicySpec::ProtectTables { tables } => db::protect_tables(tables.clone()),
            PolicySpec::NoDeleteFile => policy::policy(fs::no_delete_file),
            PolicySpec::RestrictPaths { dirs } => fs::restrict_paths(dirs.clone()),
            PolicySpec::BlockExtensions { extensions } => fs::block_extensions(extensions.clone()),
            PolicySpec::ContractorCannotWritePii => policy::policy(access::contractor_cannot_write_pii),
            PolicySpec::RequireActorRole { roles } => access::require_actor_role(roles.clone()),
            PolicySpec::WithinMaintenanceWindow {
                start_hour_utc,
                end_hour_utc,
            } => time::within_maintenance_window(*start_hour_utc, *end_hour_utc),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub receipts: ReceiptsConfig,
    #[serde(default)]
    pub systems: SystemsConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<PolicySpec>,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            receipts: ReceiptsConfig::default(),
            systems: SystemsConfig::default(),
            policies: Vec::new(),
        }
    }
}

impl Config {
    /// What `enact init` writes: the project directory as a filesystem
    /// system, with secret-bearing files off limits.
    pub fn starter() -> Self {
        Self {
            systems: SystemsConfig {
                filesystem: Some(FilesystemConfig {
                    base_dir: ".".to_string(),
                    allowed_actions: None,
                }),
                ..SystemsConfig::default()
            },
            policies: vec![PolicySpec::BlockExtensions {
                extensions: vec![".env".into(), ".pem".into(), ".key".into()],
            }],
            ..Self::default()
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(EnactError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Write the config unless one is already there. Returns true if written.
    pub fn save_if_missing(&self, root: &Path) -> Result<bool> {
        let data = serde_yaml::to_string(self)?;
        crate::io::write_if_missing(&paths::config_path(root), data.as_bytes())
    }

    pub fn receipts_dir(&self, root: &Path) -> PathBuf {
        paths::resolve_in(root, &self.receipts.dir)
    }

    /// The signing secret from `receipts.secret_env`, or [`DEV_SECRET`].
    pub fn secret(&self) -> Vec<u8> {
        match std::env::var(&self.receipts.secret_env) {
            Ok(value) if !value.is_empty() => value.into_bytes(),
            _ => {
                tracing::warn!(
                    env = %self.receipts.secret_env,
                    "signing secret not set; using the development secret"
                );
                DEV_SECRET.as_bytes().to_vec()
            }
        }
    }

    pub fn build_policies(&self) -> Vec<Policy> {
        self.policies.iter().map(PolicySpec::build).collect()
    }

    /// Construct a connector for every configured system. Credentials come
    /// from the environment at this point, so a missing token fails here
    /// rather than halfway through a run.
    pub fn build_systems(&self, root: &Path) -> Result<Systems> {
        let mut systems = Systems::new();

        if let Some(c) = &self.systems.github {
            let token = credential(&c.token_env)?;
            let mut connector = GitHubConnector::new(token, c.allowed_actions.clone())?;
            if let Some(url) = &c.base_url {
                connector = connector.with_base_url(url.clone());
            }
            systems.insert(github::SYSTEM.to_string(), Arc::new(connector));
        }
        if let Some(c) = &self.systems.slack {
            let token = credential(&c.token_env)?;
            let mut connector = SlackConnector::new(token, c.allowed_actions.clone())?;
            if let Some(url) = &c.base_url {
                connector = connector.with_base_url(url.clone());
            }
            systems.insert(slack::SYSTEM.to_string(), Arc::new(connector));
        }
        if let Some(c) = &self.systems.sqlite {
            let connector = SqliteConnector::open(paths::resolve_in(root, &c.path), c.allowed_actions.clone())?;
            systems.insert(sqlite::SYSTEM.to_string(), Arc::new(connector));
        }
        if let Some(c) = &self.systems.filesystem {
            let connector = FilesystemConnector::new(paths::resolve_in(root, &c.base_dir), c.allowed_actions.clone())
                .with_protected(paths::enact_dir(root))
                .with_protected(self.receipts_dir(root));
            systems.insert(filesystem::SYSTEM.to_string(), Arc::new(connector));
        }

        tracing::debug!(systems = ?systems.keys().collect::<Vec<_>>(), "connectors built");
        Ok(systems)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.version != 1 {
            warnings.push(ConfigWarning::warning(format!(
                "unsupported config version {} (expected 1)",
                self.version
            )));
        }

        if self.systems.is_empty() {
            warnings.push(ConfigWarning::warning("no systems configured; every workflow will fail"));
        }

        for (system, configured, defaults, known) in self.systems.allowlists() {
            let allowed: Vec<&str> = match configured {
                Some(list) => list.iter().map(String::as_str).collect(),
                None => defaults.to_vec(),
            };
            for action in &allowed {
                if !known.contains(action) {
                    warnings.push(ConfigWarning::error(format!(
                        "unknown action '{action}' in systems.{system}.allowed_actions"
                    )));
                    continue;
                }
                let missing: Vec<&str> = inverse_actions(system, action)
                    .iter()
                    .copied()
                    .filter(|inverse| !allowed.contains(inverse))
                    .collect();
                if !missing.is_empty() {
                    warnings.push(ConfigWarning::warning(format!(
                        "{system} allows '{action}' but not {missing:?}; its runs cannot be rolled back"
                    )));
                }
            }
        }

        for spec in &self.policies {
            match spec {
                PolicySpec::RequireChannelAllowlist { channels } if channels.is_empty() => {
                    warnings.push(ConfigWarning::warning(
                        "require_channel_allowlist has no channels and blocks every post",
                    ));
                }
                PolicySpec::RestrictPaths { dirs } if dirs.is_empty() => {
                    warnings.push(ConfigWarning::warning(
                        "restrict_paths has no directories and blocks every path",
                    ));
                }
                PolicySpec::RequireActorRole { roles } if roles.is_empty() => {
                    warnings.push(ConfigWarning::warning(
                        "require_actor_role has no roles and blocks every actor that states one",
                    ));
                }
                PolicySpec::WithinMaintenanceWindow {
                    start_hour_utc,
                    end_hour_utc,
                } => {
                    if *start_hour_utc > 23 || *end_hour_utc > 24 {
                        warnings.push(ConfigWarning::error(format!(
                            "maintenance window {start_hour_utc}-{end_hour_utc} is outside 0-24"
                        )));
                    } else if start_hour_utc == end_hour_utc {
                        warnings.push(ConfigWarning::warning(format!(
                            "maintenance window {start_hour_utc}-{end_hour_utc} is empty and blocks every run"
                        )));
                    }
                }
                _ => {}
            }
        }

        warnings
    }
}

fn credential(env: &str) -> Result<String> {
    match std::env::var(env) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(EnactError::MissingCredential(env.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
