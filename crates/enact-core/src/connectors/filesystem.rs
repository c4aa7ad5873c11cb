//! Local file operations confined to a base directory.
//!
//! Paths are resolved lexically against the base: `..` may not climb above
//! it and absolute paths are rejected. Symlinks inside the base are followed
//! as-is. Protected directories under the base (the `.enact/` state
//! directory when built from config) are refused like escaping paths.

use crate::connector::{parse_args, unknown_action, Allowlist, Connector};
use crate::error::Result;
use crate::io::atomic_write;
use crate::models::{fields, ActionResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

pub const SYSTEM: &str = "filesystem";

pub const DEFAULT_ACTIONS: &[&str] = &["read_file", "write_file", "list_dir"];

pub const ACTIONS: &[&str] = &["read_file", "write_file", "delete_file", "list_dir"];

pub struct FilesystemConnector {
    base: PathBuf,
    protected: Vec<PathBuf>,
    allowlist: Allowlist,
}

impl FilesystemConnector {
    pub fn new(base_dir: impl Into<PathBuf>, allowed_actions: Option<Vec<String>>) -> Self {
        Self {
            base: base_dir.into(),
            protected: Vec::new(),
            allowlist: Allowlist::or_defaults(allowed_actions, DEFAULT_ACTIONS),
        }
    }

    /// Refuse every path at or below `dir`.
    pub fn with_protected(mut self, dir: impl AsRef<Path>) -> Self {
        self.protected.push(normalize(dir.as_ref()));
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    /// `None` when `path` escapes the base directory.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let mut relative = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !relative.pop() {
                        return None;
                    }
                }
                Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(self.base.join(relative))
    }

    fn is_protected(&self, resolved: &Path) -> bool {
        let resolved = normalize(resolved);
        self.protected.iter().any(|dir| resolved.starts_with(dir))
    }

    fn confined(&self, action: &str, path: &str) -> std::result::Result<PathBuf, ActionResult> {
        let resolved = self.resolve(path).ok_or_else(|| {
            tracing::warn!(system = SYSTEM, action, path, "path escapes base directory");
            ActionResult::failure(
                SYSTEM,
                action,
                format!("path '{path}' resolves outside the base directory"),
            )
        })?;
        if self.is_protected(&resolved) {
            tracing::warn!(system = SYSTEM, action, path, "path is inside a protected directory");
            return Err(ActionResult::failure(
                SYSTEM,
                action,
                format!("path '{path}' is inside a protected directory"),
            ));
        }
        Ok(resolved)
    }

    pub fn read_file(&self, path: &str) -> Result<ActionResult> {
        const ACTION: &str = "read_file";
        self.check_allowed(ACTION)?;
        let resolved = match self.confined(ACTION, path) {
            Ok(p) => p,
            Err(blocked) => return Ok(blocked),
        };
        let result = match std::fs::read_to_string(&resolved) {
            Ok(content) => ActionResult::read(SYSTEM, ACTION, fields(json!({"path": path, "content": content}))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                ActionResult::failure(SYSTEM, ACTION, format!("file not found: {path}"))
            }
            Err(e) => ActionResult::failure(SYSTEM, ACTION, e),
        };
        Ok(result)
    }

    pub fn list_dir(&self, path: &str) -> Result<ActionResult> {
        const ACTION: &str = "list_dir";
        self.check_allowed(ACTION)?;
        let resolved = match self.confined(ACTION, path) {
            Ok(p) => p,
            Err(blocked) => return Ok(blocked),
        };
        let listing = std::fs::read_dir(&resolved).and_then(|entries| {
            let mut names = entries
                .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
                .collect::<std::io::Result<Vec<_>>>()?;
            names.sort();
            Ok(names)
        });
        let result = match listing {
            Ok(entries) => ActionResult::read(SYSTEM, ACTION, fields(json!({"path": path, "entries": entries}))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                ActionResult::failure(SYSTEM, ACTION, format!("directory not found: {path}"))
            }
            Err(e) => ActionResult::failure(SYSTEM, ACTION, e),
        };
        Ok(result)
    }

    /// Write UTF-8 `content`, creating parent directories. Rolling back a
    /// write to a new file deletes it; otherwise the previous content returns.
    pub fn write_file(&self, path: &str, content: &str) -> Result<ActionResult> {
        const ACTION: &str = "write_file";
        self.check_allowed(ACTION)?;
        let resolved = match self.confined(ACTION, path) {
            Ok(p) => p,
            Err(blocked) => return Ok(blocked),
        };
        let run = || -> Result<ActionResult> {
            let previous = match std::fs::read_to_string(&resolved) {
                Ok(existing) => Some(existing),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            if previous.as_deref() == Some(content) {
                return Ok(ActionResult::already(SYSTEM, ACTION, "written", fields(json!({"path": path}))));
            }
            atomic_write(&resolved, content.as_bytes())?;
            Ok(ActionResult::mutated(
                SYSTEM,
                ACTION,
                fields(json!({"path": path})),
                fields(json!({"path": path, "previous_content": previous})),
            ))
        };
        Ok(run().unwrap_or_else(|e| ActionResult::failure(SYSTEM, ACTION, e)))
    }

    pub fn delete_file(&self, path: &str) -> Result<ActionResult> {
        const ACTION: &str = "delete_file";
        self.check_allowed(ACTION)?;
        let resolved = match self.confined(ACTION, path) {
            Ok(p) => p,
            Err(blocked) => return Ok(blocked),
        };
        let run = || -> Result<ActionResult> {
            let content = match std::fs::read_to_string(&resolved) {
                Ok(content) => content,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Ok(ActionResult::already(SYSTEM, ACTION, "deleted", fields(json!({"path": path}))));
                }
                Err(e) => return Err(e.into()),
            };
            std::fs::remove_file(&resolved)?;
            Ok(ActionResult::mutated(
                SYSTEM,
                ACTION,
                fields(json!({"path": path})),
                fields(json!({"path": path, "content": content})),
            ))
        };
        Ok(run().unwrap_or_else(|e| ActionResult::failure(SYSTEM, ACTION, e)))
    }
}

/// Fold `.` and `..` without touching the disk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[derive(Deserialize)]
struct PathArgs {
    path: String,
}

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

impl Connector for FilesystemConnector {
    fn system(&self) -> &'static str {
        SYSTEM
    }

    fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    fn is_read_only(&self, action: &str) -> bool {
        matches!(action, "read_file" | "list_dir")
    }

    fn invoke(&self, action: &str, args: &Value) -> Result<ActionResult> {
        self.check_allowed(action)?;
        match action {
            "read_file" => {
                let a: PathArgs = parse_args(SYSTEM, action, args)?;
                self.read_file(&a.path)
            }
            "list_dir" => {
                let a: PathArgs = parse_args(SYSTEM, action, args)?;
                self.list_dir(&a.path)
            }
            "write_file" => {
                let a: WriteArgs = parse_args(SYSTEM, action, args)?;
                self.write_file(&a.path, &a.content)
            }
            "delete_file" => {
                let a: PathArgs = parse_args(SYSTEM, action, args)?;
                self.delete_file(&a.path)
            }
            other => Err(unknown_action(SYSTEM, other)),
        }
    }
}
