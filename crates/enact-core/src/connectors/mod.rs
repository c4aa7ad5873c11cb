//! Built-in connectors.
//!
//! | system       | backing                          |
//! |--------------|----------------------------------|
//! | `github`     | GitHub REST v3 (blocking reqwest)|
//! | `slack`      | Slack Web API (blocking reqwest) |
//! | `sqlite`     | rusqlite connection              |
//! | `filesystem` | std::fs confined to a base dir   |

pub mod filesystem;
pub mod github;
pub(crate) mod http;
pub mod slack;
pub mod sqlite;

pub use filesystem::FilesystemConnector;
pub use github::GitHubConnector;
pub use slack::SlackConnector;
pub use sqlite::SqliteConnector;

use std::fmt::Display;

/// Resolve an idempotency check. A failed check is logged and treated as
/// "not found" so detection problems never block the mutation itself.
pub(crate) fn detected<T, E: Display>(
    system: &str,
    action: &str,
    check: std::result::Result<Option<T>, E>,
) -> Option<T> {
    match check {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(system, action, error = %e, "idempotency check failed; attempting the action");
            None
        }
    }
}
