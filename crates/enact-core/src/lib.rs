pub mod client;
pub mod config;
pub mod connector;
pub mod connectors;
pub mod error;
pub mod executor;
pub mod io;
pub mod models;
pub mod paths;
pub mod policy;
pub mod receipt;
pub mod rollback;
pub mod workflow;

pub use client::{EnactClient, EnactClientBuilder};
pub use connector::{Allowlist, Connector, Systems};
pub use error::{EnactError, Result};
pub use models::{ActionResult, Decision, PolicyResult, Receipt, RunResult, WorkflowContext};
