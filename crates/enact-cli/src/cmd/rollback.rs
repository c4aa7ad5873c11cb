use crate::output::print_json;
use anyhow::Context;
use enact_core::receipt::render_receipt;
use std::path::Path;
use uuid::Uuid;

pub fn run(root: &Path, run_id: Uuid, actor: &str, json: bool) -> anyhow::Result<()> {
    let client = super::client(root)?;
    let (result, receipt) = client
        .rollback(run_id, actor)
        .with_context(|| format!("rollback of {run_id} failed"))?;

    if json {
        print_json(&serde_json::json!({ "result": result, "receipt": receipt }))?;
    } else {
        println!("{}", render_receipt(&receipt));
    }

    if !result.success {
        anyhow::bail!(
            "rollback of {run_id} stopped early ({}); see receipt {}",
            receipt.decision,
            receipt.run_id
        );
    }
    Ok(())
}
