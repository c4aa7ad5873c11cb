use crate::output::{print_json, print_table};
use anyhow::Context;
use enact_core::receipt::render_receipt;
use enact_core::workflow::WorkflowRegistry;
use serde_json::{Map, Value};
use std::path::Path;

pub fn run(
    root: &Path,
    workflow: &str,
    actor: &str,
    payload: Option<&str>,
    payload_file: Option<&Path>,
    json: bool,
) -> anyhow::Result<()> {
    let payload = read_payload(payload, payload_file)?;
    let client = super::client(root)?;
    let (result, receipt) = client
        .run(workflow, actor, payload)
        .with_context(|| format!("workflow '{workflow}' failed"))?;

    if json {
        print_json(&serde_json::json!({ "result": result, "receipt": receipt }))?;
    } else {
        println!("{}", render_receipt(&receipt));
    }

    if !result.success {
        anyhow::bail!("run {} did not complete ({})", receipt.run_id, receipt.decision);
    }
    Ok(())
}

fn read_payload(inline: Option<&str>, file: Option<&Path>) -> anyhow::Result<Map<String, Value>> {
    let raw = match (inline, file) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => return Ok(Map::new()),
    };
    match serde_json::from_str::<Value>(&raw).context("payload is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("payload must be a JSON object, got {other}"),
    }
}

pub fn list_workflows(json: bool) -> anyhow::Result<()> {
    let names = WorkflowRegistry::with_builtins().names();
    if json {
        return print_json(&names);
    }
    print_table(&["WORKFLOW"], names.into_iter().map(|n| vec![n]).collect());
    Ok(())
}
