use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use enact_core::config::Config;
use enact_core::receipt::{render_receipt, verify_signature, ReceiptStore};
use std::path::Path;
use uuid::Uuid;

#[derive(Subcommand)]
pub enum ReceiptSubcommand {
    /// List receipts, newest first
    List,

    /// Show one receipt
    Show { run_id: Uuid },

    /// Check a receipt's signature against the configured secret
    Verify { run_id: Uuid },
}

pub fn run(root: &Path, subcmd: ReceiptSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let store = ReceiptStore::new(config.receipts_dir(root));
    match subcmd {
        ReceiptSubcommand::List => list(&store, json),
        ReceiptSubcommand::Show { run_id } => show(&store, run_id, json),
        ReceiptSubcommand::Verify { run_id } => verify(&store, &config, run_id, json),
    }
}

fn list(store: &ReceiptStore, json: bool) -> anyhow::Result<()> {
    let receipts = store.list().context("failed to read receipts")?;
    if json {
        return print_json(&receipts);
    }
    if receipts.is_empty() {
        println!("No receipts.");
        return Ok(());
    }
    let rows = receipts
        .iter()
        .map(|r| {
            vec![
                r.run_id.to_string(),
                r.workflow.clone(),
                r.actor.clone(),
                r.decision.to_string(),
                r.actions_taken.len().to_string(),
                r.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                r.rollback_of.map(|id| id.to_string()).unwrap_or_default(),
            ]
        })
        .collect();
    print_table(
        &["RUN", "WORKFLOW", "ACTOR", "DECISION", "ACTIONS", "TIME (UTC)", "ROLLBACK OF"],
        rows,
    );
    Ok(())
}

fn show(store: &ReceiptStore, run_id: Uuid, json: bool) -> anyhow::Result<()> {
    let receipt = store.load(run_id)?;
    if json {
        return print_json(&receipt);
    }
    println!("{}", render_receipt(&receipt));
    Ok(())
}

fn verify(store: &ReceiptStore, config: &Config, run_id: Uuid, json: bool) -> anyhow::Result<()> {
    let receipt = store.load(run_id)?;
    let valid = verify_signature(&receipt, &config.secret());
    if json {
        print_json(&serde_json::json!({ "run_id": run_id, "valid": valid }))?;
    } else if valid {
        println!("Signature valid: {run_id}");
    }
    if !valid {
        anyhow::bail!("signature does not match for {run_id}");
    }
    Ok(())
}
