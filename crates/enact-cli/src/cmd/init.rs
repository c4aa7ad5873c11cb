use anyhow::Context;
use enact_core::{config::Config, io, paths};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing enact in: {}", root.display());

    let receipts = paths::receipts_dir(root);
    io::ensure_dir(&receipts).with_context(|| format!("failed to create {}", receipts.display()))?;

    let created = Config::starter()
        .save_if_missing(root)
        .context("failed to write config.yaml")?;
    if created {
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }
    println!("  ready:   {}", paths::RECEIPTS_DIR);
    Ok(())
}
