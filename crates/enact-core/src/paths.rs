use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const ENACT_DIR: &str = ".enact";
pub const CONFIG_FILE: &str = ".enact/config.yaml";
pub const RECEIPTS_DIR: &str = ".enact/receipts";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn enact_dir(root: &Path) -> PathBuf {
    root.join(ENACT_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn receipts_dir(root: &Path) -> PathBuf {
    root.join(RECEIPTS_DIR)
}

/// Config paths are relative to the project root unless absolute.
pub fn resolve_in(root: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}
