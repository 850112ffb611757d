//! Persistent node identity
//!
//! A node's name is chosen once and reused across restarts: the rest of
//! the cluster keys membership, token ownership, hints and work items
//! on it. The name is stored as a single UTF-8 line next to the other
//! local state.

use crate::{Error, Result};
use std::path::Path;

const IDENTITY_FILE: &str = "identity";

/// Load the persisted node name, or create one on first launch.
///
/// Priority: an explicit override, then a previously persisted name,
/// then the OS hostname (persisted for next time).
pub fn load_or_create(meta_dir: &Path, override_name: Option<&str>) -> Result<String> {
    std::fs::create_dir_all(meta_dir)?;
    let path = meta_dir.join(IDENTITY_FILE);

    if let Some(name) = override_name {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Config("node name override is empty".to_string()));
        }
        std::fs::write(&path, format!("{name}\n"))?;
        return Ok(name.to_string());
    }

    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        let name = raw.trim();
        if !name.is_empty() {
            return Ok(name.to_string());
        }
    }

    let name = hostname::get()
        .map_err(Error::Io)?
        .to_string_lossy()
        .trim()
        .to_string();
    if name.is_empty() {
        return Err(Error::Config(
            "cannot derive a node name from the hostname; pass --node-name".to_string(),
        ));
    }
    std::fs::write(&path, format!("{name}\n"))?;
    Ok(name)
}
