use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Sidecar written next to an approved image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveReceipt {
    pub schema_version: u64,
    pub prompt: String,
    pub provider: String,
    pub content_type: String,
    pub image_path: String,
    pub byte_len: u64,
    pub sha256: String,
    /// Generations run in the session, including rejected ones.
    pub generations: u32,
    pub saved_at: String,
}

/// `photo.png` -> `photo.png.json`.
pub fn receipt_path_for(image_path: &Path) -> PathBuf {
    let mut name = image_path
        .file_name()
        .map(|value| value.to_os_string())
        .unwrap_or_default();
    name.push(".json");
    image_path.with_file_name(name)
}

pub fn write_receipt(path: &Path, receipt: &SaveReceipt) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut staged = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to stage receipt in {}", parent.display()))?;
    staged.write_all(serde_json::to_string_pretty(receipt)?.as_bytes())?;
    staged
        .persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

pub fn read_receipt(path: &Path) -> anyhow::Result<SaveReceipt> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid receipt {}", path.display()))
}
