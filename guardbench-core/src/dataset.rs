//! Input record interface.
//!
//! Dataset loading proper (CSV/XLSX readers, column guessing) lives with
//! external tooling; the engine consumes a JSON array matching the input
//! record schema. This module is that boundary.

use crate::error::{ConfigError, Result};
use crate::types::PromptRecord;
use std::path::Path;
use tracing::info;

/// Load input records from a JSON array file.
///
/// Records with an empty prompt are dropped, mirroring what dataset
/// loaders feed the engine.
pub fn load_records(path: &Path) -> Result<Vec<PromptRecord>> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound { path: path.into() }.into());
    }
    let raw = std::fs::read_to_string(path)?;
    let records: Vec<PromptRecord> = serde_json::from_str(&raw)?;
    let total = records.len();
    let records: Vec<PromptRecord> = records
        .into_iter()
        .filter(|r| !r.prompt.trim().is_empty())
        .collect();
    if records.len() < total {
        info!(
            dropped = total - records.len(),
            "Dropped records with empty prompts"
        );
    }
    info!(records = records.len(), path = %path.display(), "Records loaded");
    Ok(records)
}
