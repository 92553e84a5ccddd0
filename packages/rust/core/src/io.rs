//! Reading the input export and writing the processed artifact.

use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, info, instrument};

use bookmarks_shared::{Bookmark, BookmarkError, RecordOutcome, Result};

/// Output field carrying the failure reason of a failed record.
pub const PROCESSING_ERROR_FIELD: &str = "processing_error";

/// Load a JSON array of bookmarks.
///
/// Malformed JSON and duplicate record identities are errors.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_records(path: &Path) -> Result<Vec<Bookmark>> {
    let content = std::fs::read_to_string(path).map_err(|e| BookmarkError::io(path, e))?;
    let records: Vec<Bookmark> = serde_json::from_str(&content)
        .map_err(|e| BookmarkError::parse(format!("{}: {e}", path.display())))?;

    let mut seen = HashSet::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let id = record.identity(index);
        if !seen.insert(id.clone()) {
            return Err(BookmarkError::validation(format!(
                "duplicate record identity {id} at position {index}"
            )));
        }
    }

    info!(count = records.len(), "loaded records");
    Ok(records)
}

/// Write one record per outcome, in input order, atomically.
///
/// Failed records are written as read, plus a `processing_error` field.
#[instrument(skip_all, fields(path = %path.display(), count = outcomes.len()))]
pub fn save_outcomes(path: &Path, outcomes: &[RecordOutcome]) -> Result<()> {
    let mut ordered: Vec<&RecordOutcome> = outcomes.iter().collect();
    ordered.sort_by_key(|outcome| outcome.index);

    let mut records = Vec::with_capacity(ordered.len());
    for outcome in ordered {
        let mut value = serde_json::to_value(&outcome.record)
            .map_err(|e| BookmarkError::parse(format!("cannot serialize {}: {e}", outcome.id)))?;
        if let (Some(reason), Value::Object(map)) = (&outcome.failure_reason, &mut value) {
            map.insert(PROCESSING_ERROR_FIELD.into(), Value::String(reason.clone()));
        }
        records.push(value);
    }

    let json = serde_json::to_string_pretty(&records)
        .map_err(|e| BookmarkError::parse(format!("cannot serialize output: {e}")))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| BookmarkError::io(parent, e))?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| BookmarkError::validation(format!("{} is not a file path", path.display())))?;
    let temp = path.with_file_name(format!(".{file_name}.tmp"));

    std::fs::write(&temp, json).map_err(|e| BookmarkError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| BookmarkError::io(path, e))?;

    debug!("output written");
    Ok(())
}
