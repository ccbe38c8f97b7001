use std::{fs, path::Path};

use crate::detector::ModelError;

/// Reads class names, one per line. Blank lines are skipped.
pub fn load_labels(path: &Path) -> Result<Vec<String>, ModelError> {
    let text = fs::read_to_string(path).map_err(|err| ModelError::Labels {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Class name for `class_id`, or the numeric id when the label table has no entry.
pub fn label_for(labels: &[String], class_id: i64) -> String {
    usize::try_from(class_id)
        .ok()
        .and_then(|idx| labels.get(idx))
        .cloned()
        .unwrap_or_else(|| class_id.to_string())
}
