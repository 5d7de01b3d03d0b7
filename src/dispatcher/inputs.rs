use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DispatchError;

/// Regular files in `dir` with the given extension (case-insensitive),
/// sorted by file name. Fails if there are none.
pub fn discover_inputs(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, DispatchError> {
    let extension = extension.trim_start_matches('.');
    let entries = fs::read_dir(dir).map_err(|source| DispatchError::InputDir {
        dir: dir.display().to_string(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(extension))
        })
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    if files.is_empty() {
        return Err(DispatchError::NoInputs {
            dir: dir.display().to_string(),
            extension: extension.to_string(),
        });
    }
    Ok(files)
}
