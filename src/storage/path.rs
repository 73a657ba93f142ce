use std::path::PathBuf;

use super::StorageError;

fn home_dir() -> Result<PathBuf, StorageError> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
        .ok_or(StorageError::HomeDirectoryUnavailable)
}

pub(crate) fn expand_home_path(raw_path: &str) -> Result<PathBuf, StorageError> {
    for prefix in ["~", "$HOME"] {
        let Some(rest) = raw_path.strip_prefix(prefix) else {
            continue;
        };
        if rest.is_empty() {
            return home_dir();
        }
        if let Some(relative) = rest.strip_prefix('/') {
            return Ok(home_dir()?.join(relative));
        }
    }

    Ok(PathBuf::from(raw_path))
}
