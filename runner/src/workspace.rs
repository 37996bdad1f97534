use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Refusing to clear {0:?}")]
    Refused(PathBuf),
    #[error("{0:?} is not a directory")]
    NotADirectory(PathBuf),
    #[error("Failed to clear {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Remove everything inside `dir` but keep `dir` itself. Clearing an empty directory is a no-op.
pub fn clear_dir(dir: &Path) -> Result<usize, WorkspaceError> {
    if dir.as_os_str().is_empty() || dir.parent().is_none() {
        return Err(WorkspaceError::Refused(dir.to_path_buf()));
    }

    if !dir.is_dir() {
        return Err(WorkspaceError::NotADirectory(dir.to_path_buf()));
    }

    let mut removed = 0;

    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(io_error(&path))?;

        if file_type.is_dir() {
            fs::remove_dir_all(&path).map_err(io_error(&path))?;
        } else {
            fs::remove_file(&path).map_err(io_error(&path))?;
        }

        removed += 1;
    }

    debug!(dir = ?dir, removed, "Cleared directory");

    Ok(removed)
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> WorkspaceError {
    let path = path.to_path_buf();

    move |source| WorkspaceError::Io { path, source }
}

/// Copy `files` into `dir`, keeping their file names
pub fn copy_into(files: &[PathBuf], dir: &Path) -> Result<(), WorkspaceError> {
    for file in files {
        let Some(name) = file.file_name() else {
            return Err(WorkspaceError::Refused(file.clone()));
        };
        let target = dir.join(name);

        fs::copy(file, &target).map_err(|source| WorkspaceError::Io {
            path: target.clone(),
            source,
        })?;
    }

    Ok(())
}
