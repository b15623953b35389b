//! File primitives confined to a working directory.

use std::path::{Component, Path, PathBuf};

/// Resolve `relative` inside `workdir`.
///
/// Absolute paths and any `..` component are rejected, so the result can
/// never name a file outside the working directory.
pub fn resolve(workdir: &Path, relative: &str) -> Result<PathBuf, String> {
    if relative.is_empty() {
        return Err("path must not be empty".to_string());
    }
    let path = Path::new(relative);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(format!("path '{}' escapes the working directory", relative)),
        }
    }
    Ok(workdir.join(path))
}

pub fn read(workdir: &Path, relative: &str) -> Result<String, String> {
    let path = resolve(workdir, relative)?;
    std::fs::read_to_string(&path).map_err(|e| format!("cannot read '{}': {}", relative, e))
}

pub fn write(workdir: &Path, relative: &str, content: &str) -> Result<(), String> {
    let path = resolve(workdir, relative)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create '{}': {}", relative, e))?;
    }
    std::fs::write(&path, content).map_err(|e| format!("cannot write '{}': {}", relative, e))
}

/// Names of the entries directly under the working directory, sorted.
pub fn list(workdir: &Path) -> Result<Vec<String>, String> {
    let entries = std::fs::read_dir(workdir).map_err(|e| format!("cannot list working directory: {}", e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| e.to_string())?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}
