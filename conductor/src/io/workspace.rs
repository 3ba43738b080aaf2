//! Project working directory with root-confined file access.
//!
//! Paths supplied by the model are resolved lexically against the root. Absolute
//! paths and `..` segments that climb above the root are rejected.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

/// A project's working directory.
///
/// Mutations take an internal lock so concurrent workers in the same project
/// never interleave partial writes.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if absent.
    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create project directory {}", self.root.display()))
    }

    /// Resolve `relative` under the root, refusing anything that escapes it.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        Ok(self.root.join(confine(relative)?))
    }

    /// Write `content` to `relative`, creating intermediate directories.
    pub fn write_file(&self, relative: &str, content: &str) -> Result<PathBuf> {
        let path = self.resolve(relative)?;
        let _guard = self.lock();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
        debug!(path = %path.display(), bytes = content.len(), "wrote file");
        Ok(path)
    }

    /// Read `relative` as UTF-8 text.
    pub fn read_file(&self, relative: &str) -> Result<String> {
        let path = self.resolve(relative)?;
        if !path.is_file() {
            return Err(anyhow!("file not found"));
        }
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded value is `()`, so a poisoned lock carries no broken state.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Normalize `relative` into a path that stays below its root.
fn confine(relative: &str) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(anyhow!("path escapes project directory: {relative}"));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!("absolute paths are not allowed: {relative}"));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(anyhow!("path names no file: {relative:?}"));
    }
    Ok(normalized)
}
