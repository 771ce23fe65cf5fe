//! Process-level ownership of a storage directory.
//!
//! An opened `StorageEngine` holds an exclusive fs2 advisory lock on `<root>/LOCK`
//! for its whole lifetime, so two processes never replay or append to the same WAL.
//! Offline inspection tools (CLI `wal-dump`) take the shared mode and therefore
//! refuse to run next to a live engine.
//!
//! The lock is released on Drop.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::consts::LOCK_FILE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
pub struct DirLock {
    file: std::fs::File,
    path: PathBuf,
    mode: LockMode,
}

impl DirLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn open_lock_file(root: &Path) -> Result<(std::fs::File, PathBuf)> {
    let path = root.join(LOCK_FILE);
    let f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))?;
    Ok((f, path))
}

/// Take the directory lock without blocking; fails if another holder conflicts.
pub fn try_lock_dir(root: &Path, mode: LockMode) -> Result<DirLock> {
    let (file, path) = open_lock_file(root)?;
    match mode {
        LockMode::Shared => file
            .try_lock_shared()
            .with_context(|| format!("storage {} is locked by a writer", root.display()))?,
        LockMode::Exclusive => file
            .try_lock_exclusive()
            .with_context(|| format!("storage {} is already open", root.display()))?,
    }
    Ok(DirLock { file, path, mode })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_excludes_shared() -> Result<()> {
        let root = std::env::temp_dir().join(format!(
            "strata-lock-{}-{}",
            std::process::id(),
            crate::util::now_secs()
        ));
        std::fs::create_dir_all(&root)?;
        {
            let g = try_lock_dir(&root, LockMode::Exclusive)?;
            assert_eq!(g.mode(), LockMode::Exclusive);
            assert!(try_lock_dir(&root, LockMode::Shared).is_err());
        }
        let s1 = try_lock_dir(&root, LockMode::Shared)?;
        let s2 = try_lock_dir(&root, LockMode::Shared)?;
        assert!(s1.path().ends_with(LOCK_FILE));
        drop((s1, s2));
        let _ = std::fs::remove_dir_all(&root);
        Ok(())
    }
}
