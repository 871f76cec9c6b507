use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_root_dir() -> String {
    ".".into()
}

fn default_state_dir() -> String {
    "state".into()
}

fn default_work_dir() -> String {
    "work".into()
}

fn default_log_dir() -> String {
    "logs".into()
}

fn default_key_dir() -> String {
    "keys".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    // Scratch space for captured archives and build contexts; needs room
    // for a full compressed copy of the source filesystem.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_key_dir")]
    pub key_dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            state_dir: default_state_dir(),
            work_dir: default_work_dir(),
            log_dir: default_log_dir(),
            key_dir: default_key_dir(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub work_dir: PathBuf,
    pub log_dir: PathBuf,
    pub key_dir: PathBuf,
}

impl WorkspacePaths {
    /// All directories rooted at `root`, using the default layout.
    pub fn under(root: &Path) -> Self {
        let cfg = WorkspaceConfig::default();
        Self {
            root: root.to_path_buf(),
            state_dir: root.join(cfg.state_dir),
            work_dir: root.join(cfg.work_dir),
            log_dir: root.join(cfg.log_dir),
            key_dir: root.join(cfg.key_dir),
        }
    }

    /// Scratch directory owned by one migration.
    pub fn scratch_dir(&self, migration_id: &str) -> PathBuf {
        self.work_dir.join(migration_id)
    }

    /// Remove leftovers of an earlier, interrupted conversion attempt.
    pub fn clear_scratch(&self, migration_id: &str) -> Result<()> {
        safe_remove_dir_all(&self.work_dir, &self.scratch_dir(migration_id))
    }
}

pub fn load_paths(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::config(format!("cwd error: {e}")))?;
    let root = resolve_user_path(&cwd, &cfg.root_dir)?;
    Ok(WorkspacePaths {
        state_dir: resolve_user_dir(&root, &cfg.state_dir)?,
        work_dir: resolve_user_dir(&root, &cfg.work_dir)?,
        log_dir: resolve_user_dir(&root, &cfg.log_dir)?,
        key_dir: resolve_user_dir(&root, &cfg.key_dir)?,
        root,
    })
}

pub fn init_dirs(paths: &WorkspacePaths) -> Result<()> {
    for dir in [
        &paths.state_dir,
        &paths.work_dir,
        &paths.log_dir,
        &paths.key_dir,
    ] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::config(format!("failed to create {}: {e}", dir.display())))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&paths.key_dir, fs::Permissions::from_mode(0o700)).map_err(|e| {
            Error::config(format!(
                "failed to restrict {}: {e}",
                paths.key_dir.display()
            ))
        })?;
    }
    Ok(())
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace dir"));
    }
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::config(format!(
            "invalid workspace dir '{p}' (contains '..')"
        )));
    }
    resolve_user_path(root, p)
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn safe_remove_dir_all(parent: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let parent_can = parent
        .canonicalize()
        .unwrap_or_else(|_| parent.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&parent_can) || dir_can == parent_can {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (outside '{}')",
            dir_can.display(),
            parent_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_components_rejected() {
        let err = resolve_user_dir(Path::new("/srv/ctm"), "../state").unwrap_err();
        assert!(err.to_string().contains(".."), "unexpected err: {err}");
    }

    #[test]
    fn clear_scratch_only_touches_own_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = WorkspacePaths::under(tmp.path());
        init_dirs(&paths).expect("init");
        let mine = paths.scratch_dir("20240101_000000");
        let other = paths.scratch_dir("20240101_000001");
        fs::create_dir_all(&mine).expect("mine");
        fs::create_dir_all(&other).expect("other");
        fs::write(mine.join("partial.tar.gz"), b"xx").expect("partial");

        paths.clear_scratch("20240101_000000").expect("clear");
        assert!(!mine.exists());
        assert!(other.exists());
        paths.clear_scratch("never-created").expect("missing is fine");
    }
}
