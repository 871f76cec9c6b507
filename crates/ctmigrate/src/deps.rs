//! PATH checks for the external tools a migration shells out to.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStatus {
    pub name: String,
    pub path: Option<PathBuf>,
}

impl ToolStatus {
    pub fn available(&self) -> bool {
        self.path.is_some()
    }
}

/// Resolve `tool` like a shell would. Names containing `/` are checked
/// as paths.
pub fn which(tool: &str) -> Option<PathBuf> {
    let tool = tool.trim();
    if tool.is_empty() {
        return None;
    }
    if tool.contains('/') {
        let p = PathBuf::from(tool);
        return is_executable(&p).then_some(p);
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|p| is_executable(p))
}

fn is_executable(p: &Path) -> bool {
    let Ok(meta) = p.metadata() else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

pub fn check<S: AsRef<str>>(tools: &[S]) -> Vec<ToolStatus> {
    tools
        .iter()
        .map(|t| ToolStatus {
            name: t.as_ref().to_string(),
            path: which(t.as_ref()),
        })
        .collect()
}

/// Error naming every missing tool, if any.
pub fn require<S: AsRef<str>>(tools: &[S]) -> Result<()> {
    let missing: Vec<String> = check(tools)
        .into_iter()
        .filter(|s| !s.available())
        .map(|s| s.name)
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(Error::new(
        ErrorKind::Dependency,
        format!("required tools not found on PATH: {}", missing.join(", ")),
    ))
}
