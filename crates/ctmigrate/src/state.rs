use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::params::MigrationParameters;

const RECORD_PREFIX: &str = "migration_";
const RECORD_SUFFIX: &str = ".json";

// Ids handed out by this process that may not be on disk yet.
static ALLOCATED_IDS: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    New,
    InputCollected,
    Validated,
    Converting,
    Completed,
    Failed,
    Cancelled,
    Interrupted,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::New => "new",
            Step::InputCollected => "input_collected",
            Step::Validated => "validated",
            Step::Converting => "converting",
            Step::Completed => "completed",
            Step::Failed => "failed",
            Step::Cancelled => "cancelled",
            Step::Interrupted => "interrupted",
        }
    }

    /// Records at these steps were already confirmed by the operator, so a
    /// resume goes straight to capture.
    pub fn skips_confirmation(self) -> bool {
        matches!(self, Step::Validated | Step::Converting)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub migration_id: String,
    pub timestamp: String,
    pub step: Step,
    pub parameters: MigrationParameters,
}

impl MigrationRecord {
    fn fresh(migration_id: String) -> Self {
        Self {
            migration_id,
            timestamp: now_timestamp(),
            step: Step::New,
            parameters: MigrationParameters::new(),
        }
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.timestamp).ok()
    }

    fn is_structurally_valid(&self) -> bool {
        !self.migration_id.trim().is_empty() && self.parsed_timestamp().is_some()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Keep SSH and container passwords in the record so a resume does not
    /// ask for them again. Off by default.
    pub persist_credentials: bool,
}

/// File-backed store, one JSON document per migration id.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    persist_credentials: bool,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>, cfg: &StateConfig) -> Self {
        Self {
            dir: dir.into(),
            persist_credentials: cfg.persist_credentials,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn persists_credentials(&self) -> bool {
        self.persist_credentials
    }

    pub fn record_path(&self, migration_id: &str) -> PathBuf {
        self.dir
            .join(format!("{RECORD_PREFIX}{migration_id}{RECORD_SUFFIX}"))
    }

    /// Load the record for `migration_id` when one exists, otherwise start a
    /// new in-memory record under a fresh timestamp-derived id. Nothing is
    /// written until the first [`StateStore::save`].
    pub fn create_or_load(&self, migration_id: Option<&str>) -> Result<MigrationRecord> {
        if let Some(id) = migration_id.map(str::trim).filter(|s| !s.is_empty())
            && let Some(record) = self.load(id)?
        {
            return Ok(record);
        }
        Ok(MigrationRecord::fresh(self.allocate_id()?))
    }

    pub fn load(&self, migration_id: &str) -> Result<Option<MigrationRecord>> {
        let path = self.record_path(migration_id);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .map_err(|e| Error::state(format!("failed to read {}: {e}", path.display())))?;
        let record = serde_json::from_str::<MigrationRecord>(&raw)
            .map_err(|e| Error::state(format!("failed to parse {}: {e}", path.display())))?;
        Ok(Some(record))
    }

    /// Overwrite the record's parameters and step and refresh its timestamp.
    /// Failure here is fatal for the run: without a durable write there is
    /// nothing to resume from.
    pub fn save(
        &self,
        record: &mut MigrationRecord,
        parameters: &MigrationParameters,
        step: Step,
    ) -> Result<()> {
        record.parameters = if self.persist_credentials {
            parameters.clone()
        } else {
            parameters.without_secrets()
        };
        record.step = step;
        record.timestamp = now_timestamp();

        let body = serde_json::to_string_pretty(record)
            .map_err(|e| Error::state(format!("failed to encode migration record: {e}")))?;
        let path = self.record_path(&record.migration_id);
        atomic_write_private(&path, &body)?;
        debug!(migration_id = %record.migration_id, step = %step, "state saved");
        Ok(())
    }

    /// Every record not at `completed`, newest first. Unparsable files are
    /// deleted on the way.
    pub fn list_incomplete(&self) -> Result<Vec<MigrationRecord>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| Error::state(format!("failed to list {}: {e}", self.dir.display())))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(RECORD_PREFIX) && n.ends_with(RECORD_SUFFIX))
            })
            .collect();
        paths.sort();

        let mut out = Vec::new();
        for path in paths {
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable state record: {e}");
                    continue;
                }
            };
            match serde_json::from_str::<MigrationRecord>(&raw) {
                Ok(record) if record.step != Step::Completed && record.is_structurally_valid() => {
                    out.push(record)
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), "removing corrupt state record: {e}");
                    let _ = fs::remove_file(&path);
                }
            }
        }
        out.sort_by(|a, b| {
            b.parsed_timestamp()
                .cmp(&a.parsed_timestamp())
                .then_with(|| b.migration_id.cmp(&a.migration_id))
        });
        Ok(out)
    }

    pub fn clear(&self, migration_id: &str) -> Result<()> {
        let path = self.record_path(migration_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::state(format!(
                "failed to remove {}: {e}",
                path.display()
            ))),
        }
    }

    fn allocate_id(&self) -> Result<String> {
        let base = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut allocated = ALLOCATED_IDS
            .lock()
            .map_err(|_| Error::state("migration id allocator poisoned"))?;
        let mut n = 1u32;
        loop {
            let candidate = if n == 1 {
                base.clone()
            } else {
                format!("{base}_{n}")
            };
            if !allocated.contains(&candidate) && !self.record_path(&candidate).exists() {
                allocated.insert(candidate.clone());
                return Ok(candidate);
            }
            n += 1;
        }
    }
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// Temp file + rename so a crash never leaves a half-written record. Mode
// 0600 because records may hold credentials.
fn atomic_write_private(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::state(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::state(format!("invalid state path {}", path.display())))?;
    let tmp = path.with_file_name(format!(
        ".{file_name}.tmp.{}.{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let write = opts.open(&tmp).and_then(|mut f| {
        f.write_all(body.as_bytes())?;
        f.sync_all()
    });
    if let Err(e) = write {
        let _ = fs::remove_file(&tmp);
        return Err(Error::state(format!(
            "failed to write {}: {e}",
            tmp.display()
        )));
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::state(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{NAME, SSH_PASSWORD};

    #[test]
    fn step_serializes_snake_case() {
        let s = serde_json::to_string(&Step::InputCollected).expect("encode");
        assert_eq!(s, "\"input_collected\"");
        assert_eq!(Step::Converting.to_string(), "converting");
        assert!(Step::Validated.skips_confirmation());
        assert!(!Step::Failed.skips_confirmation());
    }

    #[test]
    fn ids_are_unique_within_a_process() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(tmp.path(), &StateConfig::default());
        let a = store.create_or_load(None).expect("a");
        let b = store.create_or_load(None).expect("b");
        assert_ne!(a.migration_id, b.migration_id);
        assert_eq!(a.step, Step::New);
        assert!(a.parameters.is_empty());
    }

    #[test]
    fn credentials_follow_policy() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let params = MigrationParameters::from_pairs([(NAME, "web1"), (SSH_PASSWORD, "hunter22")]);

        let plain = StateStore::new(tmp.path().join("a"), &StateConfig::default());
        let mut r = plain.create_or_load(None).expect("record");
        plain.save(&mut r, &params, Step::InputCollected).expect("save");
        let raw = fs::read_to_string(plain.record_path(&r.migration_id)).expect("read");
        assert!(!raw.contains("hunter22"));

        let keep = StateStore::new(
            tmp.path().join("b"),
            &StateConfig {
                persist_credentials: true,
            },
        );
        let mut r = keep.create_or_load(None).expect("record");
        keep.save(&mut r, &params, Step::InputCollected).expect("save");
        let loaded = keep.load(&r.migration_id).expect("load").expect("present");
        assert_eq!(loaded.parameters.get(SSH_PASSWORD), Some("hunter22"));
    }

    #[cfg(unix)]
    #[test]
    fn records_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(tmp.path(), &StateConfig::default());
        let mut r = store.create_or_load(None).expect("record");
        store
            .save(&mut r, &MigrationParameters::new(), Step::New)
            .expect("save");
        let mode = fs::metadata(store.record_path(&r.migration_id))
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
