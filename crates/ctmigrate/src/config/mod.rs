use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "ctmigrate.toml";

/// A resolved configuration document. Components read their own section
/// with [`ConfigDoc::section`], so a missing file or table means defaults.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl Default for ConfigDoc {
    fn default() -> Self {
        Self::empty()
    }
}

impl ConfigDoc {
    pub fn empty() -> Self {
        Self {
            path: PathBuf::from("<defaults>"),
            value: Value::Table(Default::default()),
        }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        path.split('.')
            .try_fold(&self.value, |cur, seg| cur.as_table()?.get(seg))
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::config(format!("invalid config at '{path}': {e}")))?;
        Ok(Some(parsed))
    }

    pub fn section<T: DeserializeOwned + Default>(&self, path: &str) -> Result<T> {
        Ok(self.deserialize_path(path)?.unwrap_or_default())
    }
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(overlay_tbl)) => {
            for (k, v) in overlay_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn sibling_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn take_imports(path: &Path, value: &mut Value) -> Result<Vec<String>> {
    let Some(tbl) = value.as_table_mut() else {
        return Ok(Vec::new());
    };
    let Some(raw) = tbl.remove("imports") else {
        return Ok(Vec::new());
    };
    let Value::Array(items) = raw else {
        return Err(Error::config(format!(
            "'imports' in {} must be an array of strings",
            path.display()
        )));
    };
    let mut out = Vec::new();
    for item in items {
        let Some(s) = item.as_str() else {
            return Err(Error::config(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        if !s.trim().is_empty() {
            out.push(s.trim().to_string());
        }
    }
    Ok(out)
}

// Precedence, lowest first: extends base, imports in order, the file itself.
fn load_layered(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config include cycle at {}",
            canonical.display()
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&raw)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    let extends = value
        .as_table_mut()
        .and_then(|t| t.remove("extends"))
        .and_then(|v| v.as_str().map(str::to_string));
    if let Some(base) = extends {
        out = load_layered(&sibling_path(path, &base), stack)?;
    }
    for imp in take_imports(path, &mut value)? {
        let layer = load_layered(&sibling_path(path, &imp), stack)?;
        merge_values(&mut out, layer);
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let value = load_layered(path, &mut HashSet::new())?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// Load an explicit config path, or `ctmigrate.toml` from the working
/// directory when it exists, or fall back to built-in defaults.
pub fn load_or_default(explicit: Option<&Path>) -> Result<ConfigDoc> {
    if let Some(p) = explicit {
        return load(p);
    }
    let implicit = Path::new(DEFAULT_CONFIG_FILE);
    if implicit.is_file() {
        return load(implicit);
    }
    Ok(ConfigDoc::empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_and_imports_layer_in_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("base.toml"),
            "[ssh]\nuser = \"admin\"\nconnect_timeout_secs = 5\n",
        )
        .expect("base");
        fs::write(
            tmp.path().join("lab.toml"),
            "[ssh]\nconnect_timeout_secs = 7\n[backends.lxc]\nnameserver = \"1.1.1.1\"\n",
        )
        .expect("lab");
        let main = tmp.path().join("ctmigrate.toml");
        fs::write(
            &main,
            "extends = \"base.toml\"\nimports = [\"lab.toml\"]\n[ssh]\nuser = \"root\"\n",
        )
        .expect("main");

        let doc = load(&main).expect("load");
        assert_eq!(
            doc.value_path("ssh.user").and_then(Value::as_str),
            Some("root")
        );
        assert_eq!(
            doc.value_path("ssh.connect_timeout_secs")
                .and_then(Value::as_integer),
            Some(7)
        );
        assert!(doc.value_path("backends.lxc").is_some_and(Value::is_table));
        assert!(doc.value_path("imports").is_none());
    }

    #[test]
    fn include_cycle_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.toml"), "extends = \"b.toml\"\n").expect("a");
        fs::write(tmp.path().join("b.toml"), "extends = \"a.toml\"\n").expect("b");
        let err = load(&tmp.path().join("a.toml")).unwrap_err();
        assert!(err.to_string().contains("cycle"), "unexpected err: {err}");
    }
}
