use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const BACKEND: &str = "backend";
pub const NAME: &str = "name";
pub const TARGET: &str = "target";
pub const PORT: &str = "port";
pub const SSH_USER: &str = "ssh_user";
pub const SSH_PASSWORD: &str = "ssh_password";
pub const CT_PASSWORD: &str = "ct_password";

/// Keys whose values are credentials. Never logged; persisted only when the
/// state policy allows it.
pub const SECRET_KEYS: &[&str] = &[SSH_PASSWORD, CT_PASSWORD];

pub fn is_secret(key: &str) -> bool {
    SECRET_KEYS.contains(&key)
}

const ENV_SUFFIX: &str = "_env";

static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+[GM]$").expect("size regex"));
static IPV4_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]{1,3})\.([0-9]{1,3})\.([0-9]{1,3})\.([0-9]{1,3})$").expect("ipv4 regex")
});
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("name regex"));

pub const CONTAINER_ID_MIN: u64 = 100;
pub const CONTAINER_ID_MAX: u64 = 999_999_999;
pub const MIN_CT_PASSWORD_LEN: usize = 5;

/// Flat key/value parameters of one migration, exactly as persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationParameters(BTreeMap<String, String>);

impl MigrationParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Trimmed value, `None` when absent or blank. Secrets come back
    /// byte-for-byte; surrounding spaces can be part of a password.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .filter(|v| !v.trim().is_empty())
            .map(|v| if is_secret(key) { v.as_str() } else { v.trim() })
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::validation(format!("missing required parameter '{key}'")))
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Fill keys missing here from `other` without overriding present ones.
    pub fn fill_from(&mut self, other: &MigrationParameters) {
        for (k, v) in other.iter() {
            if !self.contains(k) {
                self.set(k, v);
            }
        }
    }

    pub fn secrets(&self) -> Vec<&str> {
        SECRET_KEYS.iter().filter_map(|k| self.get(k)).collect()
    }

    pub fn without_secrets(&self) -> Self {
        let mut out = self.clone();
        for k in SECRET_KEYS {
            out.0.remove(*k);
        }
        out
    }

    /// Replace `<key>_env = "VAR"` entries by `<key> = $VAR` when the
    /// variable is set and `<key>` itself is blank.
    pub fn resolve_env_refs(&mut self) {
        let refs: Vec<(String, String)> = self
            .0
            .iter()
            .filter_map(|(k, v)| {
                k.strip_suffix(ENV_SUFFIX)
                    .map(|base| (base.to_string(), v.trim().to_string()))
            })
            .collect();
        for (base, var) in refs {
            self.0.remove(&format!("{base}{ENV_SUFFIX}"));
            if self.contains(&base) || var.is_empty() {
                continue;
            }
            if let Some(val) = std::env::var(&var)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| if is_secret(&base) { v } else { v.trim().to_string() })
            {
                self.0.insert(base, val);
            }
        }
    }

    /// Load a flat TOML table; numbers and booleans are stored as strings.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read parameters {}: {e}", path.display()))
        })?;
        let table: toml::Table = toml::from_str(&raw)
            .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;
        let mut out = Self::new();
        for (k, v) in table {
            let s = match v {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(Error::config(format!(
                        "parameter '{k}' in {} must be a scalar, got {}",
                        path.display(),
                        other.type_str()
                    )));
                }
            };
            out.set(k, s);
        }
        out.resolve_env_refs();
        Ok(out)
    }

    pub fn port(&self) -> Result<u16> {
        let raw = self.get_or(PORT, "22");
        parse_port(raw)
            .ok_or_else(|| Error::validation(format!("invalid SSH port '{raw}' (1-65535)")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    NonEmpty,
    Name,
    Host,
    Port,
    Ipv4,
    IpOrDhcp,
    Size,
    Memory,
    ContainerId,
    ContainerPassword,
}

/// One parameter a migration needs: how to ask for it and how to check it.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub key: &'static str,
    pub label: &'static str,
    pub rule: FieldRule,
    pub required: bool,
    pub secret: bool,
    pub default: Option<&'static str>,
}

impl FieldSpec {
    pub const fn required(key: &'static str, label: &'static str, rule: FieldRule) -> Self {
        Self {
            key,
            label,
            rule,
            required: true,
            secret: false,
            default: None,
        }
    }

    pub const fn optional(key: &'static str, label: &'static str, rule: FieldRule) -> Self {
        Self {
            key,
            label,
            rule,
            required: false,
            secret: false,
            default: None,
        }
    }

    pub const fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    pub const fn with_default(mut self, default: &'static str) -> Self {
        self.default = Some(default);
        self
    }
}

/// Fields every backend needs to reach the source host.
pub const COMMON_FIELDS: &[FieldSpec] = &[
    FieldSpec::required(NAME, "Container name", FieldRule::Name),
    FieldSpec::required(TARGET, "Source host", FieldRule::Host),
    FieldSpec::required(PORT, "SSH port", FieldRule::Port).with_default("22"),
    FieldSpec::optional(SSH_USER, "SSH user", FieldRule::NonEmpty),
    FieldSpec::optional(SSH_PASSWORD, "SSH password", FieldRule::NonEmpty).secret(),
];

pub fn parse_port(s: &str) -> Option<u16> {
    s.trim().parse::<u16>().ok().filter(|p| *p >= 1)
}

pub fn is_valid_ipv4(s: &str) -> bool {
    let Some(caps) = IPV4_RE.captures(s.trim()) else {
        return false;
    };
    (1..=4).all(|i| {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .is_some_and(|octet| octet <= 255)
    })
}

pub fn is_valid_ip(s: &str) -> bool {
    s.trim() == "dhcp" || is_valid_ipv4(s)
}

pub fn is_valid_size(s: &str) -> bool {
    SIZE_RE.is_match(s.trim())
}

pub fn is_valid_container_id(s: &str) -> bool {
    s.trim()
        .parse::<u64>()
        .is_ok_and(|id| (CONTAINER_ID_MIN..=CONTAINER_ID_MAX).contains(&id))
}

pub fn is_valid_name(s: &str) -> bool {
    NAME_RE.is_match(s.trim())
}

fn is_valid_host(s: &str) -> bool {
    let s = s.trim();
    !s.is_empty() && !s.chars().any(|c| c.is_whitespace() || c == '@' || c == '/')
}

fn is_valid_memory(s: &str) -> bool {
    s.trim().parse::<u64>().is_ok_and(|mb| mb > 0)
}

/// Check one value against its rule. Emptiness is checked by the caller.
pub fn validate_field(spec: &FieldSpec, value: &str) -> Result<()> {
    let ok = match spec.rule {
        FieldRule::NonEmpty => !value.trim().is_empty(),
        FieldRule::Name => is_valid_name(value),
        FieldRule::Host => is_valid_host(value),
        FieldRule::Port => parse_port(value).is_some(),
        FieldRule::Ipv4 => is_valid_ipv4(value),
        FieldRule::IpOrDhcp => is_valid_ip(value),
        FieldRule::Size => is_valid_size(value),
        FieldRule::Memory => is_valid_memory(value),
        FieldRule::ContainerId => is_valid_container_id(value),
        FieldRule::ContainerPassword => value.chars().count() >= MIN_CT_PASSWORD_LEN,
    };
    if ok {
        return Ok(());
    }
    let shown = if spec.secret { "<hidden>" } else { value };
    let hint = match spec.rule {
        FieldRule::NonEmpty => "must not be empty",
        FieldRule::Name => "letters, digits, '.', '_' or '-'",
        FieldRule::Host => "host name or address without spaces",
        FieldRule::Port => "1-65535",
        FieldRule::Ipv4 => "dotted quad, 0-255 per octet",
        FieldRule::IpOrDhcp => "'dhcp' or a dotted quad",
        FieldRule::Size => "<integer>G or <integer>M",
        FieldRule::Memory => "positive integer (MiB)",
        FieldRule::ContainerId => "integer 100-999999999",
        FieldRule::ContainerPassword => "at least 5 characters",
    };
    Err(Error::validation(format!(
        "invalid {} ({}): '{shown}' ({hint})",
        spec.label, spec.key
    )))
}

/// Aggregate validation: every required field present, every present
/// field well-formed.
pub fn validate(params: &MigrationParameters, fields: &[FieldSpec]) -> Result<()> {
    for spec in fields {
        match params.get(spec.key) {
            Some(v) => validate_field(spec, v)?,
            None if spec.required => {
                return Err(Error::validation(format!(
                    "missing required parameter '{}' ({})",
                    spec.key, spec.label
                )));
            }
            None => {}
        }
    }
    Ok(())
}

pub fn is_valid(params: &MigrationParameters, fields: &[FieldSpec]) -> bool {
    validate(params, fields).is_ok()
}
