use std::process::Command;

use crate::capture::CaptureArtifact;
use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::{CmdOutput, ExecCtx};
use crate::log_sanitize::{redact, sanitize_diagnostic};
use crate::operator::Choices;
use crate::params::{FieldSpec, MigrationParameters};

pub mod docker;
pub mod lxc;

const DIAGNOSTIC_LINES: usize = 8;

/// What a backend produced; enough to start it or point the operator at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub backend: &'static str,
    pub id: String,
    pub detail: String,
}

/// Start failures leave a usable container behind, so they are reported
/// rather than raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    Warning(String),
}

pub trait Backend {
    fn id(&self) -> &'static str;

    /// Backend-specific parameters, asked after the common ones.
    fn fields(&self) -> &'static [FieldSpec];

    /// Binaries that must be on PATH before a migration may start.
    fn required_tools(&self) -> Vec<String>;

    /// Host-local values to offer while collecting parameters.
    fn discover(&self, _ctx: &ExecCtx) -> Choices {
        Choices::new()
    }

    /// Checks spanning more than one field.
    fn validate(&self, _params: &MigrationParameters) -> Result<()> {
        Ok(())
    }

    /// Patterns excluded from the capture on top of the base list.
    fn extra_exclusions(&self) -> &'static [&'static str] {
        &[]
    }

    fn provision(
        &self,
        ctx: &ExecCtx,
        artifact: &CaptureArtifact,
        params: &MigrationParameters,
    ) -> Result<ContainerRef>;

    fn start(&self, ctx: &ExecCtx, container: &ContainerRef) -> StartOutcome;
}

pub fn builtin_backends(doc: &ConfigDoc) -> Result<Vec<Box<dyn Backend>>> {
    Ok(vec![
        Box::new(docker::DockerBackend::new(
            doc.section::<docker::DockerConfig>("backends.docker")?,
        )),
        Box::new(lxc::LxcBackend::new(
            doc.section::<lxc::LxcConfig>("backends.lxc")?,
        )),
    ])
}

pub fn backend_by_id(doc: &ConfigDoc, id: &str) -> Result<Box<dyn Backend>> {
    let id = id.trim();
    builtin_backends(doc)?
        .into_iter()
        .find(|b| b.id() == id)
        .ok_or_else(|| {
            Error::validation(format!("unknown backend '{id}' (expected docker or lxc)"))
        })
}

/// Comma-separated `host:container` pairs. Anything without exactly one
/// `:` is dropped.
pub fn parse_pairs(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| p.matches(':').count() == 1)
        .filter(|p| p.split(':').all(|side| !side.trim().is_empty()))
        .map(str::to_string)
        .collect()
}

/// Run a backend CLI call; a non-zero exit becomes a provisioning error
/// carrying the tool's own diagnostics.
pub(crate) fn run_checked(
    ctx: &ExecCtx,
    cmd: Command,
    label: &str,
    secrets: &[&str],
) -> Result<CmdOutput> {
    let out = ctx.run_output(cmd, label, None, None)?;
    if out.success() {
        return Ok(out);
    }
    Err(Error::provisioning(format!(
        "{label} failed ({}): {}",
        status_text(&out),
        diagnostic(&out, secrets)
    )))
}

pub(crate) fn diagnostic(out: &CmdOutput, secrets: &[&str]) -> String {
    let text = sanitize_diagnostic(&out.stderr_text(), DIAGNOSTIC_LINES);
    let text = if text.is_empty() {
        sanitize_diagnostic(&out.stdout_text(), DIAGNOSTIC_LINES)
    } else {
        text
    };
    if text.is_empty() {
        return "no output".into();
    }
    redact(&text, secrets)
}

pub(crate) fn status_text(out: &CmdOutput) -> String {
    match out.code() {
        Some(c) => format!("exit {c}"),
        None if out.timed_out => "timed out".into(),
        None => "killed".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_are_parsed_permissively() {
        assert_eq!(
            parse_pairs("8080:80, 2222:22,bad,/a:/b:ro,:80,443:443"),
            vec!["8080:80", "2222:22", "443:443"]
        );
        assert!(parse_pairs("").is_empty());
    }

    #[test]
    fn lookup_by_id() {
        let doc = ConfigDoc::empty();
        assert_eq!(backend_by_id(&doc, "lxc").expect("lxc").id(), "lxc");
        assert_eq!(backend_by_id(&doc, " docker ").expect("docker").id(), "docker");
        let err = backend_by_id(&doc, "podman").err().expect("unknown");
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }
}
