//! Finding a login method that works against the source host.
//!
//! The resolver walks a fixed ladder: password, an already-trusted key,
//! alternate transport flags (only once the operator says a manual login
//! works), then an installed key pair. Network-class failures end the walk
//! at once; they never enter the credential diagnosis.

pub mod keys;
pub mod ssh;

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::operator::Operator;

pub use ssh::{
    ProbeOutcome, ProbeVerdict, RemoteShell, SshCli, SshConfig, SshProbe, SshTarget, sh_quote,
};

const KEY_COMMENT: &str = "ctmigrate";

/// Tried in order after the operator confirms that a hand-typed login with
/// the same password succeeds.
pub const ALTERNATE_FLAG_SETS: &[&[&str]] = &[
    &[
        "-o",
        "PreferredAuthentications=password",
        "-o",
        "PubkeyAuthentication=no",
    ],
    &[
        "-o",
        "PreferredAuthentications=keyboard-interactive,password",
        "-o",
        "PubkeyAuthentication=no",
    ],
    &["-tt", "-o", "PubkeyAuthentication=no"],
    &[
        "-o",
        "BatchMode=no",
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
    ],
    &[
        "-tt",
        "-o",
        "BatchMode=no",
        "-o",
        "PreferredAuthentications=password,keyboard-interactive",
        "-o",
        "PubkeyAuthentication=no",
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
    ],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMode {
    /// `sshpass` feeding the parameters' password.
    Password,
    /// Non-interactive key login.
    Key,
    /// Key login with a key the operator installed by hand.
    InteractiveConfirmed,
}

impl CredentialMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialMode::Password => "password",
            CredentialMode::Key => "key",
            CredentialMode::InteractiveConfirmed => "interactive-confirmed",
        }
    }
}

/// A verified way of running commands on the source host. Lives for one
/// run and is never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStrategy {
    pub mode: CredentialMode,
    pub extra_flags: Vec<String>,
    pub identity_file: Option<PathBuf>,
}

impl ConnectionStrategy {
    pub fn password() -> Self {
        Self {
            mode: CredentialMode::Password,
            extra_flags: Vec::new(),
            identity_file: None,
        }
    }

    pub fn key(identity_file: Option<PathBuf>) -> Self {
        Self {
            mode: CredentialMode::Key,
            extra_flags: Vec::new(),
            identity_file,
        }
    }

    pub fn with_flags(mut self, flags: &[&str]) -> Self {
        self.extra_flags = flags.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Extra ssh arguments. The archive stream must stay binary-clean, so
    /// tty allocation is dropped from streaming commands.
    pub fn transport_flags(&self, for_stream: bool) -> impl Iterator<Item = &str> {
        self.extra_flags
            .iter()
            .map(String::as_str)
            .filter(move |f| !(for_stream && is_tty_flag(f)))
    }
}

fn is_tty_flag(flag: &str) -> bool {
    flag.len() >= 2 && flag.starts_with('-') && flag[1..].chars().all(|c| c == 't')
}

impl fmt::Display for ConnectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mode.as_str())?;
        if let Some(id) = &self.identity_file {
            write!(f, " ({})", id.display())?;
        }
        if !self.extra_flags.is_empty() {
            write!(f, " [{}]", self.extra_flags.join(" "))?;
        }
        Ok(())
    }
}

pub struct Resolver<'a> {
    probe: &'a dyn SshProbe,
    operator: &'a dyn Operator,
    key_dir: PathBuf,
    identity_file: Option<PathBuf>,
    probe_retries: u32,
}

impl<'a> Resolver<'a> {
    pub fn new(
        probe: &'a dyn SshProbe,
        operator: &'a dyn Operator,
        key_dir: &Path,
        cfg: &SshConfig,
    ) -> Self {
        Self {
            probe,
            operator,
            key_dir: key_dir.to_path_buf(),
            identity_file: cfg.resolved_identity_file(),
            probe_retries: cfg.probe_retries,
        }
    }

    /// Find and verify a working strategy. Always probes, even when a
    /// previous run already found one.
    pub fn resolve(&self, ctx: &ExecCtx, target: &SshTarget) -> Result<ConnectionStrategy> {
        info!(host = %target.host, port = target.port, user = %target.user, "resolving ssh access");
        let mut last_detail = String::new();

        if target.password.is_some() {
            let strategy = ConnectionStrategy::password();
            let outcome = self.attempt(ctx, target, &strategy)?;
            if let Some(done) = self.settle(target, &strategy, &outcome)? {
                return Ok(done);
            }
            info!(detail = %outcome.detail, "password login rejected, diagnosing");
            last_detail = outcome.detail;
        }

        let key = ConnectionStrategy::key(self.existing_identity());
        let outcome = self.attempt(ctx, target, &key)?;
        if let Some(done) = self.settle(target, &key, &outcome)? {
            return Ok(done);
        }
        debug!(detail = %outcome.detail, "no trusted key");
        if last_detail.is_empty() {
            last_detail = outcome.detail;
        }

        if target.password.is_some()
            && self.operator.attest(&format!(
                "Does `ssh -p {} {}` succeed with this password when typed by hand?",
                target.port,
                target.destination()
            ))?
        {
            for flags in ALTERNATE_FLAG_SETS {
                let strategy = ConnectionStrategy::password().with_flags(flags);
                let outcome = self.attempt(ctx, target, &strategy)?;
                if let Some(done) = self.settle(target, &strategy, &outcome)? {
                    return Ok(done);
                }
                debug!(flags = %strategy.extra_flags.join(" "), "alternate flags rejected");
            }
            warn!(host = %target.host, "no alternate transport flags worked");
        }

        if let Some(done) = self.install_key_pair(ctx, target)? {
            return Ok(done);
        }
        Err(Error::unreachable(format!(
            "no working login method for {}: {}",
            target.destination(),
            if last_detail.is_empty() {
                "all methods rejected"
            } else {
                last_detail.as_str()
            }
        )))
    }

    fn existing_identity(&self) -> Option<PathBuf> {
        self.identity_file.clone().or_else(|| {
            let generated = keys::private_key_path(&self.key_dir);
            generated.is_file().then_some(generated)
        })
    }

    // Ok(Some) on success, Err on network failure, Ok(None) to keep going.
    fn settle(
        &self,
        target: &SshTarget,
        strategy: &ConnectionStrategy,
        outcome: &ProbeOutcome,
    ) -> Result<Option<ConnectionStrategy>> {
        match outcome.verdict {
            ProbeVerdict::Ok => {
                info!(host = %target.host, strategy = %strategy, "ssh access verified");
                Ok(Some(strategy.clone()))
            }
            ProbeVerdict::Network | ProbeVerdict::Timeout => Err(unreachable(target, outcome)),
            ProbeVerdict::Auth | ProbeVerdict::Other => Ok(None),
        }
    }

    /// One probe, re-run on watchdog timeouts up to the configured retry
    /// count. A timeout that persists counts as network-class.
    fn attempt(
        &self,
        ctx: &ExecCtx,
        target: &SshTarget,
        strategy: &ConnectionStrategy,
    ) -> Result<ProbeOutcome> {
        let mut retries = 0u32;
        loop {
            ctx.check_cancel()?;
            let outcome = self.probe.probe(ctx, target, strategy)?;
            if outcome.verdict != ProbeVerdict::Timeout {
                return Ok(outcome);
            }
            if retries >= self.probe_retries {
                return Ok(ProbeOutcome {
                    verdict: ProbeVerdict::Network,
                    detail: format!("probe timed out {} time(s)", retries + 1),
                });
            }
            retries += 1;
            warn!(host = %target.host, attempt = retries, "ssh probe timed out, retrying");
        }
    }

    fn install_key_pair(
        &self,
        ctx: &ExecCtx,
        target: &SshTarget,
    ) -> Result<Option<ConnectionStrategy>> {
        if !self.operator.confirm(
            &format!(
                "Generate an SSH key pair and install it for {}?",
                target.destination()
            ),
            true,
        )? {
            return Ok(None);
        }
        let pair = keys::ensure_keypair(&self.key_dir, KEY_COMMENT)?;
        info!(path = %pair.private_path.display(), "using key pair");

        let mut installed = false;
        if target.password.is_some() {
            let outcome = self.probe.install_key(
                ctx,
                target,
                &ConnectionStrategy::password(),
                &pair.public_line,
            )?;
            match outcome.verdict {
                ProbeVerdict::Ok => installed = true,
                ProbeVerdict::Network => return Err(unreachable(target, &outcome)),
                _ => ctx.warn(&format!("automatic key install failed: {}", outcome.detail)),
            }
        }

        let mode = if installed {
            CredentialMode::Key
        } else {
            self.operator.notify(&format!(
                "Append this line to ~{}/.ssh/authorized_keys on {}:\n{}",
                target.user, target.host, pair.public_line
            ));
            if !self.operator.attest("Has the key been installed?")? {
                return Ok(None);
            }
            CredentialMode::InteractiveConfirmed
        };

        let strategy = ConnectionStrategy {
            mode,
            extra_flags: Vec::new(),
            identity_file: Some(pair.private_path),
        };
        let outcome = self.attempt(ctx, target, &strategy)?;
        match self.settle(target, &strategy, &outcome)? {
            Some(done) => Ok(Some(done)),
            None => {
                ctx.warn(&format!("installed key was not accepted: {}", outcome.detail));
                Ok(None)
            }
        }
    }
}

fn unreachable(target: &SshTarget, outcome: &ProbeOutcome) -> Error {
    Error::unreachable(format!(
        "{}:{} is unreachable: {}",
        target.host, target.port, outcome.detail
    ))
}
