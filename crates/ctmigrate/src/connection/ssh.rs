//! `ssh`/`sshpass` command construction and probe classification.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::connection::{ConnectionStrategy, CredentialMode};
use crate::error::{Error, Result};
use crate::executor::{CmdOutput, ExecCtx};
use crate::log_sanitize::{redact, sanitize_diagnostic};
use crate::params::{self, MigrationParameters};

// sshpass exit statuses.
const SSHPASS_CONFLICTING_ARGS: i32 = 1;
const SSHPASS_RUNTIME_ERROR: i32 = 3;
const SSHPASS_PARSE_ERROR: i32 = 4;
const SSHPASS_WRONG_PASSWORD: i32 = 5;
const SSHPASS_HOST_KEY_UNKNOWN: i32 = 6;
const SSHPASS_HOST_KEY_CHANGED: i32 = 7;
const SSH_CONNECTION_ERROR: i32 = 255;

const NETWORK_MARKERS: &[&str] = &[
    "could not resolve hostname",
    "name or service not known",
    "temporary failure in name resolution",
    "nodename nor servname",
    "connection refused",
    "connection timed out",
    "operation timed out",
    "no route to host",
    "network is unreachable",
    "host is down",
    "connection reset by peer",
];

const AUTH_MARKERS: &[&str] = &[
    "permission denied",
    "authentication failed",
    "too many authentication failures",
    "no more authentication methods",
    "host key verification failed",
    "incorrect password",
];

const PROBE_COMMAND: &str = "true";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Login used when the parameters carry no `ssh_user`.
    pub user: String,
    pub ssh_bin: String,
    pub sshpass_bin: String,
    pub connect_timeout_secs: u64,
    /// Watchdog for one probe, on top of ssh's own connect timeout.
    pub probe_timeout_secs: u64,
    pub probe_retries: u32,
    pub server_alive_interval_secs: u64,
    pub identity_file: Option<String>,
    pub identity_file_env: Option<String>,
    pub known_hosts_file: Option<String>,
    pub known_hosts_file_env: Option<String>,
    pub strict_host_key_checking: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".into(),
            ssh_bin: "ssh".into(),
            sshpass_bin: "sshpass".into(),
            connect_timeout_secs: 10,
            probe_timeout_secs: 20,
            probe_retries: 1,
            server_alive_interval_secs: 15,
            identity_file: None,
            identity_file_env: None,
            known_hosts_file: None,
            known_hosts_file_env: None,
            strict_host_key_checking: false,
        }
    }
}

impl SshConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn resolved_identity_file(&self) -> Option<PathBuf> {
        resolve_string_field(
            self.identity_file.as_deref(),
            self.identity_file_env.as_deref(),
        )
        .map(PathBuf::from)
    }

    fn resolved_known_hosts_file(&self) -> Option<String> {
        resolve_string_field(
            self.known_hosts_file.as_deref(),
            self.known_hosts_file_env.as_deref(),
        )
    }
}

fn resolve_string_field(value: Option<&str>, env_key: Option<&str>) -> Option<String> {
    if let Some(v) = value.map(str::trim).filter(|s| !s.is_empty()) {
        return Some(v.to_string());
    }
    env_key
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Where and as whom to connect.
#[derive(Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
}

impl std::fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl SshTarget {
    pub fn from_params(p: &MigrationParameters, cfg: &SshConfig) -> Result<Self> {
        Ok(Self {
            host: p.require(params::TARGET)?.to_string(),
            port: p.port()?,
            user: p.get_or(params::SSH_USER, &cfg.user).to_string(),
            password: p.get(params::SSH_PASSWORD).map(str::to_string),
        })
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn secrets(&self) -> Vec<&str> {
        self.password.as_deref().into_iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    Ok,
    /// Credentials or host key rejected.
    Auth,
    /// DNS, refused, unroutable.
    Network,
    /// The probe watchdog fired before ssh gave up.
    Timeout,
    Other,
}

#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub verdict: ProbeVerdict,
    pub detail: String,
}

/// Remote checks the resolver runs. [`SshCli`] is the real implementation.
pub trait SshProbe {
    /// Run a no-op command on the target with `strategy`.
    fn probe(
        &self,
        ctx: &ExecCtx,
        target: &SshTarget,
        strategy: &ConnectionStrategy,
    ) -> Result<ProbeOutcome>;

    /// Append `public_line` to the remote `authorized_keys` over the
    /// password transport.
    fn install_key(
        &self,
        ctx: &ExecCtx,
        target: &SshTarget,
        strategy: &ConnectionStrategy,
        public_line: &str,
    ) -> Result<ProbeOutcome>;
}

/// Builds commands that run a shell line on the source host.
pub trait RemoteShell {
    fn remote_command(
        &self,
        target: &SshTarget,
        strategy: &ConnectionStrategy,
        remote_line: &str,
    ) -> Result<Command>;
}

#[derive(Debug, Clone)]
pub struct SshCli {
    cfg: SshConfig,
}

impl SshCli {
    pub fn new(cfg: SshConfig) -> Self {
        Self { cfg }
    }

    /// `[sshpass -e] ssh <opts> user@host -- <remote_line>`. The password
    /// only travels through the `SSHPASS` environment variable.
    pub fn command(
        &self,
        target: &SshTarget,
        strategy: &ConnectionStrategy,
        remote_line: &str,
        for_stream: bool,
    ) -> Result<Command> {
        let mut cmd = match strategy.mode {
            CredentialMode::Password => {
                let password = target.password.as_deref().ok_or_else(|| {
                    Error::new(
                        crate::error::ErrorKind::Authentication,
                        "password transport selected but no SSH password is set",
                    )
                })?;
                let mut cmd = Command::new(&self.cfg.sshpass_bin);
                cmd.env("SSHPASS", password).arg("-e").arg(&self.cfg.ssh_bin);
                cmd
            }
            CredentialMode::Key | CredentialMode::InteractiveConfirmed => {
                Command::new(&self.cfg.ssh_bin)
            }
        };
        self.configure_ssh_cmd(&mut cmd, target, strategy);
        for opt in strategy.transport_flags(for_stream) {
            cmd.arg(opt);
        }
        cmd.arg(target.destination()).arg("--").arg(remote_line);
        Ok(cmd)
    }

    fn configure_ssh_cmd(
        &self,
        cmd: &mut Command,
        target: &SshTarget,
        strategy: &ConnectionStrategy,
    ) {
        cmd.arg("-p").arg(target.port.to_string());
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.cfg.connect_timeout_secs.max(1)));
        if self.cfg.server_alive_interval_secs > 0 {
            cmd.arg("-o").arg(format!(
                "ServerAliveInterval={}",
                self.cfg.server_alive_interval_secs
            ));
        }
        cmd.arg("-o").arg("LogLevel=ERROR");
        match strategy.mode {
            CredentialMode::Password => {
                cmd.arg("-o").arg("NumberOfPasswordPrompts=1");
            }
            CredentialMode::Key | CredentialMode::InteractiveConfirmed => {
                cmd.arg("-o").arg("BatchMode=yes");
                cmd.arg("-o").arg("PasswordAuthentication=no");
                cmd.arg("-o").arg("KbdInteractiveAuthentication=no");
            }
        }
        if let Some(id) = strategy
            .identity_file
            .clone()
            .or_else(|| self.cfg.resolved_identity_file())
        {
            cmd.arg("-i").arg(id);
        }
        let known_hosts = self.cfg.resolved_known_hosts_file();
        if let Some(kh) = known_hosts.as_deref() {
            cmd.arg("-o").arg(format!("UserKnownHostsFile={kh}"));
        }
        if !self.cfg.strict_host_key_checking {
            cmd.arg("-o").arg("StrictHostKeyChecking=no");
            if known_hosts.is_none() {
                cmd.arg("-o").arg("UserKnownHostsFile=/dev/null");
            }
        }
    }
}

impl RemoteShell for SshCli {
    fn remote_command(
        &self,
        target: &SshTarget,
        strategy: &ConnectionStrategy,
        remote_line: &str,
    ) -> Result<Command> {
        self.command(target, strategy, remote_line, true)
    }
}

impl SshProbe for SshCli {
    fn probe(
        &self,
        ctx: &ExecCtx,
        target: &SshTarget,
        strategy: &ConnectionStrategy,
    ) -> Result<ProbeOutcome> {
        let cmd = self.command(target, strategy, PROBE_COMMAND, false)?;
        debug!(host = %target.host, strategy = %strategy, "ssh probe");
        let out = ctx.run_output(cmd, "ssh probe", Some(self.cfg.probe_timeout()), None)?;
        Ok(outcome_from(
            &out,
            strategy.mode == CredentialMode::Password,
            &target.secrets(),
        ))
    }

    fn install_key(
        &self,
        ctx: &ExecCtx,
        target: &SshTarget,
        strategy: &ConnectionStrategy,
        public_line: &str,
    ) -> Result<ProbeOutcome> {
        let cmd = self.command(target, strategy, &authorized_keys_script(), false)?;
        let out = ctx.run_output(
            cmd,
            "ssh install key",
            Some(self.cfg.probe_timeout()),
            Some(format!("{}\n", public_line.trim()).into_bytes()),
        )?;
        Ok(outcome_from(
            &out,
            strategy.mode == CredentialMode::Password,
            &target.secrets(),
        ))
    }
}

/// Reads one key line on stdin and appends it unless already present.
pub fn authorized_keys_script() -> String {
    [
        "umask 077",
        "mkdir -p ~/.ssh",
        "touch ~/.ssh/authorized_keys",
        "KEY=$(cat)",
        "(grep -qxF \"$KEY\" ~/.ssh/authorized_keys || printf '%s\\n' \"$KEY\" >> ~/.ssh/authorized_keys)",
    ]
    .join(" && ")
}

pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn outcome_from(out: &CmdOutput, via_sshpass: bool, secrets: &[&str]) -> ProbeOutcome {
    let verdict = classify_probe(out, via_sshpass);
    let detail = redact(&sanitize_diagnostic(&out.stderr_text(), 5), secrets);
    let detail = if detail.is_empty() && verdict != ProbeVerdict::Ok {
        out.summary()
    } else {
        detail
    };
    ProbeOutcome { verdict, detail }
}

/// Tell credential rejection apart from an unreachable host. Network
/// markers win over auth markers: a refused connection never reached
/// authentication.
pub fn classify_probe(out: &CmdOutput, via_sshpass: bool) -> ProbeVerdict {
    if out.success() {
        return ProbeVerdict::Ok;
    }
    if out.timed_out {
        return ProbeVerdict::Timeout;
    }
    let stderr = out.stderr_text().to_ascii_lowercase();
    if NETWORK_MARKERS.iter().any(|m| stderr.contains(m)) {
        return ProbeVerdict::Network;
    }
    if via_sshpass {
        match out.code() {
            Some(SSHPASS_WRONG_PASSWORD)
            | Some(SSHPASS_HOST_KEY_UNKNOWN)
            | Some(SSHPASS_HOST_KEY_CHANGED)
            | Some(SSHPASS_PARSE_ERROR) => return ProbeVerdict::Auth,
            Some(SSHPASS_CONFLICTING_ARGS) | Some(SSHPASS_RUNTIME_ERROR) => {
                return ProbeVerdict::Other;
            }
            _ => {}
        }
    }
    if AUTH_MARKERS.iter().any(|m| stderr.contains(m)) {
        return ProbeVerdict::Auth;
    }
    if out.code() == Some(SSH_CONNECTION_ERROR) && stderr.trim().is_empty() {
        return ProbeVerdict::Network;
    }
    ProbeVerdict::Other
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn out(code: i32, stderr: &str) -> CmdOutput {
        CmdOutput {
            status: Some(ExitStatus::from_raw(code << 8)),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            timed_out: false,
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn target(password: Option<&str>) -> SshTarget {
        SshTarget {
            host: "10.0.0.5".into(),
            port: 2222,
            user: "root".into(),
            password: password.map(str::to_string),
        }
    }

    #[test]
    fn target_keeps_password_verbatim() {
        let p = MigrationParameters::from_pairs([
            (params::TARGET, "10.0.0.5"),
            (params::SSH_PASSWORD, " pw with edge space "),
        ]);
        let t = SshTarget::from_params(&p, &SshConfig::default()).expect("target");
        assert_eq!(t.password.as_deref(), Some(" pw with edge space "));
        assert_eq!(t.port, 22);
    }

    #[test]
    fn classifies_network_before_auth() {
        let o = out(255, "ssh: connect to host 10.0.0.5 port 22: Connection refused\n");
        assert_eq!(classify_probe(&o, true), ProbeVerdict::Network);
        let o = out(255, "ssh: Could not resolve hostname nope: Name or service not known\n");
        assert_eq!(classify_probe(&o, false), ProbeVerdict::Network);
    }

    #[test]
    fn classifies_auth_failures() {
        assert_eq!(classify_probe(&out(5, ""), true), ProbeVerdict::Auth);
        let o = out(255, "root@10.0.0.5: Permission denied (publickey,password).\n");
        assert_eq!(classify_probe(&o, false), ProbeVerdict::Auth);
        // Exit 5 from plain ssh means nothing special.
        assert_eq!(classify_probe(&out(5, ""), false), ProbeVerdict::Other);
    }

    #[test]
    fn timeout_and_success() {
        let mut o = out(0, "");
        assert_eq!(classify_probe(&o, true), ProbeVerdict::Ok);
        o.status = None;
        o.timed_out = true;
        assert_eq!(classify_probe(&o, true), ProbeVerdict::Timeout);
    }

    #[test]
    fn password_is_not_on_argv() {
        let cli = SshCli::new(SshConfig::default());
        let cmd = cli
            .command(
                &target(Some("hunter22")),
                &ConnectionStrategy::password(),
                "true",
                false,
            )
            .expect("command");
        assert_eq!(cmd.get_program(), "sshpass");
        let argv = args(&cmd);
        assert!(!argv.iter().any(|a| a.contains("hunter22")));
        assert_eq!(argv[0], "-e");
        assert!(argv.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(argv.contains(&"StrictHostKeyChecking=no".to_string()));
        assert_eq!(argv[argv.len() - 3..], ["root@10.0.0.5", "--", "true"]);
        let env: Vec<_> = cmd.get_envs().collect();
        assert!(env.iter().any(|(k, v)| *k == "SSHPASS" && v.is_some()));
    }

    #[test]
    fn key_mode_is_batch_only() {
        let cli = SshCli::new(SshConfig::default());
        let mut strategy = ConnectionStrategy::key(Some(PathBuf::from("/k/id_ed25519")));
        strategy.extra_flags = vec!["-tt".into()];
        let cmd = cli
            .command(&target(None), &strategy, "true", true)
            .expect("command");
        assert_eq!(cmd.get_program(), "ssh");
        let argv = args(&cmd);
        assert!(argv.contains(&"BatchMode=yes".to_string()));
        assert!(argv.windows(2).any(|w| w == ["-i", "/k/id_ed25519"]));
        // No pty on the capture stream.
        assert!(!argv.contains(&"-tt".to_string()));
    }

    #[test]
    fn password_mode_without_password_fails() {
        let cli = SshCli::new(SshConfig::default());
        let err = cli
            .command(&target(None), &ConnectionStrategy::password(), "true", false)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Authentication);
    }

    #[test]
    fn quoting() {
        assert_eq!(sh_quote("/var/cache/*"), "'/var/cache/*'");
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn debug_hides_password() {
        let s = format!("{:?}", target(Some("hunter22")));
        assert!(!s.contains("hunter22"));
    }
}
