use std::process::Command;

use serde::Deserialize;
use tracing::{debug, info};

use crate::backends::{Backend, ContainerRef, StartOutcome, diagnostic, run_checked};
use crate::capture::CaptureArtifact;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::operator::Choices;
use crate::params::{self, FieldRule, FieldSpec, MigrationParameters, is_valid_ipv4};

pub const ID: &str = "id";
pub const BRIDGE: &str = "bridge";
pub const IP: &str = "ip";
pub const GATEWAY: &str = "gateway";
pub const ROOTSIZE: &str = "rootsize";
pub const MEMORY: &str = "memory";
pub const STORAGE: &str = "storage";

const FIELDS: &[FieldSpec] = &[
    FieldSpec::required(ID, "Container ID", FieldRule::ContainerId),
    FieldSpec::required(BRIDGE, "Network bridge", FieldRule::Name),
    FieldSpec::required(IP, "IP address (or dhcp)", FieldRule::IpOrDhcp).with_default("dhcp"),
    FieldSpec::optional(GATEWAY, "Gateway (static IP only)", FieldRule::Ipv4),
    FieldSpec::required(ROOTSIZE, "Root disk size (e.g. 20G)", FieldRule::Size),
    FieldSpec::required(MEMORY, "Memory in MiB", FieldRule::Memory).with_default("1024"),
    FieldSpec::required(STORAGE, "Storage", FieldRule::Name),
    FieldSpec::required(
        params::CT_PASSWORD,
        "Container root password",
        FieldRule::ContainerPassword,
    )
    .secret(),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LxcConfig {
    pub pct_bin: String,
    pub pvesm_bin: String,
    pub brctl_bin: String,
    pub nameserver: String,
    pub bridge_prefix: String,
}

impl Default for LxcConfig {
    fn default() -> Self {
        Self {
            pct_bin: "pct".into(),
            pvesm_bin: "pvesm".into(),
            brctl_bin: "brctl".into(),
            nameserver: "8.8.8.8".into(),
            bridge_prefix: "vmbr".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LxcBackend {
    cfg: LxcConfig,
}

impl LxcBackend {
    pub fn new(cfg: LxcConfig) -> Self {
        Self { cfg }
    }

    /// `pct create` argv after the binary.
    pub fn create_args(
        &self,
        archive: &str,
        params: &MigrationParameters,
        timestamp: &str,
    ) -> Result<Vec<String>> {
        let id = params.require(ID)?;
        let name = params.require(params::NAME)?;
        let target = params.require(params::TARGET)?;
        let net0 = net0_descriptor(
            params.require(BRIDGE)?,
            params.require(IP)?,
            params.get(GATEWAY),
        )?;
        let rootsize = params.require(ROOTSIZE)?;
        let gib = rootfs_size_gib(rootsize)
            .ok_or_else(|| Error::validation(format!("invalid root disk size '{rootsize}'")))?;
        let rootfs = format!("{}:{gib}", params.require(STORAGE)?);

        let mut args: Vec<String> = vec!["create".into(), id.into(), archive.into()];
        let flags = [
            (
                "--description",
                format!("Migrated: {name} (from {target}) at {timestamp}"),
            ),
            ("--hostname", name.to_string()),
            ("--features", "nesting=1".to_string()),
            ("--unprivileged", "0".to_string()),
            ("--memory", params.require(MEMORY)?.to_string()),
            ("--nameserver", self.cfg.nameserver.trim().to_string()),
            ("--net0", net0),
            ("--rootfs", rootfs),
            ("--password", params.require(params::CT_PASSWORD)?.to_string()),
            ("--onboot", "1".to_string()),
            ("--cmode", "shell".to_string()),
        ];
        for (flag, value) in flags {
            args.push(flag.to_string());
            args.push(value);
        }
        Ok(args)
    }

    fn list_bridges(&self, ctx: &ExecCtx) -> Vec<String> {
        let mut cmd = Command::new(&self.cfg.brctl_bin);
        cmd.arg("show");
        match ctx.run_output(cmd, "brctl show", None, None) {
            Ok(out) if out.success() => parse_bridges(&out.stdout_text(), &self.cfg.bridge_prefix),
            Ok(out) => {
                debug!(detail = %out.summary(), "bridge discovery failed");
                Vec::new()
            }
            Err(e) => {
                debug!("bridge discovery failed: {e}");
                Vec::new()
            }
        }
    }

    /// Active storages that can hold a container root: `rootdir` first,
    /// then `images`, without duplicates.
    fn list_storages(&self, ctx: &ExecCtx) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for content in STORAGE_CONTENT {
            let mut cmd = Command::new(&self.cfg.pvesm_bin);
            cmd.arg("status").arg("--content").arg(content);
            match ctx.run_output(cmd, "pvesm status", None, None) {
                Ok(out) if out.success() => {
                    for name in parse_storages(&out.stdout_text()) {
                        if !names.contains(&name) {
                            names.push(name);
                        }
                    }
                }
                Ok(out) => debug!(content, detail = %out.summary(), "storage discovery failed"),
                Err(e) => debug!(content, "storage discovery failed: {e}"),
            }
        }
        names
    }
}

/// `name=eth0,bridge=<b>,ip=dhcp` or `name=eth0,bridge=<b>,ip=<a>/24,gw=<g>`.
pub fn net0_descriptor(bridge: &str, ip: &str, gateway: Option<&str>) -> Result<String> {
    let ip = ip.trim();
    if ip == "dhcp" {
        return Ok(format!("name=eth0,bridge={bridge},ip=dhcp"));
    }
    let gw = gateway
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .ok_or_else(|| Error::validation("a static IP needs a gateway"))?;
    Ok(format!("name=eth0,bridge={bridge},ip={ip}/24,gw={gw}"))
}

/// Whole GiB for `--rootfs`, rounding megabytes up.
pub fn rootfs_size_gib(size: &str) -> Option<u64> {
    let size = size.trim();
    if let Some(gib) = size.strip_suffix('G') {
        return gib.parse::<u64>().ok().map(|n| n.max(1));
    }
    size.strip_suffix('M')?
        .parse::<u64>()
        .ok()
        .map(|mib| mib.div_ceil(1024).max(1))
}

/// Bridge names from `brctl show`: first column of non-continuation rows.
pub fn parse_bridges(output: &str, prefix: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .filter(|l| !l.starts_with(char::is_whitespace))
        .filter_map(|l| l.split_whitespace().next())
        .filter(|n| n.starts_with(prefix))
        .map(str::to_string)
        .collect()
}

const STORAGE_CONTENT: [&str; 2] = ["rootdir", "images"];

/// Active storages from `pvesm status` (`Name Type Status ...`).
pub fn parse_storages(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .filter_map(|l| {
            let cols: Vec<&str> = l.split_whitespace().collect();
            match cols.as_slice() {
                [name, _kind, "active", ..] => Some(name.to_string()),
                _ => None,
            }
        })
        .collect()
}

impl Backend for LxcBackend {
    fn id(&self) -> &'static str {
        "lxc"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn required_tools(&self) -> Vec<String> {
        vec![self.cfg.pct_bin.clone(), self.cfg.pvesm_bin.clone()]
    }

    fn discover(&self, ctx: &ExecCtx) -> Choices {
        let mut choices = Choices::new();
        let bridges = self.list_bridges(ctx);
        if !bridges.is_empty() {
            choices.insert(BRIDGE, bridges);
        }
        let storages = self.list_storages(ctx);
        if !storages.is_empty() {
            choices.insert(STORAGE, storages);
        }
        choices
    }

    fn validate(&self, params: &MigrationParameters) -> Result<()> {
        let ip = params.get_or(IP, "dhcp");
        if ip != "dhcp" {
            match params.get(GATEWAY) {
                Some(gw) if is_valid_ipv4(gw) => {}
                Some(gw) => {
                    return Err(Error::validation(format!("invalid gateway '{gw}'")));
                }
                None => return Err(Error::validation("a static IP needs a gateway")),
            }
        }
        Ok(())
    }

    fn provision(
        &self,
        ctx: &ExecCtx,
        artifact: &CaptureArtifact,
        params: &MigrationParameters,
    ) -> Result<ContainerRef> {
        let archive = artifact.path.to_str().ok_or_else(|| {
            Error::provisioning(format!(
                "archive path is not UTF-8: {}",
                artifact.path.display()
            ))
        })?;
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let args = self.create_args(archive, params, &timestamp)?;
        let id = params.require(ID)?;
        let mut cmd = Command::new(&self.cfg.pct_bin);
        cmd.args(&args);
        ctx.log(&format!("creating container {id}"));
        info!(id, storage = params.get_or(STORAGE, ""), "pct create");
        run_checked(ctx, cmd, "pct create", &params.secrets())?;
        Ok(ContainerRef {
            backend: "lxc",
            id: id.to_string(),
            detail: format!("hostname {}", params.get_or(params::NAME, "")),
        })
    }

    fn start(&self, ctx: &ExecCtx, container: &ContainerRef) -> StartOutcome {
        let mut cmd = Command::new(&self.cfg.pct_bin);
        cmd.arg("start").arg(&container.id);
        match ctx.run_output(cmd, "pct start", None, None) {
            Ok(out) if out.success() => StartOutcome::Started,
            Ok(out) => StartOutcome::Warning(format!(
                "container {} was created but did not start: {}",
                container.id,
                diagnostic(&out, &[])
            )),
            Err(e) => StartOutcome::Warning(format!(
                "container {} was created but could not be started: {e}",
                container.id
            )),
        }
    }
}
