use std::fs;
use std::process::Command;

use serde::Deserialize;
use sha_crypt::{Sha512Params, sha512_simple};
use tracing::{info, warn};

use crate::backends::{Backend, ContainerRef, StartOutcome, diagnostic, parse_pairs, run_checked};
use crate::capture::{ARCHIVE_FILE_NAME, CaptureArtifact};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::params::{self, FieldRule, FieldSpec, MigrationParameters};

pub const NETWORK: &str = "network";
pub const PORTS: &str = "ports";
pub const VOLUMES: &str = "volumes";
pub const BASE_IMAGE: &str = "base_image";

const FIELDS: &[FieldSpec] = &[
    FieldSpec::required(NETWORK, "Network (bridge, host or a network name)", FieldRule::Name)
        .with_default("bridge"),
    FieldSpec::optional(PORTS, "Port mappings host:container, comma separated", FieldRule::NonEmpty),
    FieldSpec::optional(VOLUMES, "Volume mappings host:container, comma separated", FieldRule::NonEmpty),
    FieldSpec::optional(BASE_IMAGE, "Base image", FieldRule::NonEmpty),
    FieldSpec::required(
        params::CT_PASSWORD,
        "Recovery root password for the container",
        FieldRule::ContainerPassword,
    )
    .secret(),
];

// Kernel-side trees are useless inside an image.
const EXTRA_EXCLUDES: &[&str] = &["/boot/*", "/lib/modules/*"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub docker_bin: String,
    pub image_prefix: String,
    pub base_image: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".into(),
            image_prefix: "ctmigrate-migrated".into(),
            base_image: "ubuntu:20.04".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode<'a> {
    Bridge,
    Host,
    Named(&'a str),
}

impl<'a> NetworkMode<'a> {
    pub fn parse(raw: &'a str) -> Self {
        match raw.trim() {
            "" | "bridge" => NetworkMode::Bridge,
            "host" => NetworkMode::Host,
            other => NetworkMode::Named(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DockerBackend {
    cfg: DockerConfig,
}

impl DockerBackend {
    pub fn new(cfg: DockerConfig) -> Self {
        Self { cfg }
    }

    pub fn image_tag(&self, name: &str) -> String {
        format!("{}:{}", self.cfg.image_prefix.trim(), name)
    }

    /// `docker create` argv after the binary.
    pub fn create_args(&self, params: &MigrationParameters) -> Result<Vec<String>> {
        let name = params.require(params::NAME)?;
        let mut args = vec!["create".to_string(), "--name".into(), name.to_string()];
        let mode = NetworkMode::parse(params.get_or(NETWORK, "bridge"));
        match mode {
            NetworkMode::Bridge => {}
            NetworkMode::Host => args.extend(["--network".into(), "host".into()]),
            NetworkMode::Named(n) => args.extend(["--network".into(), n.to_string()]),
        }
        if mode != NetworkMode::Host {
            for p in parse_pairs(params.get_or(PORTS, "")) {
                args.extend(["-p".into(), p]);
            }
        } else if params.contains(PORTS) {
            warn!("port mappings are ignored in host network mode");
        }
        for v in parse_pairs(params.get_or(VOLUMES, "")) {
            args.extend(["-v".into(), v]);
        }
        args.push(self.image_tag(name));
        Ok(args)
    }

    fn docker(&self) -> Command {
        Command::new(&self.cfg.docker_bin)
    }
}

/// Lays the archive over `base_image` and leaves sshd running with a
/// known root password.
pub fn render_dockerfile(base_image: &str, root_password_hash: &str) -> String {
    format!(
        r#"FROM {base_image}

ADD {ARCHIVE_FILE_NAME} /

RUN apt-get update && apt-get install -y \
    openssh-server \
    sudo \
    && rm -rf /var/lib/apt/lists/*

RUN mkdir -p /var/run/sshd
RUN echo 'root:{root_password_hash}' | chpasswd -e
RUN sed -i 's/^#\?PermitRootLogin.*/PermitRootLogin yes/' /etc/ssh/sshd_config

EXPOSE 22

CMD ["/usr/sbin/sshd", "-D"]
"#
    )
}

pub fn hash_root_password(password: &str) -> Result<String> {
    sha512_simple(password, &Sha512Params::default())
        .map_err(|e| Error::provisioning(format!("failed to hash recovery password: {e:?}")))
}

impl Backend for DockerBackend {
    fn id(&self) -> &'static str {
        "docker"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn required_tools(&self) -> Vec<String> {
        vec![self.cfg.docker_bin.clone()]
    }

    fn extra_exclusions(&self) -> &'static [&'static str] {
        EXTRA_EXCLUDES
    }

    fn provision(
        &self,
        ctx: &ExecCtx,
        artifact: &CaptureArtifact,
        params: &MigrationParameters,
    ) -> Result<ContainerRef> {
        let name = params.require(params::NAME)?;
        let password = params.require(params::CT_PASSWORD)?;
        let secrets = params.secrets();
        let context_dir = artifact
            .path
            .parent()
            .ok_or_else(|| Error::provisioning("capture archive has no parent directory"))?;
        if artifact.path.file_name().and_then(|n| n.to_str()) != Some(ARCHIVE_FILE_NAME) {
            return Err(Error::provisioning(format!(
                "build context expects {ARCHIVE_FILE_NAME}, got {}",
                artifact.path.display()
            )));
        }

        let base = params.get_or(BASE_IMAGE, &self.cfg.base_image);
        let dockerfile = render_dockerfile(base, &hash_root_password(password)?);
        let dockerfile_path = context_dir.join("Dockerfile");
        fs::write(&dockerfile_path, dockerfile).map_err(|e| {
            Error::provisioning(format!("failed to write {}: {e}", dockerfile_path.display()))
        })?;

        let tag = self.image_tag(name);
        ctx.log(&format!("building image {tag}"));
        info!(tag = %tag, base = %base, "docker build");
        let mut build = self.docker();
        build.arg("build").arg("-t").arg(&tag).arg(context_dir);
        run_checked(ctx, build, "docker build", &secrets)?;

        ctx.check_cancel()?;
        let mut create = self.docker();
        create.args(self.create_args(params)?);
        info!(name, "docker create");
        run_checked(ctx, create, "docker create", &secrets)?;

        Ok(ContainerRef {
            backend: "docker",
            id: name.to_string(),
            detail: format!("image {tag}"),
        })
    }

    fn start(&self, ctx: &ExecCtx, container: &ContainerRef) -> StartOutcome {
        let mut cmd = self.docker();
        cmd.arg("start").arg(&container.id);
        match ctx.run_output(cmd, "docker start", None, None) {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> DockerBackend {
        DockerBackend::new(DockerConfig::default())
    }

    #[test]
    fn bridge_mode_passes_ports_without_network_flag() {
        let p = MigrationParameters::from_pairs([
            (params::NAME, "web1"),
            (NETWORK, "bridge"),
            (PORTS, "8080:80,junk"),
            (VOLUMES, "/srv/data:/data"),
        ]);
        let args = backend().create_args(&p).expect("args");
        assert_eq!(
            args,
            vec![
                "create",
                "--name",
                "web1",
                "-p",
                "8080:80",
                "-v",
                "/srv/data:/data",
                "ctmigrate-migrated:web1"
            ]
        );
    }

    #[test]
    fn host_mode_drops_ports() {
        let p = MigrationParameters::from_pairs([
            (params::NAME, "web1"),
            (NETWORK, "host"),
            (PORTS, "8080:80"),
        ]);
        let args = backend().create_args(&p).expect("args");
        assert!(args.windows(2).any(|w| w == ["--network", "host"]));
        assert!(!args.contains(&"-p".to_string()));
    }

    #[test]
    fn named_network() {
        let p = MigrationParameters::from_pairs([(params::NAME, "web1"), (NETWORK, "backend-net")]);
        let args = backend().create_args(&p).expect("args");
        assert!(args.windows(2).any(|w| w == ["--network", "backend-net"]));
    }

    #[test]
    fn dockerfile_uses_hashed_password() {
        let hash = hash_root_password("s3cret!").expect("hash");
        assert!(hash.starts_with("$6$"));
        let df = render_dockerfile("debian:12", &hash);
        assert!(df.starts_with("FROM debian:12\n"));
        assert!(df.contains("ADD filesystem.tar.gz /"));
        assert!(df.contains(&format!("echo 'root:{hash}' | chpasswd -e")));
        assert!(!df.contains("s3cret!"));
        assert!(df.contains("EXPOSE 22"));
    }
}
