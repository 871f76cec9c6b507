use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use ctmigrate::backends::{self, StartOutcome};
use ctmigrate::capture::CaptureConfig;
use ctmigrate::config::{self, ConfigDoc};
use ctmigrate::connection::{SshCli, SshConfig};
use ctmigrate::error::ErrorKind;
use ctmigrate::executor::{ExecCtx, StdoutSink};
use ctmigrate::logging::{self, LogFormat};
use ctmigrate::operator::{BatchOperator, Operator, TerminalOperator};
use ctmigrate::orchestrator::Orchestrator;
use ctmigrate::params::{self, MigrationParameters};
use ctmigrate::state::{StateConfig, StateStore};
use ctmigrate::workspace::{self, WorkspaceConfig, WorkspacePaths};
use ctmigrate::{Error, Result, deps, signals};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (defaults to ./ctmigrate.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Console log format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    /// Do not write a per-run log file
    #[arg(long, global = true)]
    no_log_file: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Capture a remote host and turn it into a local container
    Migrate {
        /// Target container technology
        #[arg(long, value_parser = ["docker", "lxc"])]
        backend: String,
        /// TOML file of migration parameters (flat key = value table)
        #[arg(long)]
        params: Option<PathBuf>,
        /// Answer yes to every confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Continue an incomplete migration (newest one when no id is given)
    Resume {
        id: Option<String>,
        /// TOML file supplying parameters missing from the record
        #[arg(long)]
        params: Option<PathBuf>,
        #[arg(long)]
        yes: bool,
    },
    /// List incomplete migrations
    List,
    /// Delete a stored migration record
    Discard { id: String },
    /// Report which external tools are available
    Check {
        /// Only check tools for this backend
        #[arg(long, value_parser = ["docker", "lxc"])]
        backend: Option<String>,
    },
}

struct Setup {
    doc: ConfigDoc,
    paths: WorkspacePaths,
    store: StateStore,
}

fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = e.kind().as_str(), "{e}");
            eprintln!("error: {e}");
            if e.kind() == ErrorKind::Interrupted {
                ExitCode::from(signals::EXIT_INTERRUPTED as u8)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(args: Args) -> Result<()> {
    let doc = config::load_or_default(args.config.as_deref())?;
    let ws = doc.section::<WorkspaceConfig>("workspace")?;
    let paths = workspace::load_paths(&ws)?;
    workspace::init_dirs(&paths)?;
    let log_dir = (!args.no_log_file).then_some(paths.log_dir.as_path());
    if let Some(file) = logging::init(args.log_format, log_dir)? {
        info!(path = %file.display(), "logging to file");
    }
    let store = StateStore::new(&paths.state_dir, &doc.section::<StateConfig>("state")?);
    let setup = Setup { doc, paths, store };

    match args.cmd {
        Command::Migrate {
            backend,
            params,
            yes,
        } => cmd_migrate(&setup, &backend, None, params, yes),
        Command::Resume { id, params, yes } => {
            let id = match id {
                Some(id) => id,
                None => setup
                    .store
                    .list_incomplete()?
                    .into_iter()
                    .next()
                    .map(|r| r.migration_id)
                    .ok_or_else(|| Error::state("no incomplete migrations to resume"))?,
            };
            let record = setup
                .store
                .load(&id)?
                .ok_or_else(|| Error::state(format!("no stored migration '{id}'")))?;
            let backend = record
                .parameters
                .get(params::BACKEND)
                .ok_or_else(|| Error::state(format!("migration '{id}' has no backend")))?
                .to_string();
            cmd_migrate(&setup, &backend, Some(&id), params, yes)
        }
        Command::List => cmd_list(&setup),
        Command::Discard { id } => {
            setup.store.clear(&id)?;
            setup.paths.clear_scratch(&id)?;
            println!("discarded {id}");
            Ok(())
        }
        Command::Check { backend } => cmd_check(&setup, backend.as_deref()),
    }
}

fn cmd_migrate(
    setup: &Setup,
    backend_id: &str,
    resume_id: Option<&str>,
    params_file: Option<PathBuf>,
    yes: bool,
) -> Result<()> {
    let backend = backends::backend_by_id(&setup.doc, backend_id)?;
    let ssh_cfg = setup.doc.section::<SshConfig>("ssh")?;
    let capture_cfg = setup.doc.section::<CaptureConfig>("capture")?;

    let mut tools = backend.required_tools();
    tools.push(ssh_cfg.ssh_bin.clone());
    deps::require(&tools)?;
    if deps::which(&ssh_cfg.sshpass_bin).is_none() {
        tracing::warn!(tool = %ssh_cfg.sshpass_bin, "not found; password logins will fail");
    }

    let initial = match params_file {
        Some(p) => MigrationParameters::from_toml_file(&p)?,
        None => MigrationParameters::new(),
    };
    let operator: Box<dyn Operator> = if std::io::stdin().is_terminal() {
        Box::new(TerminalOperator::new(yes))
    } else {
        Box::new(BatchOperator { assume_yes: yes })
    };

    signals::install_handlers();
    let ctx = ExecCtx::new(Arc::new(StdoutSink::default()));
    let ssh = SshCli::new(ssh_cfg.clone());
    let orchestrator = Orchestrator {
        ctx: &ctx,
        store: &setup.store,
        paths: &setup.paths,
        backend: backend.as_ref(),
        operator: operator.as_ref(),
        probe: &ssh,
        shell: &ssh,
        ssh: &ssh_cfg,
        capture: &capture_cfg,
    };
    let result = orchestrator.run(resume_id, initial);
    ctx.kill_running_children_force();
    let outcome = result?;
    println!(
        "container {} ({}, {})",
        outcome.container.id, outcome.container.backend, outcome.container.detail
    );
    if let StartOutcome::Warning(msg) = &outcome.start {
        println!("warning: {msg}");
    }
    Ok(())
}

fn cmd_list(setup: &Setup) -> Result<()> {
    let records = setup.store.list_incomplete()?;
    if records.is_empty() {
        println!("no incomplete migrations");
        return Ok(());
    }
    println!(
        "{:<20} {:<28} {:<8} {:<20} {}",
        "ID", "UPDATED", "BACKEND", "NAME", "STEP"
    );
    for r in records {
        println!(
            "{:<20} {:<28} {:<8} {:<20} {}",
            r.migration_id,
            r.timestamp,
            r.parameters.get_or(params::BACKEND, "-"),
            r.parameters.get_or(params::NAME, "-"),
            r.step
        );
    }
    Ok(())
}

fn cmd_check(setup: &Setup, only: Option<&str>) -> Result<()> {
    let ssh_cfg = setup.doc.section::<SshConfig>("ssh")?;
    let mut tools = vec![ssh_cfg.ssh_bin.clone(), ssh_cfg.sshpass_bin.clone()];
    for b in backends::builtin_backends(&setup.doc)? {
        if only.is_none_or(|id| id == b.id()) {
            tools.extend(b.required_tools());
        }
    }
    let mut missing = 0;
    for status in deps::check(&tools) {
        match &status.path {
            Some(p) => println!("ok       {:<10} {}", status.name, p.display()),
            None => {
                missing += 1;
                println!("missing  {}", status.name);
            }
        }
    }
    if missing > 0 {
        return Err(Error::new(
            ErrorKind::Dependency,
            format!("{missing} tool(s) missing"),
        ));
    }
    Ok(())
}
