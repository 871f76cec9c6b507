//! Drives one migration through its steps, checkpointing after every
//! transition:
//!
//! `new -> input_collected -> validated -> converting -> completed`, with
//! `failed`, `cancelled` and `interrupted` as exits. Records at `validated`
//! or `converting` resume straight into conversion.

use tracing::{error, info, warn};

use crate::backends::{Backend, ContainerRef, StartOutcome};
use crate::capture::{ARCHIVE_FILE_NAME, CaptureConfig, CapturePipeline, exclusion_set};
use crate::connection::{RemoteShell, Resolver, SshConfig, SshProbe, SshTarget};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{ExecCtx, ExecEvent};
use crate::operator::{Choices, Operator};
use crate::params::{self, COMMON_FIELDS, FieldSpec, MigrationParameters};
use crate::state::{MigrationRecord, StateStore, Step};
use crate::workspace::WorkspacePaths;

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub migration_id: String,
    pub container: ContainerRef,
    pub start: StartOutcome,
}

/// Everything one run needs. Borrowed so callers and tests can swap the
/// ssh transport, operator and backend.
pub struct Orchestrator<'a> {
    pub ctx: &'a ExecCtx,
    pub store: &'a StateStore,
    pub paths: &'a WorkspacePaths,
    pub backend: &'a dyn Backend,
    pub operator: &'a dyn Operator,
    pub probe: &'a dyn SshProbe,
    pub shell: &'a dyn RemoteShell,
    pub ssh: &'a SshConfig,
    pub capture: &'a CaptureConfig,
}

/// Common fields followed by the backend's own.
pub fn all_fields(backend: &dyn Backend) -> Vec<FieldSpec> {
    COMMON_FIELDS
        .iter()
        .chain(backend.fields())
        .copied()
        .collect()
}

/// Aggregate check run before a record may reach `validated`.
pub fn validate_all(backend: &dyn Backend, params: &MigrationParameters) -> Result<()> {
    params::validate(params, &all_fields(backend))?;
    backend.validate(params)
}

impl<'a> Orchestrator<'a> {
    /// Start a new migration (`resume_id = None`) or continue a stored
    /// one. `initial` fills parameters the record does not already hold.
    pub fn run(
        &self,
        resume_id: Option<&str>,
        initial: MigrationParameters,
    ) -> Result<MigrationOutcome> {
        let mut record = self.open_record(resume_id)?;
        let mut params = record.parameters.clone();
        params.fill_from(&initial);
        params.resolve_env_refs();

        let result = self.drive(&mut record, &mut params);
        match &result {
            Ok(_) => self.ctx.sink.emit(ExecEvent::Done {
                ok: true,
                error: None,
            }),
            Err(e) => {
                // Nothing is stored until input is collected.
                if e.kind() == ErrorKind::Interrupted && record.step != Step::New {
                    if let Err(se) = self.checkpoint(&mut record, &params, Step::Interrupted) {
                        error!(migration_id = %record.migration_id, "interrupt checkpoint failed: {se}");
                    }
                }
                self.ctx.sink.emit(ExecEvent::Done {
                    ok: false,
                    error: Some(format!("{}: {e}", e.kind().as_str())),
                });
            }
        }
        result
    }

    fn open_record(&self, resume_id: Option<&str>) -> Result<MigrationRecord> {
        let Some(id) = resume_id else {
            return self.store.create_or_load(None);
        };
        let record = self
            .store
            .load(id)?
            .ok_or_else(|| Error::state(format!("no stored migration '{id}'")))?;
        if record.step == Step::Completed {
            return Err(Error::state(format!("migration '{id}' already completed")));
        }
        if let Some(b) = record.parameters.get(params::BACKEND)
            && b != self.backend.id()
        {
            return Err(Error::state(format!(
                "migration '{id}' uses backend '{b}', not '{}'",
                self.backend.id()
            )));
        }
        info!(migration_id = %id, step = %record.step, "resuming migration");
        Ok(record)
    }

    fn drive(
        &self,
        record: &mut MigrationRecord,
        params: &mut MigrationParameters,
    ) -> Result<MigrationOutcome> {
        let fields = all_fields(self.backend);
        params.set(params::BACKEND, self.backend.id());
        self.ctx.step_changed(&record.migration_id, record.step);
        self.ctx.check_cancel()?;

        if record.step.skips_confirmation() {
            // Secrets are not always persisted; ask again for what is gone.
            let secrets: Vec<FieldSpec> = fields
                .iter()
                .filter(|f| f.secret && !params.contains(f.key))
                .copied()
                .collect();
            if !secrets.is_empty() {
                info!(
                    migration_id = %record.migration_id,
                    persisted = self.store.persists_credentials(),
                    "stored record lacks credentials, asking again"
                );
                self.operator
                    .collect(&secrets, params, &Choices::new())?;
            }
            validate_all(self.backend, params)?;
        } else {
            let choices = self.backend.discover(self.ctx);
            self.operator.collect(&fields, params, &choices)?;
            self.ctx.check_cancel()?;
            self.checkpoint(record, params, Step::InputCollected)?;

            if let Err(e) = validate_all(self.backend, params) {
                warn!(migration_id = %record.migration_id, "validation failed: {e}");
                return Err(e);
            }
            self.checkpoint(record, params, Step::Validated)?;

            self.ctx.check_cancel()?;
            if !self.operator.confirm(&self.summary(params), true)? {
                self.checkpoint(record, params, Step::Cancelled)?;
                return Err(Error::new(
                    ErrorKind::Cancelled,
                    "migration cancelled by operator",
                ));
            }
        }

        self.checkpoint(record, params, Step::Converting)?;
        self.ctx.check_cancel()?;
        match self.convert(&record.migration_id, params) {
            Ok((container, start)) => {
                self.checkpoint(record, params, Step::Completed)?;
                if let Err(e) = self.store.clear(&record.migration_id) {
                    warn!(migration_id = %record.migration_id, "failed to clear record: {e}");
                }
                info!(migration_id = %record.migration_id, container = %container.id, "migration completed");
                Ok(MigrationOutcome {
                    migration_id: record.migration_id.clone(),
                    container,
                    start,
                })
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Err(e),
            Err(e) => {
                error!(migration_id = %record.migration_id, kind = e.kind().as_str(), "conversion failed: {e}");
                self.checkpoint(record, params, Step::Failed)?;
                if e.kind().is_capture() {
                    self.ctx.warn(&format!(
                        "no container was created; `ctmigrate resume {}` captures again",
                        record.migration_id
                    ));
                }
                Err(e)
            }
        }
    }

    fn convert(
        &self,
        migration_id: &str,
        params: &MigrationParameters,
    ) -> Result<(ContainerRef, StartOutcome)> {
        let target = SshTarget::from_params(params, self.ssh)?;
        let resolver = Resolver::new(self.probe, self.operator, &self.paths.key_dir, self.ssh);
        let strategy = resolver.resolve(self.ctx, &target)?;
        self.ctx.log(&format!("connected to {} using {strategy}", target.host));
        self.ctx.check_cancel()?;

        self.paths.clear_scratch(migration_id)?;
        let scratch = self.paths.scratch_dir(migration_id);
        let exclusions = exclusion_set(self.backend.extra_exclusions(), self.capture);
        self.ctx.log(&format!("capturing filesystem of {}", target.host));
        let artifact = match CapturePipeline::new(self.shell, self.capture).capture(
            self.ctx,
            &target,
            &strategy,
            &exclusions,
            &scratch.join(ARCHIVE_FILE_NAME),
        ) {
            Ok(artifact) => artifact,
            Err(e) => {
                if !self.capture.keep_on_failure
                    && let Err(ce) = self.paths.clear_scratch(migration_id)
                {
                    warn!("{ce}");
                }
                return Err(e);
            }
        };

        let provisioned = self
            .ctx
            .check_cancel()
            .and_then(|()| self.backend.provision(self.ctx, &artifact, params));
        if let Err(e) = artifact.discard() {
            warn!("{e}");
        }
        if let Err(e) = self.paths.clear_scratch(migration_id) {
            warn!("{e}");
        }
        let container = provisioned?;

        let start = self.backend.start(self.ctx, &container);
        match &start {
            StartOutcome::Started => self.ctx.log(&format!("container {} started", container.id)),
            StartOutcome::Warning(msg) => self.ctx.warn(msg),
        }
        Ok((container, start))
    }

    fn checkpoint(
        &self,
        record: &mut MigrationRecord,
        params: &MigrationParameters,
        step: Step,
    ) -> Result<()> {
        self.store.save(record, params, step)?;
        info!(migration_id = %record.migration_id, step = %step, "checkpoint");
        self.ctx.step_changed(&record.migration_id, step);
        Ok(())
    }

    fn summary(&self, params: &MigrationParameters) -> String {
        let mut s = format!(
            "Migrate {} into {} container '{}' with:",
            params.get_or(params::TARGET, "?"),
            self.backend.id(),
            params.get_or(params::NAME, "?")
        );
        for (k, v) in params.without_secrets().iter() {
            s.push_str(&format!("\n  {k} = {v}"));
        }
        s.push_str("\nProceed?");
        s
    }
}
