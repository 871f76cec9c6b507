use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};

use ctmigrate::backends::{Backend, ContainerRef, StartOutcome};
use ctmigrate::capture::{CaptureArtifact, CaptureConfig};
use ctmigrate::connection::{SshCli, SshConfig};
use ctmigrate::error::ErrorKind;
use ctmigrate::executor::{ChannelSink, ExecCtx};
use ctmigrate::operator::BatchOperator;
use ctmigrate::orchestrator::{MigrationOutcome, Orchestrator};
use ctmigrate::params::{FieldRule, FieldSpec, MigrationParameters};
use ctmigrate::state::{StateConfig, StateStore, Step};
use ctmigrate::workspace::{self, WorkspacePaths};
use ctmigrate::Result;

const FIELDS: &[FieldSpec] = &[
    FieldSpec::required("ip", "IP", FieldRule::IpOrDhcp),
    FieldSpec::required("rootsize", "Root size", FieldRule::Size),
    FieldSpec::required("memory", "Memory", FieldRule::Memory),
];

/// Stand-in backend: records what it was handed and fails on request.
struct FakeBackend {
    failures_left: Cell<u32>,
    provisioned: Cell<u32>,
    archive_sizes: std::cell::RefCell<Vec<u64>>,
}

impl FakeBackend {
    fn failing(times: u32) -> Self {
        Self {
            failures_left: Cell::new(times),
            provisioned: Cell::new(0),
            archive_sizes: Default::default(),
        }
    }
}

impl Backend for FakeBackend {
    fn id(&self) -> &'static str {
        "lxc"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn required_tools(&self) -> Vec<String> {
        Vec::new()
    }

    fn provision(
        &self,
        _ctx: &ExecCtx,
        artifact: &CaptureArtifact,
        params: &MigrationParameters,
    ) -> Result<ContainerRef> {
        self.provisioned.set(self.provisioned.get() + 1);
        self.archive_sizes
            .borrow_mut()
            .push(fs::metadata(&artifact.path).map(|m| m.len()).unwrap_or(0));
        if self.failures_left.get() > 0 {
            self.failures_left.set(self.failures_left.get() - 1);
            return Err(ctmigrate::Error::provisioning("pct create failed (exit 255): storage full"));
        }
        Ok(ContainerRef {
            backend: "lxc",
            id: params.get_or("name", "?").to_string(),
            detail: String::new(),
        })
    }

    fn start(&self, _ctx: &ExecCtx, _container: &ContainerRef) -> StartOutcome {
        StartOutcome::Started
    }
}

struct Env {
    _tmp: tempfile::TempDir,
    paths: WorkspacePaths,
    store: StateStore,
    ssh_cfg: SshConfig,
    capture_cfg: CaptureConfig,
    ctx: ExecCtx,
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

/// `ssh` stand-in: succeeds on probes, runs `on_tar` for the capture.
fn env_with_ssh(on_probe: &str, on_tar: &str) -> Env {
    let tmp = tempfile::tempdir().expect("tempdir");
    let paths = WorkspacePaths::under(tmp.path());
    workspace::init_dirs(&paths).expect("init dirs");
    let bin = tmp.path().join("bin");
    fs::create_dir_all(&bin).expect("bin");
    let ssh = write_script(
        &bin,
        "ssh",
        &format!(
            "for a in \"$@\"; do case \"$a\" in *tar\\ czpf*) {on_tar};; esac; done\n{on_probe}"
        ),
    );
    let ssh_cfg = SshConfig {
        ssh_bin: ssh.display().to_string(),
        probe_timeout_secs: 10,
        ..SshConfig::default()
    };
    let (tx, _rx) = mpsc::channel();
    Env {
        store: StateStore::new(&paths.state_dir, &StateConfig::default()),
        paths,
        ssh_cfg,
        capture_cfg: CaptureConfig::default(),
        ctx: ExecCtx::new(Arc::new(ChannelSink::new(tx))),
        _tmp: tmp,
    }
}

fn good_env() -> Env {
    env_with_ssh("exit 0", "head -c 1024 /dev/zero; exit 0")
}

fn web1() -> MigrationParameters {
    MigrationParameters::from_pairs([
        ("name", "web1"),
        ("target", "10.0.0.5"),
        ("port", "22"),
        ("ip", "dhcp"),
        ("rootsize", "10G"),
        ("memory", "512"),
    ])
}

fn run(
    env: &Env,
    backend: &FakeBackend,
    assume_yes: bool,
    resume: Option<&str>,
    params: MigrationParameters,
) -> Result<MigrationOutcome> {
    let ssh = SshCli::new(env.ssh_cfg.clone());
    let operator = BatchOperator { assume_yes };
    Orchestrator {
        ctx: &env.ctx,
        store: &env.store,
        paths: &env.paths,
        backend,
        operator: &operator,
        probe: &ssh,
        shell: &ssh,
        ssh: &env.ssh_cfg,
        capture: &env.capture_cfg,
    }
    .run(resume, params)
}

fn only_record(env: &Env) -> ctmigrate::state::MigrationRecord {
    let mut all = env.store.list_incomplete().expect("list");
    assert_eq!(all.len(), 1, "expected exactly one stored record");
    all.remove(0)
}

fn scratch_is_empty(env: &Env) -> bool {
    fs::read_dir(&env.paths.work_dir)
        .map(|mut d| d.next().is_none())
        .unwrap_or(true)
}

#[test]
fn successful_migration_completes_and_clears_state() {
    let env = good_env();
    let backend = FakeBackend::failing(0);
    let outcome = run(&env, &backend, true, None, web1()).expect("migration");

    assert_eq!(outcome.container.id, "web1");
    assert_eq!(outcome.start, StartOutcome::Started);
    assert!(!env.store.record_path(&outcome.migration_id).exists());
    assert!(env.store.list_incomplete().expect("list").is_empty());
    assert_eq!(*backend.archive_sizes.borrow(), vec![1024]);
    assert!(scratch_is_empty(&env), "archive must be discarded after handoff");
}

#[test]
fn provisioning_failure_keeps_record_for_resume() {
    let env = good_env();
    let backend = FakeBackend::failing(1);
    let err = run(&env, &backend, true, None, web1()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Provisioning);

    let record = only_record(&env);
    assert_eq!(record.step, Step::Failed);
    for (k, v) in web1().iter() {
        assert_eq!(record.parameters.get(k), Some(v), "parameter {k}");
    }
    let raw = fs::read_to_string(env.store.record_path(&record.migration_id)).expect("read");
    let json: serde_json::Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(json["step"], "failed");
    assert!(scratch_is_empty(&env));

    // Resuming a failed record re-confirms and then completes.
    let outcome = run(
        &env,
        &backend,
        true,
        Some(&record.migration_id),
        MigrationParameters::new(),
    )
    .expect("resume");
    assert_eq!(outcome.migration_id, record.migration_id);
    assert_eq!(backend.provisioned.get(), 2);
    assert!(!env.store.record_path(&record.migration_id).exists());
}

#[test]
fn validated_record_resumes_without_confirmation() {
    let env = good_env();
    let backend = FakeBackend::failing(0);
    let mut record = env.store.create_or_load(None).expect("record");
    let mut params = web1();
    params.set("backend", "lxc");
    env.store
        .save(&mut record, &params, Step::Validated)
        .expect("save");

    // A declining operator would cancel if it were asked.
    let outcome = run(
        &env,
        &backend,
        false,
        Some(&record.migration_id),
        MigrationParameters::new(),
    )
    .expect("resume");
    assert_eq!(outcome.migration_id, record.migration_id);
    assert!(!env.store.record_path(&record.migration_id).exists());
}

#[test]
fn declined_confirmation_is_cancelled() {
    let env = good_env();
    let backend = FakeBackend::failing(0);
    let err = run(&env, &backend, false, None, web1()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(only_record(&env).step, Step::Cancelled);
    assert_eq!(backend.provisioned.get(), 0);
}

#[test]
fn invalid_parameters_stop_before_validated() {
    let env = good_env();
    let backend = FakeBackend::failing(0);
    let mut params = web1();
    params.set("ip", "256.1.1.1");
    let err = run(&env, &backend, true, None, params).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(only_record(&env).step, Step::InputCollected);
}

#[test]
fn failed_capture_marks_record_failed() {
    let env = env_with_ssh("exit 0", "head -c 300 /dev/zero; exit 2");
    let backend = FakeBackend::failing(0);
    let err = run(&env, &backend, true, None, web1()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IncompleteCapture);
    assert_eq!(only_record(&env).step, Step::Failed);
    assert_eq!(backend.provisioned.get(), 0);
    assert!(scratch_is_empty(&env));
}

#[test]
fn unreachable_host_fails_without_capture() {
    let env = env_with_ssh(
        "echo 'ssh: connect to host 10.0.0.5 port 22: Connection refused' >&2; exit 255",
        "echo captured >&2; exit 0",
    );
    let backend = FakeBackend::failing(0);
    let err = run(&env, &backend, true, None, web1()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unreachable);
    assert_eq!(only_record(&env).step, Step::Failed);
    assert_eq!(backend.provisioned.get(), 0);
}

#[test]
fn interrupt_before_input_leaves_no_record() {
    let env = good_env();
    let backend = FakeBackend::failing(0);
    env.ctx.request_cancel();
    let err = run(&env, &backend, true, None, web1()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Interrupted);
    assert!(env.store.list_incomplete().expect("list").is_empty());
    assert_eq!(
        fs::read_dir(env.store.dir()).expect("state dir").count(),
        0,
        "no record file may be written"
    );
}

#[test]
fn interrupt_checkpoints_a_stored_record() {
    let env = good_env();
    let backend = FakeBackend::failing(0);
    let mut record = env.store.create_or_load(None).expect("record");
    env.store
        .save(&mut record, &web1(), Step::InputCollected)
        .expect("save");

    env.ctx.request_cancel();
    let err = run(
        &env,
        &backend,
        true,
        Some(&record.migration_id),
        MigrationParameters::new(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Interrupted);
    let stored = only_record(&env);
    assert_eq!(stored.migration_id, record.migration_id);
    assert_eq!(stored.step, Step::Interrupted);
    assert_eq!(stored.parameters.get("name"), Some("web1"));
    assert_eq!(backend.provisioned.get(), 0);
}

#[test]
fn credentials_are_not_persisted_by_default() {
    let mut env = good_env();
    // The stand-in ignores the leading `-e` and treats the rest as ssh argv.
    env.ssh_cfg.sshpass_bin = env.ssh_cfg.ssh_bin.clone();
    let backend = FakeBackend::failing(1);
    let mut params = web1();
    params.set("ssh_password", "hunter22");
    let err = run(&env, &backend, true, None, params).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Provisioning);
    let record = only_record(&env);
    let raw = fs::read_to_string(env.store.record_path(&record.migration_id)).expect("read");
    assert!(!raw.contains("hunter22"));
}

#[test]
#[ignore = "requires a reachable SSH host in CTMIGRATE_TEST_TARGET"]
fn real_host_capture() {
    let target = std::env::var("CTMIGRATE_TEST_TARGET").expect("CTMIGRATE_TEST_TARGET");
    let tmp = tempfile::tempdir().expect("tempdir");
    let paths = WorkspacePaths::under(tmp.path());
    workspace::init_dirs(&paths).expect("init dirs");
    let (tx, _rx) = mpsc::channel();
    let env = Env {
        store: StateStore::new(&paths.state_dir, &StateConfig::default()),
        paths,
        ssh_cfg: SshConfig::default(),
        capture_cfg: CaptureConfig::default(),
        ctx: ExecCtx::new(Arc::new(ChannelSink::new(tx))),
        _tmp: tmp,
    };
    let mut params = web1();
    params.set("target", target);
    let backend = FakeBackend::failing(0);
    run(&env, &backend, true, None, params).expect("migration");
    assert!(backend.archive_sizes.borrow()[0] > 0);
}
