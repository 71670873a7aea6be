//! Per-service lifecycle: drive one service from stopped through
//! health checks to started, later back to stopped or into error, and
//! answer status queries.
//!
//! # Locking
//!
//! Three layers, innermost last:
//! - `op_lock` (`tokio::sync::Mutex`) serializes start/stop, which must
//!   await process reaping.
//! - `cell` (`parking_lot::Mutex`) guards the quick mutable fields and
//!   is never held across an await.
//! - the supervisor's own lock guards its state and exit status.

use crate::defs::expand_env;
use crate::error::{Error, Result};
use crate::healthcheck::{backoff, CommandProbe, HealthProbe, HttpProbe};
use crate::paths::ControlPaths;
use crate::procinfo::{self, ProcError};
use crate::state::{ServiceState, StateCell};
use crate::supervisor::{OutputSink, Supervisor};
use crate::wire::messages as wire;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// How long to wait between kill escalations while stopping.
const INTERRUPT_WAIT: Duration = Duration::from_millis(250);

/// A shell command plus the environment it runs with.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub cmd: String,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    /// Build from the wire form. Every command inherits the scratch
    /// root plus `RUNFILES` and `HOME`, and `$VAR` references in
    /// declared overrides are expanded against the daemon environment.
    pub fn from_wire(cmd: &wire::Command, paths: &ControlPaths) -> Self {
        let mut envs = vec![(
            "TEST_TMPDIR".to_string(),
            paths.root().display().to_string(),
        )];
        for inherited in ["RUNFILES", "HOME"] {
            envs.push((
                inherited.to_string(),
                std::env::var(inherited).unwrap_or_default(),
            ));
        }
        for var in &cmd.env_vars {
            envs.push((var.key.clone(), expand_env(&var.value)));
        }
        Self {
            cmd: cmd.cmd.clone(),
            envs,
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.cmd)
    }
}

#[derive(Debug)]
struct RuntimeCell {
    supervisor: Option<Arc<Supervisor>>,
    start_time: Instant,
    start_duration: Duration,
    stop_time: Instant,
    stop_duration: Duration,
    sanitizer_errors: Vec<String>,
    /// Whether the current supervisor's sanitizer output has already
    /// been folded into `sanitizer_errors`.
    absorbed: bool,
}

/// Runtime record for one registered service.
pub struct Service {
    name: String,
    owner: String,
    verbose: bool,
    service_type: wire::ServiceType,
    launch_cmd: CommandSpec,
    /// Declared but unused by the lifecycle; stops always signal.
    #[allow(dead_code)]
    stop_cmd: Option<CommandSpec>,
    deps: Vec<Arc<Service>>,
    check_cmds: Vec<CommandSpec>,
    http_checks: Vec<String>,
    version_files: Vec<PathBuf>,
    paths: ControlPaths,
    state: StateCell,
    /// Digest of the version files captured when the service was last
    /// marked started. Readers see the prior or the new value, never a
    /// torn one.
    frozen_version: RwLock<Vec<u8>>,
    op_lock: tokio::sync::Mutex<()>,
    cell: Mutex<RuntimeCell>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .finish()
    }
}

impl Service {
    /// Build a record from its wire definition, resolving dependencies
    /// against already-registered services.
    pub fn new(
        def: &wire::Service,
        registry: &HashMap<String, Arc<Service>>,
        paths: &ControlPaths,
        verbose: bool,
    ) -> Result<Arc<Service>> {
        let launch = def
            .launch_cmd
            .as_ref()
            .ok_or_else(|| Error::Config(format!("service {} has no launch command", def.service_name)))?;

        let mut deps = Vec::with_capacity(def.dependencies.len());
        for dep_name in &def.dependencies {
            let dep = registry.get(dep_name).ok_or_else(|| Error::UndeclaredDependency {
                service: def.service_name.clone(),
                dependency: dep_name.clone(),
            })?;
            deps.push(Arc::clone(dep));
        }

        let mut check_cmds = Vec::new();
        let mut http_checks = Vec::new();
        for check in &def.health_checks {
            match wire::HealthCheckType::try_from(check.check_type) {
                Ok(wire::HealthCheckType::Command) => {
                    let cmd = check.cmd.as_ref().ok_or_else(|| {
                        Error::Config(format!(
                            "command health check without a command for {}",
                            def.service_name
                        ))
                    })?;
                    check_cmds.push(CommandSpec::from_wire(cmd, paths));
                }
                Ok(wire::HealthCheckType::Http) => {
                    let http = check.http_health_check.as_ref().ok_or_else(|| {
                        Error::Config(format!(
                            "http health check without a url for {}",
                            def.service_name
                        ))
                    })?;
                    http_checks.push(http.url.clone());
                }
                Err(_) => {
                    return Err(Error::Config(format!(
                        "unsupported health check type {} for {}",
                        check.check_type, def.service_name
                    )))
                }
            }
        }

        let mut version_files: Vec<PathBuf> =
            def.version_files.iter().map(PathBuf::from).collect();
        version_files.sort();

        let service_type = wire::ServiceType::try_from(def.service_type)
            .map_err(|_| Error::Config(format!("unsupported service type {}", def.service_type)))?;

        Ok(Arc::new(Service {
            name: def.service_name.clone(),
            owner: def.owner.clone(),
            verbose: verbose || def.verbose,
            service_type,
            launch_cmd: CommandSpec::from_wire(launch, paths),
            stop_cmd: def.stop_cmd.as_ref().map(|c| CommandSpec::from_wire(c, paths)),
            deps,
            check_cmds,
            http_checks,
            version_files,
            paths: paths.clone(),
            state: StateCell::new(ServiceState::Stopped),
            frozen_version: RwLock::new(Vec::new()),
            op_lock: tokio::sync::Mutex::new(()),
            cell: Mutex::new(RuntimeCell {
                supervisor: None,
                start_time: Instant::now(),
                start_duration: Duration::ZERO,
                stop_time: Instant::now(),
                stop_duration: Duration::ZERO,
                sanitizer_errors: Vec::new(),
                absorbed: true,
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn service_type(&self) -> wire::ServiceType {
        self.service_type
    }

    pub fn state(&self) -> ServiceState {
        self.state.get()
    }

    pub fn deps(&self) -> &[Arc<Service>] {
        &self.deps
    }

    pub fn start_duration(&self) -> Duration {
        self.cell.lock().start_duration
    }

    pub fn start_time(&self) -> Instant {
        self.cell.lock().start_time
    }

    pub fn stop_duration(&self) -> Duration {
        self.cell.lock().stop_duration
    }

    pub fn stop_time(&self) -> Instant {
        self.cell.lock().stop_time
    }

    /// The supervised pid, or 0 when no process is running. Advisory:
    /// the process may exit at any moment after the read.
    pub fn pid(&self) -> u32 {
        self.cell
            .lock()
            .supervisor
            .as_ref()
            .and_then(|sup| sup.pid())
            .unwrap_or(0)
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.paths.service_log_file(&self.name)
    }

    /// Launch the service and move it to starting. Health checking runs
    /// in the background; observe the outcome with
    /// [`Service::wait_till_healthy`]. A no-op unless currently stopped.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _op = self.op_lock.lock().await;
        if self.state.get() != ServiceState::Stopped {
            return Ok(());
        }

        let version = if self.version_files.is_empty() {
            Vec::new()
        } else {
            match self.read_version_files() {
                Ok(digest) => digest,
                Err(e) => {
                    tracing::warn!("[{}] Unable to read version file. {}", self.name, e);
                    Vec::new()
                }
            }
        };

        let mut log_file = self.open_log_file()?;
        {
            let mut cell = self.cell.lock();
            cell.start_time = Instant::now();
            cell.start_duration = Duration::ZERO;
            cell.absorbed = false;
        }

        let supervisor = Arc::new(Supervisor::new(
            self.launch_cmd.cmd.clone(),
            self.launch_cmd.envs.clone(),
            self.paths.root().to_path_buf(),
        ));

        let env_lines: Vec<String> = self
            .launch_cmd
            .envs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let _ = writeln!(
            log_file,
            "\n\nService starting at {}\n\nCommand line:\n{}\n\nEnvironment:\n{}\n",
            chrono::Utc::now(),
            self.launch_cmd.cmd,
            env_lines.join("\n"),
        );

        let sink = if self.verbose {
            OutputSink::Tee {
                file: log_file,
                prefix: self.name.clone(),
            }
        } else {
            OutputSink::File(log_file)
        };

        if let Err(e) = supervisor.start(sink) {
            tracing::error!("[{}] Service start error: {}", self.name, self.launch_cmd.cmd);
            self.state.set(ServiceState::Error);
            return Err(Error::StartFailed(self.name.clone(), e.to_string()));
        }

        self.cell.lock().supervisor = Some(Arc::clone(&supervisor));
        self.state.set(ServiceState::Starting);
        if self.verbose {
            tracing::info!("[{}] Service starting: {}", self.name, self.launch_cmd.cmd);
        }

        self.spawn_health_watcher(Arc::clone(&supervisor));

        // Snapshot the version digest once the service proves healthy.
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            if svc.wait_till_healthy().await.is_ok() {
                *svc.frozen_version.write() = version;
            }
        });

        Ok(())
    }

    /// Block until the service leaves starting; an error means it never
    /// became healthy.
    pub async fn wait_till_healthy(&self) -> Result<()> {
        let state = self.state.wait_till_not(ServiceState::Starting).await;
        if state == ServiceState::Started {
            Ok(())
        } else {
            Err(Error::Unhealthy {
                service: self.name.clone(),
                state: state.to_string(),
            })
        }
    }

    fn spawn_health_watcher(self: &Arc<Self>, supervisor: Arc<Supervisor>) {
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            match svc.service_type {
                wire::ServiceType::Daemon => svc.watch_daemon(supervisor).await,
                wire::ServiceType::Task => svc.watch_task(supervisor).await,
            }
        });
    }

    async fn watch_daemon(self: Arc<Self>, supervisor: Arc<Supervisor>) {
        // Reap the process independently of the probes: a daemon that
        // dies while it is supposed to be up is an error no matter what
        // the probes say.
        {
            let svc = Arc::clone(&self);
            let sup = Arc::clone(&supervisor);
            tokio::spawn(async move {
                let status = sup.wait().await;
                svc.absorb_sanitizer_errors(&sup);
                match svc.state.get() {
                    ServiceState::Starting | ServiceState::Started => {
                        tracing::error!(
                            "[{}] Daemon unexpectedly stopped: {}",
                            svc.name,
                            status
                        );
                        svc.cell.lock().supervisor = None;
                        svc.state.set(ServiceState::Error);
                    }
                    _ => {}
                }
            });
        }

        let mut probes = JoinSet::new();
        for check in &self.check_cmds {
            let probe = CommandProbe::new(check.cmd.clone(), check.envs.clone());
            let svc = Arc::clone(&self);
            probes.spawn(async move { svc.poll_probe(probe).await });
        }
        for url in &self.http_checks {
            let probe = HttpProbe::new(url.clone());
            let svc = Arc::clone(&self);
            probes.spawn(async move { svc.poll_probe(probe).await });
        }

        let mut all_passed = true;
        while let Some(outcome) = probes.join_next().await {
            if !outcome.unwrap_or(false) {
                all_passed = false;
            }
        }
        if !all_passed {
            return;
        }
        self.mark_started();

        let cpu = supervisor
            .pid()
            .and_then(|pid| procinfo::recursive_cpu_time(pid as i32).ok())
            .unwrap_or(Duration::ZERO);
        tracing::info!(
            "[{}] Daemon healthy: wall-time:{} cpu-time:{}",
            self.name,
            fmt_duration(self.start_duration()),
            fmt_duration(cpu),
        );
    }

    async fn watch_task(self: Arc<Self>, supervisor: Arc<Supervisor>) {
        let status = supervisor.wait().await;
        self.absorb_sanitizer_errors(&supervisor);
        if status.success() {
            self.mark_started();
            let cpu = supervisor
                .pid()
                .and_then(|pid| procinfo::cpu_time(pid as i32).ok())
                .unwrap_or(Duration::ZERO);
            tracing::info!(
                "[{}] Task completed: wall-time:{} cpu-time:{}",
                self.name,
                fmt_duration(self.start_duration()),
                fmt_duration(cpu),
            );
        } else {
            match self.state.get() {
                ServiceState::Starting | ServiceState::Started => {
                    tracing::error!("[{}] Task exited with an error: {}", self.name, status);
                    self.cell.lock().supervisor = None;
                    self.state.set(ServiceState::Error);
                }
                _ => {}
            }
        }
    }

    /// Poll one probe until it passes once. Gives up when the service
    /// has left starting; returns whether the probe passed.
    async fn poll_probe<P: HealthProbe>(self: Arc<Self>, probe: P) -> bool {
        for attempt in 0u32.. {
            if self.state.get() != ServiceState::Starting {
                tracing::info!(
                    "[{}] Giving up executing health check {}",
                    self.name,
                    probe.describe()
                );
                return false;
            }
            if probe.check().await {
                if self.verbose {
                    tracing::info!("[{}] Health check passed: {}", self.name, probe.describe());
                }
                return true;
            }
            if self.verbose {
                tracing::info!("[{}] Health check failed: {}", self.name, probe.describe());
            }
            backoff(attempt).await;
        }
        false
    }

    /// Transition to started, but only if still starting.
    fn mark_started(&self) {
        let mut cell = self.cell.lock();
        let elapsed = cell.start_time.elapsed();
        if self.state.set_if(ServiceState::Starting, ServiceState::Started) {
            cell.start_duration = elapsed;
        }
    }

    /// Graceful stop: SIGINT to the process group first, escalating to
    /// SIGKILL of the whole tree.
    pub async fn stop(&self) -> Result<()> {
        self.stop_with(Signal::SIGINT).await
    }

    /// Forced stop: SIGKILL the whole tree from the first signal.
    pub async fn stop_unsafe(&self) -> Result<()> {
        self.stop_with(Signal::SIGKILL).await
    }

    async fn stop_with(&self, sig: Signal) -> Result<()> {
        let _op = self.op_lock.lock().await;
        if self.state.get() == ServiceState::Stopped {
            return Ok(());
        }
        self.cell.lock().stop_time = Instant::now();
        self.state.set(ServiceState::Stopping);

        match self.service_type {
            wire::ServiceType::Task => {
                // The process is one-shot; there is nothing to signal.
                if self.verbose {
                    tracing::info!("[{}] Stopping task", self.name);
                }
                self.finish_stop();
            }
            wire::ServiceType::Daemon => {
                if self.verbose {
                    tracing::info!("[{}] Stopping daemon with signal {}", self.name, sig);
                }
                let supervisor = self.cell.lock().supervisor.clone();
                let Some(supervisor) = supervisor else {
                    self.finish_stop();
                    return Ok(());
                };
                let Some(pid) = supervisor.pid() else {
                    self.cell.lock().supervisor = None;
                    self.finish_stop();
                    return Ok(());
                };
                let pid = pid as i32;

                let mut tree = vec![pid];
                match procinfo::child_pids(pid) {
                    Ok(children) => tree.extend(children),
                    Err(_) => tracing::warn!("[{}] Failed to get child processes", self.name),
                }

                let kill_result = if sig == Signal::SIGKILL {
                    // Not graceful anyway, so use the forceful kill.
                    force_signal_process_tree(&tree, Signal::SIGKILL)
                } else {
                    // First signal is graceful, to the process group.
                    kill(Pid::from_raw(-pid), sig)
                };

                if let Err(e) = kill_result {
                    if supervisor.exited() {
                        // Signal failed because the process already left.
                        self.absorb_sanitizer_errors(&supervisor);
                        self.cell.lock().supervisor = None;
                        self.finish_stop();
                        return Ok(());
                    }
                    let mut cell = self.cell.lock();
                    cell.stop_duration = cell.stop_time.elapsed();
                    return Err(Error::Signal {
                        service: self.name.clone(),
                        source: e,
                    });
                }

                loop {
                    match tokio::time::timeout(INTERRUPT_WAIT, supervisor.wait()).await {
                        Ok(_) => break,
                        Err(_) => {
                            if self.verbose {
                                tracing::info!(
                                    "[{}] Process not dead yet - issuing SIGKILL to entire tree",
                                    self.name
                                );
                            }
                            if force_signal_process_tree(&tree, Signal::SIGKILL).is_err()
                                && supervisor.exited()
                            {
                                break;
                            }
                        }
                    }
                }
                self.absorb_sanitizer_errors(&supervisor);
                self.cell.lock().supervisor = None;
                self.finish_stop();
            }
        }
        Ok(())
    }

    fn finish_stop(&self) {
        let mut cell = self.cell.lock();
        cell.stop_duration = cell.stop_time.elapsed();
        drop(cell);
        self.state.set(ServiceState::Stopped);
    }

    fn absorb_sanitizer_errors(&self, supervisor: &Supervisor) {
        let mut cell = self.cell.lock();
        if cell.absorbed {
            return;
        }
        cell.absorbed = true;
        let errors = supervisor.sanitizer_errors();
        if !errors.is_empty() {
            tracing::error!(
                "SANITIZER ERRORS in {}:\n{}",
                self.name,
                errors.join("\n")
            );
        }
        cell.sanitizer_errors.extend(errors);
    }

    pub fn sanitizer_errors(&self) -> Vec<String> {
        self.cell.lock().sanitizer_errors.clone()
    }

    fn open_log_file(&self) -> Result<std::fs::File> {
        let path = self.log_file_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::StartFailed(
                    self.name.clone(),
                    format!("creating log directory {}: {}", dir.display(), e),
                )
            })?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                Error::StartFailed(
                    self.name.clone(),
                    format!("opening log file {}: {}", path.display(), e),
                )
            })
    }

    fn read_version_files(&self) -> Result<Vec<u8>> {
        let mut hasher = Sha256::new();
        for path in &self.version_files {
            let mut file = std::fs::File::open(path).map_err(|e| {
                Error::Config(format!("unable to open {}: {}", path.display(), e))
            })?;
            std::io::copy(&mut file, &mut hasher).map_err(|e| {
                Error::Config(format!("unable to read {}: {}", path.display(), e))
            })?;
        }
        Ok(hasher.finalize().to_vec())
    }

    /// True iff the version files' digest no longer matches the digest
    /// frozen at the last successful start. Never acted on here; an
    /// external restart command decides.
    pub fn needs_restart(&self) -> bool {
        if self.version_files.is_empty() {
            return false;
        }
        match self.read_version_files() {
            Ok(current) => *self.frozen_version.read() != current,
            Err(e) => {
                tracing::warn!("[{}] Unable to read version file. {}", self.name, e);
                false
            }
        }
    }

    /// Snapshot for the status surface.
    pub fn status(&self) -> wire::SvcStatus {
        let errors = self.sanitizer_errors();
        let failure_message = if errors.is_empty() {
            None
        } else {
            Some(wire::FailureMessage {
                failure_type: wire::FailureType::HasRaces as i32,
                log: format!(
                    "{} SANITIZER ERRORS FOUND:\n{}",
                    errors.len(),
                    errors.join("\n")
                ),
            })
        };
        wire::SvcStatus {
            service_name: self.name.clone(),
            owner: self.owner.clone(),
            status_code: status_code_of(self.state.get()) as i32,
            needs_restart: self.needs_restart(),
            log_file: self.log_file_path().display().to_string(),
            service_type: self.service_type as i32,
            start_duration_ms: self.start_duration().as_millis() as i64,
            failure_message,
            pid: self.pid() as i64,
        }
    }

    /// Aggregate CPU time and RSS over the service's process tree. Any
    /// lookup failure other than a process exiting mid-walk discards
    /// the totals: a silent zero beats partial counts.
    pub fn diagnostics(&self) -> wire::Metrics {
        let pid = self.pid() as i32;
        let mut cpu = Duration::ZERO;
        let mut rss_bytes: u64 = 0;
        if pid != 0 {
            match procinfo::descendants(pid) {
                Ok(pids) => {
                    let mut failed = false;
                    for pid in pids {
                        match procinfo::cpu_time(pid) {
                            Ok(t) => cpu += t,
                            Err(ProcError::Gone) => continue,
                            Err(_) => {
                                failed = true;
                                break;
                            }
                        }
                        match procinfo::rss_bytes(pid) {
                            Ok(bytes) => rss_bytes += bytes,
                            Err(ProcError::Gone) => continue,
                            Err(_) => {
                                failed = true;
                                break;
                            }
                        }
                    }
                    if failed {
                        cpu = Duration::ZERO;
                        rss_bytes = 0;
                    }
                }
                Err(_) => {}
            }
        }
        wire::Metrics {
            service_name: self.name.clone(),
            cpu_time_ms: cpu.as_millis() as i64,
            rss_mb: (rss_bytes / (1024 * 1024)) as i64,
        }
    }
}

fn status_code_of(state: ServiceState) -> wire::StatusCode {
    match state {
        ServiceState::Stopped => wire::StatusCode::Stopped,
        ServiceState::Starting => wire::StatusCode::Starting,
        ServiceState::Started => wire::StatusCode::Started,
        ServiceState::Stopping => wire::StatusCode::Stopping,
        ServiceState::Error => wire::StatusCode::Error,
    }
}

/// SIGKILL every descendant of every pid in `pids`, re-enumerating the
/// trees at call time. Much harder to escape than signalling the
/// process group.
fn force_signal_process_tree(pids: &[i32], sig: Signal) -> std::result::Result<(), nix::Error> {
    let mut last_err = Ok(());
    for &pid in pids {
        let all = match procinfo::descendants(pid) {
            Ok(all) => all,
            Err(_) => {
                last_err = Err(nix::Error::ESRCH);
                continue;
            }
        };
        for child in all {
            if let Err(e) = kill(Pid::from_raw(child), sig) {
                last_err = Err(e);
            }
        }
    }
    last_err
}

/// Format a duration the way the status surfaces expect: `S.mmms`.
pub fn fmt_duration(d: Duration) -> String {
    format!("{}.{:03}s", d.as_secs(), d.subsec_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_paths() -> (tempfile::TempDir, ControlPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = ControlPaths::new(dir.path());
        (dir, paths)
    }

    fn daemon_def(name: &str, launch: &str, check: &str) -> wire::Service {
        wire::Service {
            service_name: name.to_string(),
            service_type: wire::ServiceType::Daemon as i32,
            launch_cmd: Some(wire::Command {
                cmd: launch.to_string(),
                env_vars: vec![],
            }),
            stop_cmd: None,
            dependencies: vec![],
            health_checks: vec![wire::HealthCheck {
                check_type: wire::HealthCheckType::Command as i32,
                cmd: Some(wire::Command {
                    cmd: check.to_string(),
                    env_vars: vec![],
                }),
                http_health_check: None,
            }],
            version_files: vec![],
            owner: String::new(),
            verbose: false,
        }
    }

    fn task_def(name: &str, launch: &str) -> wire::Service {
        wire::Service {
            service_name: name.to_string(),
            service_type: wire::ServiceType::Task as i32,
            launch_cmd: Some(wire::Command {
                cmd: launch.to_string(),
                env_vars: vec![],
            }),
            stop_cmd: None,
            dependencies: vec![],
            health_checks: vec![],
            version_files: vec![],
            owner: String::new(),
            verbose: false,
        }
    }

    fn build(def: &wire::Service, paths: &ControlPaths) -> Arc<Service> {
        Service::new(def, &HashMap::new(), paths, false).unwrap()
    }

    #[tokio::test]
    async fn daemon_with_passing_check_reaches_started() {
        let (_dir, paths) = scratch_paths();
        let svc = build(&daemon_def("up", "sleep infinity", "true"), &paths);
        svc.start().await.unwrap();
        svc.wait_till_healthy().await.unwrap();
        assert_eq!(svc.state(), ServiceState::Started);
        assert!(svc.pid() > 0);
        svc.stop().await.unwrap();
        assert_eq!(svc.state(), ServiceState::Stopped);
        assert_eq!(svc.pid(), 0);
    }

    #[tokio::test]
    async fn daemon_with_failing_check_stays_starting() {
        let (_dir, paths) = scratch_paths();
        let svc = build(&daemon_def("stuck", "sleep infinity", "exit 1"), &paths);
        svc.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(svc.state(), ServiceState::Starting);
        svc.stop().await.unwrap();
        assert_eq!(svc.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn daemon_that_exits_early_goes_to_error() {
        let (_dir, paths) = scratch_paths();
        // A service is expected to stay up; exiting zero is still wrong.
        let svc = build(&daemon_def("flaky", "exit 0", "exit 1"), &paths);
        svc.start().await.unwrap();
        let err = svc.wait_till_healthy().await.unwrap_err();
        assert!(err.to_string().contains("flaky"));
        assert_eq!(svc.state(), ServiceState::Error);
    }

    #[tokio::test]
    async fn daemon_killed_after_healthy_goes_to_error() {
        let (_dir, paths) = scratch_paths();
        let svc = build(&daemon_def("dying", "sleep infinity", "true"), &paths);
        svc.start().await.unwrap();
        svc.wait_till_healthy().await.unwrap();

        let pid = svc.pid();
        assert!(pid > 0);
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        while svc.state() == ServiceState::Started {
            assert!(Instant::now() < deadline, "timeout waiting for process death");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(svc.state(), ServiceState::Error);
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn task_success_reaches_started_and_writes_output() {
        let (dir, paths) = scratch_paths();
        let out = dir.path().join("task-out");
        let svc = build(&task_def("writer", &format!("echo testing > {}", out.display())), &paths);
        svc.start().await.unwrap();
        svc.wait_till_healthy().await.unwrap();
        assert_eq!(svc.state(), ServiceState::Started);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "testing\n");
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn task_failure_goes_to_error() {
        let (_dir, paths) = scratch_paths();
        let svc = build(&task_def("failing", "exit 1"), &paths);
        svc.start().await.unwrap();
        assert!(svc.wait_till_healthy().await.is_err());
        assert_eq!(svc.state(), ServiceState::Error);
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_on_stopped_service_is_a_noop() {
        let (_dir, paths) = scratch_paths();
        let svc = build(&task_def("idle", "true"), &paths);
        svc.stop().await.unwrap();
        assert_eq!(svc.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn restart_reaches_started_again() {
        let (_dir, paths) = scratch_paths();
        let svc = build(&daemon_def("again", "sleep infinity", "true"), &paths);
        for _ in 0..2 {
            svc.start().await.unwrap();
            svc.wait_till_healthy().await.unwrap();
            svc.stop().await.unwrap();
            assert_eq!(svc.state(), ServiceState::Stopped);
        }
    }

    #[tokio::test]
    async fn needs_restart_follows_version_file_contents() {
        let (dir, paths) = scratch_paths();
        let version_file = dir.path().join("version");
        std::fs::write(&version_file, "v1").unwrap();

        let mut def = daemon_def("versioned", "sleep infinity", "true");
        def.version_files = vec![version_file.display().to_string()];
        let svc = build(&def, &paths);

        svc.start().await.unwrap();
        svc.wait_till_healthy().await.unwrap();
        // The snapshotter runs after the healthy transition; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!svc.needs_restart());

        std::fs::write(&version_file, "v2").unwrap();
        assert!(svc.needs_restart());

        svc.stop().await.unwrap();
        svc.start().await.unwrap();
        svc.wait_till_healthy().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!svc.needs_restart());
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn missing_version_file_never_requests_restart() {
        let (_dir, paths) = scratch_paths();
        let mut def = daemon_def("ghost-version", "sleep infinity", "true");
        def.version_files = vec!["/does/not/exist".to_string()];
        let svc = build(&def, &paths);
        assert!(!svc.needs_restart());
    }

    #[tokio::test]
    async fn status_snapshot_carries_identity() {
        let (_dir, paths) = scratch_paths();
        let mut def = task_def("snap", "true");
        def.owner = "infra".to_string();
        let svc = build(&def, &paths);
        let status = svc.status();
        assert_eq!(status.service_name, "snap");
        assert_eq!(status.owner, "infra");
        assert_eq!(status.status_code, wire::StatusCode::Stopped as i32);
        assert!(status.log_file.ends_with("logs/service_logs/snap/service.log"));
        assert!(status.failure_message.is_none());
    }

    #[tokio::test]
    async fn banner_is_written_to_the_service_log() {
        let (_dir, paths) = scratch_paths();
        let svc = build(&task_def("bannered", "echo ran"), &paths);
        svc.start().await.unwrap();
        svc.wait_till_healthy().await.unwrap();
        let log = std::fs::read_to_string(svc.log_file_path()).unwrap();
        assert!(log.contains("Service starting at"));
        assert!(log.contains("echo ran"));
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn undeclared_dependency_is_rejected() {
        let (_dir, paths) = scratch_paths();
        let mut def = task_def("needy", "true");
        def.dependencies = vec!["missing".to_string()];
        let err = Service::new(&def, &HashMap::new(), &paths, false).unwrap_err();
        assert!(matches!(err, Error::UndeclaredDependency { .. }));
    }
}
