//! Thin wrapper around one external shell invocation.
//!
//! The supervisor owns the OS process, its waiter task and the
//! sanitizer log directory. Its state only moves forward
//! (initial -> running -> exited) and `wait` may be called any number
//! of times.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    Running,
    Exited,
}

/// How the child's stdout/stderr are wired at start time.
pub enum OutputSink {
    /// Both streams append to the given file.
    File(std::fs::File),
    /// Both streams append to the file and are mirrored line by line to
    /// the parent's stderr, prefixed with the service name.
    Tee { file: std::fs::File, prefix: String },
    /// Inherit the parent's stdio.
    Inherit,
    /// Discard all output.
    Null,
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    pid: Option<u32>,
    exit: Option<ExitStatus>,
    sanitizer_errors: Vec<String>,
}

/// Supervises a single `/bin/bash -c` invocation.
#[derive(Debug)]
pub struct Supervisor {
    cmd: String,
    envs: Vec<(String, String)>,
    scratch_root: PathBuf,
    inner: Arc<Mutex<Inner>>,
    exited_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(cmd: String, envs: Vec<(String, String)>, scratch_root: PathBuf) -> Self {
        let (exited_tx, _) = watch::channel(false);
        Self {
            cmd,
            envs,
            scratch_root,
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Initial,
                pid: None,
                exit: None,
                sanitizer_errors: Vec::new(),
            })),
            exited_tx,
        }
    }

    /// Launch the command in its own process group and spawn the waiter.
    ///
    /// On success the internal state moves to running; on failure it
    /// stays initial and the error is returned to the caller.
    pub fn start(&self, sink: OutputSink) -> Result<()> {
        let sanitizer_dir = self.make_sanitizer_dir()?;

        let mut command = Command::new("/bin/bash");
        command.arg("-c").arg("--").arg(&self.cmd);
        command.env_clear();
        for (key, value) in self.filtered_envs(&sanitizer_dir) {
            command.env(key, value);
        }
        // Child gets its own process group so signals aimed at the
        // service tree never hit the controller.
        command.process_group(0);
        command.stdin(Stdio::null());
        command.kill_on_drop(false);

        let mut tee_prefix = None;
        match sink {
            OutputSink::File(file) => {
                let err_file = file.try_clone()?;
                command.stdout(Stdio::from(file));
                command.stderr(Stdio::from(err_file));
            }
            OutputSink::Tee { file, prefix } => {
                command.stdout(Stdio::piped());
                command.stderr(Stdio::piped());
                tee_prefix = Some((file, prefix));
            }
            OutputSink::Inherit => {
                command.stdout(Stdio::inherit());
                command.stderr(Stdio::inherit());
            }
            OutputSink::Null => {
                command.stdout(Stdio::null());
                command.stderr(Stdio::null());
            }
        }

        let mut child = command.spawn()?;
        let pid = child.id();

        if let Some((file, prefix)) = tee_prefix {
            spawn_tee(child.stdout.take(), file.try_clone().ok(), prefix.clone());
            spawn_tee(child.stderr.take(), Some(file), prefix);
        }

        {
            let mut inner = self.inner.lock();
            inner.phase = Phase::Running;
            inner.pid = pid;
        }

        let inner = Arc::clone(&self.inner);
        let exited_tx = self.exited_tx.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!("waiting on supervised process failed: {}", e);
                    // Synthesize a non-zero status so downstream health
                    // logic treats the process as failed.
                    ExitStatus::from_raw(0x7f00)
                }
            };
            let errors = collect_sanitizer_logs(&sanitizer_dir);
            {
                let mut guard = inner.lock();
                guard.exit = Some(status);
                guard.sanitizer_errors = errors;
                guard.phase = Phase::Exited;
            }
            exited_tx.send_replace(true);
        });
        Ok(())
    }

    /// Strip any inherited sanitizer variables and re-point them at a
    /// private log directory.
    fn filtered_envs(&self, sanitizer_dir: &Path) -> Vec<(String, String)> {
        let mut envs: Vec<(String, String)> = self
            .envs
            .iter()
            .filter(|(key, _)| key != "GORACE" && key != "EXTRA_COMMON_SAN_OPTIONS")
            .cloned()
            .collect();
        let race_prefix = sanitizer_dir.join("race_log");
        envs.push((
            "GORACE".to_string(),
            format!("halt_on_error=1 log_path={}", race_prefix.display()),
        ));
        let san_prefix = sanitizer_dir.join("sanitizer");
        envs.push((
            "EXTRA_COMMON_SAN_OPTIONS".to_string(),
            format!("log_path={}:print_suppressions=false", san_prefix.display()),
        ));
        envs
    }

    fn make_sanitizer_dir(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.scratch_root)?;
        let dir = tempfile::Builder::new()
            .prefix("sanitizer-")
            .tempdir_in(&self.scratch_root)
            .map_err(|e| Error::Config(format!("creating sanitizer log dir: {}", e)))?;
        Ok(dir.into_path())
    }

    /// Block until the process has been reaped. Idempotent.
    pub async fn wait(&self) -> ExitStatus {
        let mut rx = self.exited_tx.subscribe();
        let _ = rx.wait_for(|exited| *exited).await;
        self.inner
            .lock()
            .exit
            .expect("exit status recorded before exit broadcast")
    }

    /// Non-blocking exit predicate.
    pub fn exited(&self) -> bool {
        self.inner.lock().phase == Phase::Exited
    }

    /// The child's pid, present once `start` has succeeded.
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().pid
    }

    /// Sanitizer log contents; populated only after exit.
    pub fn sanitizer_errors(&self) -> Vec<String> {
        self.inner.lock().sanitizer_errors.clone()
    }
}

/// Read every file the sanitizers dropped, then remove the directory.
/// Non-empty contents count as errors; nothing here interprets them.
fn collect_sanitizer_logs(dir: &Path) -> Vec<String> {
    let mut errors = Vec::new();
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                match std::fs::read_to_string(entry.path()) {
                    Ok(contents) if !contents.is_empty() => errors.push(contents),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("reading sanitizer log {}: {}", entry.path().display(), e);
                    }
                }
            }
        }
        Err(e) => tracing::warn!("reading sanitizer log directory: {}", e),
    }
    if let Err(e) = std::fs::remove_dir_all(dir) {
        tracing::warn!("removing sanitizer log directory: {}", e);
    }
    errors
}

fn spawn_tee(
    stream: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    file: Option<std::fs::File>,
    prefix: String,
) {
    use std::io::Write;
    use tokio::io::AsyncBufReadExt;
    let Some(stream) = stream else { return };
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stream).lines();
        let mut file = file;
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(f) = file.as_mut() {
                let _ = writeln!(f, "{}", line);
            }
            eprintln!("[{}] {}", prefix, line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[tokio::test]
    async fn wait_is_idempotent() {
        let dir = scratch();
        let sup = Supervisor::new("true".to_string(), vec![], dir.path().to_path_buf());
        sup.start(OutputSink::Null).unwrap();
        let first = sup.wait().await;
        let second = sup.wait().await;
        assert!(first.success());
        assert_eq!(first, second);
        assert!(sup.exited());
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let dir = scratch();
        let sup = Supervisor::new("exit 3".to_string(), vec![], dir.path().to_path_buf());
        sup.start(OutputSink::Null).unwrap();
        let status = sup.wait().await;
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn sanitizer_env_is_rewritten() {
        let dir = scratch();
        let out = dir.path().join("env-dump");
        let sup = Supervisor::new(
            format!("env > {}", out.display()),
            vec![
                ("GORACE".to_string(), "stale".to_string()),
                ("KEEP".to_string(), "yes".to_string()),
            ],
            dir.path().to_path_buf(),
        );
        sup.start(OutputSink::Null).unwrap();
        sup.wait().await;
        let dump = std::fs::read_to_string(&out).unwrap();
        assert!(dump.contains("KEEP=yes"));
        assert!(dump.contains("GORACE=halt_on_error=1"));
        assert!(!dump.contains("GORACE=stale"));
        assert!(dump.contains("EXTRA_COMMON_SAN_OPTIONS=log_path="));
    }

    #[tokio::test]
    async fn nonempty_sanitizer_files_become_errors() {
        let dir = scratch();
        // The command writes into its own sanitizer directory through
        // the env var the supervisor injected.
        let cmd = r#"race_dir="${GORACE#*log_path=}"; race_dir="${race_dir%/race_log}"; echo "WARNING: DATA RACE" > "$race_dir/race_log.123""#;
        let sup = Supervisor::new(cmd.to_string(), vec![], dir.path().to_path_buf());
        sup.start(OutputSink::Null).unwrap();
        sup.wait().await;
        let errors = sup.sanitizer_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("DATA RACE"));
    }

    #[tokio::test]
    async fn empty_sanitizer_dir_means_no_errors() {
        let dir = scratch();
        let sup = Supervisor::new("true".to_string(), vec![], dir.path().to_path_buf());
        sup.start(OutputSink::Null).unwrap();
        sup.wait().await;
        assert!(sup.sanitizer_errors().is_empty());
    }

    #[tokio::test]
    async fn pid_present_after_start() {
        let dir = scratch();
        let sup = Supervisor::new("sleep 5".to_string(), vec![], dir.path().to_path_buf());
        assert!(sup.pid().is_none());
        sup.start(OutputSink::Null).unwrap();
        let pid = sup.pid().expect("running process has a pid");
        assert!(pid > 0);
        // Reap it so the test does not leak a sleeper.
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .unwrap();
        sup.wait().await;
    }
}
