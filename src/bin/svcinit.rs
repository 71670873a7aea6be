//! Test launcher. Brings the controller daemon up, registers service
//! definitions, gates the test binary on service health, tears
//! everything down, and folds service outcomes into the test's JUnit
//! XML.
//!
//! Flags this wrapper recognizes are picked out of argv by name;
//! everything else is handed to the test binary untouched, and a
//! literal `--` passes the remainder through verbatim.

use clap::Parser;
use futures::FutureExt;
use parking_lot::Mutex;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use svcctl::wire::messages as msg;
use svcctl::{defs::ServiceDefs, fmt_duration, junit, ControlChannel, ControlPaths};

const DAEMON_WAIT_DEADLINE: Duration = Duration::from_secs(5);
const DAEMON_WAIT_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Parser, Debug, Default)]
#[command(name = "svcinit")]
struct Args {
    /// Verbose output for services
    #[arg(long = "svc.verbose", default_value_t = false)]
    verbose: bool,

    /// Path to a file representing the version of service definitions,
    /// to keep track of stale and incorrect service definitions
    #[arg(long = "svc.service-defs-version-file")]
    service_defs_version_file: Option<PathBuf>,

    /// Path to the file containing service definitions
    #[arg(long = "svc.service-defs")]
    service_defs: Option<PathBuf>,

    /// Don't start any services, only create the definitions
    #[arg(long = "svc.create-only", default_value_t = false)]
    create_only: bool,

    /// Don't run any binaries after services have launched; just exit
    /// and leave the services running
    #[arg(long = "svc.services-only", default_value_t = false)]
    services_only: bool,

    /// Don't launch services; just run the test
    #[arg(long = "svc.test-only", default_value_t = false)]
    test_only: bool,

    /// Test binary name to be used in junit output
    #[arg(long = "svc.test-bin", default_value = "")]
    test_bin: String,

    /// Try a quick but graceful stop at shutdown. Slower, but useful
    /// when services need time to flush sanitizer reports on exit
    #[arg(long = "svc.graceful-stop", default_value_t = false)]
    graceful_stop: bool,

    /// Comma-separated services that must still be healthy after the
    /// test completes
    #[arg(long = "svc.fail-test-on-crash-services", default_value = "")]
    fail_test_on_crash_services: String,

    /// Path to the controller daemon binary; defaults to `svcd` next
    /// to this executable
    #[arg(long = "svc.daemon-bin")]
    daemon_bin: Option<PathBuf>,
}

/// Flags recognized here are consumed; everything else belongs to the
/// test command line. Only `--flag=value` and `--flag` shapes are
/// supported for our own flags.
fn split_args(argv: &[String]) -> (Vec<String>, Vec<String>) {
    const OURS: &[&str] = &[
        "svc.verbose",
        "svc.service-defs-version-file",
        "svc.service-defs",
        "svc.create-only",
        "svc.services-only",
        "svc.test-only",
        "svc.test-bin",
        "svc.graceful-stop",
        "svc.fail-test-on-crash-services",
        "svc.daemon-bin",
        "help",
        "h",
    ];
    let mut ours = Vec::new();
    let mut test = Vec::new();
    let mut iter = argv.iter();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            test.extend(iter.cloned());
            break;
        }
        if !arg.starts_with('-') {
            test.push(arg.clone());
            continue;
        }
        let name = arg.split('=').next().unwrap_or("").trim_start_matches('-');
        if OURS.contains(&name) {
            ours.push(arg.clone());
        } else {
            test.push(arg.clone());
        }
    }
    (ours, test)
}

struct TestOutcome {
    failed: bool,
    duration: Duration,
}

struct ServiceResult {
    name: String,
    start_duration: Duration,
    failed: bool,
    failure_message: Option<msg::FailureMessage>,
    cpu_time: Duration,
    rss_mb: i64,
}

fn failing_names(results: &[ServiceResult]) -> Vec<String> {
    let mut names: Vec<String> = results
        .iter()
        .filter(|r| r.failed)
        .map(|r| r.name.clone())
        .collect();
    names.sort();
    names
}

async fn service_status_and_diagnostics(
    channel: &ControlChannel,
) -> svcctl::Result<Vec<ServiceResult>> {
    let statuses = channel.status(vec![]).await?;
    let diagnostics = channel.diagnostics(vec![]).await?;
    let by_name: std::collections::HashMap<String, msg::Metrics> = diagnostics
        .into_iter()
        .map(|m| (m.service_name.clone(), m))
        .collect();

    Ok(statuses
        .into_iter()
        .map(|status| {
            let metrics = by_name.get(&status.service_name);
            ServiceResult {
                name: status.service_name.clone(),
                start_duration: Duration::from_millis(status.start_duration_ms.max(0) as u64),
                failed: status.status_code == msg::StatusCode::Error as i32,
                failure_message: status.failure_message,
                cpu_time: Duration::from_millis(
                    metrics.map(|m| m.cpu_time_ms.max(0) as u64).unwrap_or(0),
                ),
                rss_mb: metrics.map(|m| m.rss_mb).unwrap_or(0),
            }
        })
        .collect())
}

fn service_testcases(target: &str, results: &[ServiceResult]) -> Vec<junit::TestCase> {
    results
        .iter()
        .map(|svc| {
            let mut fail_msg = String::new();
            if svc.failed {
                fail_msg = format!("Service {} failed", svc.name);
                if let Some(message) = &svc.failure_message {
                    if !message.log.is_empty() {
                        fail_msg.push('\n');
                        fail_msg.push_str(&message.log);
                    }
                }
            }
            let mut properties = vec![junit::Property {
                name: junit::TEST_CASE_TYPE_PROPERTY.to_string(),
                value: junit::SERVICE_TEST_CASE_TYPE.to_string(),
            }];
            let has_races = svc
                .failure_message
                .as_ref()
                .map(|m| m.failure_type == msg::FailureType::HasRaces as i32)
                .unwrap_or(false);
            if has_races {
                properties.push(junit::Property {
                    name: junit::FAILURE_REASON_PROPERTY.to_string(),
                    value: junit::HAS_RACES_REASON.to_string(),
                });
            }
            properties.push(junit::Property {
                name: junit::SVC_START_DURATION_PROPERTY.to_string(),
                value: svc.start_duration.as_secs().to_string(),
            });
            properties.push(junit::Property {
                name: junit::CPU_TIME_MS_PROPERTY.to_string(),
                value: svc.cpu_time.as_millis().to_string(),
            });
            properties.push(junit::Property {
                name: junit::RSS_MB_PROPERTY.to_string(),
                value: svc.rss_mb.to_string(),
            });
            junit::generate_test_case(target, &svc.name, svc.start_duration, &fail_msg, properties)
        })
        .collect()
}

struct TestInfo {
    target: String,
    binary: String,
    failed: bool,
    duration: Duration,
    total_duration: Duration,
    service_results: Vec<ServiceResult>,
}

/// Merge service outcomes into the JUnit file at `xml_output_file`.
/// `src` is the XML the test binary produced, if any.
fn overwrite_junit_for_services(
    src: Option<&str>,
    xml_output_file: &str,
    ti: &TestInfo,
) -> anyhow::Result<()> {
    if xml_output_file.is_empty() {
        return Ok(());
    }
    let mut testcases = Vec::new();
    if src.is_none() {
        // The test binary generated no junit; synthesize a case for
        // the test itself, minus services.
        let fail_msg = if ti.failed { "Test failed" } else { "" };
        testcases.push(junit::generate_test_case(
            &ti.target,
            &ti.binary,
            ti.duration,
            fail_msg,
            vec![],
        ));
    }
    testcases.extend(service_testcases(&ti.target, &ti.service_results));

    let merged = junit::overwrite_xml_duration(src, ti.total_duration, &ti.target, testcases)?;
    std::fs::write(xml_output_file, merged)?;
    Ok(())
}

/// After everything is down, flag services whose only failure is
/// sanitizer output; they fail the test even when it passed.
fn overwrite_junit_for_races(
    xml_output_file: &str,
    mut services: Vec<ServiceResult>,
    total_duration: Duration,
    test_binary: &str,
) -> anyhow::Result<()> {
    for svc in &mut services {
        svc.failed = svc
            .failure_message
            .as_ref()
            .map(|m| m.failure_type == msg::FailureType::HasRaces as i32)
            .unwrap_or(false);
    }
    if failing_names(&services).is_empty() {
        return Ok(());
    }
    let ti = TestInfo {
        target: test_name_from_env(test_binary),
        binary: test_binary.to_string(),
        failed: false,
        duration: Duration::ZERO,
        total_duration,
        service_results: services,
    };
    overwrite_junit_for_services(None, xml_output_file, &ti)
}

/// Repeatable test name from the runner environment, made distinct
/// across shards.
fn test_name_from_env(fallback: &str) -> String {
    let mut name = std::env::var("TEST_BINARY").unwrap_or_else(|_| fallback.to_string());
    let total_shards: u64 = std::env::var("TEST_TOTAL_SHARDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if total_shards > 0 {
        let shard: u64 = std::env::var("TEST_SHARD_INDEX")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
            + 1;
        name = format!("{}_shard_{}_of_{}", name, shard, total_shards);
    }
    name
}

fn is_failing_junit(path: &str) -> anyhow::Result<bool> {
    let raw = std::fs::read_to_string(path)?;
    let doc = junit::parse(&raw)?;
    Ok(doc.has_failing_test())
}

fn copy_file(dst: &Path, src: &Path) -> anyhow::Result<()> {
    let content = std::fs::read(src)
        .map_err(|e| anyhow::anyhow!("can't open file for reading: {}", e))?;
    std::fs::write(dst, content)?;
    Ok(())
}

type Cleanup = Box<dyn FnOnce() -> futures::future::BoxFuture<'static, ()> + Send>;

/// Run cleanups newest-first. Outside a test run, skip them entirely so
/// developers can inspect the services as-is.
async fn perform_cleanups(cleanups: &mut Vec<Cleanup>, inside_bazel_test: bool) {
    if !inside_bazel_test {
        return;
    }
    while let Some(cleanup) = cleanups.pop() {
        cleanup().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let (our_args, test_args) = split_args(&argv);
    let mut clap_argv = vec!["svcinit".to_string()];
    clap_argv.extend(our_args);
    let args = Args::parse_from(clap_argv);

    match run(args, test_args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, test_args: Vec<String>) -> anyhow::Result<ExitCode> {
    let start_time = Instant::now();

    let fail_test_on_crash: Vec<String> = args
        .fail_test_on_crash_services
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if test_args.is_empty() && !args.services_only {
        anyhow::bail!("When no arguments are passed in, --svc.services-only must be explicitly passed.");
    }

    if args.test_only {
        let Some(test_bin) = test_args.first() else {
            anyhow::bail!("--svc.test-only requires a test command");
        };
        let err = std::process::Command::new(test_bin)
            .args(&test_args[1..])
            .exec();
        anyhow::bail!("Unable to exec: {}", err);
    }

    let paths = ControlPaths::from_env()?;
    let channel = ControlChannel::new(paths.clone());

    if channel.listening().await {
        anyhow::bail!("svcd is already running. Perhaps you want --svc.test-only.");
    }

    let version_file = args
        .service_defs_version_file
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("--svc.service-defs-version-file is required"))?;
    copy_file(&paths.frozen_defs_version_file(), version_file)
        .map_err(|e| anyhow::anyhow!("Unable to copy version file. {}", e))?;
    // Re-link on every run; a persistent development container may
    // still carry the previous symlink.
    let current = paths.current_defs_version_file();
    if current.symlink_metadata().is_ok() {
        let _ = std::fs::remove_file(&current);
    }
    std::os::unix::fs::symlink(version_file, &current)
        .map_err(|e| anyhow::anyhow!("Unable to symlink version file. {}", e))?;

    // --svc.services-only is never set inside `bazel test`.
    let inside_bazel_test = !args.services_only;
    let mut cleanups: Vec<Cleanup> = Vec::new();

    // Fork the daemon.
    let daemon_bin = match &args.daemon_bin {
        Some(path) => path.clone(),
        None => {
            let exe = std::env::current_exe()?;
            exe.parent()
                .map(|dir| dir.join("svcd"))
                .ok_or_else(|| anyhow::anyhow!("cannot locate svcd next to {}", exe.display()))?
        }
    };
    let mut daemon_cmd = std::process::Command::new(&daemon_bin);
    if args.verbose {
        daemon_cmd.arg("--verbose");
    }
    if let Ok(runfiles) = std::env::var("RUNFILES") {
        daemon_cmd.current_dir(runfiles);
    }
    let daemon = daemon_cmd
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to start svcd: {}", e))?;
    let daemon = Arc::new(Mutex::new(daemon));
    {
        let daemon = Arc::clone(&daemon);
        cleanups.push(Box::new(move || {
            async move {
                tracing::info!("Shutting down service controller");
                {
                    let mut child = daemon.lock();
                    let _ = child.kill();
                    let _ = child.wait();
                }
                // Reaped children rusage is dominated by the daemon at
                // this point; everything else was stopped through it.
                if let Ok(usage) =
                    nix::sys::resource::getrusage(nix::sys::resource::UsageWho::RUSAGE_CHILDREN)
                {
                    let user = usage.user_time();
                    let system = usage.system_time();
                    tracing::info!(
                        "Services resource utilization: User: {}.{:06}s System: {}.{:06}s",
                        user.tv_sec(),
                        user.tv_usec(),
                        system.tv_sec(),
                        system.tv_usec()
                    );
                }
            }.boxed()
        }));
    }

    // Surface service logs next to the test outputs.
    if let Ok(outputs_dir) = std::env::var("TEST_UNDECLARED_OUTPUTS_DIR") {
        let _ = std::os::unix::fs::symlink(paths.logs_dir(), Path::new(&outputs_dir).join("logs"));
    }

    // The wait is unconditional: a test that registers nothing up front
    // may still expect the controller to be reachable.
    let wait_start = Instant::now();
    while !channel.listening().await {
        tokio::time::sleep(DAEMON_WAIT_INTERVAL).await;
        if wait_start.elapsed() > DAEMON_WAIT_DEADLINE {
            // Kill the daemon now or it reparents to the test runner
            // and holds the test open until the timeout.
            perform_cleanups(&mut cleanups, inside_bazel_test).await;
            anyhow::bail!("Deadline exceeded waiting for svcd");
        }
    }

    // After stop-all, re-check every service for sanitizer output and
    // rewrite the junit if any raced.
    {
        let channel = channel.clone();
        let test_bin = args.test_bin.clone();
        cleanups.push(Box::new(move || {
            async move {
                if let Ok(xml) = std::env::var("XML_OUTPUT_FILE") {
                    match service_status_and_diagnostics(&channel).await {
                        Ok(services) => {
                            if let Err(e) = overwrite_junit_for_races(
                                &xml,
                                services,
                                start_time.elapsed(),
                                &test_bin,
                            ) {
                                tracing::warn!(
                                    "Error overwriting junit.xml file for failed services: {}",
                                    e
                                );
                            }
                        }
                        Err(e) => tracing::warn!("get services status {}", e),
                    }
                }
            }.boxed()
        }));
    }

    if let Some(defs_path) = &args.service_defs {
        let defs = ServiceDefs::load(defs_path)
            .map_err(|e| anyhow::anyhow!("Error reading service definitions file {}: {}", defs_path.display(), e))?;
        channel.create_batch(&defs.to_create_batch()).await?;

        if !args.create_only {
            let graceful = args.graceful_stop;
            let stop_channel = channel.clone();
            cleanups.push(Box::new(move || {
                async move {
                    let outcome = if graceful {
                        stop_channel.stop_all().await
                    } else {
                        stop_channel.stop_all_unsafe().await
                    };
                    if let Err(e) = outcome {
                        tracing::warn!("stop all failed: {}", e);
                    }
                }.boxed()
            }));

            if let Err(start_err) = channel.start_all().await {
                tracing::error!("Services did not start correctly. {}", start_err);
                if inside_bazel_test {
                    if let Ok(services) = service_status_and_diagnostics(&channel).await {
                        let ti = TestInfo {
                            target: test_name_from_env(&args.test_bin),
                            binary: args.test_bin.clone(),
                            failed: false,
                            duration: Duration::ZERO,
                            total_duration: start_time.elapsed(),
                            service_results: services,
                        };
                        let xml = std::env::var("XML_OUTPUT_FILE").unwrap_or_default();
                        let _ = overwrite_junit_for_services(None, &xml, &ti);
                    }
                }
                perform_cleanups(&mut cleanups, inside_bazel_test).await;
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    let services_from_svcd = match service_status_and_diagnostics(&channel).await {
        Ok(services) => services,
        Err(e) => {
            tracing::error!("Error getting service status from svcd: {}", e);
            perform_cleanups(&mut cleanups, inside_bazel_test).await;
            return Ok(ExitCode::FAILURE);
        }
    };
    let unhealthy = failing_names(&services_from_svcd);
    if !unhealthy.is_empty() {
        tracing::error!("Some services are no longer healthy, exiting. {:?}", unhealthy);
        if inside_bazel_test {
            let ti = TestInfo {
                target: test_name_from_env(&args.test_bin),
                binary: args.test_bin.clone(),
                failed: false,
                duration: Duration::ZERO,
                total_duration: start_time.elapsed(),
                service_results: services_from_svcd,
            };
            let xml = std::env::var("XML_OUTPUT_FILE").unwrap_or_default();
            if let Err(e) = overwrite_junit_for_services(None, &xml, &ti) {
                tracing::warn!("Error overwriting junit.xml file for failed services: {}", e);
            }
        }
        perform_cleanups(&mut cleanups, inside_bazel_test).await;
        return Ok(ExitCode::FAILURE);
    }

    tracing::info!("Services healthy {}", fmt_duration(start_time.elapsed()));

    if !inside_bazel_test {
        // Leave everything running for interactive use.
        return Ok(ExitCode::SUCCESS);
    }

    let temp_xml_dir = tempfile::Builder::new()
        .prefix("svcctl-xml-output")
        .tempdir_in(paths.root())
        .map_err(|e| anyhow::anyhow!("Unable to create temp dir for XML output. {}", e))?;
    let temp_xml_file = temp_xml_dir.path().join("test.xml");

    let outcome = Arc::new(Mutex::new(TestOutcome {
        failed: false,
        duration: Duration::ZERO,
    }));

    // Copy the (merged) XML to the real output path once the run is
    // over, whatever the outcome.
    {
        let outcome = Arc::clone(&outcome);
        let temp_xml_file = temp_xml_file.clone();
        let channel = channel.clone();
        let test_bin = args.test_bin.clone();
        cleanups.push(Box::new(move || {
            async move {
                let actual = std::env::var("XML_OUTPUT_FILE").unwrap_or_default();
                if actual.is_empty() {
                    // Test runner did not request output.
                    return;
                }
                let src = match std::fs::read_to_string(&temp_xml_file) {
                    Ok(contents) => Some(contents),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                    Err(e) => {
                        tracing::warn!("Couldn't open generated XML file: {}", e);
                        return;
                    }
                };
                let services = service_status_and_diagnostics(&channel)
                    .await
                    .unwrap_or_default();
                let (failed, duration) = {
                    let o = outcome.lock();
                    (o.failed, o.duration)
                };
                let ti = TestInfo {
                    target: test_name_from_env(&test_bin),
                    binary: test_bin.clone(),
                    failed,
                    duration,
                    total_duration: start_time.elapsed(),
                    service_results: services,
                };
                if let Err(e) = overwrite_junit_for_services(src.as_deref(), &actual, &ti) {
                    tracing::warn!("Error overwriting junit XML file: {}", e);
                }
            }.boxed()
        }));
    }

    tracing::info!("Executing command: {}", test_args.join(" "));
    let mut test_cmd = tokio::process::Command::new(&test_args[0]);
    test_cmd
        .args(&test_args[1..])
        .env("XML_OUTPUT_FILE", &temp_xml_file);

    let test_start = Instant::now();
    let status = match test_cmd.status().await {
        Ok(status) => status,
        Err(e) => {
            tracing::error!("Error launching test command: {}", e);
            outcome.lock().failed = true;
            perform_cleanups(&mut cleanups, inside_bazel_test).await;
            return Ok(ExitCode::FAILURE);
        }
    };
    let test_duration = test_start.elapsed();
    outcome.lock().duration = test_duration;

    if !status.success() {
        tracing::error!("Encountered error during test run: {}", status);
        outcome.lock().failed = true;
        perform_cleanups(&mut cleanups, inside_bazel_test).await;
        return Ok(ExitCode::FAILURE);
    }
    tracing::info!("Test duration: {}", fmt_duration(test_duration));

    tracing::info!("Checking services health before cleaning up.");
    match service_status_and_diagnostics(&channel).await {
        Ok(statuses) => {
            let failed = failing_names(&statuses);
            if !failed.is_empty() {
                tracing::warn!("Unhealthy services: {:?}", failed);
                for service in &fail_test_on_crash {
                    if failed.contains(service) {
                        tracing::error!(
                            "Service {} is configured to fail tests when it is unhealthy. Marking the test failed.",
                            service
                        );
                        outcome.lock().failed = true;
                        perform_cleanups(&mut cleanups, inside_bazel_test).await;
                        return Ok(ExitCode::FAILURE);
                    }
                }
            }
        }
        Err(e) => tracing::warn!("Failed to get service status: {}", e),
    }

    perform_cleanups(&mut cleanups, inside_bazel_test).await;
    tracing::info!("Cleanup complete");

    if let Ok(actual_xml) = std::env::var("XML_OUTPUT_FILE") {
        if !actual_xml.is_empty() {
            match is_failing_junit(&actual_xml) {
                Ok(true) => {
                    tracing::error!(
                        "Test exited successfully, but JUnit indicates failure; failing."
                    );
                    return Ok(ExitCode::FAILURE);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Failed to interpret final junit file {}: {}", actual_xml, e)
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
