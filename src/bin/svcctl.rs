//! Operator CLI for the service controller.
//!
//! Every invocation first verifies that the service definitions this
//! container was built from still match the ones the controller was
//! started with; all commands refuse to run against a stale daemon.

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::time::Duration;
use svcctl::wire::messages as msg;
use svcctl::{fmt_duration, ControlChannel, ControlPaths};
use tokio::task::JoinSet;

#[derive(Parser, Debug)]
#[command(name = "svcctl", about = "Interact with the service controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the named services
    Start { services: Vec<String> },
    /// Stop the named services
    Stop { services: Vec<String> },
    /// Stop then start the named services
    Restart { services: Vec<String> },
    /// Start every registered service
    StartAll,
    /// Stop every registered service in reverse dependency order
    StopAll,
    /// Show service status
    Status {
        /// Show all services, including task services which are hidden
        /// by default
        #[arg(long)]
        all: bool,
        /// Only show services that require a restart
        #[arg(long)]
        requires_restart_only: bool,
        /// Render each row with a template; placeholders: {name},
        /// {owner}, {status}, {pid}, {cpu_time}, {rss}, {needs_restart}
        #[arg(long)]
        format: Option<String>,
        /// Show just this service
        service: Option<String>,
    },
    /// Restart any services whose version files changed since start
    AutoRestart,
    /// Explicitly invoke the service-definitions version check
    VersionCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let paths = ControlPaths::from_env()?;
    let channel = ControlChannel::new(paths);
    // The check happens unconditionally; a command never runs against
    // stale definitions.
    channel.version_check()?;

    match cli.command {
        Command::Start { services } => {
            for name in services {
                channel
                    .start(std::slice::from_ref(&name))
                    .await
                    .map_err(|e| anyhow::anyhow!("start failed: {}", e))?;
                println!("start successful: {}", name);
            }
        }
        Command::Stop { services } => {
            for name in services {
                channel
                    .stop(&name)
                    .await
                    .map_err(|e| anyhow::anyhow!("stop failed: {}", e))?;
                println!("stop successful: {}", name);
            }
        }
        Command::Restart { services } => {
            for name in services {
                let handle = channel.service(&name);
                handle
                    .stop()
                    .await
                    .map_err(|e| anyhow::anyhow!("restart failed: {}", e))?;
                handle
                    .start()
                    .await
                    .map_err(|e| anyhow::anyhow!("restart failed: {}", e))?;
                println!("restart successful: {}", name);
            }
        }
        Command::StartAll => {
            channel
                .start_all()
                .await
                .map_err(|e| anyhow::anyhow!("start failed: {}", e))?;
            println!("start all successful");
        }
        Command::StopAll => {
            channel
                .stop_all()
                .await
                .map_err(|e| anyhow::anyhow!("stop failed: {}", e))?;
            println!("stop all successful");
        }
        Command::Status {
            all,
            requires_restart_only,
            format,
            service,
        } => {
            status_command(&channel, all, requires_restart_only, format, service).await?;
        }
        Command::AutoRestart => auto_restart(&channel).await?,
        Command::VersionCheck => {
            // The actual check already ran above; reaching this line
            // means it passed.
            println!("Service definitions are up to date.");
        }
    }
    Ok(())
}

async fn status_command(
    channel: &ControlChannel,
    all: bool,
    requires_restart_only: bool,
    format: Option<String>,
    service: Option<String>,
) -> anyhow::Result<()> {
    if let Some(name) = service {
        let status = channel
            .service(&name)
            .status()
            .await
            .map_err(|e| anyhow::anyhow!("status failed: {}", e))?;
        let code = msg::StatusCode::try_from(status.status_code)
            .unwrap_or(msg::StatusCode::Error)
            .as_lower_str();
        if status.needs_restart {
            println!("{} - needs restart", code);
        } else {
            println!("{}", code);
        }
        println!("owner: {}", status.owner);
        println!("logs: {}", status.log_file);
        return Ok(());
    }

    let mut statuses = channel
        .status(vec![])
        .await
        .map_err(|e| anyhow::anyhow!("status failed: {}", e))?;
    statuses.sort_by(|a, b| a.service_name.cmp(&b.service_name));

    let template = match &format {
        Some(template) => template.clone(),
        None => {
            println!("{:<32}{:<24}{}", "Service", "Owner", "Status");
            "{needs_restart}{name:<32}{owner:<24}{status}".to_string()
        }
    };

    for status in statuses {
        if !all && status.service_type == msg::ServiceType::Task as i32 {
            continue;
        }
        if requires_restart_only && !status.needs_restart {
            continue;
        }
        let diagnostics = channel
            .service(&status.service_name)
            .diagnostics()
            .await
            .map_err(|e| anyhow::anyhow!("failed to get diagnostics: {}", e))?;
        println!("{}", render_row(&template, &status, &diagnostics));
    }
    Ok(())
}

/// Fill a row template. `{name:<32}` pads to a column; `{needs_restart}`
/// renders as a `*` marker.
fn render_row(template: &str, status: &msg::SvcStatus, diagnostics: &msg::Metrics) -> String {
    let code = msg::StatusCode::try_from(status.status_code)
        .unwrap_or(msg::StatusCode::Error)
        .as_lower_str();
    let marker = if status.needs_restart { "*" } else { "" };
    let mut out = template.to_string();
    let fields: &[(&str, String)] = &[
        ("name", status.service_name.clone()),
        ("owner", status.owner.clone()),
        ("status", code.to_string()),
        ("pid", status.pid.to_string()),
        (
            "cpu_time",
            fmt_duration(Duration::from_millis(diagnostics.cpu_time_ms.max(0) as u64)),
        ),
        ("rss", fmt_bytes(diagnostics.rss_mb * 1024 * 1024)),
        ("needs_restart", marker.to_string()),
    ];
    for (key, value) in fields {
        let plain = format!("{{{}}}", key);
        out = out.replace(&plain, value);
        // Padded variant, e.g. {name:<32}.
        let open = format!("{{{}:<", key);
        while let Some(start) = out.find(&open) {
            let rest = &out[start + open.len()..];
            let Some(close) = rest.find('}') else { break };
            let width: usize = rest[..close].parse().unwrap_or(0);
            let padded = format!("{:<width$}", value, width = width);
            out.replace_range(start..start + open.len() + close + 1, &padded);
        }
    }
    out
}

/// Humanized byte count: unadorned below 1K, then K/M/G/... with one
/// decimal under 10.
fn fmt_bytes(real_size: i64) -> String {
    if real_size < 1024 {
        return real_size.to_string();
    }
    let suffixes = ["", "K", "M", "G", "T", "P", "E"];
    let mut size = real_size as f64;
    let mut idx = 0;
    while idx < suffixes.len() - 1 {
        if size < 10.0 {
            return format!("{:.1}{}", size, suffixes[idx]);
        }
        if size < 1024.0 {
            return format!("{:.0}{}", size, suffixes[idx]);
        }
        size /= 1024.0;
        idx += 1;
    }
    format!("{:.0}{}", size, suffixes[idx])
}

/// Stop every service that needs a restart, then start them again.
/// All stops complete before any start begins: stopping a dependency
/// mid-start would make unrelated health checks flap.
async fn auto_restart(channel: &ControlChannel) -> anyhow::Result<()> {
    let services = channel
        .list_services()
        .await
        .map_err(|e| anyhow::anyhow!("autorestart failed: {}", e))?;
    let mut to_restart = Vec::new();
    for service in services {
        let status = service
            .status()
            .await
            .map_err(|e| anyhow::anyhow!("autorestart failed: {}. {}", service.name(), e))?;
        if status.needs_restart {
            to_restart.push(service);
        }
    }
    if to_restart.is_empty() {
        println!("No services need to restart.");
        return Ok(());
    }

    let mut stops = JoinSet::new();
    for service in to_restart.clone() {
        stops.spawn(async move { (service.name().to_string(), service.stop().await) });
    }
    while let Some(joined) = stops.join_next().await {
        let (name, outcome) = joined?;
        outcome.map_err(|e| anyhow::anyhow!("restart failed: {}. {}", name, e))?;
    }

    let mut starts = JoinSet::new();
    for service in to_restart {
        starts.spawn(async move { (service.name().to_string(), service.start().await) });
    }
    while let Some(joined) = starts.join_next().await {
        let (name, outcome) = joined?;
        outcome.map_err(|e| anyhow::anyhow!("restart failed: {}. {}", name, e))?;
        println!("restart successful: {}", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(name: &str, needs_restart: bool) -> msg::SvcStatus {
        msg::SvcStatus {
            service_name: name.to_string(),
            owner: "team".to_string(),
            status_code: msg::StatusCode::Started as i32,
            needs_restart,
            pid: 42,
            ..Default::default()
        }
    }

    fn metrics() -> msg::Metrics {
        msg::Metrics {
            service_name: "svc".to_string(),
            cpu_time_ms: 1500,
            rss_mb: 3,
        }
    }

    #[test]
    fn default_template_pads_columns() {
        let row = render_row(
            "{needs_restart}{name:<32}{owner:<24}{status}",
            &status("db", false),
            &metrics(),
        );
        assert!(row.starts_with("db"));
        assert!(row.ends_with("started"));
        assert!(row.contains("team"));
    }

    #[test]
    fn needs_restart_marker_prefixes_name() {
        let row = render_row("{needs_restart}{name}", &status("db", true), &metrics());
        assert_eq!(row, "*db");
    }

    #[test]
    fn custom_template_fields() {
        let row = render_row("{name} {pid} {cpu_time} {rss}", &status("db", false), &metrics());
        assert_eq!(row, "db 42 1.500s 3.0M");
    }

    #[test]
    fn bytes_humanize() {
        assert_eq!(fmt_bytes(512), "512");
        assert_eq!(fmt_bytes(2048), "2.0K");
        assert_eq!(fmt_bytes(150 * 1024), "150K");
        assert_eq!(fmt_bytes(3 * 1024 * 1024), "3.0M");
    }
}
