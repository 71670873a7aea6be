//! The service controller daemon. One instance runs per test
//! invocation; it binds an ephemeral localhost port, publishes it to
//! the scratch directory and serves until killed by the launcher.

use clap::Parser;
use std::sync::Arc;
use svcctl::{ControlPaths, Controller};

#[derive(Parser, Debug)]
#[command(name = "svcd", about = "Integration-test service controller daemon")]
struct Args {
    /// Verbose output for services
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let paths = ControlPaths::from_env()?;
    let controller = Arc::new(Controller::new(paths.clone(), args.verbose));
    svcctl::server::serve(controller, &paths).await?;
    Ok(())
}
