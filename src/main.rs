//! The bastiond daemon: load the policy document, check the audit
//! collector if one is configured, then serve relay sessions forever.

use bastiond::Server;
use bastiond::audit::collector;
use bastiond::config::Config;
use clap::Parser;
use slog::{Drain, o};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "bastiond", about = "Auditing SSH bastion relay", version)]
struct Args {
    /// Path to the YAML configuration document.
    #[arg(short, long, default_value = "/etc/bastion/config.yaml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let logger = slog::Logger::root(slog_stdlog::StdLog {}.fuse(), o!());

    let args = Args::parse();
    let config = Arc::new(Config::load(&args.config)?);

    // A dead collector is a configuration error, not something to discover
    // on the first session's audit record.
    if let Some(url) = config.global.audit_collector.as_deref() {
        collector::probe(url).await?;
        slog::info!(logger, "audit collector reachable"; "url" => url);
    }

    let server = Server::with_config(config).logger(logger).build()?;
    server.listen().await?;
    Ok(())
}
