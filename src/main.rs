use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use malpkg_connector::{Config, GitRepository, RunnerOptions, SpoolSink, SqliteStateStorage, SyncRunner};

#[derive(Parser)]
#[command(name = "malpkg-connector")]
#[command(about = "Sync malicious-package records from a git feed into STIX bundles")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "CONNECTOR_CONFIG", default_value = "config.yml")]
    config: PathBuf,

    /// Perform a single run and exit
    #[arg(long)]
    once: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("malpkg_connector=info"))?;

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    info!("Starting malpkg-connector {}", malpkg_connector::VERSION);
    info!("Config file: {}", cli.config.display());

    let config = Config::load(&cli.config)?;
    info!("Repository: {} ({})", config.repo.url, config.repo.branch);
    info!("Working copy: {}", config.repo.local_path.display());
    info!("State database: {}", config.connector.state_db.display());

    let repo = GitRepository::new(&config.repo.url, &config.repo.branch, config.repo.local_path.clone());
    let sink = SpoolSink::open(&config.connector.state_db)?;
    let storage = SqliteStateStorage::open(&config.connector.state_db, &config.connector.name)?;

    let mut runner = SyncRunner::new(repo, sink, storage, RunnerOptions::from_config(&config));

    if cli.once {
        match runner.run_once() {
            Ok(summary) => {
                info!(
                    "Run complete: {} paths, {} records, {} skipped, {} objects in {} chunk(s)",
                    summary.changed_paths,
                    summary.records_parsed,
                    summary.records_rejected,
                    summary.objects_sent,
                    summary.chunks_sent
                );
                Ok(())
            }
            Err(e) => {
                error!("Run aborted: {:#}", e);
                Err(e)
            }
        }
    } else {
        runner.run_forever()
    }
}
