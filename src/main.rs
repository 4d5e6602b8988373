use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

mod cli;

use cli::Cli;
use cli::commands::Commands;
use offsync::config::Config;
use offsync::migrate::Migrator;
use offsync::remote::HttpRemote;
use offsync::store::{FlatStore, Record};
use offsync::sync::DrainOutcome;
use offsync::{SaveOutcome, ServiceOptions, SyncService};

fn setup_logging(config: &Config) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("offsync")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("offsync.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let default_level = config.log_level.as_deref().unwrap_or("info");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn open_service(cli: &Cli, config: &Config) -> Result<SyncService> {
    let flat = Arc::new(
        FlatStore::open(config.storage.flat_path(), config.storage.fallback_capacity_bytes)
            .context("Failed to open flat store")?,
    );
    let remote = Arc::new(HttpRemote::new(config.remote.http()).context("Failed to create HTTP client")?);

    let mut options = ServiceOptions::from_config(config);
    match cli.command {
        Commands::Migrate => options.migrator = Some(Migrator::default()),
        Commands::Run => options.start_scheduler = true,
        _ => {}
    }

    SyncService::init(options, flat, remote)
        .await
        .context("Failed to initialize sync service")
}

fn print_record(record: &Record) {
    let key = record.key.as_ref().map(|k| k.to_string()).unwrap_or_default();
    let state = if record.synced {
        "synced".green()
    } else {
        "pending".yellow()
    };
    println!(
        "{} [{}] {} {}",
        key.bold(),
        state,
        record.created_at.as_deref().unwrap_or("-").dimmed(),
        record.payload
    );
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    let service = open_service(cli, config).await?;

    match &cli.command {
        Commands::Save {
            endpoint,
            collection,
            payload,
        } => {
            let payload: serde_json::Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
            match service.facade().save(endpoint, payload, collection).await? {
                SaveOutcome::Synced { key, server_id, .. } => {
                    println!(
                        "{} {}/{} (server id: {})",
                        "Synced:".green(),
                        collection,
                        key,
                        server_id.as_deref().unwrap_or("-")
                    );
                }
                SaveOutcome::QueuedOffline { key, reason, .. } => {
                    println!("{} {}/{} ({})", "Queued offline:".yellow(), collection, key, reason);
                }
            }
        }
        Commands::List { collection, unsynced } => {
            let records = if *unsynced {
                service.store().get_unsynced(collection).await?
            } else {
                service.store().get_all(collection).await?
            };
            for record in &records {
                print_record(record);
            }
            println!("{} {}", records.len().to_string().cyan(), "records".cyan());
        }
        Commands::Count { collection } => {
            println!("{}", service.store().count(collection).await?);
        }
        Commands::Clear { collection } => {
            let removed = service.store().clear(collection).await?;
            println!("{} {} records from {}", "Cleared".red(), removed, collection);
        }
        Commands::Migrate => {
            if let Some(report) = service.migration_report() {
                println!(
                    "{} {} keys ({} records written, {} unchanged), {} already done, {} absent, {} failed",
                    "Migrated".green(),
                    report.migrated,
                    report.items,
                    report.unchanged,
                    report.skipped,
                    report.absent,
                    report.failed
                );
            }
        }
        Commands::Drain => match service.drain_now().await? {
            DrainOutcome::Completed(report) => {
                println!(
                    "{} {} delivered, {} failed, {} blocked",
                    "Drained:".green(),
                    report.delivered,
                    report.failed,
                    report.blocked
                );
            }
            DrainOutcome::AlreadyRunning => println!("{}", "A drain is already running".yellow()),
            DrainOutcome::Offline => println!("{}", "Offline, nothing drained".yellow()),
        },
        Commands::Status => {
            let status = service.status().await?;
            let backend = service
                .store()
                .backend_kind()
                .map(|k| k.to_string())
                .unwrap_or_else(|| "closed".to_string());
            let flat = service.store().flat();
            println!("{} {}", "Backend:".cyan(), backend);
            println!(
                "{} {} of {} bytes",
                "Flat store:".cyan(),
                flat.used_bytes()?,
                flat.capacity()
            );
            println!("{} {}", "Pending:".cyan(), status.pending);
            println!("{} {}", "Evicted:".cyan(), status.evicted);
            if let Some(last) = &status.last_drain {
                println!("{} {} ({} delivered)", "Last drain:".cyan(), last.finished_at, last.delivered);
            }
        }
        Commands::Run => {
            println!("{}", "Sync scheduler running, Ctrl-C to stop".cyan());
            tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
            println!("{}", "Stopping...".yellow());
        }
    }

    service.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // Setup logging
    setup_logging(&config).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
