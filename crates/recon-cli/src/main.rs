use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use recon_core::{SyncImport, SyncStatus};
use recon_storage::{MemoryStore, PgStore, Store};
use recon_sync::{maybe_build_scheduler, Engine, SyncConfig};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "recon-cli")]
#[command(about = "Sync provider data into the canonical client graph and merge duplicates")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one adapter, or every enabled adapter concurrently.
    Sync { adapter: Option<String> },
    /// Merge duplicate clients.
    Merge {
        #[arg(long)]
        dry_run: bool,
    },
    /// Show recent sync runs, newest first.
    Imports {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Migrate,
    /// Serve the HTTP API, with the scheduler when enabled.
    Serve,
    /// List the adapters built from the providers file.
    Adapters,
}

fn init_tracing() {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("recon=info"),
    };
    let json = std::env::var("RECON_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn Store>> {
    match &config.database_url {
        Some(url) => Ok(Arc::new(PgStore::connect(url).await?)),
        None => {
            warn!("DATABASE_URL not set, using an in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn print_import(import: &SyncImport) {
    println!(
        "{} import_id={} status={} found={} synced={} failed={} skipped={} step={:?}",
        import.adapter,
        import.id,
        import.status.as_str(),
        import.records_found,
        import.records_synced,
        import.records_failed,
        import.records_skipped,
        import.current_step,
    );
    for err in &import.errors {
        println!("  - {err}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let store = open_store(&config).await?;
    let engine = Engine::from_config(config, store).await?;

    match cli.command.unwrap_or(Commands::Sync { adapter: None }) {
        Commands::Sync { adapter: Some(adapter) } => {
            let import = engine.runner.run(&adapter).await?;
            print_import(&import);
            if import.status == SyncStatus::Failed {
                bail!("sync of {adapter} failed");
            }
        }
        Commands::Sync { adapter: None } => {
            if engine.runner.registry().is_empty() {
                println!("no adapters enabled in {}", engine.config.providers_file.display());
                return Ok(());
            }
            let mut failed = Vec::new();
            for (adapter, result) in engine.runner.run_all().await {
                match result {
                    Ok(import) => {
                        print_import(&import);
                        if import.status == SyncStatus::Failed {
                            failed.push(adapter);
                        }
                    }
                    Err(err) => {
                        println!("{adapter} not started: {err}");
                        failed.push(adapter);
                    }
                }
            }
            if !failed.is_empty() {
                bail!("sync failed for {}", failed.join(", "));
            }
        }
        Commands::Merge { dry_run } => {
            let report = engine.resolver.run(dry_run).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Imports { limit } => {
            for import in engine.store.list_imports(limit).await? {
                print_import(&import);
            }
        }
        Commands::Adapters => {
            for name in engine.runner.registry().names() {
                println!("{name}");
            }
        }
        Commands::Serve => {
            let scheduler =
                maybe_build_scheduler(&engine.config, engine.runner.clone(), Arc::clone(&engine.resolver)).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            recon_web::serve(recon_web::AppState::from_engine(&engine), engine.config.web_port).await?;
        }
        Commands::Migrate => {
            let url = engine
                .config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            PgStore::connect(url).await?.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
