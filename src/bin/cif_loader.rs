//! CIF full-timetable / daily-update loader binary (spec §6 CLI surface).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use nr_rail_core::cif::{parse_file, CifLoader};
use nr_rail_core::config::Config;
use nr_rail_core::feed::fetch_bulk_cif;
use nr_rail_core::store::memory::MemoryStore;
use nr_rail_core::store::pg::PgStore;
use nr_rail_core::store::StoreBackend;

/// Load a CIF full or daily-update extract into the store.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the colon-separated configuration file.
    #[arg(short = 'c')]
    config: PathBuf,
    /// Bulk-fetch URL; overrides `nr_server` in the config file.
    #[arg(short = 'u')]
    url: Option<String>,
    /// Load this local file instead of fetching one.
    #[arg(short = 'f')]
    file: Option<PathBuf>,
    /// Fetch the full extract rather than a daily update.
    #[arg(short = 'a')]
    full: bool,
    /// Parse and validate only; never writes to the real database.
    #[arg(short = 't')]
    test: bool,
    /// Verbose (1-minute) progress telemetry instead of 10-minute.
    #[arg(short = 'p')]
    verbose: bool,
    /// Allow a TLS-verification-disabled retry on certificate failure.
    #[arg(short = 'i')]
    insecure: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            log::error!("failed to load config {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = run(&args, &config).await {
        log::error!("cif_loader: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(args: &Args, config: &Config) -> anyhow::Result<()> {
    let text = match &args.file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let url = args
                .url
                .clone()
                .or_else(|| config.nr_server.clone())
                .ok_or_else(|| anyhow::anyhow!("no -u url and no nr_server configured"))?;
            let user = config.nr_user.as_deref().unwrap_or_default();
            let password = config.nr_password.as_deref().unwrap_or_default();
            let outcome = fetch_bulk_cif(&url, user, password, &std::env::temp_dir(), "cifloader", args.insecure).await?;
            std::fs::read_to_string(&outcome.path)?
        }
    };

    let file = parse_file(&text)?;
    let now = chrono::Utc::now();

    let store: Arc<dyn StoreBackend> = if args.test {
        Arc::new(MemoryStore::new())
    } else {
        let store = PgStore::connect(&config.db_connect_string()).await?;
        store.run_migrations("cif_loader").await?;
        Arc::new(store)
    };

    let loader = CifLoader::new(store);
    let stats = loader.load(&file, args.full, args.verbose, now).await?;
    log::info!(
        "cif_loader: {} cards, {} schedules created, {} deleted, {} locations created",
        stats.cards_processed, stats.schedules_created, stats.schedules_deleted, stats.locations_created
    );
    Ok(())
}
