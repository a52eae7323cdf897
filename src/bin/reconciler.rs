//! Full-timetable reconciler binary (spec §6 CLI surface): fetches or
//! reads a full CIF extract and checks it against the live store.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Datelike;
use clap::Parser;
use nr_rail_core::cif::parse_file;
use nr_rail_core::config::Config;
use nr_rail_core::feed::fetch_bulk_cif;
use nr_rail_core::reconcile::Reconciler;
use nr_rail_core::store::pg::PgStore;
use nr_rail_core::store::StoreBackend;

#[derive(Parser, Debug)]
struct Args {
    /// Path to the colon-separated configuration file.
    #[arg(short = 'c')]
    config: PathBuf,
    /// Full CIF extract to reconcile against; fetched from `nr_server` if omitted.
    #[arg(short = 'f')]
    file: Option<PathBuf>,
    /// Actually apply changes (create missing schedules, delete orphans).
    #[arg(short = 'm')]
    apply: bool,
    /// Override the Saturday-only restriction on when this may run.
    #[arg(short = 'o')]
    override_dow: bool,
    /// Verbose progress telemetry.
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
    if args.verbose {
        log::info!("reconciler: starting against {}", args.config.display());
    }

    if chrono::Utc::now().weekday() != chrono::Weekday::Sat && !args.override_dow {
        log::error!("reconciler: this should normally be run on a Saturday; use -o to override");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            log::error!("failed to load config {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = run(&args, &config).await {
        log::error!("reconciler: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(args: &Args, config: &Config) -> anyhow::Result<()> {
    let text = match &args.file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let url = config.nr_server.clone().ok_or_else(|| anyhow::anyhow!("no -f file and no nr_server configured"))?;
            let user = config.nr_user.as_deref().unwrap_or_default();
            let password = config.nr_password.as_deref().unwrap_or_default();
            let outcome = fetch_bulk_cif(&url, user, password, &std::env::temp_dir(), "reconciler", args.insecure).await?;
            std::fs::read_to_string(&outcome.path)?
        }
    };
    let file = parse_file(&text)?;

    let store: Arc<dyn StoreBackend> = {
        let store = PgStore::connect(&config.db_connect_string()).await?;
        store.run_migrations("reconciler").await?;
        Arc::new(store)
    };

    let reconciler = Reconciler::new(store);
    let now = chrono::Utc::now();

    let revise_path = std::env::temp_dir().join("reconciler-revise.txt");
    let mut revise_file = std::fs::File::create(&revise_path)?;

    let stats = reconciler.run(&file, now, args.apply, Some(&mut revise_file)).await?;
    log::info!(
        "reconciler: examined {}, missing {}, match1 {}, matchm {}, unmatched {}, orphaned {}",
        stats.schedule_examined,
        stats.schedule_missing,
        stats.schedule_match1,
        stats.schedule_matchm,
        stats.schedule_unmatched,
        stats.orphaned_schedule_ids.len()
    );
    if stats.schedule_unmatched > 0 {
        log::info!("reconciler: demote-to-revise sequences written to {}", revise_path.display());
    }
    Ok(())
}
