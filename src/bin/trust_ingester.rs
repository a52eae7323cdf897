//! TRUST train-movement ingester binary (spec §6 CLI surface): connects
//! to the local stompy proxy and applies every frame to the store.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nr_rail_core::alert::LogAlertSink;
use nr_rail_core::config::Config;
use nr_rail_core::feed::stomp::{ReconnectBackoff, StompConsumer};
use nr_rail_core::store::pg::PgStore;
use nr_rail_core::store::StoreBackend;
use nr_rail_core::trust::{LatencyMonitor, TrustError, TrustIngester};

const DEFAULT_TRUST_PORT: u16 = 55841;

#[derive(Parser, Debug)]
struct Args {
    /// Path to the colon-separated configuration file.
    #[arg(short = 'c')]
    config: PathBuf,
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

    if !config.debug {
        log::info!("trust_ingester: running attached; daemonisation is left to the process supervisor");
    }

    if let Err(e) = run(&config).await {
        log::error!("trust_ingester: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(config: &Config) -> anyhow::Result<()> {
    let store: Arc<dyn StoreBackend> = {
        let store = PgStore::connect(&config.db_connect_string()).await?;
        store.run_migrations("trust_ingester").await?;
        Arc::new(store)
    };

    let local_tz = chrono_tz::Europe::London;
    let mut ingester = TrustIngester::new(store, local_tz, config.trustdb_no_deduce_act);
    let mut latency = LatencyMonitor::new(Duration::from_secs(60));
    let sink = LogAlertSink;
    let mut backoff = ReconnectBackoff::new();

    let port: u16 = config.get("trust_port").and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_TRUST_PORT);
    let addr = format!("127.0.0.1:{port}");

    loop {
        let mut consumer = match StompConsumer::connect(&addr, Duration::from_secs(256)).await {
            Ok(c) => {
                backoff.reset();
                c
            }
            Err(e) => {
                let delay = backoff.next_delay();
                log::warn!("trust_ingester: failed to connect to {addr}: {e}, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        loop {
            match consumer.read_frame().await {
                Ok(Some(frame)) => {
                    let now = chrono::Utc::now();
                    let started = std::time::Instant::now();
                    match ingester.ingest_frame(&frame, now).await {
                        Ok(()) => {
                            if let Err(e) = consumer.ack().await {
                                log::error!("trust_ingester: failed to ack frame: {e}");
                                break;
                            }
                            latency.record(started.elapsed());
                        }
                        Err(TrustError::Store(e)) => {
                            log::error!("trust_ingester: store error, dropping connection without ack: {e}");
                            break;
                        }
                        Err(e) => {
                            log::warn!("trust_ingester: dropping malformed frame: {e}");
                            if let Err(e) = consumer.ack().await {
                                log::error!("trust_ingester: failed to ack frame: {e}");
                                break;
                            }
                        }
                    }
                }
                Ok(None) => {
                    latency.tick(&sink).await;
                    let local_now = chrono::Utc::now().with_timezone(&local_tz);
                    if ingester.stats.due(local_now) {
                        let snapshot = ingester.stats.emit(local_now);
                        log::info!("trust_ingester daily stats: {snapshot:?}");
                    }
                }
                Err(e) => {
                    log::warn!("trust_ingester: connection to {addr} lost: {e}");
                    break;
                }
            }
        }
    }
}
