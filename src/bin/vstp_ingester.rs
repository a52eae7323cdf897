//! VSTP (Very Short Term Plan) ingester binary (spec §6 CLI surface):
//! connects to the local stompy proxy and applies every schedule frame.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nr_rail_core::config::Config;
use nr_rail_core::feed::stomp::{ReconnectBackoff, StompConsumer};
use nr_rail_core::store::pg::PgStore;
use nr_rail_core::store::StoreBackend;
use nr_rail_core::vstp::{VstpError, VstpIngester};

const DEFAULT_VSTP_PORT: u16 = 55840;

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
        log::info!("vstp_ingester: running attached; daemonisation is left to the process supervisor");
    }

    if let Err(e) = run(&config).await {
        log::error!("vstp_ingester: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(config: &Config) -> anyhow::Result<()> {
    let store: Arc<dyn StoreBackend> = {
        let store = PgStore::connect(&config.db_connect_string()).await?;
        store.run_migrations("vstp_ingester").await?;
        Arc::new(store)
    };

    let ingester = VstpIngester::new(store);
    let mut backoff = ReconnectBackoff::new();

    let port: u16 = config.get("vstp_port").and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_VSTP_PORT);
    let addr = format!("127.0.0.1:{port}");

    loop {
        let mut consumer = match StompConsumer::connect(&addr, Duration::from_secs(256)).await {
            Ok(c) => {
                backoff.reset();
                c
            }
            Err(e) => {
                let delay = backoff.next_delay();
                log::warn!("vstp_ingester: failed to connect to {addr}: {e}, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        loop {
            match consumer.read_frame().await {
                Ok(Some(frame)) => {
                    let now = chrono::Utc::now();
                    match ingester.ingest_frame(&frame, now).await {
                        Ok(stats) => {
                            log::debug!("vstp_ingester: applied frame: {stats:?}");
                            if let Err(e) = consumer.ack().await {
                                log::error!("vstp_ingester: failed to ack frame: {e}");
                                break;
                            }
                        }
                        Err(VstpError::Store(e)) => {
                            log::error!("vstp_ingester: store error, dropping connection without ack: {e}");
                            break;
                        }
                        Err(e) => {
                            log::warn!("vstp_ingester: dropping malformed frame: {e}");
                            if let Err(e) = consumer.ack().await {
                                log::error!("vstp_ingester: failed to ack frame: {e}");
                                break;
                            }
                        }
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("vstp_ingester: connection to {addr} lost: {e}");
                    break;
                }
            }
        }
    }
}
