//! Everything that gets bytes from the vendor feeds onto local disk or
//! into a broker frame (spec §4.B): bulk HTTPS fetch, the STOMP
//! streaming consumer, and temp-file housekeeping.

pub mod http;
pub mod housekeeping;
pub mod stomp;

pub use http::{fetch_bulk_cif, BulkFetchError, BulkFetchOutcome};
pub use housekeeping::sweep_temp_dir;
pub use stomp::{StompConsumer, StompError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] BulkFetchError),
    #[error(transparent)]
    Stomp(#[from] StompError),
    #[error("housekeeping failed: {0}")]
    Housekeeping(std::io::Error),
}
