use thiserror::Error;

use crate::cif::parser::CIFParseError;
use crate::cif::loader::ScheduleApplyError;
use crate::config::ConfigError;
use crate::feed::FeedError;
use crate::store::StoreError;
use crate::trust::TrustError;
use crate::vstp::VstpError;

/// Aggregated error type for the binaries. Library code returns the
/// narrower, component-specific error types; `main` functions flatten
/// into this with `?` via `#[from]`.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Cif(#[from] CIFParseError),
    #[error(transparent)]
    ScheduleApply(#[from] ScheduleApplyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Vstp(#[from] VstpError),
    #[error(transparent)]
    Trust(#[from] TrustError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("usage error: {0}")]
    Usage(String),
}
