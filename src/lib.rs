//! Ingestion pipeline and schedule matching for the UK national rail
//! feeds: a full-timetable (CIF) loader, a Very Short Term Plan (VSTP)
//! ingester, a TRUST train-movement ingester, and the full-timetable
//! reconciler that checks the store against a fresh extract.

pub mod alert;
pub mod cif;
pub mod config;
pub mod error;
pub mod feed;
pub mod reconcile;
pub mod store;
pub mod time;
pub mod trust;
pub mod vstp;

pub use error::Error;

pub mod prelude {
    pub use crate::alert::{AlertSink, LogAlertSink};
    pub use crate::cif::{CifLoader, CIFFile, CIFRecord};
    pub use crate::config::Config;
    pub use crate::error::Error;
    pub use crate::feed::{fetch_bulk_cif, sweep_temp_dir, StompConsumer};
    pub use crate::reconcile::{Reconciler, ReconcileStats};
    pub use crate::store::{StoreBackend, StoreError};
    pub use crate::trust::TrustIngester;
    pub use crate::vstp::VstpIngester;
}
