//! TRUST movement-message ingester (spec §4.E): parsing, activation
//! matching and deduction, latency telemetry, and the daily statistics
//! report.

pub mod ingest;
pub mod latency;
pub mod messages;
pub mod stats;

pub use ingest::{TrustError, TrustIngester};
pub use latency::{LatencyMonitor, LatencyWindowReport};
pub use messages::{parse_frame, parse_message, TrustEventType, TrustMessage, TrustMessageError, VariationStatus};
pub use stats::{DailyStatsReport, TrustCounters};
