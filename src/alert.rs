//! User-visible failure reporting (spec §7: "surface as email alerts
//! with subject lines keyed to the program name and build"). No SMTP
//! crate appears anywhere in the retrieval pack, so the boundary is a
//! trait: `LogAlertSink` is the default, matching the teacher's and
//! pack's universal use of `log` for anything operator-facing: a real
//! deployment wires an SMTP-backed sink behind the same trait.

use async_trait::async_trait;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, subject: &str, body: &str);
}

pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, subject: &str, body: &str) {
        log::warn!("ALERT: {subject}: {body}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_sink_does_not_panic() {
        let sink = LogAlertSink;
        sink.send("test", "body").await;
    }
}
