//! End-to-end latency telemetry: mean/peak over a 256 s window, with an
//! alarm raised once when the configured threshold is crossed and
//! cleared once when it recovers (spec §4.E, §7).

use std::time::Duration;

use crate::alert::AlertSink;

pub struct LatencyMonitor {
    threshold: Duration,
    samples: Vec<Duration>,
    alarm_raised: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyWindowReport {
    pub mean: Duration,
    pub peak: Duration,
    pub count: usize,
}

impl LatencyMonitor {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold, samples: Vec::new(), alarm_raised: false }
    }

    pub fn record(&mut self, latency: Duration) {
        self.samples.push(latency);
    }

    /// Close out the current 256 s window: compute the report, raise or
    /// clear the alarm via `sink` as appropriate, and reset for the
    /// next window.
    pub async fn tick(&mut self, sink: &dyn AlertSink) -> LatencyWindowReport {
        let report = self.summarise();
        if report.peak > self.threshold && !self.alarm_raised {
            self.alarm_raised = true;
            sink.send(
                "TRUST ingester latency alarm",
                &format!(
                    "peak end-to-end latency {:.1}s exceeded threshold {:.1}s",
                    report.peak.as_secs_f64(),
                    self.threshold.as_secs_f64()
                ),
            )
            .await;
        } else if report.peak <= self.threshold && self.alarm_raised {
            self.alarm_raised = false;
            sink.send(
                "TRUST ingester latency recovered",
                &format!("peak end-to-end latency back to {:.1}s", report.peak.as_secs_f64()),
            )
            .await;
        }
        self.samples.clear();
        report
    }

    fn summarise(&self) -> LatencyWindowReport {
        if self.samples.is_empty() {
            return LatencyWindowReport::default();
        }
        let total: Duration = self.samples.iter().sum();
        let mean = total / self.samples.len() as u32;
        let peak = self.samples.iter().copied().max().unwrap_or_default();
        LatencyWindowReport { mean, peak, count: self.samples.len() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogAlertSink;

    #[test]
    fn raises_alarm_once_when_peak_exceeds_threshold() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let mut monitor = LatencyMonitor::new(Duration::from_secs(10));
            let sink = LogAlertSink;
            monitor.record(Duration::from_secs(20));
            let report = monitor.tick(&sink).await;
            assert_eq!(report.peak, Duration::from_secs(20));
            assert!(monitor.alarm_raised);

            monitor.record(Duration::from_secs(2));
            monitor.tick(&sink).await;
            assert!(!monitor.alarm_raised);
        });
    }

    #[test]
    fn mean_and_peak_over_a_window() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let mut monitor = LatencyMonitor::new(Duration::from_secs(60));
            let sink = LogAlertSink;
            monitor.record(Duration::from_secs(2));
            monitor.record(Duration::from_secs(4));
            let report = monitor.tick(&sink).await;
            assert_eq!(report.count, 2);
            assert_eq!(report.mean, Duration::from_secs(3));
            assert_eq!(report.peak, Duration::from_secs(4));
        });
    }
}
